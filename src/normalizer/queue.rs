//! One renormalization worker per job.
//!
//! Quantiles updates can arrive faster than a pass over the results completes. They are queued
//! onto a dedicated thread so passes for the same job never overlap and callers never block.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{JobRenormalizationSettings, RenormalizerConfig};
use crate::normalizer::client::ScoringNormalizer;
use crate::normalizer::process::NativeScoringProcessFactory;
use crate::normalizer::updater::ScoresUpdater;
use crate::persistence::{ResultPersister, ResultsProvider};
use crate::results::Quantiles;

#[derive(Debug, Clone, PartialEq)]
pub struct RenormalizationRequest {
    pub quantiles_state: String,
    pub end_time_ms: i64,
    pub window_extension_ms: u64,
}

enum QueueCommand {
    Renormalize(RenormalizationRequest),
    Stop,
}

/// Requests accepted but not yet finished.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        let mut count = self.count.lock().unwrap_or_else(|err| err.into_inner());
        *count += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(|err| err.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct RenormalizationQueue {
    job_id: String,
    tx: mpsc::UnboundedSender<QueueCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl RenormalizationQueue {
    /// Starts a queue backed by the native scoring process.
    pub fn start(
        config: &RenormalizerConfig,
        settings: JobRenormalizationSettings,
        provider: Arc<dyn ResultsProvider>,
        persister: Arc<dyn ResultPersister>,
    ) -> Result<Self> {
        let factory = Arc::new(NativeScoringProcessFactory::from_config(
            config,
            settings.per_partition,
        ));
        let normalizer = ScoringNormalizer::new(
            settings.job_id.clone(),
            factory,
            config.score_change_policy(),
        );
        let updater = ScoresUpdater::new(
            settings,
            provider,
            persister.clone(),
            Box::new(normalizer),
            config.update_limits(),
        );
        Self::spawn(updater, persister, config.coalesce_queued)
    }

    pub fn spawn(
        updater: ScoresUpdater,
        persister: Arc<dyn ResultPersister>,
        coalesce: bool,
    ) -> Result<Self> {
        let job_id = updater.job_id().to_string();
        let (tx, rx) = mpsc::unbounded_channel::<QueueCommand>();
        let pending = Arc::new(Pending::default());

        let worker = Worker {
            updater,
            persister,
            pending: pending.clone(),
            coalesce,
        };
        let handle = std::thread::Builder::new()
            .name(format!("{job_id}-renormalizer"))
            .spawn(move || {
                worker.run(rx);
            })
            .with_context(|| format!("failed to spawn renormalizer for job {job_id}"))?;
        tracing::debug!(job_id = %job_id, coalesce, "renormalizer started");

        Ok(Self {
            job_id,
            tx,
            worker: Mutex::new(Some(handle)),
            pending,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn enqueue(&self, quantiles_state: impl Into<String>, end_time_ms: i64) {
        self.enqueue_request(RenormalizationRequest {
            quantiles_state: quantiles_state.into(),
            end_time_ms,
            window_extension_ms: 0,
        });
    }

    /// Ends the window at the quantiles timestamp, or now if it has none.
    pub fn enqueue_quantiles(&self, quantiles: &Quantiles) {
        let end_time_ms = quantiles
            .timestamp
            .map(|ts| ts.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        self.enqueue(quantiles.quantile_state.clone(), end_time_ms);
    }

    pub fn enqueue_request(&self, request: RenormalizationRequest) {
        if !self.is_worker_running() {
            tracing::error!(
                job_id = %self.job_id,
                end_time_ms = request.end_time_ms,
                "renormalizer is not running; dropping quantiles update"
            );
            return;
        }
        self.pending.add();
        if self.tx.send(QueueCommand::Renormalize(request)).is_err() {
            self.pending.done();
            tracing::error!(job_id = %self.job_id, "renormalizer stopped; dropping quantiles update");
        }
    }

    pub fn is_worker_running(&self) -> bool {
        let worker = self.worker.lock().unwrap_or_else(|err| err.into_inner());
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Blocks until every accepted request has finished or the worker is gone.
    pub fn wait_until_idle(&self) {
        let mut count = self.pending.count.lock().unwrap_or_else(|err| err.into_inner());
        while *count > 0 {
            if !self.is_worker_running() {
                return;
            }
            let (guard, _) = self
                .pending
                .idle
                .wait_timeout(count, Duration::from_millis(100))
                .unwrap_or_else(|err| err.into_inner());
            count = guard;
        }
    }

    /// Stops accepting requests, lets the worker finish everything queued so far and joins it.
    pub fn shutdown(&self) {
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|err| err.into_inner());
            worker.take()
        };
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(QueueCommand::Stop);
        if handle.join().is_err() {
            tracing::error!(job_id = %self.job_id, "renormalizer panicked");
        }
        tracing::debug!(job_id = %self.job_id, "renormalizer stopped");
    }
}

impl Drop for RenormalizationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    updater: ScoresUpdater,
    persister: Arc<dyn ResultPersister>,
    pending: Arc<Pending>,
    coalesce: bool,
}

impl Worker {
    /// Processes requests up to the first `Stop`; returns how many arrived behind it.
    fn run(self, mut rx: mpsc::UnboundedReceiver<QueueCommand>) -> usize {
        while let Some(command) = rx.blocking_recv() {
            let mut request = match command {
                QueueCommand::Renormalize(request) => request,
                QueueCommand::Stop => break,
            };

            let mut stop = false;
            if self.coalesce {
                while let Ok(next) = rx.try_recv() {
                    match next {
                        QueueCommand::Renormalize(newer) => {
                            tracing::info!(
                                job_id = %self.updater.job_id(),
                                end_time_ms = request.end_time_ms,
                                "quantiles update superseded before processing"
                            );
                            self.pending.done();
                            request = newer;
                        }
                        QueueCommand::Stop => {
                            stop = true;
                            break;
                        }
                    }
                }
            }

            self.process(&request);
            self.pending.done();
            if stop {
                break;
            }
        }

        let mut discarded = 0usize;
        while let Ok(command) = rx.try_recv() {
            if let QueueCommand::Renormalize(_) = command {
                discarded += 1;
                self.pending.done();
            }
        }
        if discarded > 0 {
            tracing::info!(
                job_id = %self.updater.job_id(),
                discarded,
                "discarded unprocessed quantiles updates at shutdown"
            );
        }
        discarded
    }

    fn process(&self, request: &RenormalizationRequest) {
        let job_id = self.updater.job_id();
        match self.updater.update(
            &request.quantiles_state,
            request.end_time_ms,
            request.window_extension_ms,
        ) {
            Ok(summary) => {
                tracing::debug!(job_id = %job_id, chunks = summary.chunks, "renormalization finished");
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job_id,
                    code = err.code(),
                    error = %err,
                    "renormalization failed"
                );
            }
        }
        if let Err(err) = self.persister.refresh(job_id) {
            tracing::warn!(job_id = %job_id, error = %err, "failed to refresh results after renormalization");
        }
    }
}
