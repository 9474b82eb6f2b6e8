//! In-memory stand-ins for the results store and the scoring process.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ScoringError;
use crate::normalizer::client::Normalizer;
use crate::normalizer::node::ResultNode;
use crate::normalizer::process::{NormalizerResult, ScoringProcess, ScoringProcessFactory};
use crate::persistence::{BatchedIterator, ResultPersister, ResultsProvider, ResultsQuery};
use crate::results::{AnomalyRecord, Bucket, Influencer};

/// Polls `check` for up to five seconds.
pub fn wait_for(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub struct VecBatchedIterator<T> {
    batches: VecDeque<Vec<T>>,
}

impl<T> VecBatchedIterator<T> {
    pub fn new(batches: Vec<Vec<T>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl<T: Send> BatchedIterator<T> for VecBatchedIterator<T> {
    fn has_next(&self) -> bool {
        !self.batches.is_empty()
    }

    fn next_batch(&mut self) -> Result<Vec<T>> {
        self.batches
            .pop_front()
            .ok_or_else(|| anyhow!("iterator exhausted"))
    }
}

/// A latch that blocks callers until opened.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.inner;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (open, cvar) = &*self.inner;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

#[derive(Default)]
pub struct FakeProvider {
    buckets: Vec<Vec<Bucket>>,
    influencers: Vec<Vec<Influencer>>,
    bucket_queries: Mutex<Vec<ResultsQuery>>,
    queries: Mutex<Vec<ResultsQuery>>,
    failures_remaining: Mutex<usize>,
    gate: Option<Gate>,
}

impl FakeProvider {
    pub fn with_buckets(batches: Vec<Vec<Bucket>>) -> Self {
        Self {
            buckets: batches,
            ..Self::default()
        }
    }

    pub fn and_influencers(mut self, batches: Vec<Vec<Influencer>>) -> Self {
        self.influencers = batches;
        self
    }

    pub fn failing() -> Self {
        Self::default().failing_first(usize::MAX)
    }

    pub fn failing_first(self, count: usize) -> Self {
        *self.failures_remaining.lock().unwrap() = count;
        self
    }

    /// Bucket queries block until `gate` opens.
    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn queries(&self) -> Vec<ResultsQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn bucket_end_times(&self) -> Vec<i64> {
        self.bucket_queries
            .lock()
            .unwrap()
            .iter()
            .map(|query| query.end_ms)
            .collect()
    }
}

impl ResultsProvider for FakeProvider {
    fn bucket_iterator(
        &self,
        _job_id: &str,
        query: &ResultsQuery,
    ) -> Result<Box<dyn BatchedIterator<Bucket>>> {
        self.bucket_queries.lock().unwrap().push(*query);
        self.queries.lock().unwrap().push(*query);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("results index unavailable"));
            }
        }
        Ok(Box::new(VecBatchedIterator::new(self.buckets.clone())))
    }

    fn influencer_iterator(
        &self,
        _job_id: &str,
        query: &ResultsQuery,
    ) -> Result<Box<dyn BatchedIterator<Influencer>>> {
        self.queries.lock().unwrap().push(*query);
        Ok(Box::new(VecBatchedIterator::new(self.influencers.clone())))
    }
}

#[derive(Default)]
pub struct RecordingPersister {
    buckets: Mutex<Vec<Bucket>>,
    records: Mutex<Vec<(String, Vec<AnomalyRecord>)>>,
    influencers: Mutex<Vec<Influencer>>,
    refreshes: AtomicUsize,
    failing_bucket_id: Option<String>,
}

impl RecordingPersister {
    pub fn failing_bucket(bucket_id: &str) -> Self {
        Self {
            failing_bucket_id: Some(bucket_id.to_string()),
            ..Self::default()
        }
    }

    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<(String, Vec<AnomalyRecord>)> {
        self.records.lock().unwrap().clone()
    }

    pub fn influencers(&self) -> Vec<Influencer> {
        self.influencers.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl ResultPersister for RecordingPersister {
    fn update_bucket(&self, _job_id: &str, bucket: &Bucket) -> Result<()> {
        if bucket.id.is_some() && bucket.id == self.failing_bucket_id {
            return Err(anyhow!("write rejected"));
        }
        self.buckets.lock().unwrap().push(bucket.clone());
        Ok(())
    }

    fn update_records(
        &self,
        _job_id: &str,
        bucket_id: &str,
        records: &[AnomalyRecord],
    ) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((bucket_id.to_string(), records.to_vec()));
        Ok(())
    }

    fn update_influencers(&self, _job_id: &str, influencers: &[Influencer]) -> Result<()> {
        self.influencers
            .lock()
            .unwrap()
            .extend_from_slice(influencers);
        Ok(())
    }

    fn refresh(&self, _job_id: &str) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    scores: Mutex<VecDeque<f64>>,
    calls: Mutex<Vec<Vec<String>>>,
    started: AtomicUsize,
    closed: AtomicUsize,
}

/// Hands out queued scores to each process it starts, one per body row written.
pub struct ScriptedProcessFactory {
    script: Arc<Script>,
    extra_results: usize,
    fail_start: bool,
}

impl ScriptedProcessFactory {
    pub fn with_scores(scores: &[f64]) -> Self {
        let script = Script::default();
        script.scores.lock().unwrap().extend(scores.iter().copied());
        Self {
            script: Arc::new(script),
            extra_results: 0,
            fail_start: false,
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::with_scores(&[])
        }
    }

    /// Each process answers with this many results beyond the rows it was sent.
    pub fn with_extra_results(mut self, extra: usize) -> Self {
        self.extra_results = extra;
        self
    }

    pub fn started(&self) -> usize {
        self.script.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.script.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn written_rows(&self) -> Vec<String> {
        self.calls().into_iter().flatten().collect()
    }
}

impl ScoringProcessFactory for ScriptedProcessFactory {
    fn create(
        &self,
        job_id: &str,
        _quantiles_state: &str,
        _bucket_span_seconds: u64,
    ) -> Result<Box<dyn ScoringProcess>, ScoringError> {
        if self.fail_start {
            return Err(ScoringError::ProcessStart {
                job_id: job_id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "normalize not found"),
            });
        }
        self.script.started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedProcess {
            script: self.script.clone(),
            extra_results: self.extra_results,
            rows: Vec::new(),
            results: VecDeque::new(),
            input_closed: false,
        }))
    }
}

struct ScriptedProcess {
    script: Arc<Script>,
    extra_results: usize,
    rows: Vec<String>,
    results: VecDeque<NormalizerResult>,
    input_closed: bool,
}

impl ScoringProcess for ScriptedProcess {
    fn write_record(&mut self, fields: &[&str]) -> Result<(), ScoringError> {
        if self.input_closed {
            return Err(ScoringError::Protocol("input already closed".to_string()));
        }
        self.rows.push(fields.join(","));
        Ok(())
    }

    fn close_input(&mut self) -> Result<(), ScoringError> {
        if self.input_closed {
            return Ok(());
        }
        self.input_closed = true;
        let wanted = self.rows.len().saturating_sub(1) + self.extra_results;
        let mut scores = self.script.scores.lock().unwrap();
        let available = wanted.min(scores.len());
        self.results = scores
            .drain(..available)
            .map(NormalizerResult::with_score)
            .collect();
        self.script.calls.lock().unwrap().push(self.rows.clone());
        Ok(())
    }

    fn read_result(&mut self) -> Result<Option<NormalizerResult>, ScoringError> {
        Ok(self.results.pop_front())
    }

    fn close(self: Box<Self>) -> Result<(), ScoringError> {
        self.script.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type ApplyFn = Box<dyn Fn(&mut dyn ResultNode) + Send + Sync>;

/// Applies a closure to every root and records how many roots each call received.
pub struct FnNormalizer {
    calls: Arc<Mutex<Vec<usize>>>,
    apply: ApplyFn,
}

impl FnNormalizer {
    pub fn new(apply: impl Fn(&mut dyn ResultNode) + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            apply: Box::new(apply),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<usize>>> {
        self.calls.clone()
    }
}

impl Normalizer for FnNormalizer {
    fn normalize(
        &self,
        _bucket_span_seconds: u64,
        roots: &mut [&mut dyn ResultNode],
        _quantiles_state: &str,
    ) -> Result<(), ScoringError> {
        self.calls.lock().unwrap().push(roots.len());
        for root in roots.iter_mut() {
            (self.apply)(&mut **root);
        }
        Ok(())
    }
}
