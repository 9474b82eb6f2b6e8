use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::JobRenormalizationSettings;
use crate::error::RenormalizeError;
use crate::normalizer::client::Normalizer;
use crate::normalizer::node::{BucketNode, InfluencerNode, ResultNode};
use crate::persistence::{BatchedIterator, ResultPersister, ResultsProvider, ResultsQuery};
use crate::results::{AnomalyRecord, Bucket, Influencer};

const MILLIS_PER_DAY: u64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateLimits {
    pub default_window_days: u64,
    pub default_min_buckets: u64,
    /// Rows submitted to one scoring process, counting each root and each child.
    pub max_units_per_chunk: usize,
    pub page_size: usize,
}

impl Default for UpdateLimits {
    fn default() -> Self {
        Self {
            default_window_days: 30,
            default_min_buckets: 100,
            max_units_per_chunk: 100_000,
            page_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenormalizationSummary {
    pub buckets_updated: usize,
    pub records_updated: usize,
    pub influencers_updated: usize,
    pub no_ops: usize,
    pub chunks: usize,
    pub ineligible_buckets: usize,
    pub skipped_without_id: usize,
    pub failed_writes: usize,
}

impl RenormalizationSummary {
    pub fn updates(&self) -> usize {
        self.buckets_updated + self.records_updated + self.influencers_updated
    }
}

/// Rescores persisted results for one job against a new quantiles state.
pub struct ScoresUpdater {
    settings: JobRenormalizationSettings,
    provider: Arc<dyn ResultsProvider>,
    persister: Arc<dyn ResultPersister>,
    normalizer: Box<dyn Normalizer>,
    limits: UpdateLimits,
    cancel: Option<CancellationToken>,
}

struct PendingChunk<N> {
    nodes: Vec<N>,
    units: usize,
}

impl<N> PendingChunk<N> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            units: 0,
        }
    }

    fn take(&mut self) -> Vec<N> {
        self.units = 0;
        std::mem::take(&mut self.nodes)
    }
}

impl ScoresUpdater {
    pub fn new(
        settings: JobRenormalizationSettings,
        provider: Arc<dyn ResultsProvider>,
        persister: Arc<dyn ResultPersister>,
        normalizer: Box<dyn Normalizer>,
        limits: UpdateLimits,
    ) -> Self {
        Self {
            settings,
            provider,
            persister,
            normalizer,
            limits,
            cancel: None,
        }
    }

    /// Chunks not yet submitted are abandoned once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.settings.job_id
    }

    pub fn window_start_ms(&self, end_time_ms: i64, window_extension_ms: u64) -> i64 {
        let window_ms = match self.settings.renormalization_window_days {
            Some(days) => days.saturating_mul(MILLIS_PER_DAY),
            None => {
                let default_ms = self.limits.default_window_days.saturating_mul(MILLIS_PER_DAY);
                let min_buckets_ms = self
                    .limits
                    .default_min_buckets
                    .saturating_mul(self.settings.bucket_span_seconds)
                    .saturating_mul(1000);
                default_ms.max(min_buckets_ms)
            }
        };
        let back = window_ms.saturating_add(window_extension_ms);
        end_time_ms.saturating_sub(i64::try_from(back).unwrap_or(i64::MAX))
    }

    pub fn update(
        &self,
        quantiles_state: &str,
        end_time_ms: i64,
        window_extension_ms: u64,
    ) -> Result<RenormalizationSummary, RenormalizeError> {
        let span = tracing::info_span!(
            "renormalization",
            job_id = %self.settings.job_id,
            end_time_ms
        );
        let _entered = span.enter();

        let query = ResultsQuery {
            start_ms: self.window_start_ms(end_time_ms, window_extension_ms),
            end_ms: end_time_ms,
            include_interim: false,
            page_size: self.limits.page_size,
        };
        tracing::debug!(start_ms = query.start_ms, end_ms = query.end_ms, "renormalizing window");

        let mut summary = RenormalizationSummary::default();

        let mut buckets = self
            .provider
            .bucket_iterator(&self.settings.job_id, &query)
            .map_err(RenormalizeError::Iteration)?;
        self.run_chunks(
            buckets.as_mut(),
            quantiles_state,
            &mut summary,
            |bucket: Bucket, summary: &mut RenormalizationSummary| {
                if bucket.is_normalizable() {
                    Some(BucketNode::new(bucket))
                } else {
                    summary.ineligible_buckets += 1;
                    None
                }
            },
            Self::persist_buckets,
        )?;

        let mut influencers = self
            .provider
            .influencer_iterator(&self.settings.job_id, &query)
            .map_err(RenormalizeError::Iteration)?;
        self.run_chunks(
            influencers.as_mut(),
            quantiles_state,
            &mut summary,
            |influencer: Influencer, _: &mut RenormalizationSummary| Some(InfluencerNode::new(influencer)),
            Self::persist_influencers,
        )?;

        tracing::info!(
            updates = summary.updates(),
            no_ops = summary.no_ops,
            chunks = summary.chunks,
            "renormalization resulted in {} updates, {} no-ops",
            summary.updates(),
            summary.no_ops
        );
        Ok(summary)
    }

    fn run_chunks<T, N, W, P>(
        &self,
        iterator: &mut dyn BatchedIterator<T>,
        quantiles_state: &str,
        summary: &mut RenormalizationSummary,
        wrap: W,
        persist: P,
    ) -> Result<(), RenormalizeError>
    where
        N: ResultNode,
        W: Fn(T, &mut RenormalizationSummary) -> Option<N>,
        P: Fn(&Self, Vec<N>, &mut RenormalizationSummary),
    {
        let max_units = self.limits.max_units_per_chunk;
        let mut chunk = PendingChunk::new();
        while iterator.has_next() {
            let batch = iterator.next_batch().map_err(RenormalizeError::Iteration)?;
            for item in batch {
                let Some(node) = wrap(item, &mut *summary) else {
                    continue;
                };
                let units = node.unit_count();
                if !chunk.nodes.is_empty() && chunk.units + units > max_units {
                    self.flush(&mut chunk, quantiles_state, summary, &persist)?;
                }
                chunk.units += units;
                chunk.nodes.push(node);
                if chunk.units > max_units {
                    self.flush(&mut chunk, quantiles_state, summary, &persist)?;
                }
            }
        }
        self.flush(&mut chunk, quantiles_state, summary, &persist)
    }

    fn flush<N, P>(
        &self,
        chunk: &mut PendingChunk<N>,
        quantiles_state: &str,
        summary: &mut RenormalizationSummary,
        persist: &P,
    ) -> Result<(), RenormalizeError>
    where
        N: ResultNode,
        P: Fn(&Self, Vec<N>, &mut RenormalizationSummary),
    {
        if chunk.nodes.is_empty() {
            return Ok(());
        }
        if self.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Err(RenormalizeError::Cancelled);
        }

        let units = chunk.units;
        let mut nodes = chunk.take();
        {
            let mut roots: Vec<&mut dyn ResultNode> = nodes
                .iter_mut()
                .map(|node| node as &mut dyn ResultNode)
                .collect();
            self.normalizer
                .normalize(self.settings.bucket_span_seconds, &mut roots, quantiles_state)?;
        }
        summary.chunks += 1;
        tracing::debug!(roots = nodes.len(), units, "normalized chunk");
        persist(self, nodes, summary);
        Ok(())
    }

    fn persist_buckets(&self, nodes: Vec<BucketNode>, summary: &mut RenormalizationSummary) {
        let job_id = self.settings.job_id.as_str();
        for node in nodes {
            let bucket_changed = node.had_big_change();
            let bucket = node.into_bucket();
            let (changed_records, unchanged_records): (Vec<&AnomalyRecord>, Vec<&AnomalyRecord>) =
                bucket
                    .records
                    .iter()
                    .partition(|record| record.had_big_normalized_update());
            summary.no_ops += unchanged_records.len();

            let Some(bucket_id) = bucket.id.as_deref() else {
                let dropped = usize::from(bucket_changed) + changed_records.len();
                if dropped > 0 {
                    tracing::warn!(
                        timestamp = %bucket.timestamp,
                        "bucket has no id; renormalized scores not persisted"
                    );
                }
                summary.skipped_without_id += dropped;
                summary.no_ops += 1 + changed_records.len();
                continue;
            };

            if bucket_changed {
                match self.persister.update_bucket(job_id, &bucket) {
                    Ok(()) => summary.buckets_updated += 1,
                    Err(err) => {
                        tracing::warn!(bucket_id, error = %err, "failed to persist renormalized bucket");
                        summary.failed_writes += 1;
                    }
                }
            } else {
                summary.no_ops += 1;
            }

            let mut records = Vec::with_capacity(changed_records.len());
            for record in changed_records {
                if record.id.is_some() {
                    records.push(record.clone());
                } else {
                    tracing::warn!(bucket_id, "record has no id; renormalized score not persisted");
                    summary.skipped_without_id += 1;
                    summary.no_ops += 1;
                }
            }
            if records.is_empty() {
                continue;
            }
            match self.persister.update_records(job_id, bucket_id, &records) {
                Ok(()) => summary.records_updated += records.len(),
                Err(err) => {
                    tracing::warn!(bucket_id, error = %err, "failed to persist renormalized records");
                    summary.failed_writes += records.len();
                }
            }
        }
    }

    fn persist_influencers(&self, nodes: Vec<InfluencerNode>, summary: &mut RenormalizationSummary) {
        let mut changed: Vec<Influencer> = Vec::new();
        for node in nodes {
            if !node.had_big_change() {
                summary.no_ops += 1;
                continue;
            }
            let influencer = node.into_inner();
            if influencer.id.is_none() {
                tracing::warn!(
                    field = %influencer.influencer_field_name,
                    value = %influencer.influencer_field_value,
                    "influencer has no id; renormalized score not persisted"
                );
                summary.skipped_without_id += 1;
                summary.no_ops += 1;
                continue;
            }
            changed.push(influencer);
        }
        if changed.is_empty() {
            return;
        }
        match self
            .persister
            .update_influencers(&self.settings.job_id, &changed)
        {
            Ok(()) => summary.influencers_updated += changed.len(),
            Err(err) => {
                tracing::warn!(count = changed.len(), error = %err, "failed to persist renormalized influencers");
                summary.failed_writes += changed.len();
            }
        }
    }
}
