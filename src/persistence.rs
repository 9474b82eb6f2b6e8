//! Seams to the results store. The store itself lives elsewhere; renormalization only needs
//! paged reads of buckets and influencers and keyed rewrites of whatever changed.

use anyhow::Result;

use crate::results::{AnomalyRecord, Bucket, Influencer};

/// Ordered, bounded batches over a query. `next_batch` on an exhausted iterator is an error.
pub trait BatchedIterator<T>: Send {
    fn has_next(&self) -> bool;

    fn next_batch(&mut self) -> Result<Vec<T>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultsQuery {
    /// Inclusive.
    pub start_ms: i64,
    /// Exclusive.
    pub end_ms: i64,
    pub include_interim: bool,
    pub page_size: usize,
}

pub trait ResultsProvider: Send + Sync {
    /// Buckets come back with their bucket influencers and records attached.
    fn bucket_iterator(
        &self,
        job_id: &str,
        query: &ResultsQuery,
    ) -> Result<Box<dyn BatchedIterator<Bucket>>>;

    fn influencer_iterator(
        &self,
        job_id: &str,
        query: &ResultsQuery,
    ) -> Result<Box<dyn BatchedIterator<Influencer>>>;
}

/// Keyed rewrites of persisted results. Every write replaces the document with the same id.
pub trait ResultPersister: Send + Sync {
    fn update_bucket(&self, job_id: &str, bucket: &Bucket) -> Result<()>;

    fn update_records(&self, job_id: &str, bucket_id: &str, records: &[AnomalyRecord])
        -> Result<()>;

    fn update_influencers(&self, job_id: &str, influencers: &[Influencer]) -> Result<()>;

    /// Makes prior writes visible to readers.
    fn refresh(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}
