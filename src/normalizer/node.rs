//! Uniform view over the four result kinds that take part in renormalization.
//!
//! A node owns the entity it wraps for the duration of one pass. Setting a score on a node
//! writes straight into the entity, and the entity's change flag is the node's change flag.
//! Wrapping clears the flag; the scoring client raises it when a score moved enough to be
//! worth persisting.

use crate::error::NodeError;
use crate::results::{AnomalyRecord, Bucket, BucketInfluencer, Influencer};

/// Child type index of a bucket's influencers.
pub const BUCKET_INFLUENCERS: usize = 0;
/// Child type index of a bucket's anomaly records.
pub const RECORDS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Root,
    BucketInfluencer,
    Influencer,
    Leaf,
}

impl Level {
    /// Value of the `level` column in the scoring protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Root => "root",
            Level::BucketInfluencer => "inflb",
            Level::Influencer => "infl",
            Level::Leaf => "leaf",
        }
    }
}

pub trait ResultNode {
    fn kind(&self) -> &'static str;

    fn is_container_only(&self) -> bool {
        false
    }

    fn level(&self) -> Level;

    fn partition_field_name(&self) -> &str {
        ""
    }

    fn partition_field_value(&self) -> &str {
        ""
    }

    fn person_field_name(&self) -> &str {
        ""
    }

    fn function_name(&self) -> &str {
        ""
    }

    fn value_field_name(&self) -> &str {
        ""
    }

    fn probability(&self) -> Result<f64, NodeError>;

    fn normalized_score(&self) -> f64;

    fn set_normalized_score(&mut self, score: f64);

    /// Number of distinct child classes; zero for anything that is not a container.
    fn child_type_count(&self) -> usize {
        0
    }

    fn children(&self) -> Vec<&dyn ResultNode> {
        Vec::new()
    }

    fn children_of_type(&self, child_type: usize) -> Result<Vec<&dyn ResultNode>, NodeError> {
        Err(NodeError::InvalidChildType {
            kind: self.kind(),
            child_type,
        })
    }

    fn children_of_type_mut(
        &mut self,
        child_type: usize,
    ) -> Result<Vec<&mut dyn ResultNode>, NodeError> {
        Err(NodeError::InvalidChildType {
            kind: self.kind(),
            child_type,
        })
    }

    /// Current aggregate held for `child_type`.
    fn aggregate(&self, child_type: usize) -> Result<f64, NodeError> {
        Err(NodeError::InvalidChildType {
            kind: self.kind(),
            child_type,
        })
    }

    /// Stores the aggregate of a child class and reports whether the stored value moved.
    fn set_aggregate_from_children(
        &mut self,
        child_type: usize,
        _value: f64,
    ) -> Result<bool, NodeError> {
        Err(NodeError::InvalidChildType {
            kind: self.kind(),
            child_type,
        })
    }

    fn set_parent_context(&mut self, value: f64) -> Result<(), NodeError>;

    fn had_big_change(&self) -> bool;

    fn reset_change_flag(&mut self);

    fn raise_change_flag(&mut self);

    /// Chunk accounting: the node itself plus everything written beneath it.
    fn unit_count(&self) -> usize {
        1 + self.children().len()
    }
}

#[derive(Debug)]
pub struct BucketNode {
    bucket: Bucket,
    bucket_influencers: Vec<BucketInfluencerNode>,
    records: Vec<RecordNode>,
}

impl BucketNode {
    pub fn new(mut bucket: Bucket) -> Self {
        bucket.reset_big_normalized_update_flag();
        let bucket_influencers = std::mem::take(&mut bucket.bucket_influencers)
            .into_iter()
            .map(BucketInfluencerNode::new)
            .collect();
        let records = std::mem::take(&mut bucket.records)
            .into_iter()
            .map(RecordNode::new)
            .collect();
        Self {
            bucket,
            bucket_influencers,
            records,
        }
    }

    pub fn bucket_id(&self) -> Option<&str> {
        self.bucket.id.as_deref()
    }

    pub fn max_normalized_probability(&self) -> f64 {
        self.bucket.max_normalized_probability
    }

    /// Reattaches the children and hands the bucket back for persistence.
    pub fn into_bucket(self) -> Bucket {
        let mut bucket = self.bucket;
        bucket.bucket_influencers = self
            .bucket_influencers
            .into_iter()
            .map(BucketInfluencerNode::into_inner)
            .collect();
        bucket.records = self
            .records
            .into_iter()
            .map(RecordNode::into_inner)
            .collect();
        bucket
    }
}

impl ResultNode for BucketNode {
    fn kind(&self) -> &'static str {
        "bucket"
    }

    fn is_container_only(&self) -> bool {
        true
    }

    fn level(&self) -> Level {
        Level::Root
    }

    fn probability(&self) -> Result<f64, NodeError> {
        Err(NodeError::InvalidState {
            kind: self.kind(),
            what: "probability",
        })
    }

    fn normalized_score(&self) -> f64 {
        self.bucket.anomaly_score
    }

    fn set_normalized_score(&mut self, score: f64) {
        self.bucket.anomaly_score = score;
    }

    fn child_type_count(&self) -> usize {
        2
    }

    fn children(&self) -> Vec<&dyn ResultNode> {
        self.bucket_influencers
            .iter()
            .map(|node| node as &dyn ResultNode)
            .chain(self.records.iter().map(|node| node as &dyn ResultNode))
            .collect()
    }

    fn children_of_type(&self, child_type: usize) -> Result<Vec<&dyn ResultNode>, NodeError> {
        match child_type {
            BUCKET_INFLUENCERS => Ok(self
                .bucket_influencers
                .iter()
                .map(|node| node as &dyn ResultNode)
                .collect()),
            RECORDS => Ok(self
                .records
                .iter()
                .map(|node| node as &dyn ResultNode)
                .collect()),
            other => Err(NodeError::InvalidChildType {
                kind: self.kind(),
                child_type: other,
            }),
        }
    }

    fn children_of_type_mut(
        &mut self,
        child_type: usize,
    ) -> Result<Vec<&mut dyn ResultNode>, NodeError> {
        let kind = self.kind();
        match child_type {
            BUCKET_INFLUENCERS => Ok(self
                .bucket_influencers
                .iter_mut()
                .map(|node| node as &mut dyn ResultNode)
                .collect()),
            RECORDS => Ok(self
                .records
                .iter_mut()
                .map(|node| node as &mut dyn ResultNode)
                .collect()),
            other => Err(NodeError::InvalidChildType {
                kind,
                child_type: other,
            }),
        }
    }

    fn aggregate(&self, child_type: usize) -> Result<f64, NodeError> {
        match child_type {
            BUCKET_INFLUENCERS => Ok(self.bucket.anomaly_score),
            RECORDS => Ok(self.bucket.max_normalized_probability),
            other => Err(NodeError::InvalidChildType {
                kind: self.kind(),
                child_type: other,
            }),
        }
    }

    fn set_aggregate_from_children(
        &mut self,
        child_type: usize,
        value: f64,
    ) -> Result<bool, NodeError> {
        let kind = self.kind();
        let slot = match child_type {
            BUCKET_INFLUENCERS => &mut self.bucket.anomaly_score,
            RECORDS => &mut self.bucket.max_normalized_probability,
            other => {
                return Err(NodeError::InvalidChildType {
                    kind,
                    child_type: other,
                })
            }
        };
        let changed = *slot != value;
        *slot = value;
        Ok(changed)
    }

    fn set_parent_context(&mut self, _value: f64) -> Result<(), NodeError> {
        Err(NodeError::InvalidState {
            kind: self.kind(),
            what: "parent",
        })
    }

    fn had_big_change(&self) -> bool {
        self.bucket.had_big_normalized_update()
    }

    fn reset_change_flag(&mut self) {
        self.bucket.reset_big_normalized_update_flag();
    }

    fn raise_change_flag(&mut self) {
        self.bucket.raise_big_normalized_update_flag();
    }

    fn unit_count(&self) -> usize {
        1 + self.bucket_influencers.len() + self.records.len()
    }
}

#[derive(Debug)]
pub struct BucketInfluencerNode {
    influencer: BucketInfluencer,
}

impl BucketInfluencerNode {
    pub fn new(mut influencer: BucketInfluencer) -> Self {
        influencer.reset_big_normalized_update_flag();
        Self { influencer }
    }

    pub fn into_inner(self) -> BucketInfluencer {
        self.influencer
    }
}

impl ResultNode for BucketInfluencerNode {
    fn kind(&self) -> &'static str {
        "bucket_influencer"
    }

    fn level(&self) -> Level {
        if self.influencer.is_bucket_time() {
            Level::Root
        } else {
            Level::BucketInfluencer
        }
    }

    fn person_field_name(&self) -> &str {
        &self.influencer.influencer_field_name
    }

    fn probability(&self) -> Result<f64, NodeError> {
        Ok(self.influencer.probability)
    }

    fn normalized_score(&self) -> f64 {
        self.influencer.anomaly_score
    }

    fn set_normalized_score(&mut self, score: f64) {
        self.influencer.anomaly_score = score;
    }

    fn set_parent_context(&mut self, _value: f64) -> Result<(), NodeError> {
        Ok(())
    }

    fn had_big_change(&self) -> bool {
        self.influencer.had_big_normalized_update()
    }

    fn reset_change_flag(&mut self) {
        self.influencer.reset_big_normalized_update_flag();
    }

    fn raise_change_flag(&mut self) {
        self.influencer.raise_big_normalized_update_flag();
    }
}

#[derive(Debug)]
pub struct RecordNode {
    record: AnomalyRecord,
}

impl RecordNode {
    pub fn new(mut record: AnomalyRecord) -> Self {
        record.reset_big_normalized_update_flag();
        Self { record }
    }

    pub fn into_inner(self) -> AnomalyRecord {
        self.record
    }
}

impl ResultNode for RecordNode {
    fn kind(&self) -> &'static str {
        "record"
    }

    fn level(&self) -> Level {
        Level::Leaf
    }

    fn partition_field_name(&self) -> &str {
        self.record.partition_field_name.as_deref().unwrap_or("")
    }

    fn partition_field_value(&self) -> &str {
        self.record.partition_field_value.as_deref().unwrap_or("")
    }

    fn person_field_name(&self) -> &str {
        self.record.person_field_name().unwrap_or("")
    }

    fn function_name(&self) -> &str {
        self.record.function.as_deref().unwrap_or("")
    }

    fn value_field_name(&self) -> &str {
        self.record.field_name.as_deref().unwrap_or("")
    }

    fn probability(&self) -> Result<f64, NodeError> {
        Ok(self.record.probability)
    }

    fn normalized_score(&self) -> f64 {
        self.record.normalized_probability
    }

    fn set_normalized_score(&mut self, score: f64) {
        self.record.normalized_probability = score;
    }

    fn set_parent_context(&mut self, _value: f64) -> Result<(), NodeError> {
        Ok(())
    }

    fn had_big_change(&self) -> bool {
        self.record.had_big_normalized_update()
    }

    fn reset_change_flag(&mut self) {
        self.record.reset_big_normalized_update_flag();
    }

    fn raise_change_flag(&mut self) {
        self.record.raise_big_normalized_update_flag();
    }
}

#[derive(Debug)]
pub struct InfluencerNode {
    influencer: Influencer,
}

impl InfluencerNode {
    pub fn new(mut influencer: Influencer) -> Self {
        influencer.reset_big_normalized_update_flag();
        Self { influencer }
    }

    pub fn influencer(&self) -> &Influencer {
        &self.influencer
    }

    pub fn into_inner(self) -> Influencer {
        self.influencer
    }
}

impl ResultNode for InfluencerNode {
    fn kind(&self) -> &'static str {
        "influencer"
    }

    fn level(&self) -> Level {
        Level::Influencer
    }

    fn person_field_name(&self) -> &str {
        &self.influencer.influencer_field_name
    }

    fn probability(&self) -> Result<f64, NodeError> {
        Ok(self.influencer.probability)
    }

    fn normalized_score(&self) -> f64 {
        self.influencer.anomaly_score
    }

    fn set_normalized_score(&mut self, score: f64) {
        self.influencer.anomaly_score = score;
    }

    fn set_parent_context(&mut self, _value: f64) -> Result<(), NodeError> {
        Err(NodeError::InvalidState {
            kind: self.kind(),
            what: "parent",
        })
    }

    fn had_big_change(&self) -> bool {
        self.influencer.had_big_normalized_update()
    }

    fn reset_change_flag(&mut self) {
        self.influencer.reset_big_normalized_update_flag();
    }

    fn raise_change_flag(&mut self) {
        self.influencer.raise_big_normalized_update_flag();
    }
}
