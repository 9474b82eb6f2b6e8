//! Persisted anomaly result entities.
//!
//! These mirror the documents the analysis process writes to the results store. Only the
//! fields renormalization reads or rewrites are modelled; everything else stays in the
//! store untouched because updates are keyed by `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Influencer field name reserved for the elapsed-time factor of a bucket.
pub const BUCKET_TIME: &str = "bucketTime";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(default)]
    pub id: Option<String>,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub bucket_span: u64,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default)]
    pub initial_anomaly_score: f64,
    #[serde(default)]
    pub raw_anomaly_score: f64,
    #[serde(default)]
    pub max_normalized_probability: f64,
    #[serde(default)]
    pub record_count: u32,
    #[serde(default)]
    pub is_interim: bool,
    #[serde(default)]
    pub bucket_influencers: Vec<BucketInfluencer>,
    #[serde(default)]
    pub records: Vec<AnomalyRecord>,
    #[serde(skip)]
    pub(crate) had_big_normalized_update: bool,
}

impl Bucket {
    pub fn new(job_id: impl Into<String>, timestamp: DateTime<Utc>, bucket_span: u64) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp,
            bucket_span,
            ..Self::default()
        }
    }

    /// A bucket is worth renormalizing only when something in it can carry a score.
    pub fn is_normalizable(&self) -> bool {
        !self.bucket_influencers.is_empty() && (self.anomaly_score != 0.0 || self.record_count != 0)
    }

    pub fn had_big_normalized_update(&self) -> bool {
        self.had_big_normalized_update
    }

    pub fn raise_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = true;
    }

    pub fn reset_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketInfluencer {
    pub influencer_field_name: String,
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default)]
    pub initial_anomaly_score: f64,
    #[serde(default)]
    pub raw_anomaly_score: f64,
    #[serde(skip)]
    pub(crate) had_big_normalized_update: bool,
}

impl BucketInfluencer {
    pub fn new(influencer_field_name: impl Into<String>, probability: f64) -> Self {
        Self {
            influencer_field_name: influencer_field_name.into(),
            probability,
            ..Self::default()
        }
    }

    pub fn is_bucket_time(&self) -> bool {
        self.influencer_field_name == BUCKET_TIME
    }

    pub fn had_big_normalized_update(&self) -> bool {
        self.had_big_normalized_update
    }

    pub fn raise_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = true;
    }

    pub fn reset_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub detector_index: u32,
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub normalized_probability: f64,
    #[serde(default)]
    pub initial_normalized_probability: f64,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub by_field_name: Option<String>,
    #[serde(default)]
    pub over_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_value: Option<String>,
    #[serde(default)]
    pub is_interim: bool,
    #[serde(skip)]
    pub(crate) had_big_normalized_update: bool,
}

impl AnomalyRecord {
    /// The population (over) field wins over the by field when both are set.
    pub fn person_field_name(&self) -> Option<&str> {
        self.over_field_name
            .as_deref()
            .or(self.by_field_name.as_deref())
    }

    pub fn had_big_normalized_update(&self) -> bool {
        self.had_big_normalized_update
    }

    pub fn raise_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = true;
    }

    pub fn reset_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Influencer {
    #[serde(default)]
    pub id: Option<String>,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub influencer_field_name: String,
    pub influencer_field_value: String,
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub anomaly_score: f64,
    #[serde(default)]
    pub initial_anomaly_score: f64,
    #[serde(default)]
    pub is_interim: bool,
    #[serde(skip)]
    pub(crate) had_big_normalized_update: bool,
}

impl Influencer {
    pub fn had_big_normalized_update(&self) -> bool {
        self.had_big_normalized_update
    }

    pub fn raise_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = true;
    }

    pub fn reset_big_normalized_update_flag(&mut self) {
        self.had_big_normalized_update = false;
    }
}

/// Calibration snapshot emitted by the analysis process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantiles {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub quantile_state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_with(influencers: usize, anomaly_score: f64, record_count: u32) -> Bucket {
        let mut bucket = Bucket::new("job", Utc::now(), 3600);
        for _ in 0..influencers {
            bucket
                .bucket_influencers
                .push(BucketInfluencer::new(BUCKET_TIME, 0.5));
        }
        bucket.anomaly_score = anomaly_score;
        bucket.record_count = record_count;
        bucket
    }

    #[test]
    fn bucket_without_influencers_is_not_normalizable() {
        assert!(!bucket_with(0, 10.0, 3).is_normalizable());
    }

    #[test]
    fn bucket_with_zero_score_and_no_records_is_not_normalizable() {
        assert!(!bucket_with(1, 0.0, 0).is_normalizable());
    }

    #[test]
    fn bucket_with_score_or_records_is_normalizable() {
        assert!(bucket_with(1, 1.0, 0).is_normalizable());
        assert!(bucket_with(1, 0.0, 2).is_normalizable());
    }

    #[test]
    fn record_person_field_prefers_over_field() {
        let record = AnomalyRecord {
            by_field_name: Some("host".to_string()),
            over_field_name: Some("user".to_string()),
            ..AnomalyRecord::default()
        };
        assert_eq!(record.person_field_name(), Some("user"));

        let record = AnomalyRecord {
            by_field_name: Some("host".to_string()),
            ..AnomalyRecord::default()
        };
        assert_eq!(record.person_field_name(), Some("host"));
    }

    #[test]
    fn change_flag_is_not_serialized() {
        let mut bucket = bucket_with(1, 5.0, 0);
        bucket.raise_big_normalized_update_flag();
        let json = serde_json::to_value(&bucket).unwrap();
        assert!(json.get("had_big_normalized_update").is_none());

        let parsed: Bucket = serde_json::from_value(json).unwrap();
        assert!(!parsed.had_big_normalized_update());
    }
}
