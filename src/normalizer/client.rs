use std::sync::Arc;

use crate::error::ScoringError;
use crate::normalizer::node::ResultNode;
use crate::normalizer::process::{ScoringProcess, ScoringProcessFactory, HEADER};

/// Recomputes normalized scores for a batch of root nodes in place.
pub trait Normalizer: Send {
    fn normalize(
        &self,
        bucket_span_seconds: u64,
        roots: &mut [&mut dyn ResultNode],
        quantiles_state: &str,
    ) -> Result<(), ScoringError>;
}

/// Decides whether a score moved far enough to be worth rewriting.
///
/// A change counts when the absolute difference reaches `min_absolute_delta`, or when the
/// smaller score is below `min_relative_ratio` of the larger one. The second clause catches
/// small scores that moved a lot relative to themselves, including moves to or from zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreChangePolicy {
    pub min_absolute_delta: f64,
    pub min_relative_ratio: f64,
}

impl Default for ScoreChangePolicy {
    fn default() -> Self {
        Self {
            min_absolute_delta: 1.0,
            min_relative_ratio: 0.5,
        }
    }
}

impl ScoreChangePolicy {
    pub fn is_significant(&self, old: f64, new: f64) -> bool {
        if old == new {
            return false;
        }
        if (new - old).abs() >= self.min_absolute_delta {
            return true;
        }
        let (low, high) = if old < new { (old, new) } else { (new, old) };
        low < self.min_relative_ratio * high
    }
}

/// Drives one scoring process per `normalize` call.
pub struct ScoringNormalizer {
    job_id: String,
    factory: Arc<dyn ScoringProcessFactory>,
    policy: ScoreChangePolicy,
}

impl ScoringNormalizer {
    pub fn new(
        job_id: impl Into<String>,
        factory: Arc<dyn ScoringProcessFactory>,
        policy: ScoreChangePolicy,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            factory,
            policy,
        }
    }

    fn exchange(
        &self,
        process: &mut dyn ScoringProcess,
        roots: &mut [&mut dyn ResultNode],
    ) -> Result<(), ScoringError> {
        process.write_record(&HEADER)?;
        let mut written = 0usize;
        for root in roots.iter() {
            let root: &dyn ResultNode = &**root;
            if !root.is_container_only() {
                write_node(process, root)?;
                written += 1;
            }
            for child in root.children() {
                write_node(process, child)?;
                written += 1;
            }
        }
        process.close_input()?;

        let mut scores = Vec::with_capacity(written);
        while let Some(result) = process.read_result()? {
            if scores.len() == written {
                return Err(ScoringError::Protocol(format!(
                    "scoring process returned more than the {written} results expected"
                )));
            }
            scores.push(result.score()?);
        }
        if scores.len() < written {
            return Err(ScoringError::Protocol(format!(
                "scoring process returned {} results for {written} rows",
                scores.len()
            )));
        }

        let mut scores = scores.into_iter();
        for root in roots.iter_mut() {
            self.apply(&mut **root, &mut scores)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        node: &mut dyn ResultNode,
        scores: &mut impl Iterator<Item = f64>,
    ) -> Result<(), ScoringError> {
        if !node.is_container_only() {
            let score = next_score(scores)?;
            self.apply_score(node, score);
            for child_type in 0..node.child_type_count() {
                for child in node.children_of_type_mut(child_type)? {
                    child.set_parent_context(score)?;
                }
            }
        }

        for child_type in 0..node.child_type_count() {
            let mut max: Option<f64> = None;
            for child in node.children_of_type_mut(child_type)? {
                let score = next_score(scores)?;
                self.apply_score(child, score);
                max = Some(max.map_or(score, |current| current.max(score)));
            }
            let Some(max) = max else {
                continue;
            };
            let previous = node.aggregate(child_type)?;
            if node.set_aggregate_from_children(child_type, max)?
                && self.policy.is_significant(previous, max)
            {
                node.raise_change_flag();
            }
        }
        Ok(())
    }

    fn apply_score(&self, node: &mut dyn ResultNode, score: f64) {
        let previous = node.normalized_score();
        node.set_normalized_score(score);
        if self.policy.is_significant(previous, score) {
            node.raise_change_flag();
        }
    }
}

impl Normalizer for ScoringNormalizer {
    fn normalize(
        &self,
        bucket_span_seconds: u64,
        roots: &mut [&mut dyn ResultNode],
        quantiles_state: &str,
    ) -> Result<(), ScoringError> {
        let mut process = self
            .factory
            .create(&self.job_id, quantiles_state, bucket_span_seconds)?;
        match self.exchange(process.as_mut(), roots) {
            Ok(()) => process.close(),
            Err(err) => {
                if let Err(close_err) = process.close() {
                    tracing::warn!(job_id = %self.job_id, error = %close_err, "failed to close scoring process");
                }
                Err(err)
            }
        }
    }
}

fn write_node(process: &mut dyn ScoringProcess, node: &dyn ResultNode) -> Result<(), ScoringError> {
    let probability = format!("{:?}", node.probability()?);
    process.write_record(&[
        node.level().as_str(),
        node.partition_field_name(),
        node.partition_field_value(),
        node.person_field_name(),
        node.function_name(),
        node.value_field_name(),
        &probability,
    ])
}

fn next_score(scores: &mut impl Iterator<Item = f64>) -> Result<f64, ScoringError> {
    scores
        .next()
        .ok_or_else(|| ScoringError::Protocol("ran out of results while applying scores".to_string()))
}
