use thiserror::Error;

/// Misuse of a result node, e.g. asking a container for its probability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("{kind} node has no {what}")]
    InvalidState {
        kind: &'static str,
        what: &'static str,
    },
    #[error("{kind} node has no child type {child_type}")]
    InvalidChildType {
        kind: &'static str,
        child_type: usize,
    },
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("failed to start scoring process for job {job_id}: {source}")]
    ProcessStart {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("scoring process protocol error: {0}")]
    Protocol(String),
    #[error("scoring process I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Node(#[from] NodeError),
}

#[derive(Debug, Error)]
pub enum RenormalizeError {
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("failed to read results for renormalization: {0:#}")]
    Iteration(anyhow::Error),
    #[error("renormalization interrupted by shutdown")]
    Cancelled,
}

impl RenormalizeError {
    pub fn code(&self) -> &'static str {
        match self {
            RenormalizeError::Scoring(ScoringError::ProcessStart { .. }) => "process_start",
            RenormalizeError::Scoring(ScoringError::Protocol(_)) => "protocol",
            RenormalizeError::Scoring(ScoringError::Io(_)) => "process_io",
            RenormalizeError::Scoring(ScoringError::Node(_)) => "invalid_node",
            RenormalizeError::Iteration(_) => "iteration",
            RenormalizeError::Cancelled => "cancelled",
        }
    }
}
