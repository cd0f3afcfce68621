use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsdpError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Shard sizes disagree with the partition implied by the full shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A collective reported an error; surfaced at the wait point, never retried here.
    #[error("Communication failure during {op}: {reason}")]
    CommunicationFailure { op: &'static str, reason: String },

    #[error("Invalid mesh shape: {0}")]
    InvalidMeshShape(String),

    /// An operation was requested in a state that cannot accept it.
    #[error("State violation in group '{group}': {reason}")]
    StateViolation { group: String, reason: String },

    #[error("Loss mismatch on rank {rank} at step {step}: sharded {sharded} vs reference {reference}")]
    LossMismatch {
        rank: usize,
        step: usize,
        sharded: f32,
        reference: f32,
    },
}

impl FsdpError {
    pub fn state_violation(group: impl Into<String>, reason: impl Into<String>) -> Self {
        FsdpError::StateViolation {
            group: group.into(),
            reason: reason.into(),
        }
    }

    pub fn comm_failure(op: &'static str, reason: impl ToString) -> Self {
        FsdpError::CommunicationFailure {
            op,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsdpError>;
