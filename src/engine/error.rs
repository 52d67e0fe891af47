use thiserror::Error;
use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("outside operating hours: {0}")]
    OutOfHours(String),
    #[error("all {0} slots are booked for this time")]
    SlotUnavailable(u32),
    #[error("cannot {action} an appointment that is {from}")]
    InvalidTransition {
        from: AppointmentStatus,
        action: &'static str,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::OutOfHours(_) => "out_of_hours",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
