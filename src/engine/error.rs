use ulid::Ulid;

use crate::clock::TimeFormatError;
use crate::model::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid time format: {0}")]
    InvalidTimeFormat(#[from] TimeFormatError),

    /// The requested interval overlaps this blocking booking.
    #[error("slot unavailable: overlaps booking {0}")]
    SlotUnavailable(Ulid),

    #[error("illegal transition for booking {id}: {from} -> {to}")]
    IllegalTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("version conflict on booking {id}: expected {expected}, current {actual}")]
    VersionConflict { id: Ulid, expected: u64, actual: u64 },

    #[error("booking not found: {0}")]
    NotFound(Ulid),

    #[error("booking id already exists: {0}")]
    DuplicateId(Ulid),

    /// Durable store failure. Safe to retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable kind name reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::InvalidTimeFormat(_) => "InvalidTimeFormat",
            EngineError::SlotUnavailable(_) => "SlotUnavailable",
            EngineError::IllegalTransition { .. } => "IllegalTransition",
            EngineError::VersionConflict { .. } => "VersionConflict",
            EngineError::NotFound(_) => "NotFound",
            EngineError::DuplicateId(_) => "DuplicateId",
            EngineError::Unavailable(_) => "Unavailable",
        }
    }

    /// `InvalidTimeFormat` is a refinement of `InvalidInput`.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, EngineError::InvalidInput(_) | EngineError::InvalidTimeFormat(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::VersionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_errors_are_invalid_input() {
        let err: EngineError = TimeFormatError::BadClock("25:00".into()).into();
        assert_eq!(err.kind(), "InvalidTimeFormat");
        assert!(err.is_invalid_input());
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_carries_versions() {
        let id = Ulid::new();
        let err = EngineError::VersionConflict { id, expected: 0, actual: 1 };
        assert_eq!(err.to_string(), format!("version conflict on booking {id}: expected 0, current 1"));
        assert!(err.is_retryable());
    }
}
