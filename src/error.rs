//! Error types for DAG recovery

use thiserror::Error;

use crate::cancel::CancelReason;
use crate::cid::Cid;

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Node not found: {0}")]
    NotFound(Cid),

    // Encode-time validation
    #[error("Node must have links")]
    NoLinks,

    #[error("Node's links must have equal size")]
    SizesNotEqual,

    #[error("Wrong node type: expected {expected}")]
    WrongNodeType { expected: &'static str },

    #[error("Invalid recoverability: {0}")]
    InvalidRecoverability(String),

    #[error("{0} is not linked from the recovery node")]
    UnknownChild(Cid),

    #[error("Maximum recoverability exceeded")]
    RecoveryExceeded,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("No decoder registered for codec {0:#x}")]
    UnknownCodec(u64),

    #[error("Invalid block format: {0}")]
    InvalidFormat(String),

    #[error("Content id mismatch: expected {expected}, got {actual}")]
    CidMismatch { expected: Cid, actual: Cid },

    #[error("Erasure coding error: {0}")]
    Coding(#[from] reed_solomon_erasure::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RecoveryError {
    /// Stable error code for logs and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::NotFound(_) => "NOT_FOUND",
            RecoveryError::NoLinks
            | RecoveryError::SizesNotEqual
            | RecoveryError::WrongNodeType { .. }
            | RecoveryError::InvalidRecoverability(_) => "VALIDATION",
            RecoveryError::UnknownChild(_) => "UNKNOWN_CHILD",
            RecoveryError::RecoveryExceeded => "RECOVERY_EXCEEDED",
            RecoveryError::Cancelled => "CANCELLED",
            RecoveryError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RecoveryError::UnknownCodec(_) => "UNKNOWN_CODEC",
            RecoveryError::InvalidFormat(_) | RecoveryError::CidMismatch { .. } => "DECODE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for a definite miss (as opposed to "gave up" or "broken").
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecoveryError::NotFound(_))
    }

    /// True for errors raised while validating a node for encoding.
    pub fn is_validation(&self) -> bool {
        self.code() == "VALIDATION"
    }

    /// True when the caller's token was cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RecoveryError::Cancelled | RecoveryError::DeadlineExceeded)
    }
}

impl From<CancelReason> for RecoveryError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => RecoveryError::Cancelled,
            CancelReason::DeadlineExceeded => RecoveryError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_codes() {
        assert!(RecoveryError::NoLinks.is_validation());
        assert!(RecoveryError::SizesNotEqual.is_validation());
        assert!(RecoveryError::InvalidRecoverability("0".into()).is_validation());
        assert!(!RecoveryError::RecoveryExceeded.is_validation());
    }

    #[test]
    fn test_cancel_reason_maps_to_distinct_errors() {
        let cancelled: RecoveryError = CancelReason::Cancelled.into();
        let deadline: RecoveryError = CancelReason::DeadlineExceeded.into();

        assert_eq!(cancelled.code(), "CANCELLED");
        assert_eq!(deadline.code(), "DEADLINE_EXCEEDED");
        assert!(cancelled.is_cancelled() && deadline.is_cancelled());
        assert!(!cancelled.is_not_found());
    }

    #[test]
    fn test_not_found_display() {
        let id = Cid::raw(b"gone");
        let err = RecoveryError::NotFound(id);
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("Node not found: raw:"));
    }
}
