//! Error types for the Tally settings engine.

use crate::{FieldName, SchemaVersion};
use thiserror::Error;

/// All possible errors from the settings engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown field: {0}")]
    UnknownField(FieldName),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: FieldName,
        expected: String,
        got: String,
    },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: FieldName, reason: String },

    // Durable state errors
    #[error("corrupt durable state: {0}")]
    CorruptState(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Whether this error rejects a mutation (as opposed to a storage problem).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownField(_) | Error::TypeMismatch { .. } | Error::InvalidValue { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownField("colour".into());
        assert_eq!(err.to_string(), "unknown field: colour");

        let err = Error::TypeMismatch {
            field: "decimalPlaces".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'decimalPlaces': expected Int, got String"
        );

        let err = Error::InvalidValue {
            field: "theme".into(),
            reason: "expected one of light, dark".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for field 'theme': expected one of light, dark"
        );
    }

    #[test]
    fn validation_classification() {
        assert!(Error::UnknownField("x".into()).is_validation());
        assert!(!Error::CorruptState("bad json".into()).is_validation());
        assert!(!Error::SchemaVersionMismatch {
            expected: 1,
            actual: 2
        }
        .is_validation());
    }
}
