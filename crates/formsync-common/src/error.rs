//! Error types shared across formsync crates

use thiserror::Error;

use crate::types::ScalarType;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommonError {
    #[error("Unknown data type: '{0}' (expected string, int, float, bool, date or repeat)")]
    UnknownDataType(String),

    #[error("Cannot coerce '{value}' to {data_type}")]
    Coercion { data_type: ScalarType, value: String },

    #[error("Nested value cannot be stored in a {0} field")]
    NestedValue(ScalarType),
}
