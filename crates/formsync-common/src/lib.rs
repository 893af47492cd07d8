//! Formsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, value coercion and logging for the formsync workspace.
//!
//! # Overview
//!
//! - **Types**: field data types, typed field values and the raw record shape
//!   produced by remote survey sources
//! - **Error Handling**: coercion and parsing errors
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use formsync_common::types::{FieldValue, ScalarType};
//! use serde_json::json;
//!
//! let value = ScalarType::Int.coerce(&json!("42")).unwrap();
//! assert_eq!(value, Some(FieldValue::Int(42)));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DataType, FieldValue, RawRecord, ScalarType};
