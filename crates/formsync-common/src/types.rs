//! Common types used across formsync
//!
//! Remote survey sources hand us loosely typed JSON (or CSV cells lifted into
//! JSON strings). The registry declares what each field should be, and
//! [`ScalarType::coerce`] bridges the two.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommonError, Result};

/// A record exactly as the remote source produced it.
///
/// Keys are source field names. Embedded repeat groups show up as arrays of
/// objects.
pub type RawRecord = serde_json::Map<String, Value>;

/// Sentinel stored in date fields that are missing from a submission.
pub fn date_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Declared type of a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    Date,
    Repeat,
}

impl DataType {
    /// Scalar counterpart, `None` for repeat groups
    pub fn scalar(self) -> Option<ScalarType> {
        match self {
            DataType::String => Some(ScalarType::String),
            DataType::Int => Some(ScalarType::Int),
            DataType::Float => Some(ScalarType::Float),
            DataType::Bool => Some(ScalarType::Bool),
            DataType::Date => Some(ScalarType::Date),
            DataType::Repeat => None,
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "text" | "str" => Ok(DataType::String),
            "int" | "integer" => Ok(DataType::Int),
            "float" | "decimal" | "number" => Ok(DataType::Float),
            "bool" | "boolean" => Ok(DataType::Bool),
            "date" | "datetime" => Ok(DataType::Date),
            "repeat" => Ok(DataType::Repeat),
            _ => Err(CommonError::UnknownDataType(s.to_string())),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scalar() {
            Some(scalar) => scalar.fmt(f),
            None => write!(f, "repeat"),
        }
    }
}

/// Type of a leaf (non-repeat) field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    String,
    Int,
    Float,
    Bool,
    Date,
}

impl ScalarType {
    pub const ALL: [ScalarType; 5] = [
        ScalarType::String,
        ScalarType::Int,
        ScalarType::Float,
        ScalarType::Bool,
        ScalarType::Date,
    ];

    /// Value substituted when a field is missing or cannot be coerced.
    ///
    /// Total over every scalar type; never produces a null.
    pub fn default_value(self) -> FieldValue {
        match self {
            ScalarType::String => FieldValue::String(String::new()),
            ScalarType::Int => FieldValue::Int(0),
            ScalarType::Float => FieldValue::Float(0.0),
            ScalarType::Bool => FieldValue::Bool(false),
            ScalarType::Date => FieldValue::Date(date_sentinel()),
        }
    }

    /// Coerce an untyped JSON value into this type.
    ///
    /// `Ok(None)` means "no value" (null or blank) and the caller should
    /// apply a default.
    pub fn coerce(self, value: &Value) -> Result<Option<FieldValue>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => self.parse_str(s.trim()).map(Some),
            Value::Bool(b) => match self {
                ScalarType::Bool => Ok(Some(FieldValue::Bool(*b))),
                ScalarType::String => Ok(Some(FieldValue::String(b.to_string()))),
                ScalarType::Int => Ok(Some(FieldValue::Int(i64::from(*b)))),
                ScalarType::Float | ScalarType::Date => Err(self.coercion_error(value)),
            },
            Value::Number(n) => match self {
                ScalarType::String => Ok(Some(FieldValue::String(n.to_string()))),
                ScalarType::Int => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => Ok(Some(FieldValue::Int(i))),
                    (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(Some(FieldValue::Int(f as i64)))
                    },
                    _ => Err(self.coercion_error(value)),
                },
                ScalarType::Float => n
                    .as_f64()
                    .map(|f| Some(FieldValue::Float(f)))
                    .ok_or_else(|| self.coercion_error(value)),
                ScalarType::Bool => match n.as_i64() {
                    Some(0) => Ok(Some(FieldValue::Bool(false))),
                    Some(1) => Ok(Some(FieldValue::Bool(true))),
                    _ => Err(self.coercion_error(value)),
                },
                ScalarType::Date => Err(self.coercion_error(value)),
            },
            Value::Array(_) | Value::Object(_) => Err(CommonError::NestedValue(self)),
        }
    }

    /// Parse a textual value (CSV cell, declared default) into this type
    pub fn parse_str(self, raw: &str) -> Result<FieldValue> {
        let err = || CommonError::Coercion {
            data_type: self,
            value: raw.to_string(),
        };

        match self {
            ScalarType::String => Ok(FieldValue::String(raw.to_string())),
            ScalarType::Int => raw
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(FieldValue::Int)
                .ok_or_else(err),
            ScalarType::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(FieldValue::Float)
                .ok_or_else(err),
            ScalarType::Bool => match raw.to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(err()),
            },
            ScalarType::Date => parse_date(raw).map(FieldValue::Date).ok_or_else(err),
        }
    }

    fn coercion_error(self, value: &Value) -> CommonError {
        CommonError::Coercion {
            data_type: self,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarType::String => write!(f, "string"),
            ScalarType::Int => write!(f, "int"),
            ScalarType::Float => write!(f, "float"),
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::Date => write!(f, "date"),
        }
    }
}

// Survey exports mix ISO dates, RFC 3339 timestamps and the
// "Feb 12, 2019 10:31:53 AM" style used by SurveyCTO CSV exports.
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%b %d, %Y %I:%M:%S %p",
    "%b %e, %Y %I:%M:%S %p",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%b %d, %Y", "%d/%m/%Y"];

/// Parse the date component out of the formats remote sources emit
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        })
}

/// A typed value held by a normalized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    String(String),
}

impl FieldValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            FieldValue::String(_) => ScalarType::String,
            FieldValue::Int(_) => ScalarType::Int,
            FieldValue::Float(_) => ScalarType::Float,
            FieldValue::Bool(_) => ScalarType::Bool,
            FieldValue::Date(_) => ScalarType::Date,
        }
    }

    /// True for values that cannot identify a record (blank strings)
    pub fn is_blank(&self) -> bool {
        matches!(self, FieldValue::String(s) if s.trim().is_empty())
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}
