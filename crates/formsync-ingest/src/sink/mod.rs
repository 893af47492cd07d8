//! Upsert sinks
//!
//! A sink writes normalized records into one table or collection per form
//! and per repeat group, keyed so that writing the same records twice leaves
//! the store unchanged.
//!
//! - **postgres**: `INSERT … ON CONFLICT DO UPDATE`, one transaction per target
//! - **mongo**: unordered `update` commands with `upsert: true`

pub mod mongo;
pub mod postgres;

use async_trait::async_trait;
use formsync_common::{RawRecord, ScalarType};
use serde::Serialize;
use std::str::FromStr;

use crate::error::{ConfigError, SinkError};
use crate::flatten::RepeatGroup;
use crate::normalize::NormalizedRecord;
use crate::registry::{FieldKind, FieldSpec, FormDefinition, CHILD_KEY_COLUMN, PARENT_KEY_COLUMN};

pub use mongo::MongoSink;
pub use postgres::PostgresSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: ScalarType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Where a set of records goes and how it is keyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertTarget {
    pub name: String,
    pub key_column: String,
    /// Every column, key included, in table order
    pub columns: Vec<Column>,
}

impl UpsertTarget {
    /// Target for a form's top-level submissions
    pub fn for_form(form: &FormDefinition) -> Self {
        let mut columns = scalar_columns(&form.fields);
        if !columns.iter().any(|c| c.name == form.unique_key) {
            columns.insert(0, Column::new(&form.unique_key, ScalarType::String));
        }

        Self {
            name: form.target_name().to_string(),
            key_column: form.unique_key.clone(),
            columns,
        }
    }

    /// Target for one repeat group, keyed by the row key
    pub fn for_group(form: &FormDefinition, group: &RepeatGroup, fields: &[FieldSpec]) -> Self {
        let mut columns = vec![
            Column::new(CHILD_KEY_COLUMN, ScalarType::String),
            Column::new(PARENT_KEY_COLUMN, ScalarType::String),
        ];
        columns.extend(scalar_columns(fields));

        Self {
            name: form.group_target_name(&group.target_path),
            key_column: CHILD_KEY_COLUMN.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn scalar_columns(fields: &[FieldSpec]) -> Vec<Column> {
    fields
        .iter()
        .filter_map(|f| match &f.kind {
            FieldKind::Scalar { data_type, .. } => Some(Column::new(&f.target_name, *data_type)),
            FieldKind::Repeat { .. } => None,
        })
        .collect()
}

/// Result of upserting one record set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl UpsertOutcome {
    pub fn succeeded(count: usize) -> Self {
        Self {
            succeeded: count,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: UpsertOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.details.extend(other.details);
    }
}

#[async_trait]
pub trait UpsertSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert or update `records` in `target`, keyed by `target.key_column`.
    ///
    /// An empty record set is a no-op returning an empty outcome.
    async fn upsert(&self, target: &UpsertTarget, records: &[NormalizedRecord]) -> Result<UpsertOutcome, SinkError>;
}

/// Unmodified source documents keyed by their `_id`
#[async_trait]
pub trait RawDocumentSink: Send + Sync {
    async fn upsert_raw(&self, collection: &str, records: &[RawRecord]) -> Result<UpsertOutcome, SinkError>;
}

/// Store selected for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Postgres,
    Mongo,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(SinkKind::Postgres),
            "mongo" | "mongodb" => Ok(SinkKind::Mongo),
            other => Err(ConfigError::invalid(
                "FORMSYNC_SINK",
                format!("unknown sink '{}', expected postgres or mongo", other),
            )),
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Postgres => write!(f, "postgres"),
            SinkKind::Mongo => write!(f, "mongo"),
        }
    }
}
