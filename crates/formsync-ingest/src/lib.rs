//! Formsync Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pulls survey submissions from remote data-collection services and upserts
//! them into an analytical store.
//!
//! # Supported Sources
//!
//! - **SurveyCTO**: wide CSV exports, repeat groups exported separately and
//!   linked through `PARENT_KEY`; metadata calls need a CSRF session
//! - **Ona**: paged JSON submissions with repeat groups nested inline
//!
//! # Supported Sinks
//!
//! - **PostgreSQL**: one table per form and per repeat group, `ON CONFLICT`
//!   upserts inside a transaction
//! - **MongoDB**: one collection per target, unordered upserts by key
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use formsync_ingest::fetch::{OnaConfig, OnaFetcher};
//! use formsync_ingest::sink::PostgresSink;
//! use formsync_ingest::{Pipeline, SchemaRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = SchemaRegistry::load("forms.yaml")?;
//!     let fetcher = OnaFetcher::new(OnaConfig::new("https://api.ona.io/api/v1", "token"))?;
//!     let sink = PostgresSink::connect("postgres://localhost/surveys", 5, false).await?;
//!
//!     let pipeline = Pipeline::new("ona", Arc::new(registry), Arc::new(fetcher), Arc::new(sink));
//!     let summary = pipeline.run(Utc::now()).await;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod flatten;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod summary;

pub use config::{IngestConfig, RunMode, SinkConfig, SourceConfig, SourceKind};
pub use error::{ConfigError, FetchCause, FetchError, IngestError, NormalizeError, Result, SinkError};
pub use pipeline::Pipeline;
pub use registry::{FieldSpec, FormDefinition, SchemaRegistry};
pub use summary::{FormOutcome, GroupOutcome, RunStatus, RunSummary, UnitStatus};
