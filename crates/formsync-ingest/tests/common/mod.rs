//! Shared fixtures for formsync-ingest integration tests
//!
//! - [`MemorySink`]: keyed in-memory store implementing both sink traits
//! - [`StubFetcher`]: canned submissions and repeat-group exports
//! - [`TestPostgres`]: throwaway PostgreSQL container (requires Docker)
//! - [`TestMongo`]: throwaway MongoDB container (requires Docker)

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use formsync_common::RawRecord;
use formsync_ingest::error::{FetchCause, FetchError, SinkError};
use formsync_ingest::fetch::{Cursor, FetchBatch, RemoteFetcher, RepeatLayout};
use formsync_ingest::normalize::NormalizedRecord;
use formsync_ingest::registry::FieldSpec;
use formsync_ingest::sink::{RawDocumentSink, UpsertOutcome, UpsertSink, UpsertTarget};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::mongo::Mongo;
use testcontainers_modules::postgres::Postgres;

pub fn raw(value: Value) -> RawRecord {
    value.as_object().expect("fixture must be a JSON object").clone()
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,formsync_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// In-memory sink
// ============================================================================

#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, BTreeMap<String, NormalizedRecord>>>,
    collections: Mutex<HashMap<String, BTreeMap<String, RawRecord>>>,
    failing: HashSet<String>,
    rejecting: HashSet<String>,
    calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write to `target` as a whole
    pub fn failing_on(mut self, target: &str) -> Self {
        self.failing.insert(target.to_string());
        self
    }

    /// Reject single records with this key, the way a store reports write errors
    pub fn rejecting_key(mut self, key: &str) -> Self {
        self.rejecting.insert(key.to_string());
        self
    }

    pub fn rows(&self, target: &str) -> Vec<NormalizedRecord> {
        self.tables
            .lock()
            .unwrap()
            .get(target)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, target: &str, key: &str) -> Option<NormalizedRecord> {
        self.tables.lock().unwrap().get(target)?.get(key).cloned()
    }

    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn documents(&self, collection: &str) -> Vec<RawRecord> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of upsert calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, target: &str) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(target) {
            return Err(SinkError::Target {
                target: target.to_string(),
                message: "rejected by test sink".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, target: &UpsertTarget, records: &[NormalizedRecord]) -> Result<UpsertOutcome, SinkError> {
        self.check(&target.name)?;
        let mut outcome = UpsertOutcome::default();
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(target.name.clone()).or_default();

        for record in records {
            match record.key_text(&target.key_column) {
                Some(key) if self.rejecting.contains(&key) => {
                    outcome.failed += 1;
                    outcome.details.push(format!("{}: E11000 duplicate key", key));
                },
                Some(key) => {
                    table.insert(key, record.clone());
                    outcome.succeeded += 1;
                },
                None => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RawDocumentSink for MemorySink {
    async fn upsert_raw(&self, collection: &str, records: &[RawRecord]) -> Result<UpsertOutcome, SinkError> {
        self.check(collection)?;
        let mut outcome = UpsertOutcome::default();
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();

        for record in records {
            match record.get("_id") {
                Some(id) if !id.is_null() => {
                    docs.insert(id.to_string(), record.clone());
                    outcome.succeeded += 1;
                },
                _ => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// Stub fetcher
// ============================================================================

pub struct StubFetcher {
    layout: RepeatLayout,
    forms: HashMap<String, Vec<RawRecord>>,
    groups: HashMap<(String, String), Vec<RawRecord>>,
    failing: HashSet<String>,
    field_trees: HashMap<String, Result<Vec<FieldSpec>, String>>,
    group_fetches: AtomicUsize,
}

impl StubFetcher {
    pub fn new(layout: RepeatLayout) -> Self {
        Self {
            layout,
            forms: HashMap::new(),
            groups: HashMap::new(),
            failing: HashSet::new(),
            field_trees: HashMap::new(),
            group_fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_form(mut self, form_id: &str, records: Vec<RawRecord>) -> Self {
        self.forms.insert(form_id.to_string(), records);
        self
    }

    pub fn with_group(mut self, form_id: &str, group: &str, records: Vec<RawRecord>) -> Self {
        self.groups
            .insert((form_id.to_string(), group.to_string()), records);
        self
    }

    /// Fail fetches of a form (`form`) or of one of its groups (`form/group`)
    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn with_field_tree(mut self, form_id: &str, tree: Result<Vec<FieldSpec>, String>) -> Self {
        self.field_trees.insert(form_id.to_string(), tree);
        self
    }

    pub fn group_fetches(&self) -> usize {
        self.group_fetches.load(Ordering::SeqCst)
    }

    fn server_error(id: &str) -> FetchError {
        FetchCause::Status {
            url: format!("stub://{}", id),
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        }
        .for_form(id)
    }
}

#[async_trait]
impl RemoteFetcher for StubFetcher {
    fn source_name(&self) -> &'static str {
        "stub"
    }

    fn repeat_layout(&self) -> RepeatLayout {
        self.layout
    }

    async fn fetch(&self, form_id: &str, _cursor: Option<&Cursor>) -> Result<FetchBatch, FetchError> {
        if self.failing.contains(form_id) {
            return Err(Self::server_error(form_id));
        }
        Ok(FetchBatch {
            records: self.forms.get(form_id).cloned().unwrap_or_default(),
            columns: vec![],
            next: None,
        })
    }

    async fn fetch_repeat_group(&self, form_id: &str, group: &str) -> Result<FetchBatch, FetchError> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}/{}", form_id, group);
        if self.failing.contains(&id) {
            return Err(Self::server_error(&id));
        }
        Ok(FetchBatch {
            records: self
                .groups
                .get(&(form_id.to_string(), group.to_string()))
                .cloned()
                .unwrap_or_default(),
            columns: vec![],
            next: None,
        })
    }

    async fn field_tree(&self, form_id: &str) -> Result<Option<Vec<FieldSpec>>, FetchError> {
        match self.field_trees.get(form_id) {
            None => Ok(None),
            Some(Ok(tree)) => Ok(Some(tree.clone())),
            Some(Err(message)) => Err(FetchCause::Payload(message.clone()).for_form(form_id)),
        }
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL container")?;

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// ============================================================================
// MongoDB Test Container
// ============================================================================

pub struct TestMongo {
    _container: ContainerAsync<Mongo>,
    client: mongodb::Client,
}

impl TestMongo {
    pub async fn start() -> Result<Self> {
        let container = Mongo::default()
            .start()
            .await
            .context("Failed to start MongoDB container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(27017.tcp())
            .await
            .context("Failed to get container port")?;

        let client = mongodb::Client::with_uri_str(format!("mongodb://{}:{}", host, port))
            .await
            .context("Failed to connect to MongoDB container")?;

        Ok(Self {
            _container: container,
            client,
        })
    }

    pub fn database(&self, name: &str) -> mongodb::Database {
        self.client.database(name)
    }
}
