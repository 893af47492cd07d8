//! PostgreSQL upsert sink
//!
//! One table per form and per repeat group. The first write to a table in a
//! run creates it (dropping it first when `recreate_tables` is set); every
//! write is a chunked `INSERT … ON CONFLICT (key) DO UPDATE`, all chunks of
//! one target inside a single transaction.

use async_trait::async_trait;
use formsync_common::{FieldValue, ScalarType};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{UpsertOutcome, UpsertSink, UpsertTarget};
use crate::error::SinkError;
use crate::normalize::NormalizedRecord;

/// Bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Longest identifier PostgreSQL stores without truncating (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Default rows per `INSERT` statement
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

pub struct PostgresSink {
    pool: PgPool,
    recreate_tables: bool,
    chunk_size: usize,
    tables: TableLocks,
}

/// One lock per table, holding whether the table was prepared in this run.
///
/// Writers to the same table queue behind each other for the whole
/// transaction, so two of them can never both recreate it; writers to
/// different tables do not wait on each other.
#[derive(Debug, Default)]
pub struct TableLocks {
    tables: Mutex<HashMap<String, Arc<Mutex<bool>>>>,
}

impl TableLocks {
    /// The lock guarding `table`, created unprepared on first request
    pub async fn get(&self, table: &str) -> Arc<Mutex<bool>> {
        let mut tables = self.tables.lock().await;
        Arc::clone(tables.entry(table.to_string()).or_default())
    }
}

impl PostgresSink {
    pub fn new(pool: PgPool, recreate_tables: bool) -> Self {
        Self {
            pool,
            recreate_tables,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tables: TableLocks::default(),
        }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        recreate_tables: bool,
    ) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, recreate_tables))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn prepare_table(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: &UpsertTarget,
    ) -> Result<(), SinkError> {
        let table = quote_ident(&target.name)?;

        if self.recreate_tables {
            info!(table = %target.name, "Recreating table");
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut **tx)
                .await?;
        }

        sqlx::query(&create_table_sql(target)?)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn insert_chunk(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: &UpsertTarget,
        head: &str,
        conflict: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), SinkError> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(head);

        query_builder.push_values(records, |mut b, record| {
            for column in &target.columns {
                let value = record
                    .get(&column.name)
                    .cloned()
                    .unwrap_or_else(|| column.data_type.default_value());
                match value {
                    FieldValue::String(v) => b.push_bind(v),
                    FieldValue::Int(v) => b.push_bind(v),
                    FieldValue::Float(v) => b.push_bind(v),
                    FieldValue::Bool(v) => b.push_bind(v),
                    FieldValue::Date(v) => b.push_bind(v),
                };
            }
        });
        query_builder.push(conflict);

        query_builder.build().execute(&mut **tx).await?;
        Ok(())
    }
}

#[async_trait]
impl UpsertSink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, target: &UpsertTarget, records: &[NormalizedRecord]) -> Result<UpsertOutcome, SinkError> {
        if target.column(&target.key_column).is_none() {
            return Err(SinkError::Target {
                target: target.name.clone(),
                message: format!("key column '{}' is not a column", target.key_column),
            });
        }

        let head = insert_head(target)?;
        let conflict = conflict_clause(target)?;
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let rows_per_statement = rows_per_statement(self.chunk_size, target.columns.len());

        let table_lock = self.tables.get(&target.name).await;
        let mut prepared = table_lock.lock().await;
        let needs_prepare = !*prepared;

        let mut tx = self.pool.begin().await?;

        if needs_prepare {
            self.prepare_table(&mut tx, target).await?;
        }

        let total_chunks = records.len().div_ceil(rows_per_statement);
        for (chunk_idx, chunk) in records.chunks(rows_per_statement).enumerate() {
            debug!(
                table = %target.name,
                "Upserting chunk {} / {} ({} rows)",
                chunk_idx + 1,
                total_chunks,
                chunk.len()
            );
            self.insert_chunk(&mut tx, target, &head, &conflict, chunk).await?;
        }

        tx.commit().await?;
        *prepared = true;

        info!(table = %target.name, rows = records.len(), "Upserted rows");
        Ok(UpsertOutcome::succeeded(records.len()))
    }
}

/// Double-quote an identifier, rejecting names PostgreSQL cannot hold
pub fn quote_ident(name: &str) -> Result<String, SinkError> {
    if name.is_empty() || name.contains('\0') {
        return Err(SinkError::Target {
            target: name.to_string(),
            message: "identifier is empty or contains NUL".to_string(),
        });
    }
    // Longer names are silently truncated, so two targets could share one table
    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(SinkError::Target {
            target: name.to_string(),
            message: format!("identifier is longer than {} bytes", MAX_IDENTIFIER_BYTES),
        });
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub fn sql_type(data_type: ScalarType) -> &'static str {
    match data_type {
        ScalarType::String => "TEXT",
        ScalarType::Int => "BIGINT",
        ScalarType::Float => "DOUBLE PRECISION",
        ScalarType::Bool => "BOOLEAN",
        ScalarType::Date => "DATE",
    }
}

pub fn create_table_sql(target: &UpsertTarget) -> Result<String, SinkError> {
    let mut definitions = Vec::with_capacity(target.columns.len());
    for column in &target.columns {
        let mut definition = format!("{} {}", quote_ident(&column.name)?, sql_type(column.data_type));
        if column.name == target.key_column {
            definition.push_str(" PRIMARY KEY");
        } else {
            definition.push_str(" NOT NULL");
        }
        definitions.push(definition);
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&target.name)?,
        definitions.join(", ")
    ))
}

fn insert_head(target: &UpsertTarget) -> Result<String, SinkError> {
    let columns = target
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("INSERT INTO {} ({}) ", quote_ident(&target.name)?, columns.join(", ")))
}

fn conflict_clause(target: &UpsertTarget) -> Result<String, SinkError> {
    let key = quote_ident(&target.key_column)?;
    let updates = target
        .columns
        .iter()
        .filter(|c| c.name != target.key_column)
        .map(|c| quote_ident(&c.name).map(|q| format!("{q} = EXCLUDED.{q}")))
        .collect::<Result<Vec<_>, _>>()?;

    if updates.is_empty() {
        Ok(format!(" ON CONFLICT ({}) DO NOTHING", key))
    } else {
        Ok(format!(" ON CONFLICT ({}) DO UPDATE SET {}", key, updates.join(", ")))
    }
}

fn rows_per_statement(chunk_size: usize, columns: usize) -> usize {
    chunk_size.min(MAX_BIND_PARAMS / columns.max(1)).max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sink::Column;

    fn target() -> UpsertTarget {
        UpsertTarget {
            name: "baseline".to_string(),
            key_column: "KEY".to_string(),
            columns: vec![
                Column::new("KEY", ScalarType::String),
                Column::new("age", ScalarType::Int),
                Column::new("visit \"date\"", ScalarType::Date),
            ],
        }
    }

    #[tokio::test]
    async fn test_table_locks_are_per_table() {
        let locks = TableLocks::default();
        let baseline = locks.get("baseline").await;
        assert!(Arc::ptr_eq(&baseline, &locks.get("baseline").await));

        let held = baseline.lock().await;
        let members = locks.get("baseline__members").await;
        assert!(members.try_lock().is_ok());
        assert!(locks.get("baseline").await.try_lock().is_err());
        drop(held);

        *locks.get("baseline").await.lock().await = true;
        assert!(*baseline.lock().await);
        assert!(!*members.lock().await);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("baseline").unwrap(), "\"baseline\"");
        assert_eq!(quote_ident("a\"b").unwrap(), "\"a\"\"b\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_quote_ident_rejects_names_postgres_would_truncate() {
        let longest = "a".repeat(MAX_IDENTIFIER_BYTES);
        assert!(quote_ident(&longest).is_ok());

        let table = format!("{}__household_members__visits", "baseline_household_survey_2024_round_two");
        assert!(table.len() > MAX_IDENTIFIER_BYTES);
        assert!(matches!(quote_ident(&table), Err(SinkError::Target { .. })));
        // multibyte names are measured in bytes
        assert!(quote_ident(&"é".repeat(32)).is_err());
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql(&target()).unwrap(),
            "CREATE TABLE IF NOT EXISTS \"baseline\" (\"KEY\" TEXT PRIMARY KEY, \"age\" BIGINT NOT NULL, \
             \"visit \"\"date\"\"\" DATE NOT NULL)"
        );
    }

    #[test]
    fn test_conflict_clause() {
        assert_eq!(
            conflict_clause(&target()).unwrap(),
            " ON CONFLICT (\"KEY\") DO UPDATE SET \"age\" = EXCLUDED.\"age\", \
             \"visit \"\"date\"\"\" = EXCLUDED.\"visit \"\"date\"\"\""
        );

        let key_only = UpsertTarget {
            columns: vec![Column::new("KEY", ScalarType::String)],
            ..target()
        };
        assert_eq!(conflict_clause(&key_only).unwrap(), " ON CONFLICT (\"KEY\") DO NOTHING");
    }

    #[test]
    fn test_insert_head() {
        assert_eq!(
            insert_head(&target()).unwrap(),
            "INSERT INTO \"baseline\" (\"KEY\", \"age\", \"visit \"\"date\"\"\") "
        );
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(rows_per_statement(1_000, 10), 1_000);
        assert_eq!(rows_per_statement(1_000, 100), 655);
        assert_eq!(rows_per_statement(1_000, 100_000), 1);
    }

    #[test]
    fn test_sql_types() {
        let types: Vec<&str> = ScalarType::ALL.iter().map(|t| sql_type(*t)).collect();
        assert_eq!(types, vec!["TEXT", "BIGINT", "DOUBLE PRECISION", "BOOLEAN", "DATE"]);
    }
}
