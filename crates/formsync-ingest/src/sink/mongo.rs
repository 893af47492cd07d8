//! MongoDB upsert sink
//!
//! Records are written with the `update` database command rather than a
//! bulk-write helper so that each statement's outcome can be read back from
//! the reply: statements run unordered, and every entry of `writeErrors`
//! names the index of the record that failed.

use async_trait::async_trait;
use chrono::NaiveTime;
use formsync_common::{FieldValue, RawRecord};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::{Client, Database};
use std::future::Future;
use tracing::{info, warn};

use super::{RawDocumentSink, UpsertOutcome, UpsertSink, UpsertTarget};
use crate::error::SinkError;
use crate::normalize::NormalizedRecord;

/// Default statements per `update` command
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Key mirrored documents are upserted by
pub const RAW_ID_FIELD: &str = "_id";

pub struct MongoSink {
    database: Database,
    batch_size: usize,
}

impl MongoSink {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub async fn connect(uri: &str, database: &str) -> Result<Self, SinkError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client.database(database)))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    async fn upsert_documents(
        &self,
        collection: &str,
        key_field: &str,
        documents: Vec<(Bson, Document)>,
    ) -> Result<UpsertOutcome, SinkError> {
        upsert_in_chunks(collection, key_field, &documents, self.batch_size, |command| async move {
            self.database.run_command(command).await.map_err(SinkError::from)
        })
        .await
    }
}

/// Run chunked `update` commands for prepared `(filter value, document)` pairs.
///
/// Commands are not transactional: once a chunk has gone through, a later
/// failing command no longer fails the whole set. The records it and every
/// following chunk carried are counted as failed instead.
pub async fn upsert_in_chunks<F, Fut>(
    collection: &str,
    key_field: &str,
    documents: &[(Bson, Document)],
    batch_size: usize,
    mut run_command: F,
) -> Result<UpsertOutcome, SinkError>
where
    F: FnMut(Document) -> Fut,
    Fut: Future<Output = Result<Document, SinkError>>,
{
    let mut outcome = UpsertOutcome::default();
    let mut attempted = 0;

    for chunk in documents.chunks(batch_size.max(1)) {
        let command = build_update_command(collection, key_field, chunk);
        let result = match run_command(command)
            .await
            .and_then(|reply| parse_update_reply(&reply, chunk.len()))
        {
            Ok(result) => result,
            Err(e) if attempted == 0 => return Err(e),
            Err(e) => {
                let remaining = documents.len() - attempted;
                warn!(collection = %collection, remaining, error = %e, "Update command failed after earlier chunks were written");
                outcome.failed += remaining;
                outcome.details.push(format!("{} record(s) not written: {}", remaining, e));
                return Ok(outcome);
            },
        };

        for (index, message) in &result.errors {
            warn!(collection = %collection, key = %chunk[*index].0, error = %message, "Document upsert failed");
        }
        outcome.merge(result.into_outcome(chunk));
        attempted += chunk.len();
    }

    Ok(outcome)
}

#[async_trait]
impl UpsertSink for MongoSink {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn upsert(&self, target: &UpsertTarget, records: &[NormalizedRecord]) -> Result<UpsertOutcome, SinkError> {
        validate_collection(&target.name)?;
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut documents = Vec::with_capacity(records.len());
        let mut outcome = UpsertOutcome::default();
        for record in records {
            match record.get(&target.key_column) {
                Some(key) => documents.push((field_to_bson(key), to_document(record))),
                None => {
                    outcome.failed += 1;
                    outcome
                        .details
                        .push(format!("record without key column '{}'", target.key_column));
                },
            }
        }

        outcome.merge(
            self.upsert_documents(&target.name, &target.key_column, documents)
                .await?,
        );
        info!(
            collection = %target.name,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Upserted documents"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl RawDocumentSink for MongoSink {
    async fn upsert_raw(&self, collection: &str, records: &[RawRecord]) -> Result<UpsertOutcome, SinkError> {
        validate_collection(collection)?;
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut documents = Vec::with_capacity(records.len());
        let mut outcome = UpsertOutcome::default();
        for record in records {
            match raw_to_document(record) {
                Ok(pair) => documents.push(pair),
                Err(message) => {
                    outcome.failed += 1;
                    outcome.details.push(message);
                },
            }
        }

        outcome.merge(self.upsert_documents(collection, RAW_ID_FIELD, documents).await?);
        info!(
            collection = %collection,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Mirrored raw documents"
        );
        Ok(outcome)
    }
}

fn validate_collection(name: &str) -> Result<(), SinkError> {
    if name.is_empty() || name.contains('$') || name.contains('\0') || name.starts_with("system.") {
        return Err(SinkError::Target {
            target: name.to_string(),
            message: "not a valid collection name".to_string(),
        });
    }
    Ok(())
}

/// Dates are stored as BSON datetimes at midnight UTC
pub fn field_to_bson(value: &FieldValue) -> Bson {
    match value {
        FieldValue::String(v) => Bson::String(v.clone()),
        FieldValue::Int(v) => Bson::Int64(*v),
        FieldValue::Float(v) => Bson::Double(*v),
        FieldValue::Bool(v) => Bson::Boolean(*v),
        FieldValue::Date(v) => Bson::DateTime(bson::DateTime::from_millis(
            v.and_time(NaiveTime::MIN).and_utc().timestamp_millis(),
        )),
    }
}

pub fn to_document(record: &NormalizedRecord) -> Document {
    record
        .iter()
        .map(|(column, value)| (column.to_string(), field_to_bson(value)))
        .collect()
}

fn raw_to_document(record: &RawRecord) -> Result<(Bson, Document), String> {
    let mut document =
        bson::to_document(record).map_err(|e| format!("document not representable in BSON: {}", e))?;
    let id = document
        .remove(RAW_ID_FIELD)
        .filter(|id| !matches!(id, Bson::Null))
        .ok_or_else(|| format!("document without '{}'", RAW_ID_FIELD))?;
    Ok((id, document))
}

/// `update` command upserting every document by `key_field`, unordered
pub fn build_update_command(collection: &str, key_field: &str, documents: &[(Bson, Document)]) -> Document {
    let updates: Vec<Bson> = documents
        .iter()
        .map(|(key, document)| {
            let mut filter = Document::new();
            filter.insert(key_field, key.clone());
            Bson::Document(doc! {
                "q": filter,
                "u": { "$set": document.clone() },
                "upsert": true,
            })
        })
        .collect();

    doc! {
        "update": collection,
        "updates": updates,
        "ordered": false,
    }
}

/// Per-statement results of one `update` command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub statements: usize,
    /// `(statement index, message)` for every failed statement
    pub errors: Vec<(usize, String)>,
}

impl UpdateResult {
    fn into_outcome(self, documents: &[(Bson, Document)]) -> UpsertOutcome {
        UpsertOutcome {
            succeeded: self.statements.saturating_sub(self.errors.len()),
            failed: self.errors.len(),
            details: self
                .errors
                .into_iter()
                .map(|(index, message)| match documents.get(index) {
                    Some((key, _)) => format!("{}: {}", key, message),
                    None => message,
                })
                .collect(),
        }
    }
}

pub fn parse_update_reply(reply: &Document, statements: usize) -> Result<UpdateResult, SinkError> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        _ => false,
    };
    if !ok {
        let message = reply.get_str("errmsg").unwrap_or("command failed");
        return Err(SinkError::Reply(message.to_string()));
    }

    let mut errors = Vec::new();
    if let Ok(write_errors) = reply.get_array("writeErrors") {
        for entry in write_errors {
            let Bson::Document(entry) = entry else {
                return Err(SinkError::Reply("writeErrors entry is not a document".to_string()));
            };
            let index = match entry.get("index") {
                Some(Bson::Int32(i)) => usize::try_from(*i).ok(),
                Some(Bson::Int64(i)) => usize::try_from(*i).ok(),
                _ => None,
            }
            .filter(|i| *i < statements)
            .ok_or_else(|| SinkError::Reply("writeErrors entry without a valid index".to_string()))?;
            let message = entry.get_str("errmsg").unwrap_or("write error").to_string();
            errors.push((index, message));
        }
    }

    if let Ok(concern) = reply.get_document("writeConcernError") {
        let message = concern.get_str("errmsg").unwrap_or("write concern error");
        return Err(SinkError::Reply(message.to_string()));
    }

    Ok(UpdateResult { statements, errors })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_field_to_bson() {
        assert_eq!(field_to_bson(&FieldValue::Int(3)), Bson::Int64(3));
        assert_eq!(field_to_bson(&FieldValue::Bool(true)), Bson::Boolean(true));
        assert_eq!(
            field_to_bson(&FieldValue::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap())),
            Bson::DateTime(bson::DateTime::from_millis(86_400_000))
        );
    }

    #[test]
    fn test_build_update_command() {
        let documents = vec![(Bson::String("7".to_string()), doc! { "id": "7", "answer1": "" })];
        let command = build_update_command("baseline", "id", &documents);

        assert_eq!(command.get_str("update").unwrap(), "baseline");
        assert!(!command.get_bool("ordered").unwrap());

        let updates = command.get_array("updates").unwrap();
        assert_eq!(
            updates[0],
            Bson::Document(doc! {
                "q": { "id": "7" },
                "u": { "$set": { "id": "7", "answer1": "" } },
                "upsert": true,
            })
        );
    }

    #[test]
    fn test_parse_reply_success() {
        let reply = doc! { "n": 3, "nModified": 1, "upserted": [{ "index": 0, "_id": "a" }], "ok": 1.0 };
        let result = parse_update_reply(&reply, 3).unwrap();
        assert_eq!(result.statements, 3);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_parse_reply_write_errors_map_to_records() {
        let reply = doc! {
            "n": 1,
            "writeErrors": [
                { "index": 1, "code": 11000, "errmsg": "E11000 duplicate key" },
            ],
            "ok": 1,
        };
        let documents = vec![
            (Bson::String("a".to_string()), Document::new()),
            (Bson::String("b".to_string()), Document::new()),
        ];

        let result = parse_update_reply(&reply, 2).unwrap();
        assert_eq!(result.errors, vec![(1, "E11000 duplicate key".to_string())]);

        let outcome = result.into_outcome(&documents);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.details.len(), 1);
        assert!(outcome.details[0].contains('b'));
        assert!(outcome.details[0].ends_with("E11000 duplicate key"));
    }

    #[test]
    fn test_parse_reply_command_failure() {
        let reply = doc! { "ok": 0.0, "errmsg": "not authorized" };
        assert!(matches!(
            parse_update_reply(&reply, 1),
            Err(SinkError::Reply(message)) if message == "not authorized"
        ));
    }

    #[test]
    fn test_raw_to_document_extracts_id() {
        let record = json!({ "_id": 12, "name": "x" }).as_object().unwrap().clone();
        let (id, document) = raw_to_document(&record).unwrap();
        assert!(matches!(id, Bson::Int64(12) | Bson::Int32(12)));
        assert!(!document.contains_key("_id"));

        let missing = json!({ "name": "x" }).as_object().unwrap().clone();
        assert!(raw_to_document(&missing).is_err());
    }

    fn keyed(count: usize) -> Vec<(Bson, Document)> {
        (0..count)
            .map(|i| (Bson::String(format!("k{}", i)), doc! { "n": (i as i64) }))
            .collect()
    }

    #[tokio::test]
    async fn test_chunks_before_a_failed_command_stay_counted() {
        let documents = keyed(5);
        let mut commands = Vec::new();

        let outcome = upsert_in_chunks("baseline", "id", &documents, 2, |command| {
            commands.push(command);
            let reply = match commands.len() {
                2 => Err(SinkError::Reply("connection reset".to_string())),
                _ => Ok(doc! { "n": 2, "ok": 1.0 }),
            };
            std::future::ready(reply)
        })
        .await
        .unwrap();

        // the third chunk is never sent
        assert_eq!(commands.len(), 2);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.details.len(), 1);
        assert!(outcome.details[0].starts_with("3 record(s) not written"));
        assert!(outcome.details[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn test_first_command_failure_fails_the_target() {
        let documents = keyed(3);
        let result = upsert_in_chunks("baseline", "id", &documents, 2, |_| {
            std::future::ready(Ok(doc! { "ok": 0.0, "errmsg": "not authorized" }))
        })
        .await;

        assert!(matches!(result, Err(SinkError::Reply(message)) if message == "not authorized"));
    }

    #[tokio::test]
    async fn test_write_errors_across_chunks_merge() {
        let documents = keyed(4);
        let mut calls = 0;
        let outcome = upsert_in_chunks("baseline", "id", &documents, 2, |_| {
            calls += 1;
            let reply = if calls == 2 {
                doc! { "n": 1, "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "E11000" }], "ok": 1 }
            } else {
                doc! { "n": 2, "ok": 1 }
            };
            std::future::ready(Ok(reply))
        })
        .await
        .unwrap();

        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.details, vec!["\"k2\": E11000".to_string()]);
    }

    #[test]
    fn test_validate_collection() {
        assert!(validate_collection("baseline__members").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("a$b").is_err());
    }
}
