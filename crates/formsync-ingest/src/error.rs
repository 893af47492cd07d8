//! Error types for form ingestion
//!
//! Each pipeline stage owns an error type. Only [`ConfigError`] is fatal for
//! a whole run; the others are caught by the pipeline and recorded against
//! the form or repeat group they belong to.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Invalid or missing configuration, detected before anything is fetched
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Form '{form_id}': {message}")]
    Form { form_id: String, message: String },

    #[error("Failed to read forms file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse forms file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn form(form_id: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Form {
            form_id: form_id.into(),
            message: message.into(),
        }
    }
}

/// Transport or authentication failure talking to a remote source
#[derive(Error, Debug)]
#[error("Fetch failed for '{form_id}': {cause}")]
pub struct FetchError {
    pub form_id: String,
    #[source]
    pub cause: FetchCause,
}

#[derive(Error, Debug)]
pub enum FetchCause {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Session handshake failed: {0}")]
    Handshake(String),

    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error("Not supported by this source: {0}")]
    Unsupported(String),
}

impl FetchCause {
    /// Attach the form (or `form/group`) the failed call was made for
    pub fn for_form(self, form_id: impl Into<String>) -> FetchError {
        FetchError {
            form_id: form_id.into(),
            cause: self,
        }
    }

    /// Whether the remote rejected our credentials or session token
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            FetchCause::Status { status, .. }
                if *status == reqwest::StatusCode::UNAUTHORIZED
                    || *status == reqwest::StatusCode::FORBIDDEN
        )
    }
}

impl From<csv::Error> for FetchCause {
    fn from(err: csv::Error) -> Self {
        FetchCause::Payload(err.to_string())
    }
}

impl From<serde_json::Error> for FetchCause {
    fn from(err: serde_json::Error) -> Self {
        FetchCause::Payload(err.to_string())
    }
}

/// A record that cannot be keyed and therefore cannot be upserted
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("Record in '{form_id}' has no value for unique key '{key}'")]
    MissingKey { form_id: String, key: String },
}

/// Write failure against the target store
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Document store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Invalid target '{target}': {message}")]
    Target { target: String, message: String },

    #[error("Unexpected reply from document store: {0}")]
    Reply(String),
}

/// Top-level ingestion error
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Form not found: {0}")]
    FormNotFound(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}
