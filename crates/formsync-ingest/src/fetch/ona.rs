//! Ona fetcher
//!
//! Submissions are JSON objects from `GET {api}/data/{form_id}`. Repeat
//! groups arrive embedded as arrays of objects inside each submission, so
//! there is no separate group export.

use async_trait::async_trait;
use formsync_common::RawRecord;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Cursor, FetchBatch, RemoteFetcher, RepeatLayout};
use crate::error::{ConfigError, FetchCause, FetchError};

pub const DEFAULT_API_URL: &str = "https://api.ona.io/api/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const USER_AGENT: &str = concat!("formsync-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct OnaConfig {
    pub api_url: String,
    pub token: String,
    pub timeout_secs: u64,
    /// Request pages of this many submissions; `None` fetches everything at once
    pub page_size: Option<u32>,
}

impl OnaConfig {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            page_size: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "FORMSYNC_ONA_API_URL",
                format!("'{}' is not an http(s) URL", self.api_url),
            ));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("FORMSYNC_ONA_TOKEN".to_string()));
        }
        if self.page_size == Some(0) {
            return Err(ConfigError::invalid("FORMSYNC_ONA_PAGE_SIZE", "page size must be greater than 0"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "FORMSYNC_HTTP_TIMEOUT_SECS",
                "timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    fn root(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}

/// Project as listed by `GET {api}/projects`
#[derive(Debug, Clone, Deserialize)]
pub struct OnaProject {
    pub projectid: i64,
    pub name: String,
    #[serde(default)]
    pub forms: Vec<Option<OnaFormRef>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnaFormRef {
    pub formid: i64,
    pub name: String,
}

pub struct OnaFetcher {
    client: Client,
    config: OnaConfig,
}

impl OnaFetcher {
    pub fn new(config: OnaConfig) -> Result<Self, FetchCause> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn data_url(&self, form_id: &str) -> String {
        format!("{}/data/{}", self.config.root(), form_id)
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<(StatusCode, Value), FetchCause> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.config.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok((status, Value::Null));
        }
        Ok((status, response.json().await?))
    }

    /// Every project visible to the token, with its forms
    pub async fn list_projects(&self) -> Result<Vec<OnaProject>, FetchCause> {
        let url = format!("{}/projects", self.config.root());
        let (status, body) = self.get_json(&url, &[]).await?;
        if !status.is_success() {
            return Err(FetchCause::Status { url, status });
        }

        let projects: Vec<OnaProject> = serde_json::from_value(body)?;
        info!(projects = projects.len(), "Listed Ona projects");
        Ok(projects)
    }
}

#[async_trait]
impl RemoteFetcher for OnaFetcher {
    fn source_name(&self) -> &'static str {
        "ona"
    }

    fn repeat_layout(&self) -> RepeatLayout {
        RepeatLayout::Embedded
    }

    async fn fetch(&self, form_id: &str, cursor: Option<&Cursor>) -> Result<FetchBatch, FetchError> {
        let url = self.data_url(form_id);

        let (page, previous_first) = match cursor {
            Some(cursor) => parse_page_cursor(cursor).ok_or_else(|| {
                FetchCause::Payload(format!("invalid page cursor '{}'", cursor.as_str())).for_form(form_id)
            })?,
            None => (1, None),
        };
        let query = match self.config.page_size {
            Some(page_size) => vec![("page", page.to_string()), ("page_size", page_size.to_string())],
            None => vec![],
        };

        debug!(form_id = %form_id, page, "Fetching Ona submissions");
        let (status, body) = self
            .get_json(&url, &query)
            .await
            .map_err(|cause| cause.for_form(form_id))?;

        // Ona answers 404 for a page past the last one
        if status == StatusCode::NOT_FOUND && page > 1 {
            return Ok(FetchBatch::default());
        }
        if !status.is_success() {
            return Err(FetchCause::Status { url, status }.for_form(form_id));
        }

        let records = submissions(body).map_err(|cause| cause.for_form(form_id))?;

        let first = records.first().map(page_marker);
        if previous_first.is_some() && first.as_deref() == previous_first {
            warn!(form_id = %form_id, page, "Page repeats the previous one, server ignores paging");
            return Ok(FetchBatch::default());
        }

        let next = match (self.config.page_size, first) {
            (Some(page_size), Some(first)) if records.len() >= page_size as usize => {
                Some(Cursor::new(format!("{}|{}", page + 1, first)))
            },
            _ => None,
        };

        info!(form_id = %form_id, page, rows = records.len(), "Fetched Ona submissions");
        Ok(FetchBatch {
            records,
            columns: vec![],
            next,
        })
    }
}

/// Identifies a page by its first submission: the `_id`, or the whole
/// submission when it has none
fn page_marker(record: &RawRecord) -> String {
    match record.get("_id") {
        Some(id) => id.to_string(),
        None => Value::Object(record.clone()).to_string(),
    }
}

/// `{page}` or `{page}|{first submission of the previous page}`
fn parse_page_cursor(cursor: &Cursor) -> Option<(u32, Option<&str>)> {
    match cursor.as_str().split_once('|') {
        Some((page, previous)) => Some((page.parse().ok()?, Some(previous))),
        None => Some((cursor.as_str().parse().ok()?, None)),
    }
}

fn submissions(body: Value) -> Result<Vec<RawRecord>, FetchCause> {
    let Value::Array(items) = body else {
        return Err(FetchCause::Payload("expected a JSON array of submissions".to_string()));
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            other => Err(FetchCause::Payload(format!("submission is not an object: {}", other))),
        })
        .collect()
}
