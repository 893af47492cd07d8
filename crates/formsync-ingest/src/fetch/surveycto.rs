//! SurveyCTO fetcher
//!
//! Submissions come from the CSV export API with Basic auth. Each repeat
//! group has its own export (`…/csv/{form_id}/{group}`) whose rows carry the
//! parent submission's key in a `PARENT_KEY` column.
//!
//! The field tree (needed to find undeclared repeat groups) is only available
//! from the web UI's workbook endpoint, which sits behind a CSRF token; see
//! [`CsrfSession`].

use async_trait::async_trait;
use formsync_common::ScalarType;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::session::CsrfSession;
use super::tabular::{parse_csv, DEFAULT_SAMPLE_SIZE};
use super::{Cursor, FetchBatch, RemoteFetcher, RepeatLayout};
use crate::error::{ConfigError, FetchCause, FetchError};
use crate::registry::{FieldSpec, MAX_FIELD_DEPTH};

/// Default HTTP timeout for export calls; large forms take a while to render
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const USER_AGENT: &str = concat!("formsync-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct SurveyCtoConfig {
    /// Server root, e.g. `https://acme.surveycto.com`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    /// Re-scrape the session token once it is this old
    pub token_max_age_secs: Option<u64>,
}

impl SurveyCtoConfig {
    /// Configuration for a hosted `{server}.surveycto.com` instance
    pub fn for_server(
        server_name: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: format!("https://{}.surveycto.com", server_name),
            username: username.into(),
            password: password.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            token_max_age_secs: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "FORMSYNC_SURVEYCTO_URL",
                format!("'{}' is not an http(s) URL", self.base_url),
            ));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("FORMSYNC_SURVEYCTO_USERNAME".to_string()));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("FORMSYNC_SURVEYCTO_PASSWORD".to_string()));
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
        self.base_url.trim_end_matches('/')
    }
}

pub struct SurveyCtoFetcher {
    client: Client,
    config: SurveyCtoConfig,
    session: CsrfSession,
}

impl SurveyCtoFetcher {
    pub fn new(config: SurveyCtoConfig) -> Result<Self, FetchCause> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;

        let session = CsrfSession::new(
            client.clone(),
            format!("{}/", config.root()),
            config.token_max_age_secs.map(Duration::from_secs),
        );

        Ok(Self {
            client,
            config,
            session,
        })
    }

    pub fn session(&self) -> &CsrfSession {
        &self.session
    }

    /// CSV export URL for a form or one of its repeat groups
    pub fn csv_url(&self, form_id: &str, group: Option<&str>) -> String {
        match group {
            Some(group) => format!("{}/api/v1/forms/data/csv/{}/{}", self.config.root(), form_id, group),
            None => format!("{}/api/v1/forms/data/csv/{}", self.config.root(), form_id),
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn get_csv(&self, url: &str) -> Result<FetchBatch, FetchCause> {
        debug!(url = %url, "Downloading CSV export");
        let response = self.authed(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchCause::Status {
                url: url.to_string(),
                status,
            });
        }

        let body = response.bytes().await?;
        let payload = parse_csv(&body, DEFAULT_SAMPLE_SIZE)?;
        info!(url = %url, rows = payload.records.len(), "Downloaded CSV export");

        Ok(FetchBatch {
            records: payload.records,
            columns: payload.columns,
            next: None,
        })
    }

    /// Workbook metadata, re-acquiring the session token once on rejection
    async fn load_form_structure(&self, form_id: &str) -> Result<Value, FetchCause> {
        match self.request_form_structure(form_id).await {
            Err(cause) if cause.is_auth_rejection() => {
                warn!(form_id = %form_id, "Session token rejected, re-acquiring");
                self.session.expire().await;
                self.request_form_structure(form_id).await
            },
            other => other,
        }
    }

    async fn request_form_structure(&self, form_id: &str) -> Result<Value, FetchCause> {
        let token = self.session.token().await?;
        let url = format!("{}/forms/{}/workbook/export/load", self.config.root(), form_id);
        let now_millis = chrono::Utc::now().timestamp_millis().to_string();

        let request = self
            .client
            .get(&url)
            .query(&[
                ("includeFormStructureModel", "true"),
                ("submissionsPattern", "all"),
                ("fieldsPattern", "all"),
                ("fetchInBatches", "true"),
                ("includeDatasets", "false"),
                ("date", now_millis.as_str()),
            ])
            .header("X-csrf-token", token)
            .header("X-OpenRosa-Version", "1.0")
            .header(reqwest::header::ACCEPT, "*/*");

        let response = self.authed(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchCause::Status { url, status });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl RemoteFetcher for SurveyCtoFetcher {
    fn source_name(&self) -> &'static str {
        "surveycto"
    }

    fn repeat_layout(&self) -> RepeatLayout {
        RepeatLayout::Separate
    }

    /// The CSV export is a single page; any cursor is ignored
    async fn fetch(&self, form_id: &str, _cursor: Option<&Cursor>) -> Result<FetchBatch, FetchError> {
        self.get_csv(&self.csv_url(form_id, None))
            .await
            .map_err(|cause| cause.for_form(form_id))
    }

    async fn fetch_repeat_group(&self, form_id: &str, group: &str) -> Result<FetchBatch, FetchError> {
        self.get_csv(&self.csv_url(form_id, Some(group)))
            .await
            .map_err(|cause| cause.for_form(format!("{}/{}", form_id, group)))
    }

    async fn field_tree(&self, form_id: &str) -> Result<Option<Vec<FieldSpec>>, FetchError> {
        let structure = self
            .load_form_structure(form_id)
            .await
            .map_err(|cause| cause.for_form(form_id))?;
        field_tree_from_structure(&structure)
            .map(Some)
            .map_err(|cause| cause.for_form(form_id))
    }
}

/// Build a field tree from a workbook `formStructureModel` reply.
///
/// Plain groups are transparent in the CSV export, so their children are
/// spliced into the enclosing level. Repeats keep their own subtree.
pub fn field_tree_from_structure(reply: &Value) -> Result<Vec<FieldSpec>, FetchCause> {
    let model = reply
        .get("formStructureModel")
        .ok_or_else(|| FetchCause::Payload("reply has no formStructureModel".to_string()))?;
    let language = model
        .get("defaultLanguage")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchCause::Payload("formStructureModel has no defaultLanguage".to_string()))?;
    let elements = model
        .get("summaryElementsPerLanguage")
        .and_then(|per_language| per_language.get(language))
        .and_then(|summary| summary.get("children"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            FetchCause::Payload(format!("no summary elements for language '{}'", language))
        })?;

    let mut fields = Vec::new();
    collect_fields(elements, 1, &mut fields)?;
    Ok(fields)
}

fn collect_fields(elements: &[Value], depth: usize, out: &mut Vec<FieldSpec>) -> Result<(), FetchCause> {
    if depth > MAX_FIELD_DEPTH {
        return Err(FetchCause::Payload(format!(
            "form structure nested deeper than {}",
            MAX_FIELD_DEPTH
        )));
    }

    for element in elements {
        let Some(name) = element.get("name").and_then(Value::as_str) else {
            continue;
        };
        let data_type = element.get("dataType").and_then(Value::as_str).unwrap_or("");
        let children = element.get("children").and_then(Value::as_array);

        match (data_type, children) {
            ("repeat", children) => {
                let mut nested = Vec::new();
                if let Some(children) = children {
                    collect_fields(children, depth + 1, &mut nested)?;
                }
                out.push(FieldSpec::repeat(name, nested));
            },
            (_, Some(children)) => collect_fields(children, depth + 1, out)?,
            ("note", None) => {},
            (data_type, None) => out.push(FieldSpec::scalar(name, scalar_for(data_type))),
        }
    }

    Ok(())
}

fn scalar_for(data_type: &str) -> ScalarType {
    match data_type {
        "integer" => ScalarType::Int,
        "decimal" => ScalarType::Float,
        "date" | "datetime" | "start" | "end" | "today" => ScalarType::Date,
        _ => ScalarType::String,
    }
}
