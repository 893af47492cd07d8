//! Remote fetchers for survey submission sources
//!
//! - **surveycto**: CSV export API with separately exported repeat groups and
//!   a session-token protected form-structure endpoint
//! - **ona**: JSON REST API with repeat groups embedded in each submission
//!
//! Fetchers make exactly one attempt per call. Retrying a failed run is the
//! scheduler's job.

pub mod ona;
pub mod session;
pub mod surveycto;
pub mod tabular;

use async_trait::async_trait;
use formsync_common::RawRecord;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;

use crate::error::{FetchCause, FetchError};
use crate::registry::FieldSpec;

pub use ona::{OnaConfig, OnaFetcher, OnaFormRef, OnaProject};
pub use session::{extract_csrf_token, CsrfSession, SessionState};
pub use surveycto::{SurveyCtoConfig, SurveyCtoFetcher};
pub use tabular::{infer_column_type, parse_csv, InferredColumn, TabularPayload};

/// Records for a form, fetched page by page as the stream is polled
pub type RawRecordStream = BoxStream<'static, Result<RawRecord, FetchError>>;

/// Opaque pagination position handed back by a fetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How a source delivers repeat-group rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatLayout {
    /// Each group is exported on its own, rows carry a `PARENT_KEY` column
    Separate,
    /// Group rows are nested arrays inside the parent submission
    Embedded,
}

/// One page of records
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub records: Vec<RawRecord>,
    /// Column types guessed from tabular payloads; advisory only
    pub columns: Vec<InferredColumn>,
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Short source name used in logs and summaries
    fn source_name(&self) -> &'static str;

    fn repeat_layout(&self) -> RepeatLayout;

    /// Fetch one page of submissions for a form
    async fn fetch(&self, form_id: &str, cursor: Option<&Cursor>) -> Result<FetchBatch, FetchError>;

    /// Fetch the rows of a separately exported repeat group
    async fn fetch_repeat_group(&self, form_id: &str, group: &str) -> Result<FetchBatch, FetchError> {
        Err(FetchCause::Unsupported(format!("separate export of repeat group '{}'", group))
            .for_form(form_id))
    }

    /// Field structure as reported by the source, when it exposes one
    async fn field_tree(&self, _form_id: &str) -> Result<Option<Vec<FieldSpec>>, FetchError> {
        Ok(None)
    }
}

/// Lazily page through every submission of a form
pub fn record_stream(fetcher: Arc<dyn RemoteFetcher>, form_id: String) -> RawRecordStream {
    enum Position {
        Start,
        At(Cursor),
        Done,
    }

    stream::try_unfold(Position::Start, move |position| {
        let fetcher = Arc::clone(&fetcher);
        let form_id = form_id.clone();
        async move {
            let cursor = match position {
                Position::Done => return Ok(None),
                Position::Start => None,
                Position::At(cursor) => Some(cursor),
            };

            let batch = fetcher.fetch(&form_id, cursor.as_ref()).await?;
            let next = match batch.next {
                Some(next) if cursor.as_ref() != Some(&next) => Position::At(next),
                _ => Position::Done,
            };

            let page = stream::iter(batch.records.into_iter().map(Ok::<_, FetchError>));
            Ok::<_, FetchError>(Some((page, next)))
        }
    })
    .try_flatten()
    .boxed()
}
