//! Session token handshake for SurveyCTO's web endpoints
//!
//! The form-structure endpoint is not part of the public API. It expects the
//! CSRF token embedded in the server's landing page, sent back together with
//! the session cookie that page sets. The token is scraped once and reused
//! for every metadata call in a run.
//!
//! ```text
//! Unauthenticated ──handshake──► TokenAcquired ──401/403 or max age──► Expired
//!        │                                                               │
//!        └────────────handshake fails────► Failed ◄──handshake fails─────┘
//! ```
//!
//! `Failed` is terminal: no further handshakes are attempted in this run.

use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::FetchCause;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    TokenAcquired { token: String, acquired_at: Instant },
    Expired,
    Failed(String),
}

/// Token-holding session shared by every metadata call of one fetcher
#[derive(Debug)]
pub struct CsrfSession {
    client: Client,
    landing_url: String,
    max_age: Option<Duration>,
    state: Mutex<SessionState>,
}

impl CsrfSession {
    /// `client` must keep cookies; the token is bound to the session cookie
    pub fn new(client: Client, landing_url: impl Into<String>, max_age: Option<Duration>) -> Self {
        Self {
            client,
            landing_url: landing_url.into(),
            max_age,
            state: Mutex::new(SessionState::Unauthenticated),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Current token, performing the handshake when none is held
    pub async fn token(&self) -> Result<String, FetchCause> {
        let mut state = self.state.lock().await;

        match &*state {
            SessionState::TokenAcquired { token, acquired_at } => {
                let stale = self.max_age.is_some_and(|max_age| acquired_at.elapsed() >= max_age);
                if !stale {
                    return Ok(token.clone());
                }
                debug!("Session token exceeded its max age, re-acquiring");
            },
            SessionState::Failed(reason) => return Err(FetchCause::Handshake(reason.clone())),
            SessionState::Unauthenticated | SessionState::Expired => {},
        }

        match self.handshake().await {
            Ok(token) => {
                info!(landing_url = %self.landing_url, "Acquired session token");
                *state = SessionState::TokenAcquired {
                    token: token.clone(),
                    acquired_at: Instant::now(),
                };
                Ok(token)
            },
            Err(cause) => {
                warn!(landing_url = %self.landing_url, error = %cause, "Session handshake failed");
                *state = SessionState::Failed(cause.to_string());
                Err(cause)
            },
        }
    }

    /// Mark the held token as rejected; the next [`token`](Self::token) call re-acquires
    pub async fn expire(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, SessionState::TokenAcquired { .. }) {
            *state = SessionState::Expired;
        }
    }

    async fn handshake(&self) -> Result<String, FetchCause> {
        let response = self.client.get(&self.landing_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchCause::Status {
                url: self.landing_url.clone(),
                status,
            });
        }

        let html = response.text().await?;
        extract_csrf_token(&html).ok_or_else(|| {
            FetchCause::Handshake(format!("no CSRF token found on {}", self.landing_url))
        })
    }
}

/// Pull the CSRF token out of a landing page.
///
/// Looks for `var csrfToken = '…';` in inline scripts first, then for a
/// `<meta name="csrf-token" content="…">` tag.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let pattern = Regex::new(r#"var\s+csrfToken\s*=\s*['"](.+?)['"]\s*;"#).ok()?;

    if let Ok(script_selector) = Selector::parse("script") {
        let from_script = document.select(&script_selector).find_map(|script| {
            let text: String = script.text().collect();
            pattern.captures(&text).map(|c| c[1].to_string())
        });
        if from_script.is_some() {
            return from_script;
        }
    }

    let meta_selector = Selector::parse(r#"meta[name="csrf-token"]"#).ok()?;
    document
        .select(&meta_selector)
        .filter_map(|meta| meta.value().attr("content"))
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_from_script() {
        let html = r#"<html><head><script type="text/javascript">
            var serverName = 'acme';
            var csrfToken = 'a1b2-c3d4';
        </script></head><body></body></html>"#;
        assert_eq!(extract_csrf_token(html).as_deref(), Some("a1b2-c3d4"));
    }

    #[test]
    fn test_extract_token_double_quotes() {
        let html = r#"<script>var csrfToken = "xyz";</script>"#;
        assert_eq!(extract_csrf_token(html).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_extract_token_from_meta() {
        let html = r#"<html><head><meta name="csrf-token" content="meta-token"></head></html>"#;
        assert_eq!(extract_csrf_token(html).as_deref(), Some("meta-token"));
    }

    #[test]
    fn test_extract_token_missing() {
        assert_eq!(extract_csrf_token("<html><body>Sign in</body></html>"), None);
        assert_eq!(extract_csrf_token(r#"<meta name="csrf-token" content="  ">"#), None);
    }

    #[tokio::test]
    async fn test_expire_without_token_is_noop() {
        let session = CsrfSession::new(Client::new(), "http://127.0.0.1:9/", None);
        session.expire().await;
        assert_eq!(session.state().await, SessionState::Unauthenticated);
    }
}
