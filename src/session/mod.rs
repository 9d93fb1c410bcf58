//! Browser-session abstraction.
//!
//! Defines the `BrowserSession` and `SessionFactory` traits that the rest
//! of the engine is written against (currently backed by Chromium via
//! chromiumoxide). Everything above this boundary treats the browser as a
//! correct external capability: navigate, evaluate, click, read, subscribe
//! to network events.

pub mod chromium;

use crate::error::SessionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How long `navigate` should wait before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPolicy {
    /// Return once the document has parsed (DOMContentLoaded equivalent).
    DocumentReady,
    /// Return once the document is ready and network activity has quieted,
    /// bounded by the session's default timeout.
    IdleNetwork,
    /// Return as soon as navigation is committed.
    None,
}

/// One request observed while network capture was active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCallRecord {
    pub url: String,
    pub method: String,
    /// Browser-reported resource kind (`xhr`, `fetch`, `document`, ...).
    pub resource_kind: String,
    pub timestamp: DateTime<Utc>,
}

/// URL substrings that mark a request as API-like.
const API_KEYWORDS: [&str; 4] = ["api", "ajax", "json", "graphql"];

impl NetworkCallRecord {
    /// Whether this request looks like a data endpoint rather than an
    /// asset fetch. Substring match against a fixed keyword set.
    pub fn is_api_like(&self) -> bool {
        let lower = self.url.to_lowercase();
        API_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

/// One live browser page, exclusively owned by the active attempt.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate to a URL, waiting according to `wait`.
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), SessionError>;

    /// Execute a script in the page context and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, SessionError>;

    /// Locate an element by CSS selector and activate it.
    async fn click(&self, selector: &str) -> Result<(), SessionError>;

    /// Read the visible text of the first element matching `selector`.
    async fn inner_text(&self, selector: &str) -> Result<String, SessionError>;

    /// Current document title.
    async fn title(&self) -> Result<String, SessionError>;

    /// Current page URL.
    async fn current_url(&self) -> Result<String, SessionError>;

    /// Start recording request events into the session's network log.
    async fn begin_network_capture(&self) -> Result<(), SessionError>;

    /// All requests recorded since capture began.
    fn captured_requests(&self) -> Vec<NetworkCallRecord>;

    /// Close the page and release browser resources.
    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}

/// Opens fresh sessions, one per attempt.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> NetworkCallRecord {
        NetworkCallRecord {
            url: url.to_string(),
            method: "GET".to_string(),
            resource_kind: "xhr".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_api_like_matching() {
        assert!(record("https://example.com/api/v2/items").is_api_like());
        assert!(record("https://example.com/feed.JSON").is_api_like());
        assert!(record("https://example.com/graphql").is_api_like());
        assert!(record("https://cdn.example.com/ajax/load").is_api_like());
        assert!(!record("https://example.com/styles/main.css").is_api_like());
        assert!(!record("https://example.com/img/logo.png").is_api_like());
    }
}
