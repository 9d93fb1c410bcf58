//! Error taxonomy for session and run-level failures.
//!
//! Per-element and per-sub-capture failures never surface here — they are
//! recorded into the owning record and processing continues. Only
//! session-level failures (launch, navigation, page evaluation) propagate
//! to the retry coordinator, which decides retry vs. terminal failure.

use thiserror::Error;

/// A failure inside one browser session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Browser process could not be launched or connected to.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// Navigation to a URL failed or timed out.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Page-side script or query execution failed.
    #[error("page evaluation failed: {0}")]
    Evaluation(String),

    /// A selector matched nothing.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

/// A failure of the whole analysis run.
///
/// Note that a stability timeout is *not* represented here: it is a
/// policy fallback consumed by the coordinator, never an error.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The target URL has no scheme or host.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A protection challenge did not clear within the bypass window.
    #[error("protection bypass timed out after {waited_secs}s ({signature})")]
    ProtectionBypassTimeout {
        signature: String,
        waited_secs: u64,
    },

    /// Session-level failure bubbled up from the browser boundary.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Every retry attempt failed; carries the last attempt's error.
    #[error("all {attempts} attempts failed; last error: {last}")]
    SessionExhausted { attempts: u32, last: String },
}

impl ScrapeError {
    /// Whether the coordinator may spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ScrapeError::InvalidUrl(_) | ScrapeError::SessionExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_timeout_is_retryable() {
        let err = ScrapeError::ProtectionBypassTimeout {
            signature: "title contains 'cloudflare'".to_string(),
            waited_secs: 30,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_exhausted_is_terminal() {
        let err = ScrapeError::SessionExhausted {
            attempts: 3,
            last: "navigation failed: net::ERR_FAILED".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("all 3 attempts failed"));
    }

    #[test]
    fn test_session_error_converts() {
        let err: ScrapeError = SessionError::Navigation("timed out".to_string()).into();
        assert!(err.is_retryable());
        assert!(matches!(err, ScrapeError::Session(_)));
    }
}
