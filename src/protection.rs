//! Anti-bot protection detection and the passive Cloudflare bypass wait.

use crate::error::SessionError;
use crate::session::BrowserSession;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Title fragments that mark a challenge or block page. Matched
/// case-insensitively against the lowercased document title.
pub const PROTECTION_TITLES: [&str; 9] = [
    "just a moment",
    "checking your browser",
    "cloudflare",
    "access denied",
    "blocked",
    "captcha",
    "security check",
    "ddos protection",
    "rate limited",
];

/// Selectors whose presence marks an active challenge widget.
pub const PROTECTION_SELECTORS: [&str; 6] = [
    ".cf-browser-verification",
    "#challenge-form",
    ".grecaptcha-badge",
    "[data-sitekey]",
    ".challenge-running",
    "meta[name=\"robots\"][content*=\"noindex\"]",
];

/// A body shorter than this, combined with nothing else on the page,
/// suggests an interstitial rather than real content.
const MINIMAL_CONTENT_CHARS: usize = 100;

/// Poll interval for the passive bypass wait.
const BYPASS_POLL: Duration = Duration::from_secs(1);

/// Title phrases the bypass wait blocks on. Anything Cloudflare puts in
/// an interstitial title, including the "Attention Required!" block page.
const CHALLENGE_PHRASES: [&str; 3] = ["just a moment", "checking your browser", "cloudflare"];

/// True while the title still reads as an unresolved challenge.
pub fn is_challenge_title(title: &str) -> bool {
    let lowered = title.to_lowercase();
    CHALLENGE_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// Evidence that a protection layer is active. Each indicator is one
/// independent signal; the set is reported verbatim in attempt records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionSignature {
    pub indicators: Vec<String>,
}

impl ProtectionSignature {
    /// Cloudflare challenges resolve on their own given time, so they get
    /// the passive bypass wait instead of an immediate retry.
    pub fn is_cloudflare(&self) -> bool {
        self.indicators.iter().any(|i| {
            let i = i.to_lowercase();
            i.contains("cloudflare") || i.contains("just a moment") || i.contains("cf-")
        })
    }
}

impl std::fmt::Display for ProtectionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.indicators.join(", "))
    }
}

/// Check the lowercased title against the known challenge phrases.
pub fn title_indicators(title: &str) -> Vec<String> {
    let lowered = title.to_lowercase();
    PROTECTION_TITLES
        .iter()
        .filter(|phrase| lowered.contains(**phrase))
        .map(|phrase| format!("title contains '{phrase}'"))
        .collect()
}

/// Probe the live page for protection evidence. Individual probe failures
/// are ignored; only positive evidence counts.
pub async fn detect(
    session: &dyn BrowserSession,
) -> Result<Option<ProtectionSignature>, SessionError> {
    let title = session.title().await.unwrap_or_default();
    let mut indicators = title_indicators(&title);

    for selector in PROTECTION_SELECTORS {
        let script = format!(
            "document.querySelector({}) !== null",
            serde_json::to_string(selector).map_err(|e| SessionError::Evaluation(e.to_string()))?
        );
        match session.evaluate(&script).await {
            Ok(value) if value.as_bool() == Some(true) => {
                indicators.push(format!("selector '{selector}' present"));
            }
            Ok(_) => {}
            Err(e) => debug!(selector, error = %e, "protection probe failed"),
        }
    }

    // A nearly empty body alongside any other signal strengthens the
    // verdict; alone it is enough to flag an interstitial.
    match session.inner_text("body").await {
        Ok(body) if body.trim().chars().count() < MINIMAL_CONTENT_CHARS => {
            indicators.push("minimal page content".to_string());
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "body text probe failed"),
    }

    if indicators.is_empty() {
        Ok(None)
    } else {
        warn!(indicators = ?indicators, "protection detected");
        Ok(Some(ProtectionSignature { indicators }))
    }
}

/// Wait passively for a Cloudflare challenge to clear, polling the title
/// once per second. Returns true if the challenge phrasing disappeared
/// within the budget.
pub async fn bypass_wait(session: &dyn BrowserSession, max_wait_secs: u64) -> bool {
    for waited in 0..max_wait_secs {
        tokio::time::sleep(BYPASS_POLL).await;
        let title = match session.title().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "title poll failed during bypass wait");
                continue;
            }
        };
        if !is_challenge_title(&title) {
            info!(waited_secs = waited + 1, "challenge cleared");
            return true;
        }
    }
    warn!(max_wait_secs, "challenge did not clear within budget");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_indicators_case_insensitive() {
        let hits = title_indicators("Just a Moment...");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("just a moment"));
    }

    #[test]
    fn test_clean_title_has_no_indicators() {
        assert!(title_indicators("Acme Corp - Product Documentation").is_empty());
    }

    #[test]
    fn test_title_can_hit_multiple_phrases() {
        let hits = title_indicators("Cloudflare security check");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_challenge_titles_block_the_bypass_wait() {
        assert!(is_challenge_title("Just a moment..."));
        assert!(is_challenge_title("Checking your browser before accessing"));
        assert!(is_challenge_title("Attention Required! | Cloudflare"));
        assert!(!is_challenge_title("Acme Corp - Product Documentation"));
    }

    #[test]
    fn test_cloudflare_classification() {
        let cf = ProtectionSignature {
            indicators: vec!["title contains 'just a moment'".into()],
        };
        assert!(cf.is_cloudflare());

        let widget = ProtectionSignature {
            indicators: vec!["selector '.cf-browser-verification' present".into()],
        };
        assert!(widget.is_cloudflare());

        let captcha = ProtectionSignature {
            indicators: vec!["selector '[data-sitekey]' present".into()],
        };
        assert!(!captcha.is_cloudflare());
    }
}
