//! Run configuration: retry budget, recursion limits, wait deadlines.
//!
//! Every wait in the engine is bounded; the deadlines and poll intervals
//! all live here so the composition of limits is visible in one place.

use serde::{Deserialize, Serialize};

/// Configuration for a full analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Run the browser headless.
    pub headless: bool,
    /// Rotate user agents, inject masking scripts, add human-like delays.
    pub stealth: bool,
    /// Optional proxy server (e.g. `http://127.0.0.1:8080`).
    pub proxy: Option<String>,
    /// Default timeout applied to navigation and evaluation, in ms.
    pub default_timeout_ms: u64,
    /// Maximum number of full session attempts.
    pub max_retries: u32,

    /// Maximum disclosure recursion depth (top-level elements are depth 0).
    pub max_expansion_depth: u32,
    /// Newly revealed elements processed per recursion level.
    pub max_nested_per_level: usize,

    /// Hard deadline for the stability waiter, in ms.
    pub stability_max_wait_ms: u64,
    /// How long the structural metric must hold unchanged, in ms.
    pub stability_hold_ms: u64,
    /// Stability polling interval, in ms.
    pub stability_poll_ms: u64,
    /// Fixed wait used when the stability waiter hits its deadline, in ms.
    pub fallback_wait_ms: u64,

    /// Deadline for waiting out a protection challenge, in seconds.
    pub bypass_max_wait_secs: u64,

    /// Whether to run the mutation monitor around the expansion pass.
    pub monitor_content: bool,
    /// Whether to interact with disclosure elements at all.
    pub interact_with_elements: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            headless: true,
            stealth: true,
            proxy: None,
            default_timeout_ms: 30_000,
            max_retries: 3,
            max_expansion_depth: 3,
            max_nested_per_level: 5,
            stability_max_wait_ms: 10_000,
            stability_hold_ms: 2_000,
            stability_poll_ms: 250,
            fallback_wait_ms: 5_000,
            bypass_max_wait_secs: 30,
            monitor_content: true,
            interact_with_elements: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ScrapeConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_expansion_depth, 3);
        assert_eq!(cfg.max_nested_per_level, 5);
        assert_eq!(cfg.stability_hold_ms, 2_000);
        assert!(cfg.stability_poll_ms >= 100 && cfg.stability_poll_ms <= 500);
        assert!(cfg.headless);
    }

    #[test]
    fn test_roundtrip() {
        let cfg = ScrapeConfig {
            proxy: Some("http://localhost:9050".to_string()),
            ..ScrapeConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ScrapeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.proxy.as_deref(), Some("http://localhost:9050"));
    }
}
