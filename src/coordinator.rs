//! Attempt-retry coordinator: owns the whole-run loop, spending fresh
//! browser sessions on attempts until one completes or the budget runs out.

use crate::config::ScrapeConfig;
use crate::element::Signature;
use crate::error::{ScrapeError, SessionError};
use crate::expansion::{ExpansionAttemptRecord, ExpansionEngine};
use crate::monitor::{InteractionHook, MonitoringSession, MutationMonitor};
use crate::protection::{self, ProtectionSignature};
use crate::session::{BrowserSession, SessionFactory, WaitPolicy};
use crate::snapshot::{self, PageSnapshot};
use crate::stability::await_stability;
use crate::stealth;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Delay band between attempts, seconds.
const RETRY_DELAY_MIN_SECS: f64 = 2.0;
const RETRY_DELAY_MAX_SECS: f64 = 5.0;

/// Where an attempt was when it ended. Phases advance monotonically;
/// `Failed` records the phase the attempt died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptPhase {
    Opening,
    Navigating,
    ProtectionCheck,
    BypassWait,
    Stabilizing,
    Exploring,
    FinalCapture,
    Completed,
}

/// How the post-interaction settle resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// The page held still within the stability budget.
    Stability,
    /// The budget lapsed; a fixed wait was used instead.
    Fallback,
}

/// Record of one attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeAttempt {
    pub number: u32,
    pub phase: AttemptPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_strategy: Option<WaitStrategy>,
    /// Every positive protection verdict, in check order. A challenge
    /// detected and later cleared stays on the record.
    pub protection_history: Vec<ProtectionSignature>,
    /// A challenge cleared during the passive bypass wait.
    pub bypass_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_snapshot: Option<PageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_snapshot: Option<PageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSession>,
    pub expansion: BTreeMap<Signature, ExpansionAttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScrapeAttempt {
    fn new(number: u32) -> Self {
        ScrapeAttempt {
            number,
            phase: AttemptPhase::Opening,
            started_at: Utc::now(),
            ended_at: None,
            wait_strategy: None,
            protection_history: Vec::new(),
            bypass_used: false,
            initial_snapshot: None,
            final_snapshot: None,
            monitoring: None,
            expansion: BTreeMap::new(),
            error: None,
        }
    }
}

/// Result of a completed run: the attempt that completed plus every
/// failed attempt that preceded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeOutcome {
    pub url: String,
    pub final_url: String,
    pub title: String,
    pub completed_at: DateTime<Utc>,
    /// Whole-run wall time, first open to completion.
    pub elapsed_ms: u64,
    /// The attempt that completed.
    pub attempt: ScrapeAttempt,
    /// Failed attempts that preceded it, in order.
    pub prior_failures: Vec<ScrapeAttempt>,
}

/// Terminal failure of a run, carrying every partial attempt gathered
/// before giving up. The error tag is authoritative; partial fields are
/// whatever each attempt managed to populate.
#[derive(Debug)]
pub struct RunFailure {
    pub error: ScrapeError,
    pub attempts: Vec<ScrapeAttempt>,
    pub elapsed_ms: u64,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Placeholder hook for observation-only runs.
struct ObserveOnly;

#[async_trait::async_trait]
impl InteractionHook for ObserveOnly {
    fn label(&self) -> &str {
        "observe-only"
    }

    async fn run(
        &mut self,
        _session: &dyn BrowserSession,
    ) -> Result<serde_json::Value, SessionError> {
        Ok(serde_json::Value::Null)
    }
}

/// Drives attempts against one URL. Each attempt gets a fresh session;
/// sessions are closed on every exit path so browser processes never leak.
pub struct ScrapeCoordinator {
    config: ScrapeConfig,
    factory: Arc<dyn SessionFactory>,
}

impl ScrapeCoordinator {
    pub fn new(config: ScrapeConfig, factory: Arc<dyn SessionFactory>) -> Self {
        ScrapeCoordinator { config, factory }
    }

    /// Analyze one URL, retrying with fresh sessions on retryable failures.
    pub async fn scrape(&self, url: &str) -> Result<ScrapeOutcome, RunFailure> {
        let run_started = Instant::now();
        if let Err(error) = validate_url(url) {
            return Err(RunFailure {
                error,
                attempts: Vec::new(),
                elapsed_ms: 0,
            });
        }

        let mut attempts: Vec<ScrapeAttempt> = Vec::new();
        let mut last_error = String::new();

        for number in 1..=self.config.max_retries {
            if number > 1 {
                stealth::human_delay(RETRY_DELAY_MIN_SECS, RETRY_DELAY_MAX_SECS).await;
            }
            info!(url, attempt = number, "starting attempt");

            let mut attempt = ScrapeAttempt::new(number);
            let session = match self.factory.open().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(attempt = number, error = %e, "session open failed");
                    last_error = e.to_string();
                    attempt.error = Some(last_error.clone());
                    attempt.ended_at = Some(Utc::now());
                    attempts.push(attempt);
                    continue;
                }
            };

            let result = self.run_attempt(url, &*session, &mut attempt).await;
            if let Err(e) = session.close().await {
                warn!(attempt = number, error = %e, "session close failed");
            }
            attempt.ended_at = Some(Utc::now());

            match result {
                Ok(()) => {
                    attempt.phase = AttemptPhase::Completed;
                    let final_snapshot = attempt.final_snapshot.as_ref();
                    let outcome = ScrapeOutcome {
                        url: url.to_string(),
                        final_url: final_snapshot
                            .map(|s| s.url.clone())
                            .unwrap_or_else(|| url.to_string()),
                        title: final_snapshot.map(|s| s.title.clone()).unwrap_or_default(),
                        completed_at: Utc::now(),
                        elapsed_ms: run_started.elapsed().as_millis() as u64,
                        attempt,
                        prior_failures: attempts,
                    };
                    info!(
                        url,
                        attempts = outcome.prior_failures.len() + 1,
                        elapsed_ms = outcome.elapsed_ms,
                        "run completed"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(attempt = number, phase = ?attempt.phase, error = %e, "attempt failed");
                    last_error = e.to_string();
                    attempt.error = Some(last_error.clone());
                    attempts.push(attempt);
                    if !e.is_retryable() {
                        return Err(RunFailure {
                            error: e,
                            attempts,
                            elapsed_ms: run_started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }
        }

        Err(RunFailure {
            error: ScrapeError::SessionExhausted {
                attempts: self.config.max_retries,
                last: last_error,
            },
            attempts,
            elapsed_ms: run_started.elapsed().as_millis() as u64,
        })
    }

    async fn run_attempt(
        &self,
        url: &str,
        session: &dyn BrowserSession,
        attempt: &mut ScrapeAttempt,
    ) -> Result<(), ScrapeError> {
        attempt.phase = AttemptPhase::Navigating;
        session.navigate(url, WaitPolicy::IdleNetwork).await?;

        attempt.phase = AttemptPhase::ProtectionCheck;
        if let Some(signature) = protection::detect(session).await? {
            attempt.protection_history.push(signature.clone());
            if signature.is_cloudflare() {
                attempt.phase = AttemptPhase::BypassWait;
                if !protection::bypass_wait(session, self.config.bypass_max_wait_secs).await {
                    return Err(ScrapeError::ProtectionBypassTimeout {
                        signature: signature.to_string(),
                        waited_secs: self.config.bypass_max_wait_secs,
                    });
                }
                attempt.bypass_used = true;
                stealth::simulate_human_behavior(session).await;
            }
        }

        attempt.initial_snapshot = Some(snapshot::capture_snapshot(session).await);

        attempt.phase = AttemptPhase::Stabilizing;
        let settled = await_stability(
            session,
            self.config.stability_max_wait_ms,
            self.config.stability_hold_ms,
            self.config.stability_poll_ms,
        )
        .await;
        attempt.wait_strategy = Some(if settled {
            WaitStrategy::Stability
        } else {
            tokio::time::sleep(Duration::from_millis(self.config.fallback_wait_ms)).await;
            WaitStrategy::Fallback
        });

        attempt.phase = AttemptPhase::Exploring;
        if self.config.monitor_content {
            let monitor = MutationMonitor::new(&self.config);
            if self.config.interact_with_elements {
                let mut engine = ExpansionEngine::new(&self.config);
                attempt.monitoring = Some(monitor.monitor(session, &mut engine).await?);
                attempt.expansion = engine.into_results();
            } else {
                let mut hook = ObserveOnly;
                attempt.monitoring = Some(monitor.monitor(session, &mut hook).await?);
            }
        } else if self.config.interact_with_elements {
            let mut engine = ExpansionEngine::new(&self.config);
            engine.explore(session).await?;
            attempt.expansion = engine.into_results();
        }

        // Re-check: expansion can reveal a challenge. Earlier verdicts stay
        // on the record even when the page has since cleared.
        if let Some(signature) = protection::detect(session).await? {
            attempt.protection_history.push(signature);
        }

        attempt.phase = AttemptPhase::FinalCapture;
        attempt.final_snapshot = Some(snapshot::capture_snapshot(session).await);

        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), ScrapeError> {
    let parsed = url::Url::parse(url).map_err(|e| ScrapeError::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ScrapeError::InvalidUrl(format!(
            "{url}: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ScrapeError::InvalidUrl(format!("{url}: missing host")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(validate_url("https://example.com/docs").is_ok());
        assert!(validate_url("http://localhost:8080/").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_garbage_and_other_schemes() {
        assert!(matches!(
            validate_url("not a url"),
            Err(ScrapeError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.com/file"),
            Err(ScrapeError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("data:text/html,<p>hi</p>"),
            Err(ScrapeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_attempt_phase_serializes_kebab_case() {
        let json = serde_json::to_string(&AttemptPhase::BypassWait).unwrap();
        assert_eq!(json, "\"bypass-wait\"");
    }

    #[test]
    fn test_fresh_attempt_starts_in_opening() {
        let attempt = ScrapeAttempt::new(1);
        assert_eq!(attempt.phase, AttemptPhase::Opening);
        assert!(attempt.error.is_none());
        assert!(attempt.expansion.is_empty());
        assert!(attempt.protection_history.is_empty());
        assert!(!attempt.bypass_used);
    }
}
