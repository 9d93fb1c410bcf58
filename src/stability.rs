//! Stability waiter: bounded polling on a cheap structural metric.
//!
//! Samples the rendered page height until it holds unchanged for
//! `hold_ms`, or gives up at `max_wait_ms`. Hitting the deadline is a
//! policy signal, not an error — callers fall back to a fixed wait.

use crate::session::BrowserSession;
use std::time::Duration;
use tokio::time::Instant;

const METRIC_SCRIPT: &str = "document.body ? document.body.scrollHeight : 0";

/// Poll the page height until it stops changing.
///
/// Returns `true` once the metric has held unchanged for `hold_ms`,
/// `false` if `max_wait_ms` elapses first. The stable-for accumulator
/// resets on every change. A sampling failure is treated as "unchanged"
/// rather than aborting — corrupt frames should not fail the wait.
pub async fn await_stability(
    session: &dyn BrowserSession,
    max_wait_ms: u64,
    hold_ms: u64,
    poll_ms: u64,
) -> bool {
    let poll = Duration::from_millis(poll_ms.max(1));
    let deadline = Instant::now() + Duration::from_millis(max_wait_ms);
    let mut stable_since = Instant::now();
    let mut last_metric = sample(session).await;

    loop {
        if stable_since.elapsed() >= Duration::from_millis(hold_ms) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;

        if let Some(current) = sample(session).await {
            if last_metric != Some(current) {
                stable_since = Instant::now();
                last_metric = Some(current);
            }
        }
    }
}

async fn sample(session: &dyn BrowserSession) -> Option<i64> {
    session
        .evaluate(METRIC_SCRIPT)
        .await
        .ok()
        .and_then(|v| v.as_i64())
}
