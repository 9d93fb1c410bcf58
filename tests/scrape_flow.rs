//! End-to-end flows against a scripted in-memory session: retry budget,
//! disclosure expansion, challenge bypass, and stability fallback.

use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pagespec::config::ScrapeConfig;
use pagespec::coordinator::{AttemptPhase, ScrapeCoordinator, WaitStrategy};
use pagespec::error::{ScrapeError, SessionError};
use pagespec::monitor::ChangeAnalysis;
use pagespec::protection;
use pagespec::report;
use pagespec::session::{BrowserSession, NetworkCallRecord, SessionFactory, WaitPolicy};
use pagespec::snapshot::capture_snapshot;
use pagespec::stability::await_stability;

#[derive(Default)]
struct MockState {
    /// Sessions opened so far.
    opens: u32,
    /// Fail every navigation with this message.
    nav_error: Option<String>,
    /// Title calls up to this count return a challenge title.
    challenge_title_calls: u32,
    /// Challenge title to serve; defaults to the interstitial phrasing.
    challenge_title: Option<String>,
    title_calls: u32,
    /// Page height grows on every sample when set.
    oscillating_height: bool,
    height_calls: u32,
    /// Disclosure elements served by top-level discovery.
    elements: Vec<Value>,
    /// Element ids that have been activated.
    expanded: HashSet<String>,
    /// Mutation events served by the first observer drain.
    pending_mutations: Vec<Value>,
    requests: Vec<NetworkCallRecord>,
}

#[derive(Clone)]
struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn page_metrics(&self) -> Value {
        json!({
            "totalElements": 180, "visibleElements": 120, "textNodes": 60,
            "totalTextLength": 4200, "links": 25, "buttons": 4, "inputs": 1,
            "images": 8, "scripts": 5, "pageHeight": 2000, "viewportHeight": 900
        })
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn navigate(&self, _url: &str, _wait: WaitPolicy) -> Result<(), SessionError> {
        let state = self.state.lock().unwrap();
        match &state.nav_error {
            Some(message) => Err(SessionError::Navigation(message.clone())),
            None => Ok(()),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value, SessionError> {
        let mut state = self.state.lock().unwrap();

        if script.contains("MutationObserver") {
            return Ok(json!(true));
        }
        if script.contains("window.__pagespecMutations") {
            return Ok(Value::Array(std::mem::take(&mut state.pending_mutations)));
        }
        if script.contains("createTreeWalker") {
            return Ok(self.page_metrics());
        }
        if script.contains("interactionType") || script.contains("textLength") {
            return Ok(json!([]));
        }
        if script.contains("stylesheets") {
            return Ok(json!({
                "metas": [], "linkTags": [], "scripts": 5,
                "stylesheets": 2, "language": "en"
            }));
        }
        if script.contains("MAX_DEPTH") {
            return Ok(Value::Null);
        }
        if script.contains("document.body ? document.body.scrollHeight") {
            if state.oscillating_height {
                state.height_calls += 1;
                return Ok(json!(2000 + state.height_calls * 50));
            }
            return Ok(json!(2000));
        }
        // Protection selector probes.
        if script.contains("!== null") {
            return Ok(json!(false));
        }
        // Element content capture: expanded elements carry revealed markup.
        // Checked before discovery because capture scripts embed the
        // serialized descriptor, whose JSON also contains
        // "isCurrentlyExpanded".
        if script.contains("childElementCount") {
            let expanded = state.expanded.iter().any(|id| script.contains(&format!("\"{id}\"")));
            let markup = if expanded { "<p>revealed answer text</p>" } else { "" };
            return Ok(json!({
                "found": true,
                "innerHTML": markup,
                "textContent": if expanded { "revealed answer text" } else { "question" },
                "childElementCount": if expanded { 1 } else { 0 },
                "scrollHeight": if expanded { 240 } else { 40 },
                "clientHeight": 40
            }));
        }
        // Discovery: top-level gets the configured elements, nested rescans
        // inside an expanded subtree find nothing.
        if script.contains("isCurrentlyExpanded") {
            if script.contains("const scopeInfo = null") {
                return Ok(Value::Array(state.elements.clone()));
            }
            return Ok(json!([]));
        }
        // Fallback strategy scripts; unused when ids are clickable.
        if script.contains("applied") {
            return Ok(json!({ "applied": true }));
        }
        Ok(Value::Null)
    }

    async fn click(&self, selector: &str) -> Result<(), SessionError> {
        let id = selector
            .strip_prefix("[id=\"")
            .and_then(|s| s.strip_suffix("\"]"))
            .unwrap_or_else(|| selector.trim_start_matches('#'))
            .to_string();
        self.state.lock().unwrap().expanded.insert(id);
        Ok(())
    }

    async fn inner_text(&self, _selector: &str) -> Result<String, SessionError> {
        Ok("Documentation portal with several collapsible sections covering \
            installation, configuration and troubleshooting in depth."
            .to_string())
    }

    async fn title(&self) -> Result<String, SessionError> {
        let mut state = self.state.lock().unwrap();
        state.title_calls += 1;
        if state.title_calls <= state.challenge_title_calls {
            Ok(state
                .challenge_title
                .clone()
                .unwrap_or_else(|| "Just a moment...".to_string()))
        } else {
            Ok("Example Docs".to_string())
        }
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok("https://example.com/docs".to_string())
    }

    async fn begin_network_capture(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        state.requests = vec![
            NetworkCallRecord {
                url: "https://example.com/api/sections".to_string(),
                method: "GET".to_string(),
                resource_kind: "xhr".to_string(),
                timestamp: Utc::now(),
            },
            NetworkCallRecord {
                url: "https://example.com/styles/main.css".to_string(),
                method: "GET".to_string(),
                resource_kind: "stylesheet".to_string(),
                timestamp: Utc::now(),
            },
        ];
        Ok(())
    }

    fn captured_requests(&self) -> Vec<NetworkCallRecord> {
        self.state.lock().unwrap().requests.clone()
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}

struct MockFactory {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        self.state.lock().unwrap().opens += 1;
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

fn disclosure(id: &str, text: &str) -> Value {
    json!({
        "tagName": "BUTTON",
        "id": id,
        "className": "accordion-header",
        "text": text,
        "attributes": { "aria-expanded": "false" },
        "position": { "x": 0, "y": 100, "width": 600, "height": 40 },
        "isCurrentlyExpanded": false
    })
}

fn harness(state: MockState) -> (ScrapeCoordinator, Arc<Mutex<MockState>>) {
    let state = Arc::new(Mutex::new(state));
    let factory = Arc::new(MockFactory {
        state: Arc::clone(&state),
    });
    let coordinator = ScrapeCoordinator::new(ScrapeConfig::default(), factory);
    (coordinator, state)
}

#[tokio::test(start_paused = true)]
async fn failing_navigation_spends_the_whole_retry_budget() {
    let (coordinator, state) = harness(MockState {
        nav_error: Some("net::ERR_CONNECTION_RESET".to_string()),
        ..MockState::default()
    });

    let failure = coordinator.scrape("https://example.com/docs").await.unwrap_err();
    match &failure.error {
        ScrapeError::SessionExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(last.contains("net::ERR_CONNECTION_RESET"));
        }
        other => panic!("expected SessionExhausted, got {other}"),
    }
    // Every partial attempt is carried out of the failed run, along with
    // the wall time spent before giving up.
    assert!(failure.elapsed_ms > 0);
    assert_eq!(failure.attempts.len(), 3);
    for attempt in &failure.attempts {
        assert_eq!(attempt.phase, AttemptPhase::Navigating);
        assert!(attempt.error.as_deref().unwrap().contains("navigation failed"));
    }
    // One fresh session per attempt.
    assert_eq!(state.lock().unwrap().opens, 3);
}

#[tokio::test]
async fn invalid_url_fails_without_opening_a_session() {
    let (coordinator, state) = harness(MockState::default());

    let failure = coordinator.scrape("not a url").await.unwrap_err();
    assert!(matches!(failure.error, ScrapeError::InvalidUrl(_)));
    assert!(failure.attempts.is_empty());
    assert_eq!(state.lock().unwrap().opens, 0);
}

#[tokio::test(start_paused = true)]
async fn independent_disclosures_all_expand_on_one_attempt() {
    let (coordinator, state) = harness(MockState {
        elements: vec![
            disclosure("faq-install", "How do I install?"),
            disclosure("faq-config", "How do I configure?"),
            disclosure("faq-debug", "How do I debug?"),
        ],
        pending_mutations: vec![
            json!({ "kind": "node-added", "timestampMs": 40.0,
                    "target": { "tagName": "DIV", "id": "", "className": "panel" },
                    "nodeCount": 3 }),
            json!({ "kind": "attribute", "timestampMs": 12.0,
                    "target": { "tagName": "BUTTON", "id": "faq-install", "className": "" },
                    "nodeCount": 1, "attributeName": "aria-expanded" }),
        ],
        ..MockState::default()
    });

    let outcome = coordinator.scrape("https://example.com/docs").await.unwrap();
    assert_eq!(state.lock().unwrap().opens, 1);
    assert!(outcome.prior_failures.is_empty());

    let attempt = &outcome.attempt;
    assert_eq!(attempt.phase, AttemptPhase::Completed);
    assert_eq!(attempt.wait_strategy, Some(WaitStrategy::Stability));
    assert!(attempt.protection_history.is_empty());
    assert!(!attempt.bypass_used);

    assert_eq!(attempt.expansion.len(), 3);
    for record in attempt.expansion.values() {
        assert!(record.succeeded, "strategy should apply for {:?}", record.descriptor.id);
        assert!(record.content_changed);
        assert_eq!(record.depth, 0);
        assert!(record.nested.is_empty());
        assert!(!record.depth_limited);
    }

    let monitoring = attempt.monitoring.as_ref().unwrap();
    assert_eq!(monitoring.summary.total_mutations, 2);
    assert_eq!(monitoring.summary.nodes_added, 3);
    // Drained events come back in page-clock order.
    assert!(monitoring.mutations[0].timestamp_ms < monitoring.mutations[1].timestamp_ms);
    // Only the API-like request survives filtering.
    assert_eq!(monitoring.api_calls.len(), 1);
    assert!(monitoring.api_calls[0].url.contains("/api/"));

    let scrape_report = report::build(outcome, true);
    assert_eq!(scrape_report.interaction_summary.total_interactions, 3);
    assert_eq!(scrape_report.interaction_summary.successful_interactions, 3);
    assert_eq!(scrape_report.interaction_summary.content_changes_detected, 3);
    assert_eq!(scrape_report.attempts_made, 1);
    assert!(scrape_report.elapsed_ms > 0);
    assert!(scrape_report
        .recommendations
        .iter()
        .all(|r| !r.contains("error handling")));

    assert_json_include!(
        actual: serde_json::to_value(&scrape_report).unwrap(),
        expected: json!({
            "pageInfo": {
                "url": "https://example.com/docs",
                "finalUrl": "https://example.com/docs",
                "title": "Example Docs"
            },
            "interactionSummary": { "totalInteractions": 3 },
            "stealthModeUsed": true
        })
    );
}

#[tokio::test(start_paused = true)]
async fn cloudflare_challenge_clears_during_bypass_wait() {
    // The first three title reads show the interstitial; the fourth is the
    // real page. Detection consumes one read, the bypass poll the rest.
    let (coordinator, _state) = harness(MockState {
        challenge_title_calls: 3,
        ..MockState::default()
    });

    let outcome = coordinator.scrape("https://example.com/docs").await.unwrap();
    assert!(outcome.prior_failures.is_empty());
    let attempt = &outcome.attempt;
    assert_eq!(attempt.phase, AttemptPhase::Completed);
    assert_eq!(outcome.title, "Example Docs");

    // The detection stays on the record even though the page cleared.
    assert_eq!(attempt.protection_history.len(), 1);
    assert!(attempt.protection_history[0].is_cloudflare());
    assert!(attempt.bypass_used);

    // All of it survives into the report, in its serialized form too.
    let scrape_report = report::build(outcome, false);
    assert!(scrape_report.bypass_used);
    assert_eq!(scrape_report.protection_history.len(), 1);
    assert!(scrape_report.elapsed_ms > 0);

    let json = serde_json::to_value(&scrape_report).unwrap();
    assert_eq!(json["bypassUsed"], json!(true));
    assert!(json["elapsedMs"].as_u64().unwrap() > 0);
    assert!(json["protectionHistory"][0]["indicators"][0]
        .as_str()
        .unwrap()
        .contains("just a moment"));
}

#[tokio::test(start_paused = true)]
async fn bypass_wait_stays_blocked_on_a_cloudflare_block_page() {
    // "Attention Required! | Cloudflare" is a block page, not a cleared
    // challenge: the wait must run out instead of declaring success.
    let state = Arc::new(Mutex::new(MockState {
        challenge_title_calls: u32::MAX,
        challenge_title: Some("Attention Required! | Cloudflare".to_string()),
        ..MockState::default()
    }));
    let session = MockSession { state };

    assert!(!protection::bypass_wait(&session, 5).await);
}

#[tokio::test]
async fn detect_flags_a_cloudflare_interstitial() {
    let state = Arc::new(Mutex::new(MockState {
        challenge_title_calls: u32::MAX,
        ..MockState::default()
    }));
    let session = MockSession { state };

    let signature = protection::detect(&session).await.unwrap().unwrap();
    assert!(signature.is_cloudflare());
    assert!(signature.to_string().contains("just a moment"));
}

#[tokio::test(start_paused = true)]
async fn bypass_wait_returns_once_the_title_clears() {
    // Challenge title for the first four reads, real title afterwards: the
    // poll sees it clear on the fifth second, well inside the deadline.
    let state = Arc::new(Mutex::new(MockState {
        challenge_title_calls: 4,
        ..MockState::default()
    }));
    let session = MockSession { state };

    assert!(protection::bypass_wait(&session, 30).await);
}

#[tokio::test(start_paused = true)]
async fn bypass_wait_gives_up_at_the_deadline() {
    let state = Arc::new(Mutex::new(MockState {
        challenge_title_calls: u32::MAX,
        ..MockState::default()
    }));
    let session = MockSession { state };

    assert!(!protection::bypass_wait(&session, 5).await);
}

#[tokio::test(start_paused = true)]
async fn page_that_never_settles_falls_back_to_fixed_wait() {
    let (coordinator, _state) = harness(MockState {
        oscillating_height: true,
        ..MockState::default()
    });

    let outcome = coordinator.scrape("https://example.com/docs").await.unwrap();
    let attempt = &outcome.attempt;
    assert_eq!(attempt.wait_strategy, Some(WaitStrategy::Fallback));
    assert_eq!(attempt.phase, AttemptPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn oscillating_metric_never_reports_stable() {
    let state = Arc::new(Mutex::new(MockState {
        oscillating_height: true,
        ..MockState::default()
    }));
    let session = MockSession { state };

    assert!(!await_stability(&session, 5_000, 1_000, 250).await);
}

#[tokio::test(start_paused = true)]
async fn quiet_metric_reports_stable_after_hold() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let session = MockSession { state };

    assert!(await_stability(&session, 5_000, 1_000, 250).await);
}

#[tokio::test]
async fn repeated_snapshots_of_a_static_page_show_no_drift() {
    let state = Arc::new(Mutex::new(MockState::default()));
    let session = MockSession { state };

    let first = capture_snapshot(&session).await;
    let second = capture_snapshot(&session).await;

    assert!(first.capture_errors.is_empty());
    assert_eq!(first.content_metrics, second.content_metrics);

    let analysis = ChangeAnalysis::compare(&first.content_metrics, &second.content_metrics);
    assert!(analysis.significant_changes.is_empty());
    assert!(analysis.deltas.values().all(|d| d.delta == 0));
}
