//! Mutation monitor: observes DOM mutations and network calls around a
//! single interaction pass, then seals the log into a summarized session.

use crate::config::ScrapeConfig;
use crate::error::SessionError;
use crate::session::{BrowserSession, NetworkCallRecord};
use crate::snapshot::{self, ContentMetrics};
use crate::stability::await_stability;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An interaction pass the monitor observes. Invoked exactly once per
/// monitoring session; its outcome (or error) is recorded, never retried.
#[async_trait]
pub trait InteractionHook: Send {
    /// Short label recorded in the session.
    fn label(&self) -> &str;

    async fn run(
        &mut self,
        session: &dyn BrowserSession,
    ) -> Result<serde_json::Value, SessionError>;
}

/// Kind of a recorded DOM mutation. `childList` observer records fan out
/// into separate added/removed events so counts stay attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Attribute,
    NodeAdded,
    NodeRemoved,
    TextChanged,
}

/// Minimal identity of a mutation target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationTarget {
    pub tag_name: String,
    pub id: String,
    pub class_name: String,
    /// Target text content, clipped to 100 characters.
    pub text: String,
}

/// One observed DOM mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub kind: MutationKind,
    /// Page-clock milliseconds (performance.now at observation time).
    pub timestamp_ms: f64,
    pub target: MutationTarget,
    /// Nodes added/removed for childList events, 1 otherwise.
    #[serde(default)]
    pub node_count: u32,
    /// Attribute name for attribute mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    /// Value before the mutation, clipped to 100 characters. Set for
    /// attribute and text mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    /// Value after the mutation, clipped to 100 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

/// Coarse mutation activity classification over the mutation log's own
/// timespan. Boundaries are exclusive: a rate of exactly 5/s is `Medium`,
/// exactly 1/s is `Low`. Zero mutations is always `None`; a non-empty log
/// with no measurable timespan is `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    None,
    Low,
    Medium,
    High,
}

impl Default for ActivityLevel {
    fn default() -> Self {
        ActivityLevel::None
    }
}

impl ActivityLevel {
    pub fn classify(mutation_count: usize, duration_secs: f64) -> Self {
        if mutation_count == 0 {
            return ActivityLevel::None;
        }
        if duration_secs <= 0.0 {
            return ActivityLevel::Low;
        }
        let rate = mutation_count as f64 / duration_secs;
        if rate > 5.0 {
            ActivityLevel::High
        } else if rate > 1.0 {
            ActivityLevel::Medium
        } else {
            ActivityLevel::Low
        }
    }
}

/// Before/after value of one content metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricDelta {
    pub before: i64,
    pub after: i64,
    pub delta: i64,
}

/// Comparison of the initial and final content metrics, with
/// human-readable notes for changes crossing significance thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAnalysis {
    pub deltas: BTreeMap<String, MetricDelta>,
    pub significant_changes: Vec<String>,
}

impl ChangeAnalysis {
    pub fn compare(initial: &ContentMetrics, final_: &ContentMetrics) -> Self {
        let before = initial.as_map();
        let after = final_.as_map();
        let mut deltas = BTreeMap::new();
        for (name, b) in &before {
            let a = after[name];
            deltas.insert(
                name.to_string(),
                MetricDelta { before: *b, after: a, delta: a - b },
            );
        }

        let mut significant = Vec::new();
        let element_delta = final_.total_elements - initial.total_elements;
        if element_delta > 10 {
            significant.push(format!("{element_delta} new elements appeared"));
        }
        let text_delta = final_.total_text_length - initial.total_text_length;
        if text_delta > 1000 {
            significant.push(format!("{text_delta} characters of new text"));
        }
        if final_.buttons > initial.buttons {
            significant.push(format!("{} new buttons", final_.buttons - initial.buttons));
        }
        if final_.links > initial.links {
            significant.push(format!("{} new links", final_.links - initial.links));
        }
        if final_.inputs > initial.inputs {
            significant.push(format!("{} new inputs", final_.inputs - initial.inputs));
        }
        let height_delta = final_.page_height - initial.page_height;
        if height_delta.abs() > 500 {
            significant.push(format!("page height changed by {height_delta}px"));
        }

        ChangeAnalysis { deltas, significant_changes: significant }
    }
}

/// Outcome of the single hook invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutcome {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate counters over the sealed mutation log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSummary {
    pub total_mutations: usize,
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub attribute_changes: usize,
    pub text_changes: usize,
    pub api_call_count: usize,
    /// Span between the first and last logged mutation, page-clock ms.
    pub time_span_ms: f64,
    /// Mutation rate over `time_span_ms`; 0 when the span is empty.
    pub mutations_per_second: f64,
    pub activity: ActivityLevel,
}

/// A sealed monitoring session. Once returned it is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub initial_metrics: ContentMetrics,
    pub final_metrics: ContentMetrics,
    /// Mutation log in page-clock order.
    pub mutations: Vec<MutationEvent>,
    /// Network calls whose URL looks API-like.
    pub api_calls: Vec<NetworkCallRecord>,
    pub hook_outcome: HookOutcome,
    pub summary: MonitoringSummary,
    pub change_analysis: ChangeAnalysis,
}

/// Runs an [`InteractionHook`] while recording mutations and network
/// traffic, then seals the observations into a [`MonitoringSession`].
pub struct MutationMonitor {
    stability_max_wait_ms: u64,
    stability_hold_ms: u64,
    stability_poll_ms: u64,
}

impl MutationMonitor {
    pub fn new(config: &ScrapeConfig) -> Self {
        MutationMonitor {
            stability_max_wait_ms: config.stability_max_wait_ms,
            stability_hold_ms: config.stability_hold_ms,
            stability_poll_ms: config.stability_poll_ms,
        }
    }

    /// Observe one interaction pass end to end.
    pub async fn monitor(
        &self,
        session: &dyn BrowserSession,
        hook: &mut dyn InteractionHook,
    ) -> Result<MonitoringSession, SessionError> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        debug!(session = %id, hook = hook.label(), "starting monitoring session");

        session.evaluate(OBSERVER_INSTALL_SCRIPT).await?;
        session.begin_network_capture().await?;
        let initial_metrics = snapshot::capture_metrics(session).await?;

        // The hook runs exactly once; its failure is data, not a monitor
        // failure.
        let hook_outcome = match hook.run(session).await {
            Ok(value) => HookOutcome {
                label: hook.label().to_string(),
                value: Some(value),
                error: None,
            },
            Err(e) => {
                warn!(session = %id, error = %e, "interaction hook failed");
                HookOutcome {
                    label: hook.label().to_string(),
                    value: None,
                    error: Some(e.to_string()),
                }
            }
        };

        await_stability(
            session,
            self.stability_max_wait_ms,
            self.stability_hold_ms,
            self.stability_poll_ms,
        )
        .await;

        let final_metrics = snapshot::capture_metrics(session).await?;
        let mut mutations = self.drain_mutations(session).await?;
        mutations.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));

        let api_calls: Vec<NetworkCallRecord> = session
            .captured_requests()
            .into_iter()
            .filter(NetworkCallRecord::is_api_like)
            .collect();

        let ended_at = Utc::now();
        let summary = summarize(&mutations, &api_calls);
        info!(
            session = %id,
            mutations = summary.total_mutations,
            api_calls = summary.api_call_count,
            activity = ?summary.activity,
            "monitoring session sealed"
        );

        Ok(MonitoringSession {
            id,
            started_at,
            ended_at,
            change_analysis: ChangeAnalysis::compare(&initial_metrics, &final_metrics),
            initial_metrics,
            final_metrics,
            mutations,
            api_calls,
            hook_outcome,
            summary,
        })
    }

    async fn drain_mutations(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<Vec<MutationEvent>, SessionError> {
        let value = session.evaluate(OBSERVER_DRAIN_SCRIPT).await?;
        serde_json::from_value(value).map_err(|e| SessionError::Evaluation(e.to_string()))
    }
}

/// Seal the sorted mutation log into counters. Activity is a pure function
/// of the log itself: the rate divides by the span between the first and
/// last mutation's page-clock timestamps, not by how long the monitor ran.
fn summarize(mutations: &[MutationEvent], api_calls: &[NetworkCallRecord]) -> MonitoringSummary {
    let time_span_ms = match (mutations.first(), mutations.last()) {
        (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
        _ => 0.0,
    };
    let mutations_per_second = if time_span_ms > 0.0 {
        mutations.len() as f64 / (time_span_ms / 1000.0)
    } else {
        0.0
    };
    let mut summary = MonitoringSummary {
        total_mutations: mutations.len(),
        api_call_count: api_calls.len(),
        time_span_ms,
        mutations_per_second,
        activity: ActivityLevel::classify(mutations.len(), time_span_ms / 1000.0),
        ..MonitoringSummary::default()
    };
    for event in mutations {
        match event.kind {
            MutationKind::NodeAdded => summary.nodes_added += event.node_count as u64,
            MutationKind::NodeRemoved => summary.nodes_removed += event.node_count as u64,
            MutationKind::Attribute => summary.attribute_changes += 1,
            MutationKind::TextChanged => summary.text_changes += 1,
        }
    }
    summary
}

/// Installs a MutationObserver buffering into `window.__pagespecMutations`.
/// Idempotent: a second install is a no-op.
const OBSERVER_INSTALL_SCRIPT: &str = r#"(() => {
    if (window.__pagespecMutations) return true;
    window.__pagespecMutations = [];
    const clip = (s) => (s == null ? null : String(s).substring(0, 100));
    const describe = (node) => {
        const el = node.nodeType === Node.ELEMENT_NODE ? node : node.parentElement;
        if (!el) return { tagName: '', id: '', className: '', text: '' };
        return {
            tagName: el.tagName || '',
            id: el.id || '',
            className: typeof el.className === 'string' ? el.className : '',
            text: (el.textContent || '').trim().substring(0, 100)
        };
    };
    const observer = new MutationObserver((records) => {
        const now = performance.now();
        for (const record of records) {
            if (record.type === 'childList') {
                if (record.addedNodes.length > 0) {
                    window.__pagespecMutations.push({
                        kind: 'node-added', timestampMs: now,
                        target: describe(record.target),
                        nodeCount: record.addedNodes.length
                    });
                }
                if (record.removedNodes.length > 0) {
                    window.__pagespecMutations.push({
                        kind: 'node-removed', timestampMs: now,
                        target: describe(record.target),
                        nodeCount: record.removedNodes.length
                    });
                }
            } else if (record.type === 'attributes') {
                const el = record.target;
                window.__pagespecMutations.push({
                    kind: 'attribute', timestampMs: now,
                    target: describe(el),
                    nodeCount: 1,
                    attributeName: record.attributeName,
                    oldValue: clip(record.oldValue),
                    newValue: clip(el.getAttribute && el.getAttribute(record.attributeName))
                });
            } else if (record.type === 'characterData') {
                window.__pagespecMutations.push({
                    kind: 'text-changed', timestampMs: now,
                    target: describe(record.target),
                    nodeCount: 1,
                    oldValue: clip(record.oldValue),
                    newValue: clip(record.target.textContent)
                });
            }
        }
    });
    observer.observe(document.body, {
        childList: true, subtree: true,
        attributes: true, attributeOldValue: true,
        characterData: true, characterDataOldValue: true
    });
    return true;
})()"#;

/// Drains and returns the buffered mutation log.
const OBSERVER_DRAIN_SCRIPT: &str = r#"(() => {
    const log = window.__pagespecMutations || [];
    window.__pagespecMutations = [];
    return log;
})()"#;
