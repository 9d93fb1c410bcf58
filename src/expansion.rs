//! Expansion engine: discover disclosure elements, expand them through an
//! ordered strategy list, and recurse into newly revealed disclosures.
//!
//! Per-element failures are captured into that element's record and never
//! abort sibling processing. Recursion is bounded by depth and per-level
//! fan-out; attempts beyond the depth limit yield a sentinel record
//! instead of a real attempt.

use crate::config::ScrapeConfig;
use crate::element::{capture_content, ElementContent, ElementDescriptor, Signature, LOCATOR_SNIPPET};
use crate::error::SessionError;
use crate::session::BrowserSession;
use crate::stability::await_stability;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Selectors for disclosure patterns, tried in this order on the full page.
const DISCOVERY_SELECTORS: [&str; 10] = [
    "[aria-expanded=\"false\"]",
    "[aria-expanded=\"true\"]",
    "details:not([open])",
    ".expandable:not(.expanded)",
    ".collapsible:not(.expanded)",
    ".accordion-header",
    "[data-toggle=\"collapse\"]",
    "[data-bs-toggle=\"collapse\"]",
    ".dropdown-toggle:not(.show)",
    "[role=\"button\"][aria-expanded]",
];

/// Narrower selector set used when re-scanning inside an expanded subtree.
const NESTED_SELECTORS: [&str; 4] = [
    "[aria-expanded=\"false\"]",
    "details:not([open])",
    ".expandable:not(.expanded)",
    ".collapsible:not(.expanded)",
];

/// How an expansion was attempted, in fixed priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpansionStrategy {
    /// Primary activation: a click-equivalent on the element.
    Click,
    /// Set the `aria-expanded` attribute and fire a change event.
    AriaExpanded,
    /// Set a native `<details>` element's open state directly.
    DetailsOpen,
    /// Dispatch a synthetic activation event for `data-toggle` carriers.
    DataToggle,
}

/// Strategies share one contract and are tried until one applies.
pub const STRATEGY_ORDER: [ExpansionStrategy; 4] = [
    ExpansionStrategy::Click,
    ExpansionStrategy::AriaExpanded,
    ExpansionStrategy::DetailsOpen,
    ExpansionStrategy::DataToggle,
];

impl ExpansionStrategy {
    /// Page-side half of the strategy contract. The script locates the
    /// element and returns `{ applied, error? }`; `applied: false` with no
    /// error means the strategy's precondition did not hold.
    fn script(&self, info_json: &str) -> String {
        let body = match self {
            ExpansionStrategy::Click => {
                r#"try { el.click(); return { applied: true }; }
                   catch (e) { return { applied: false, error: e.message }; }"#
            }
            ExpansionStrategy::AriaExpanded => {
                r#"if (!el.hasAttribute('aria-expanded')) return { applied: false };
                   try {
                       el.setAttribute('aria-expanded', 'true');
                       el.dispatchEvent(new Event('change', { bubbles: true }));
                       return { applied: true };
                   } catch (e) { return { applied: false, error: e.message }; }"#
            }
            ExpansionStrategy::DetailsOpen => {
                r#"if (el.tagName !== 'DETAILS') return { applied: false };
                   try { el.open = true; return { applied: true }; }
                   catch (e) { return { applied: false, error: e.message }; }"#
            }
            ExpansionStrategy::DataToggle => {
                r#"if (!el.hasAttribute('data-toggle') && !el.hasAttribute('data-bs-toggle'))
                       return { applied: false };
                   try {
                       el.dispatchEvent(new Event('click', { bubbles: true }));
                       return { applied: true };
                   } catch (e) { return { applied: false, error: e.message }; }"#
            }
        };
        format!(
            r#"(() => {{
                {LOCATOR_SNIPPET}
                const el = __locate({info_json});
                if (!el) return {{ applied: false, error: 'element not found' }};
                {body}
            }})()"#
        )
    }
}

/// Outcome of one expansion attempt, owned 1:1 by an element signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionAttemptRecord {
    pub descriptor: ElementDescriptor,
    /// Recursion depth; top-level discoveries are depth 0.
    pub depth: u32,
    pub collapsed_content: Option<ElementContent>,
    pub expanded_content: Option<ElementContent>,
    /// A strategy applied without raising. Distinct from `content_changed`.
    pub succeeded: bool,
    pub strategy: Option<ExpansionStrategy>,
    /// Authoritative change signal: before/after content capture differed.
    pub content_changed: bool,
    pub error: Option<String>,
    /// Records for disclosures revealed by this expansion.
    pub nested: BTreeMap<Signature, ExpansionAttemptRecord>,
    /// Sentinel: the depth limit was reached, no attempt was made.
    pub depth_limited: bool,
}

impl ExpansionAttemptRecord {
    fn depth_limit(descriptor: ElementDescriptor, depth: u32) -> Self {
        Self {
            descriptor,
            depth,
            collapsed_content: None,
            expanded_content: None,
            succeeded: false,
            strategy: None,
            content_changed: false,
            error: None,
            nested: BTreeMap::new(),
            depth_limited: true,
        }
    }
}

/// Aggregate view over one exploration pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpansionSummary {
    pub total_elements: usize,
    pub successful_expansions: usize,
    pub failed_expansions: usize,
    pub content_changes: usize,
    pub nested_discoveries: usize,
    pub strategies_used: BTreeMap<String, usize>,
}

/// Discovers and expands disclosure elements; one instance per attempt.
pub struct ExpansionEngine {
    max_depth: u32,
    max_nested_per_level: usize,
    settle_max_wait_ms: u64,
    nested_settle_wait_ms: u64,
    settle_hold_ms: u64,
    settle_poll_ms: u64,
    results: BTreeMap<Signature, ExpansionAttemptRecord>,
    visited: HashSet<Signature>,
}

impl ExpansionEngine {
    pub fn new(config: &ScrapeConfig) -> Self {
        Self {
            max_depth: config.max_expansion_depth,
            max_nested_per_level: config.max_nested_per_level,
            settle_max_wait_ms: config.stability_max_wait_ms,
            nested_settle_wait_ms: 3_000,
            settle_hold_ms: 1_000,
            settle_poll_ms: config.stability_poll_ms,
            results: BTreeMap::new(),
            visited: HashSet::new(),
        }
    }

    /// Expansion results keyed by element signature.
    pub fn results(&self) -> &BTreeMap<Signature, ExpansionAttemptRecord> {
        &self.results
    }

    pub fn into_results(self) -> BTreeMap<Signature, ExpansionAttemptRecord> {
        self.results
    }

    /// Summarize the current result map.
    pub fn summary(&self) -> ExpansionSummary {
        let mut summary = ExpansionSummary {
            total_elements: self.results.len(),
            ..ExpansionSummary::default()
        };
        for record in self.results.values() {
            if record.succeeded {
                summary.successful_expansions += 1;
                if let Some(strategy) = record.strategy {
                    let key = serde_json::to_value(strategy)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| "unknown".to_string());
                    *summary.strategies_used.entry(key).or_insert(0) += 1;
                }
                if record.content_changed {
                    summary.content_changes += 1;
                }
            } else {
                summary.failed_expansions += 1;
            }
            summary.nested_discoveries += record.nested.len();
        }
        summary
    }

    /// Discover every disclosure element and attempt to expand each one,
    /// recursing into content revealed along the way.
    pub async fn explore(&mut self, session: &dyn BrowserSession) -> Result<(), SessionError> {
        self.results.clear();
        self.visited.clear();

        let discovered = discover(session, None, &DISCOVERY_SELECTORS).await?;
        info!("found {} expandable elements", discovered.len());

        for descriptor in discovered {
            let signature = descriptor.signature();
            if !self.visited.insert(signature.clone()) {
                continue;
            }
            let record = self.process_element(session, descriptor, 0).await;
            self.results.insert(signature, record);
        }
        Ok(())
    }

    fn process_element<'a>(
        &'a mut self,
        session: &'a dyn BrowserSession,
        descriptor: ElementDescriptor,
        depth: u32,
    ) -> BoxFuture<'a, ExpansionAttemptRecord> {
        Box::pin(async move {
            if depth > self.max_depth {
                debug!(
                    "depth limit reached at {} for {}",
                    depth,
                    descriptor.signature()
                );
                return ExpansionAttemptRecord::depth_limit(descriptor, depth);
            }

            let collapsed_content = capture_content(session, &descriptor).await.ok();

            let mut record = ExpansionAttemptRecord {
                descriptor: descriptor.clone(),
                depth,
                collapsed_content,
                expanded_content: None,
                succeeded: false,
                strategy: None,
                content_changed: false,
                error: None,
                nested: BTreeMap::new(),
                depth_limited: false,
            };

            match self.try_strategies(session, &descriptor).await {
                Ok(strategy) => {
                    record.succeeded = true;
                    record.strategy = Some(strategy);
                }
                Err(message) => {
                    warn!("expansion failed for {}: {message}", descriptor.signature());
                    record.error = Some(message);
                    return record;
                }
            }

            // Let revealed content settle before re-capturing.
            let settle_budget = if depth == 0 {
                self.settle_max_wait_ms
            } else {
                self.nested_settle_wait_ms
            };
            await_stability(session, settle_budget, self.settle_hold_ms, self.settle_poll_ms)
                .await;

            record.expanded_content = capture_content(session, &descriptor).await.ok();
            record.content_changed = match (&record.collapsed_content, &record.expanded_content)
            {
                (Some(before), Some(after)) => before != after,
                _ => false,
            };

            // Only a confirmed content change can have revealed new
            // disclosures worth scanning for.
            if record.content_changed {
                let nested = match discover(session, Some(&descriptor), &NESTED_SELECTORS).await {
                    Ok(found) => found,
                    Err(e) => {
                        debug!("nested scan failed under {}: {e}", descriptor.signature());
                        Vec::new()
                    }
                };
                let mut taken = 0usize;
                for child in nested {
                    if taken >= self.max_nested_per_level {
                        break;
                    }
                    let child_signature = child.signature();
                    if !self.visited.insert(child_signature.clone()) {
                        continue;
                    }
                    taken += 1;
                    let child_record = self.process_element(session, child, depth + 1).await;
                    record.nested.insert(child_signature, child_record);
                }
            }

            record
        })
    }

    /// Try each strategy in fixed priority order; the first one that
    /// applies without raising wins. Returns the last failure message when
    /// none applied.
    async fn try_strategies(
        &self,
        session: &dyn BrowserSession,
        descriptor: &ElementDescriptor,
    ) -> Result<ExpansionStrategy, String> {
        let info_json = match serde_json::to_string(descriptor) {
            Ok(json) => json,
            Err(e) => return Err(format!("descriptor serialization: {e}")),
        };

        let mut last_error = None;
        for strategy in STRATEGY_ORDER {
            // The primary activation goes through the session's own click
            // when the element has an unambiguous id selector.
            if strategy == ExpansionStrategy::Click && !descriptor.id.is_empty() {
                match session.click(&id_selector(&descriptor.id)).await {
                    Ok(()) => return Ok(strategy),
                    Err(SessionError::ElementNotFound(_)) => {}
                    Err(e) => {
                        last_error = Some(e.to_string());
                        continue;
                    }
                }
            }

            let outcome = match session.evaluate(&strategy.script(&info_json)).await {
                Ok(value) => value,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            let applied = outcome
                .get("applied")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if applied {
                return Ok(strategy);
            }
            if let Some(message) = outcome.get("error").and_then(|v| v.as_str()) {
                last_error = Some(message.to_string());
            }
        }

        Err(last_error.unwrap_or_else(|| "no suitable expansion strategy".to_string()))
    }
}

/// Attribute-form id selector. Ids coming off real pages can hold `:`,
/// `.`, or other CSS metacharacters that would break a `#` selector.
fn id_selector(id: &str) -> String {
    let escaped = id.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[id=\"{escaped}\"]")
}

/// Run the discovery selectors, deduplicating by underlying element
/// identity page-side, and convert matches to descriptors. `scope`
/// restricts the scan strictly to that element's subtree.
async fn discover(
    session: &dyn BrowserSession,
    scope: Option<&ElementDescriptor>,
    selectors: &[&str],
) -> Result<Vec<ElementDescriptor>, SessionError> {
    let selectors_json =
        serde_json::to_string(selectors).map_err(|e| SessionError::Evaluation(e.to_string()))?;
    let scope_json = match scope {
        Some(descriptor) => serde_json::to_string(descriptor)
            .map_err(|e| SessionError::Evaluation(e.to_string()))?,
        None => "null".to_string(),
    };

    let script = format!(
        r#"(() => {{
            {LOCATOR_SNIPPET}
            const scopeInfo = {scope_json};
            const root = scopeInfo ? __locate(scopeInfo) : document;
            if (!root) return [];
            const seen = new Set();
            const results = [];
            for (const selector of {selectors_json}) {{
                let matches;
                try {{ matches = root.querySelectorAll(selector); }}
                catch (e) {{ continue; }}
                for (const el of matches) {{
                    if (seen.has(el)) continue;
                    seen.add(el);
                    const rect = el.getBoundingClientRect();
                    if (rect.width <= 0 || rect.height <= 0) continue;
                    const attributes = {{}};
                    for (const attr of el.attributes) {{
                        if (attr.name.startsWith('data-') || attr.name.startsWith('aria-') ||
                            ['id', 'class', 'role'].includes(attr.name)) {{
                            attributes[attr.name] = attr.value;
                        }}
                    }}
                    results.push({{
                        tagName: el.tagName,
                        id: el.id,
                        className: typeof el.className === 'string' ? el.className : '',
                        text: (el.textContent || '').trim().substring(0, 100),
                        attributes,
                        position: {{
                            x: Math.round(rect.x),
                            y: Math.round(rect.y),
                            width: Math.round(rect.width),
                            height: Math.round(rect.height)
                        }},
                        isCurrentlyExpanded: el.getAttribute('aria-expanded') === 'true' ||
                                             el.hasAttribute('open') ||
                                             el.classList.contains('expanded') ||
                                             el.classList.contains('show')
                    }});
                }}
            }}
            return results;
        }})()"#
    );

    let value = session.evaluate(&script).await?;
    serde_json::from_value(value).map_err(|e| SessionError::Evaluation(format!("discovery: {e}")))
}

#[async_trait::async_trait]
impl crate::monitor::InteractionHook for ExpansionEngine {
    fn label(&self) -> &str {
        "expand-disclosures"
    }

    async fn run(
        &mut self,
        session: &dyn BrowserSession,
    ) -> Result<serde_json::Value, SessionError> {
        self.explore(session).await?;
        serde_json::to_value(self.summary())
            .map_err(|e| SessionError::Evaluation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_selector_survives_css_metacharacters() {
        assert_eq!(id_selector("faq-1"), r#"[id="faq-1"]"#);
        assert_eq!(id_selector("section:2.intro"), r#"[id="section:2.intro"]"#);
        assert_eq!(id_selector(r#"say-"hi""#), r#"[id="say-\"hi\""]"#);
    }

    #[test]
    fn test_strategy_order_starts_with_activation() {
        assert_eq!(STRATEGY_ORDER[0], ExpansionStrategy::Click);
        assert_eq!(STRATEGY_ORDER[3], ExpansionStrategy::DataToggle);
    }

    #[test]
    fn test_strategy_scripts_share_contract() {
        for strategy in STRATEGY_ORDER {
            let script = strategy.script("{\"tagName\":\"DIV\"}");
            assert!(script.contains("applied"));
            assert!(script.contains("__locate"));
        }
    }

    #[test]
    fn test_depth_limit_sentinel_shape() {
        let record = ExpansionAttemptRecord::depth_limit(ElementDescriptor::default(), 4);
        assert!(record.depth_limited);
        assert!(!record.succeeded);
        assert!(!record.content_changed);
        assert!(record.error.is_none());
        assert!(record.nested.is_empty());
    }

    #[test]
    fn test_summary_counts() {
        let config = ScrapeConfig::default();
        let mut engine = ExpansionEngine::new(&config);

        let make = |sig: &str, succeeded: bool, changed: bool| {
            let descriptor = ElementDescriptor {
                id: sig.to_string(),
                tag_name: "BUTTON".to_string(),
                ..ElementDescriptor::default()
            };
            (
                descriptor.signature(),
                ExpansionAttemptRecord {
                    descriptor,
                    depth: 0,
                    collapsed_content: None,
                    expanded_content: None,
                    succeeded,
                    strategy: succeeded.then_some(ExpansionStrategy::Click),
                    content_changed: changed,
                    error: (!succeeded).then(|| "boom".to_string()),
                    nested: BTreeMap::new(),
                    depth_limited: false,
                },
            )
        };

        for (sig, record) in [make("a", true, true), make("b", true, false), make("c", false, false)] {
            engine.results.insert(sig, record);
        }

        let summary = engine.summary();
        assert_eq!(summary.total_elements, 3);
        assert_eq!(summary.successful_expansions, 2);
        assert_eq!(summary.failed_expansions, 1);
        assert_eq!(summary.content_changes, 1);
        assert_eq!(summary.strategies_used.get("click"), Some(&2));
    }

    #[test]
    fn test_strategy_serializes_kebab_case() {
        let json = serde_json::to_string(&ExpansionStrategy::AriaExpanded).unwrap();
        assert_eq!(json, "\"aria-expanded\"");
        let json = serde_json::to_string(&ExpansionStrategy::DetailsOpen).unwrap();
        assert_eq!(json, "\"details-open\"");
    }
}
