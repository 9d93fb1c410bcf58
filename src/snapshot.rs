//! Structure snapshotter: read-only capture of the current document.
//!
//! Every sub-capture is independently fallible and degrades to an empty
//! or partial result — a corrupt corner of the page must never cost the
//! whole snapshot. The node tree is depth- and fan-out-bounded so
//! snapshot size stays sub-linear in pathological DOMs.

use crate::element::BoundingBox;
use crate::session::BrowserSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum node-tree recursion depth.
const MAX_TREE_DEPTH: u32 = 10;
/// Maximum children captured per node.
const MAX_CHILDREN_PER_NODE: u32 = 50;

/// Quantitative content metrics; the deltas between two captures drive
/// change analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentMetrics {
    pub total_elements: i64,
    pub visible_elements: i64,
    pub text_nodes: i64,
    pub total_text_length: i64,
    pub links: i64,
    pub buttons: i64,
    pub inputs: i64,
    pub images: i64,
    pub scripts: i64,
    pub page_height: i64,
    pub viewport_height: i64,
}

impl ContentMetrics {
    /// Name/value view for generic delta computation.
    pub fn as_map(&self) -> BTreeMap<&'static str, i64> {
        BTreeMap::from([
            ("total_elements", self.total_elements),
            ("visible_elements", self.visible_elements),
            ("text_nodes", self.text_nodes),
            ("total_text_length", self.total_text_length),
            ("links", self.links),
            ("buttons", self.buttons),
            ("inputs", self.inputs),
            ("images", self.images),
            ("scripts", self.scripts),
            ("page_height", self.page_height),
            ("viewport_height", self.viewport_height),
        ])
    }
}

/// One interactive element from the page inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InteractiveElement {
    /// The discovery selector that matched first.
    pub selector: String,
    pub tag_name: String,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub is_visible: bool,
    pub position: BoundingBox,
    /// Coarse classification: expandable, link, button, clickable, interactive.
    pub interaction_type: String,
}

/// A likely content container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentArea {
    pub selector: String,
    pub tag_name: String,
    pub text_length: i64,
    pub child_count: i64,
    pub position: BoundingBox,
}

/// Page metadata: meta tags, link tags, resource counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageMetadata {
    pub metas: Vec<MetaTag>,
    pub link_tags: Vec<LinkTag>,
    pub scripts: i64,
    pub stylesheets: i64,
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTag {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTag {
    pub rel: String,
    pub href: String,
}

/// One node of the bounded DOM tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomNode {
    pub tag_name: String,
    pub id: String,
    pub class_name: String,
    pub text: String,
    pub is_visible: bool,
    pub is_expandable: bool,
    pub position: BoundingBox,
    pub children: Vec<DomNode>,
}

/// A structural snapshot of the current document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub interactive_elements: Vec<InteractiveElement>,
    pub content_areas: Vec<ContentArea>,
    pub metadata: PageMetadata,
    pub dom_tree: Option<DomNode>,
    pub content_metrics: ContentMetrics,
    /// Notes about sub-captures that degraded to empty results.
    pub capture_errors: Vec<String>,
}

/// Capture a full structural snapshot. Never fails: individual
/// sub-captures that error leave their field empty and add a note.
pub async fn capture_snapshot(session: &dyn BrowserSession) -> PageSnapshot {
    let mut snapshot = PageSnapshot {
        captured_at: Some(Utc::now()),
        ..PageSnapshot::default()
    };

    match session.current_url().await {
        Ok(url) => snapshot.url = url,
        Err(e) => snapshot.capture_errors.push(format!("url: {e}")),
    }
    match session.title().await {
        Ok(title) => snapshot.title = title,
        Err(e) => snapshot.capture_errors.push(format!("title: {e}")),
    }

    match capture_field(session, INTERACTIVE_ELEMENTS_SCRIPT).await {
        Ok(elements) => snapshot.interactive_elements = elements,
        Err(e) => snapshot.capture_errors.push(format!("interactive elements: {e}")),
    }
    match capture_field(session, CONTENT_AREAS_SCRIPT).await {
        Ok(areas) => snapshot.content_areas = areas,
        Err(e) => snapshot.capture_errors.push(format!("content areas: {e}")),
    }
    match capture_field(session, METADATA_SCRIPT).await {
        Ok(metadata) => snapshot.metadata = metadata,
        Err(e) => snapshot.capture_errors.push(format!("metadata: {e}")),
    }
    match capture_field::<Option<DomNode>>(session, &dom_tree_script()).await {
        Ok(tree) => snapshot.dom_tree = tree,
        Err(e) => snapshot.capture_errors.push(format!("dom tree: {e}")),
    }
    match capture_metrics(session).await {
        Ok(metrics) => snapshot.content_metrics = metrics,
        Err(e) => snapshot.capture_errors.push(format!("content metrics: {e}")),
    }

    snapshot
}

/// Capture just the content metrics (used by the mutation monitor).
pub async fn capture_metrics(
    session: &dyn BrowserSession,
) -> Result<ContentMetrics, crate::error::SessionError> {
    capture_field(session, CONTENT_METRICS_SCRIPT).await
}

async fn capture_field<T: serde::de::DeserializeOwned>(
    session: &dyn BrowserSession,
    script: &str,
) -> Result<T, crate::error::SessionError> {
    let value = session.evaluate(script).await?;
    serde_json::from_value(value)
        .map_err(|e| crate::error::SessionError::Evaluation(e.to_string()))
}

const INTERACTIVE_ELEMENTS_SCRIPT: &str = r#"(() => {
    const selectors = [
        'button', 'a', '[role="button"]', '[onclick]',
        '[aria-expanded]', '.expandable', '.collapsible',
        'details', 'summary', 'input', 'select', 'textarea',
        '[tabindex]', '[data-toggle]', '[data-collapse]'
    ];
    const seen = new Set();
    const results = [];
    for (const selector of selectors) {
        let matches;
        try { matches = document.querySelectorAll(selector); }
        catch (e) { continue; }
        for (const el of matches) {
            if (seen.has(el)) continue;
            seen.add(el);
            const rect = el.getBoundingClientRect();
            const attributes = {};
            for (const attr of el.attributes) {
                if (attr.name.startsWith('data-') || attr.name.startsWith('aria-') ||
                    ['id', 'class', 'role', 'href', 'type', 'name'].includes(attr.name)) {
                    attributes[attr.name] = attr.value;
                }
            }
            results.push({
                selector,
                tagName: el.tagName,
                text: (el.textContent || '').trim().substring(0, 100),
                attributes,
                isVisible: rect.width > 0 && rect.height > 0,
                position: {
                    x: Math.round(rect.x), y: Math.round(rect.y),
                    width: Math.round(rect.width), height: Math.round(rect.height)
                },
                interactionType: el.getAttribute('aria-expanded') !== null ? 'expandable'
                               : el.tagName === 'A' ? 'link'
                               : el.tagName === 'BUTTON' ? 'button'
                               : el.onclick ? 'clickable' : 'interactive'
            });
        }
    }
    return results;
})()"#;

const CONTENT_AREAS_SCRIPT: &str = r#"(() => {
    const selectors = [
        'main', 'article', '.content', '#content', '.main',
        '.container', '.wrapper', '[role="main"]'
    ];
    const areas = [];
    for (const selector of selectors) {
        let matches;
        try { matches = document.querySelectorAll(selector); }
        catch (e) { continue; }
        for (const el of matches) {
            const rect = el.getBoundingClientRect();
            if (rect.width <= 0 || rect.height <= 0) continue;
            areas.push({
                selector,
                tagName: el.tagName,
                textLength: (el.textContent || '').length,
                childCount: el.children.length,
                position: {
                    x: Math.round(rect.x), y: Math.round(rect.y),
                    width: Math.round(rect.width), height: Math.round(rect.height)
                }
            });
        }
    }
    return areas;
})()"#;

const METADATA_SCRIPT: &str = r#"(() => {
    const metas = Array.from(document.querySelectorAll('meta'))
        .map(m => ({
            name: m.getAttribute('name') || m.getAttribute('property') || '',
            content: m.getAttribute('content') || ''
        }))
        .filter(m => m.name);
    const linkTags = Array.from(document.querySelectorAll('link'))
        .map(l => ({ rel: l.getAttribute('rel') || '', href: l.getAttribute('href') || '' }))
        .filter(l => l.rel);
    return {
        metas,
        linkTags,
        scripts: document.querySelectorAll('script').length,
        stylesheets: document.querySelectorAll('link[rel="stylesheet"]').length,
        language: document.documentElement.lang || 'unknown'
    };
})()"#;

const CONTENT_METRICS_SCRIPT: &str = r#"(() => {
    const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
    let textNodes = 0;
    let totalTextLength = 0;
    let node;
    while ((node = walker.nextNode())) {
        const text = node.textContent.trim();
        if (text.length > 0) {
            textNodes += 1;
            totalTextLength += node.textContent.length;
        }
    }
    const all = document.querySelectorAll('*');
    let visibleElements = 0;
    for (const el of all) {
        const rect = el.getBoundingClientRect();
        if (rect.width > 0 && rect.height > 0) visibleElements += 1;
    }
    return {
        totalElements: all.length,
        visibleElements,
        textNodes,
        totalTextLength,
        links: document.querySelectorAll('a').length,
        buttons: document.querySelectorAll('button').length,
        inputs: document.querySelectorAll('input, select, textarea').length,
        images: document.querySelectorAll('img').length,
        scripts: document.querySelectorAll('script').length,
        pageHeight: document.body.scrollHeight,
        viewportHeight: window.innerHeight
    };
})()"#;

fn dom_tree_script() -> String {
    format!(
        r#"(() => {{
            const MAX_DEPTH = {MAX_TREE_DEPTH};
            const MAX_CHILDREN = {MAX_CHILDREN_PER_NODE};
            function traverse(el, depth) {{
                if (depth > MAX_DEPTH) return null;
                const computed = window.getComputedStyle(el);
                const rect = el.getBoundingClientRect();
                return {{
                    tagName: el.tagName,
                    id: el.id,
                    className: typeof el.className === 'string' ? el.className : '',
                    text: (el.textContent || '').trim().substring(0, 200),
                    isVisible: computed.display !== 'none' &&
                               computed.visibility !== 'hidden' &&
                               rect.width > 0 && rect.height > 0,
                    isExpandable: el.getAttribute('aria-expanded') !== null ||
                                  el.classList.contains('collapsible') ||
                                  el.classList.contains('expandable'),
                    position: {{
                        x: Math.round(rect.x), y: Math.round(rect.y),
                        width: Math.round(rect.width), height: Math.round(rect.height)
                    }},
                    children: Array.from(el.children)
                        .slice(0, MAX_CHILDREN)
                        .map(child => traverse(child, depth + 1))
                        .filter(child => child !== null)
                }};
            }}
            return document.body ? traverse(document.body, 0) : null;
        }})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_as_map_covers_every_field() {
        let metrics = ContentMetrics {
            total_elements: 120,
            page_height: 2400,
            ..ContentMetrics::default()
        };
        let map = metrics.as_map();
        assert_eq!(map.len(), 11);
        assert_eq!(map["total_elements"], 120);
        assert_eq!(map["page_height"], 2400);
        assert_eq!(map["buttons"], 0);
    }

    #[test]
    fn test_metrics_deserialize_from_page_shape() {
        let json = r#"{
            "totalElements": 340, "visibleElements": 210, "textNodes": 95,
            "totalTextLength": 8123, "links": 42, "buttons": 6, "inputs": 3,
            "images": 12, "scripts": 9, "pageHeight": 5200, "viewportHeight": 900
        }"#;
        let metrics: ContentMetrics = serde_json::from_str(json).unwrap();
        assert_eq!(metrics.total_elements, 340);
        assert_eq!(metrics.viewport_height, 900);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = PageSnapshot::default();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("captureErrors").is_some());
        assert!(json.get("contentMetrics").is_some());
        assert!(json.get("interactiveElements").is_some());
        assert!(json.get("capture_errors").is_none());
    }

    #[test]
    fn test_dom_tree_script_embeds_bounds() {
        let script = dom_tree_script();
        assert!(script.contains("MAX_DEPTH = 10"));
        assert!(script.contains("MAX_CHILDREN = 50"));
    }

    #[test]
    fn test_dom_node_nested_deserialize() {
        let json = r#"{
            "tagName": "BODY", "id": "", "className": "", "text": "hi",
            "isVisible": true, "isExpandable": false,
            "position": { "x": 0, "y": 0, "width": 800, "height": 600 },
            "children": [
                { "tagName": "MAIN", "children": [] }
            ]
        }"#;
        let node: DomNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].tag_name, "MAIN");
    }
}
