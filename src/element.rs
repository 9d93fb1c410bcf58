//! Element descriptors, identity signatures, and content capture.
//!
//! Descriptors are captured once, page-side, and are immutable afterwards.
//! A [`Signature`] is the deterministic identity key used to deduplicate
//! discoveries and index expansion results.

use crate::error::SessionError;
use crate::session::BrowserSession;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// Pixel bounding box, rounded page-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A lightweight description of one page element, as discovered in-page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementDescriptor {
    pub tag_name: String,
    /// May be empty.
    pub id: String,
    pub class_name: String,
    /// Visible-text excerpt, trimmed, at most 100 chars.
    pub text: String,
    /// Whitelisted attributes only: data-*, aria-*, id, class, role.
    pub attributes: BTreeMap<String, String>,
    pub position: BoundingBox,
    pub is_currently_expanded: bool,
}

impl ElementDescriptor {
    /// Deterministic identity key for this descriptor.
    ///
    /// `id:<id>` when an identifier exists; otherwise a composite of tag,
    /// normalized class list, and a short hash of the text excerpt. Stable
    /// across repeated computation on the same logical element.
    pub fn signature(&self) -> Signature {
        if !self.id.is_empty() {
            return Signature(format!("id:{}", self.id));
        }
        let classes = self
            .class_name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(".");
        let prefix: String = self.text.chars().take(50).collect();
        let mut hasher = FnvHasher::default();
        hasher.write(prefix.as_bytes());
        let hash = hasher.finish() as u32;
        Signature(format!(
            "{}.{}#{:08x}",
            self.tag_name.to_lowercase(),
            classes,
            hash
        ))
    }
}

/// Deduplication and result-index key for an [`ElementDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time capture of an element's content.
///
/// Equality across a before/after pair is the authoritative
/// "content changed" signal, independent of strategy outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementContent {
    /// Trimmed visible text, at most 400 chars.
    pub text_excerpt: String,
    /// FNV-64 hash of the inner markup (the markup itself is not retained).
    pub markup_hash: u64,
    pub markup_len: usize,
    pub child_count: u32,
    pub scroll_height: i64,
    pub client_height: i64,
}

/// JS function expression that re-locates an element from its descriptor:
/// by id when present, otherwise by tag + class candidates filtered on the
/// text excerpt prefix.
pub(crate) const LOCATOR_SNIPPET: &str = r#"
const __locate = (info) => {
    if (info.id) {
        const byId = document.getElementById(info.id);
        if (byId) return byId;
    }
    const classes = (info.className || '').trim().split(/\s+/).filter(c => c.length);
    const selector = info.tagName.toLowerCase() + classes.map(c => '.' + CSS.escape(c)).join('');
    const prefix = (info.text || '').substring(0, 50);
    for (const candidate of document.querySelectorAll(selector)) {
        if (!prefix || (candidate.textContent || '').trim().includes(prefix)) {
            return candidate;
        }
    }
    return null;
};
"#;

/// Capture the current content of the element behind `descriptor`.
pub async fn capture_content(
    session: &dyn BrowserSession,
    descriptor: &ElementDescriptor,
) -> Result<ElementContent, SessionError> {
    let info = serde_json::to_string(descriptor)
        .map_err(|e| SessionError::Evaluation(e.to_string()))?;
    let script = format!(
        r#"(() => {{
            {LOCATOR_SNIPPET}
            const el = __locate({info});
            if (!el) return {{ found: false }};
            return {{
                found: true,
                innerHTML: el.innerHTML,
                textContent: (el.textContent || '').trim().substring(0, 400),
                childElementCount: el.childElementCount,
                scrollHeight: el.scrollHeight,
                clientHeight: el.clientHeight
            }};
        }})()"#
    );
    let value = session.evaluate(&script).await?;

    let found = value
        .get("found")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !found {
        return Err(SessionError::ElementNotFound(
            descriptor.signature().to_string(),
        ));
    }

    let markup = value
        .get("innerHTML")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let mut hasher = FnvHasher::default();
    hasher.write(markup.as_bytes());

    Ok(ElementContent {
        text_excerpt: value
            .get("textContent")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        markup_hash: hasher.finish(),
        markup_len: markup.len(),
        child_count: value
            .get("childElementCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        scroll_height: value
            .get("scrollHeight")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        client_height: value
            .get("clientHeight")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, tag: &str, class: &str, text: &str) -> ElementDescriptor {
        ElementDescriptor {
            tag_name: tag.to_string(),
            id: id.to_string(),
            class_name: class.to_string(),
            text: text.to_string(),
            ..ElementDescriptor::default()
        }
    }

    #[test]
    fn test_signature_uses_id_alone() {
        let a = descriptor("faq-3", "BUTTON", "accordion toggle", "What is shipping?");
        let b = descriptor("faq-3", "DIV", "totally different", "other text entirely");
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().0, "id:faq-3");
    }

    #[test]
    fn test_signature_stable_across_invocations() {
        let d = descriptor("", "BUTTON", "accordion  toggle", "Expand section one");
        let first = d.signature();
        for _ in 0..10 {
            assert_eq!(d.signature(), first);
        }
    }

    #[test]
    fn test_signature_composite_normalizes_classes() {
        let a = descriptor("", "BUTTON", "accordion toggle", "Expand");
        let b = descriptor("", "BUTTON", "accordion   toggle", "Expand");
        assert_eq!(a.signature(), b.signature());
        assert!(a.signature().0.starts_with("button.accordion.toggle#"));
    }

    #[test]
    fn test_signature_distinguishes_text() {
        let a = descriptor("", "BUTTON", "toggle", "Section one");
        let b = descriptor("", "BUTTON", "toggle", "Section two");
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_descriptor_deserializes_from_page_shape() {
        let json = r#"{
            "tagName": "DETAILS",
            "id": "",
            "className": "faq-item",
            "text": "More info",
            "attributes": { "class": "faq-item", "role": "group" },
            "position": { "x": 10, "y": 200, "width": 600, "height": 40 },
            "isCurrentlyExpanded": false
        }"#;
        let d: ElementDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.tag_name, "DETAILS");
        assert!(!d.is_currently_expanded);
        assert_eq!(d.position.width, 600);
        assert_eq!(d.attributes.get("role").map(String::as_str), Some("group"));
    }

    #[test]
    fn test_content_equality_is_change_signal() {
        let before = ElementContent {
            text_excerpt: "collapsed".to_string(),
            markup_hash: 1,
            markup_len: 9,
            child_count: 0,
            scroll_height: 20,
            client_height: 20,
        };
        let mut after = before.clone();
        assert_eq!(before, after);
        after.child_count = 3;
        assert_ne!(before, after);
    }
}
