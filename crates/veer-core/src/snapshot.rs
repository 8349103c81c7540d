//! Structural snapshots of the automation target

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::SessionId;

/// Attributes that identify an element independently of its index
const IDENTIFYING_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "aria-label",
    "placeholder",
    "type",
    "href",
    "title",
    "data-testid",
];

/// Attributes that give an element a human-readable label
const LABEL_ATTRIBUTES: &[&str] = &["aria-label", "placeholder", "title", "name", "alt", "value"];

const MODAL_ROLES: &[&str] = &["dialog", "alertdialog", "alert"];

const SUGGESTION_ROLES: &[&str] = &["listbox", "option", "menu", "menuitem", "tooltip", "grid", "tree"];

/// Element bounding box in page pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Distance between the two centres
    pub fn distance_to(&self, other: &Rect) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// One addressable element of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    /// Index valid only within the snapshot that produced it
    pub index: usize,
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub xpath: String,
    #[serde(default = "default_true")]
    pub is_interactive: bool,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub bounds: Option<Rect>,
}

fn default_true() -> bool {
    true
}

impl ElementNode {
    pub fn new(index: usize, tag: impl Into<String>) -> Self {
        Self {
            index,
            tag: tag.into(),
            role: None,
            attributes: BTreeMap::new(),
            text: String::new(),
            xpath: String::new(),
            is_interactive: true,
            is_visible: true,
            bounds: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = xpath.into();
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn non_interactive(mut self) -> Self {
        self.is_interactive = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_visible = false;
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref().or_else(|| self.attr("role"))
    }

    /// Best human-readable label, if the element carries one
    pub fn label(&self) -> Option<&str> {
        LABEL_ATTRIBUTES
            .iter()
            .filter_map(|name| self.attr(name))
            .find(|v| !v.trim().is_empty())
            .or_else(|| {
                let text = self.text.trim();
                (!text.is_empty()).then_some(text)
            })
    }

    pub fn is_labeled(&self) -> bool {
        self.label().is_some()
    }

    /// Index-independent identity used to re-resolve the element in a later snapshot.
    ///
    /// Excludes the xpath, which shifts when siblings are inserted; callers
    /// use the xpath only to break ties between equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![self.tag.to_lowercase()];
        if let Some(role) = self.role() {
            parts.push(format!("role={}", role));
        }
        for name in IDENTIFYING_ATTRIBUTES {
            if let Some(value) = self.attr(name) {
                parts.push(format!("{}={}", name, value));
            }
        }
        let text: String = self.text.trim().chars().take(40).collect();
        if !text.is_empty() {
            parts.push(format!("text={}", text));
        }
        parts.join("|")
    }

    /// Dialog-like element that obscures the rest of the page
    pub fn is_modal_like(&self) -> bool {
        if !self.is_visible {
            return false;
        }
        let role_modal = self
            .role()
            .map(|r| MODAL_ROLES.contains(&r.to_lowercase().as_str()))
            .unwrap_or(false);
        role_modal || self.tag.eq_ignore_ascii_case("dialog") || self.attr("aria-modal") == Some("true")
    }

    /// Transient suggestion/overlay element (listbox, option, menu)
    pub fn is_suggestion_like(&self) -> bool {
        if !self.is_visible {
            return false;
        }
        let role_match = self
            .role()
            .map(|r| SUGGESTION_ROLES.contains(&r.to_lowercase().as_str()))
            .unwrap_or(false);
        role_match || self.tag.eq_ignore_ascii_case("datalist")
    }

    /// Composite input that owns a popup (combobox, autocomplete)
    pub fn is_combobox(&self) -> bool {
        self.role().map(|r| r.eq_ignore_ascii_case("combobox")).unwrap_or(false)
            || self.attr("aria-autocomplete").is_some_and(|v| v != "none")
            || self.attr("aria-haspopup").is_some_and(|v| v != "false")
            || self.attr("list").is_some()
            || (self.attr("aria-expanded").is_some() && self.tag.eq_ignore_ascii_case("input"))
    }

    /// Ids this element claims to control or own
    pub fn controlled_ids(&self) -> Vec<&str> {
        ["aria-controls", "aria-owns", "list"]
            .iter()
            .filter_map(|name| self.attr(name))
            .flat_map(|v| v.split_whitespace())
            .collect()
    }
}

/// Scroll position around the viewport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollInfo {
    pub pixels_above: u32,
    pub pixels_below: u32,
}

/// Timestamped, session-scoped structural view of the live document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub session_id: SessionId,
    /// Cache generation current when the snapshot was built
    #[serde(default)]
    pub generation: u64,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub elements: Vec<ElementNode>,
    #[serde(default)]
    pub scroll: ScrollInfo,
}

impl EnvironmentSnapshot {
    pub fn new(session_id: SessionId, url: impl Into<String>, elements: Vec<ElementNode>) -> Self {
        Self {
            session_id,
            generation: 0,
            captured_at: Utc::now(),
            url: url.into(),
            title: String::new(),
            elements,
            scroll: ScrollInfo::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn element(&self, index: usize) -> Option<&ElementNode> {
        self.elements.iter().find(|e| e.index == index)
    }

    /// Visible interactive elements (the addressable set)
    pub fn addressable(&self) -> impl Iterator<Item = &ElementNode> {
        self.elements.iter().filter(|e| e.is_interactive && e.is_visible)
    }

    pub fn addressable_count(&self) -> usize {
        self.addressable().count()
    }

    /// Elements whose fingerprint matches
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Vec<&ElementNode> {
        self.elements
            .iter()
            .filter(|e| e.fingerprint() == fingerprint)
            .collect()
    }

    /// Locate the element a stale reference pointed at.
    ///
    /// Returns `None` when the element is gone or cannot be told apart from
    /// another element with the same fingerprint.
    pub fn resolve(&self, original: &ElementNode) -> Option<&ElementNode> {
        let fingerprint = original.fingerprint();
        let candidates = self.find_by_fingerprint(&fingerprint);
        match candidates.len() {
            0 => None,
            1 => candidates.into_iter().next(),
            _ => {
                let mut same_path = candidates
                    .into_iter()
                    .filter(|e| !original.xpath.is_empty() && e.xpath == original.xpath);
                match (same_path.next(), same_path.next()) {
                    (Some(found), None) => Some(found),
                    _ => None,
                }
            }
        }
    }

    pub fn find_by_id(&self, id: &str) -> Option<&ElementNode> {
        self.elements.iter().find(|e| e.attr("id") == Some(id))
    }

    pub fn has_modal(&self) -> bool {
        self.elements.iter().any(ElementNode::is_modal_like)
    }

    /// Host and first path segment, used for history keys
    pub fn url_scope(&self) -> String {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let without_query = without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or(without_scheme);
        let mut segments = without_query.split('/').filter(|s| !s.is_empty());
        let host = segments.next().unwrap_or("");
        match segments.next() {
            Some(first) => format!("{}/{}", host, first),
            None => host.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combobox() -> ElementNode {
        ElementNode::new(5, "input")
            .with_role("combobox")
            .with_attr("aria-controls", "to-suggestions")
            .with_attr("placeholder", "To")
            .with_xpath("/html/body/form/div[1]/input")
    }

    #[test]
    fn test_fingerprint_ignores_index() {
        let a = combobox();
        let mut b = combobox();
        b.index = 42;
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().contains("placeholder=To"));
    }

    #[test]
    fn test_label_prefers_attributes_then_text() {
        assert_eq!(combobox().label(), Some("To"));
        let button = ElementNode::new(1, "button").with_text("  Send ");
        assert_eq!(button.label(), Some("Send"));
        assert_eq!(ElementNode::new(2, "div").label(), None);
    }

    #[test]
    fn test_modal_and_suggestion_classification() {
        let dialog = ElementNode::new(9, "div").with_attr("role", "dialog");
        assert!(dialog.is_modal_like());
        assert!(!dialog.clone().hidden().is_modal_like());

        let modal_attr = ElementNode::new(10, "section").with_attr("aria-modal", "true");
        assert!(modal_attr.is_modal_like());

        let listbox = ElementNode::new(11, "ul").with_role("listbox");
        assert!(listbox.is_suggestion_like());
        assert!(!listbox.is_modal_like());
    }

    #[test]
    fn test_combobox_detection() {
        assert!(combobox().is_combobox());
        let plain = ElementNode::new(3, "input").with_attr("type", "text");
        assert!(!plain.is_combobox());
        let autocomplete = ElementNode::new(4, "input").with_attr("aria-autocomplete", "list");
        assert!(autocomplete.is_combobox());
        assert_eq!(combobox().controlled_ids(), vec!["to-suggestions"]);
    }

    #[test]
    fn test_resolve_follows_shifted_index() {
        let before = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://example.com",
            vec![
                ElementNode::new(0, "input").with_attr("name", "to"),
                ElementNode::new(1, "input").with_attr("name", "subject"),
            ],
        );
        let after = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://example.com",
            vec![
                ElementNode::new(0, "input").with_attr("name", "to"),
                ElementNode::new(1, "li").with_role("option").with_text("bob@example.com"),
                ElementNode::new(2, "input").with_attr("name", "subject"),
            ],
        );
        let subject = before.element(1).unwrap();
        assert_eq!(after.resolve(subject).map(|e| e.index), Some(2));
    }

    #[test]
    fn test_resolve_rejects_ambiguous_match() {
        let original = ElementNode::new(0, "button").with_text("Next");
        let after = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://example.com",
            vec![
                ElementNode::new(3, "button").with_text("Next").with_xpath("/a"),
                ElementNode::new(4, "button").with_text("Next").with_xpath("/b"),
            ],
        );
        assert!(after.resolve(&original).is_none());

        let with_path = original.with_xpath("/b");
        assert_eq!(after.resolve(&with_path).map(|e| e.index), Some(4));
    }

    #[test]
    fn test_url_scope() {
        let snap = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://mail.example.com/compose/new?draft=1",
            vec![],
        );
        assert_eq!(snap.url_scope(), "mail.example.com/compose");

        let bare = EnvironmentSnapshot::new(SessionId::from("s"), "https://example.com", vec![]);
        assert_eq!(bare.url_scope(), "example.com");
    }

    #[test]
    fn test_addressable_excludes_hidden_and_static() {
        let snap = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://example.com",
            vec![
                ElementNode::new(0, "button"),
                ElementNode::new(1, "p").non_interactive(),
                ElementNode::new(2, "a").hidden(),
            ],
        );
        assert_eq!(snap.addressable_count(), 1);
        assert!(snap.element(2).is_some());
        assert!(snap.element(3).is_none());
    }
}
