//! Snapshot delta classification
//!
//! Interactive changes are only attributed to the last action when they
//! appear in the neighborhood of its target. Listboxes anywhere on the page
//! are common (site search, nav menus) and counting them caused sequence
//! thrashing. Blocking changes are page-wide: a dialog obscures everything.

use std::collections::{HashMap, VecDeque};
use veer_core::config::DetectorSettings;
use veer_core::{Action, ChangeAnalysis, ChangeKind, ElementNode, EnvironmentSnapshot};

/// Labels that mark a control inside a blocker as a way out
const DISMISS_HINTS: &[&str] = &["close", "dismiss", "cancel", "no thanks", "not now", "×"];

/// Minimum shared xpath segments for two elements to count as neighbors
/// (`/html/body` alone never makes a neighborhood)
const MIN_SHARED_SEGMENTS: usize = 3;

/// Element-level comparison of two snapshots
#[derive(Debug, Default)]
pub struct SnapshotDiff<'a> {
    /// New elements, plus existing ones that became visible
    pub appeared: Vec<&'a ElementNode>,
    pub removed: usize,
    /// Some surviving element changed index
    pub indices_shifted: bool,
}

impl<'a> SnapshotDiff<'a> {
    pub fn compute(before: &EnvironmentSnapshot, after: &'a EnvironmentSnapshot) -> Self {
        let mut remaining: HashMap<String, VecDeque<&ElementNode>> = HashMap::new();
        for element in &before.elements {
            remaining
                .entry(element.fingerprint())
                .or_default()
                .push_back(element);
        }

        let mut diff = SnapshotDiff::default();
        for element in &after.elements {
            let matched = remaining
                .get_mut(&element.fingerprint())
                .and_then(VecDeque::pop_front);
            match matched {
                Some(previous) => {
                    if previous.index != element.index {
                        diff.indices_shifted = true;
                    }
                    if !previous.is_visible && element.is_visible {
                        diff.appeared.push(element);
                    }
                }
                None => diff.appeared.push(element),
            }
        }
        diff.removed = remaining.values().map(VecDeque::len).sum();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.removed == 0 && !self.indices_shifted
    }
}

/// Classifies what changed between a pre-action and post-action snapshot
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    neighborhood_depth: usize,
    proximity_px: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(&DetectorSettings::default())
    }
}

impl ChangeDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        Self {
            neighborhood_depth: settings.neighborhood_depth,
            proximity_px: settings.proximity_px,
        }
    }

    /// Classify the delta between `before` and `after`.
    ///
    /// Pure: reads both snapshots and the action, touches nothing else.
    pub fn analyze(
        &self,
        before: &EnvironmentSnapshot,
        after: &EnvironmentSnapshot,
        last_action: Option<&Action>,
    ) -> ChangeAnalysis {
        let diff = SnapshotDiff::compute(before, after);
        let anchor_index = last_action.and_then(Action::target_index);
        let anchor = anchor_index.and_then(|i| before.element(i));

        if let Some(modal) = diff.appeared.iter().copied().find(|e| e.is_modal_like()) {
            let label = describe(modal);
            return ChangeAnalysis::new(ChangeKind::Blocking, format!("{} appeared over the page", label))
                .with_new_elements(owned(&diff.appeared))
                .with_recommended(dismissal_actions(after, modal, &diff.appeared))
                .with_indices_shifted(diff.indices_shifted)
                .with_anchor(anchor_index);
        }

        if let Some(anchor) = anchor {
            let nearby: Vec<&ElementNode> = diff
                .appeared
                .iter()
                .copied()
                .filter(|e| self.is_nearby(anchor, e, after))
                .collect();
            let overlays: Vec<&ElementNode> =
                nearby.iter().copied().filter(|e| e.is_suggestion_like()).collect();
            let popup_items = anchor.is_combobox()
                && nearby.iter().any(|e| e.is_interactive && e.is_visible && e.is_labeled());

            if !overlays.is_empty() || popup_items {
                let what = if overlays.is_empty() { "popup" } else { "suggestion list" };
                let recommended = last_action
                    .map(|action| suggestion_pick(action, &nearby))
                    .unwrap_or_default();
                return ChangeAnalysis::new(
                    ChangeKind::Interactive,
                    format!(
                        "{} appeared under element {} ({} new nearby elements)",
                        what,
                        anchor.index,
                        nearby.len()
                    ),
                )
                .with_new_elements(nearby.into_iter().cloned().collect())
                .with_recommended(recommended)
                .with_indices_shifted(diff.indices_shifted)
                .with_anchor(Some(anchor.index));
            }
        }

        let new_labeled = diff
            .appeared
            .iter()
            .filter(|e| e.is_interactive && e.is_visible && e.is_labeled())
            .count();
        let same_count = before.addressable_count() == after.addressable_count();

        if same_count && new_labeled == 0 && before.url == after.url {
            return ChangeAnalysis::none()
                .with_indices_shifted(diff.indices_shifted)
                .with_anchor(anchor_index);
        }

        let description = if before.url != after.url {
            format!("page changed to {}", after.url)
        } else {
            format!(
                "{} elements appeared, {} removed ({} labeled interactive)",
                diff.appeared.len(),
                diff.removed,
                new_labeled
            )
        };
        ChangeAnalysis::new(ChangeKind::Minor, description)
            .with_new_elements(owned(&diff.appeared))
            .with_indices_shifted(diff.indices_shifted)
            .with_anchor(anchor_index)
    }

    /// Whether `candidate` sits close enough to `anchor` to be caused by it
    fn is_nearby(&self, anchor: &ElementNode, candidate: &ElementNode, after: &EnvironmentSnapshot) -> bool {
        for id in anchor.controlled_ids() {
            if candidate.attr("id") == Some(id) {
                return true;
            }
            if let Some(container) = after.find_by_id(id) {
                if !container.xpath.is_empty() && is_descendant(&candidate.xpath, &container.xpath) {
                    return true;
                }
            }
        }

        if !anchor.xpath.is_empty() && !candidate.xpath.is_empty() {
            let anchor_depth = segments(&anchor.xpath).count();
            let shared = shared_segments(&anchor.xpath, &candidate.xpath);
            let required = anchor_depth
                .saturating_sub(self.neighborhood_depth)
                .max(MIN_SHARED_SEGMENTS);
            if shared >= required {
                return true;
            }
        }

        match (&anchor.bounds, &candidate.bounds) {
            (Some(a), Some(b)) => a.distance_to(b) <= self.proximity_px,
            _ => false,
        }
    }
}

fn segments(xpath: &str) -> impl Iterator<Item = &str> {
    xpath.split('/').filter(|s| !s.is_empty())
}

fn shared_segments(a: &str, b: &str) -> usize {
    segments(a)
        .zip(segments(b))
        .take_while(|(x, y)| x == y)
        .count()
}

fn is_descendant(xpath: &str, ancestor: &str) -> bool {
    xpath.len() > ancestor.len()
        && xpath.starts_with(ancestor)
        && xpath[ancestor.len()..].starts_with('/')
}

fn owned(elements: &[&ElementNode]) -> Vec<ElementNode> {
    elements.iter().map(|e| (*e).clone()).collect()
}

fn describe(element: &ElementNode) -> String {
    let role = element.role().unwrap_or(element.tag.as_str());
    match element.label() {
        Some(label) => format!("{} '{}'", role, label),
        None => role.to_string(),
    }
}

fn is_dismiss_label(label: &str) -> bool {
    let lower = label.trim().to_lowercase();
    lower == "x" || DISMISS_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Controls inside the blocker that look like a way out, then Escape
fn dismissal_actions(after: &EnvironmentSnapshot, modal: &ElementNode, appeared: &[&ElementNode]) -> Vec<Action> {
    let inside: Vec<&ElementNode> = if modal.xpath.is_empty() {
        appeared.to_vec()
    } else {
        after
            .elements
            .iter()
            .filter(|e| is_descendant(&e.xpath, &modal.xpath))
            .collect()
    };

    let mut actions: Vec<Action> = inside
        .into_iter()
        .filter(|e| e.is_interactive && e.is_visible)
        .filter(|e| e.label().map(is_dismiss_label).unwrap_or(false))
        .map(|e| Action::Click { index: e.index })
        .collect();
    actions.push(Action::SendKeys {
        keys: "Escape".to_string(),
    });
    actions
}

/// For typed input, the suggestion whose label contains the typed text
fn suggestion_pick(action: &Action, nearby: &[&ElementNode]) -> Vec<Action> {
    let typed = match action {
        Action::InputText { text, .. } => text.trim().to_lowercase(),
        _ => return Vec::new(),
    };
    if typed.is_empty() {
        return Vec::new();
    }
    nearby
        .iter()
        .filter(|e| e.is_interactive && e.is_visible)
        .find(|e| {
            e.label()
                .map(|l| l.to_lowercase().contains(&typed))
                .unwrap_or(false)
        })
        .map(|e| vec![Action::Click { index: e.index }])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::{Rect, SessionId};

    fn snap(elements: Vec<ElementNode>) -> EnvironmentSnapshot {
        EnvironmentSnapshot::new(SessionId::from("s1"), "https://mail.example.com/compose", elements)
    }

    fn compose_form() -> Vec<ElementNode> {
        vec![
            ElementNode::new(0, "button")
                .with_text("Send")
                .with_xpath("/html/body/form/div[3]/button"),
            ElementNode::new(1, "input")
                .with_role("combobox")
                .with_attr("name", "to")
                .with_attr("aria-controls", "to-list")
                .with_xpath("/html/body/form/div[1]/input"),
            ElementNode::new(2, "input")
                .with_attr("name", "subject")
                .with_xpath("/html/body/form/div[2]/input"),
        ]
    }

    fn input_to() -> Action {
        Action::InputText {
            index: 1,
            text: "bob".to_string(),
        }
    }

    #[test]
    fn test_identical_snapshots_are_none() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());
        let after = snap(compose_form());
        let analysis = detector.analyze(&before, &after, Some(&input_to()));
        assert_eq!(analysis.kind, ChangeKind::None);
        assert!(!analysis.indices_shifted);
    }

    #[test]
    fn test_attribute_only_change_is_none() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());
        let mut changed = compose_form();
        changed[2] = changed[2].clone().with_attr("class", "focused");
        let after = snap(changed);
        assert_eq!(detector.analyze(&before, &after, Some(&input_to())).kind, ChangeKind::None);
    }

    #[test]
    fn test_suggestion_list_near_target_is_interactive() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());

        let mut elements = compose_form();
        elements.insert(
            2,
            ElementNode::new(2, "ul")
                .with_role("listbox")
                .with_attr("id", "to-list")
                .with_xpath("/html/body/form/div[1]/ul")
                .non_interactive(),
        );
        elements.insert(
            3,
            ElementNode::new(3, "li")
                .with_role("option")
                .with_text("Bob Smith <bob@example.com>")
                .with_xpath("/html/body/form/div[1]/ul/li[1]"),
        );
        elements[4].index = 4;
        let after = snap(elements);

        let analysis = detector.analyze(&before, &after, Some(&input_to()));
        assert_eq!(analysis.kind, ChangeKind::Interactive);
        assert_eq!(analysis.anchor_index, Some(1));
        assert!(analysis.indices_shifted);
        assert_eq!(analysis.recommended_actions, vec![Action::Click { index: 3 }]);
        assert!(analysis.description.contains("suggestion list"));
    }

    #[test]
    fn test_listbox_elsewhere_is_not_interactive() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());

        let mut elements = compose_form();
        elements.push(
            ElementNode::new(3, "ul")
                .with_role("listbox")
                .with_attr("aria-label", "Site search results")
                .with_xpath("/html/body/aside/ul"),
        );
        let after = snap(elements);

        let analysis = detector.analyze(&before, &after, Some(&input_to()));
        assert_eq!(analysis.kind, ChangeKind::Minor);
    }

    #[test]
    fn test_proximity_by_bounds() {
        let detector = ChangeDetector::default();
        let anchor = ElementNode::new(0, "input")
            .with_role("combobox")
            .with_bounds(Rect::new(100.0, 100.0, 200.0, 30.0));
        let before = snap(vec![anchor.clone()]);
        let after = snap(vec![
            anchor,
            ElementNode::new(1, "div")
                .with_role("listbox")
                .with_bounds(Rect::new(100.0, 130.0, 200.0, 120.0)),
        ]);
        let action = Action::Click { index: 0 };
        assert_eq!(
            detector.analyze(&before, &after, Some(&action)).kind,
            ChangeKind::Interactive
        );
    }

    #[test]
    fn test_modal_anywhere_is_blocking() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());

        let mut elements = compose_form();
        elements.push(
            ElementNode::new(3, "div")
                .with_role("dialog")
                .with_attr("aria-label", "Upgrade your plan")
                .with_xpath("/html/body/div[9]")
                .non_interactive(),
        );
        elements.push(
            ElementNode::new(4, "button")
                .with_text("Upgrade")
                .with_xpath("/html/body/div[9]/button[1]"),
        );
        elements.push(
            ElementNode::new(5, "button")
                .with_attr("aria-label", "Close")
                .with_xpath("/html/body/div[9]/button[2]"),
        );
        let after = snap(elements);

        let analysis = detector.analyze(&before, &after, Some(&Action::Click { index: 0 }));
        assert_eq!(analysis.kind, ChangeKind::Blocking);
        assert_eq!(
            analysis.recommended_actions,
            vec![
                Action::Click { index: 5 },
                Action::SendKeys {
                    keys: "Escape".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_existing_modal_is_not_new() {
        let detector = ChangeDetector::default();
        let mut elements = compose_form();
        elements.push(
            ElementNode::new(3, "div")
                .with_role("dialog")
                .with_xpath("/html/body/div[9]"),
        );
        let before = snap(elements.clone());
        let after = snap(elements);
        assert_eq!(detector.analyze(&before, &after, None).kind, ChangeKind::None);
    }

    #[test]
    fn test_hidden_dialog_becoming_visible_is_blocking() {
        let detector = ChangeDetector::default();
        let dialog = ElementNode::new(3, "dialog").with_xpath("/html/body/dialog");
        let mut hidden = compose_form();
        hidden.push(dialog.clone().hidden());
        let mut shown = compose_form();
        shown.push(dialog);

        let analysis = detector.analyze(&snap(hidden), &snap(shown), None);
        assert_eq!(analysis.kind, ChangeKind::Blocking);
    }

    #[test]
    fn test_new_labeled_button_is_minor() {
        let detector = ChangeDetector::default();
        let before = snap(compose_form());
        let mut elements = compose_form();
        elements.push(
            ElementNode::new(3, "button")
                .with_text("Undo")
                .with_xpath("/html/body/div[2]/button"),
        );
        let after = snap(elements);
        let analysis = detector.analyze(&before, &after, Some(&Action::Click { index: 0 }));
        assert_eq!(analysis.kind, ChangeKind::Minor);
        assert_eq!(analysis.new_elements.len(), 1);
    }

    #[test]
    fn test_shared_segments() {
        assert_eq!(shared_segments("/html/body/form/div[1]/input", "/html/body/form/div[1]/ul"), 4);
        assert_eq!(shared_segments("/html/body/form", "/html/body/aside"), 2);
        assert!(is_descendant("/html/body/div[9]/button", "/html/body/div[9]"));
        assert!(!is_descendant("/html/body/div[90]", "/html/body/div[9]"));
    }
}
