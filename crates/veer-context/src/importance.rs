//! Element importance scoring

use veer_core::{ElementNode, EnvironmentSnapshot};

use crate::model::{CompressedEnvironment, KeyElement};

const HANDLER_TAGS: &[&str] = &["a", "button", "input", "select", "textarea", "option", "summary"];
const HANDLER_ROLES: &[&str] = &[
    "button", "link", "textbox", "combobox", "checkbox", "radio", "option", "menuitem", "tab", "switch",
];
const LABEL_ATTRIBUTES: &[&str] = &["aria-label", "placeholder", "title", "name", "alt"];

/// Score how useful an element is to an agent deciding the next action.
///
/// Interactivity dominates; labels, visible text and explicit handlers add
/// to it. Invisible elements score zero.
pub fn score(element: &ElementNode) -> f64 {
    if !element.is_visible {
        return 0.0;
    }

    let mut score = 0.0;
    if element.is_interactive {
        score += 3.0;
    }

    let labels = LABEL_ATTRIBUTES
        .iter()
        .filter(|name| element.attr(name).is_some_and(|v| !v.trim().is_empty()))
        .count();
    score += (labels as f64).min(2.0);

    let text_len = element.text.trim().chars().count().min(50);
    score += text_len as f64 / 25.0;

    let tag = element.tag.to_lowercase();
    let has_handler = element.attr("onclick").is_some()
        || HANDLER_TAGS.contains(&tag.as_str())
        || element
            .role()
            .map(|r| HANDLER_ROLES.contains(&r.to_lowercase().as_str()))
            .unwrap_or(false);
    if has_handler {
        score += 1.5;
    }

    score
}

/// Keep the `max` highest-scoring elements, presented in document order
pub fn compress_environment(snapshot: &EnvironmentSnapshot, max: usize) -> CompressedEnvironment {
    let mut scored: Vec<(f64, &ElementNode)> = snapshot
        .elements
        .iter()
        .map(|e| (score(e), e))
        .filter(|(s, _)| *s > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.index.cmp(&b.1.index))
    });
    scored.truncate(max);
    scored.sort_by_key(|(_, e)| e.index);

    CompressedEnvironment {
        url: snapshot.url.clone(),
        title: snapshot.title.clone(),
        key_elements: scored
            .into_iter()
            .map(|(score, e)| KeyElement {
                index: e.index,
                tag: e.tag.clone(),
                role: e.role().map(str::to_string),
                label: e.label().map(|l| truncate(l, 80)),
                score,
            })
            .collect(),
        total_elements: snapshot.elements.len(),
        generation: snapshot.generation,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::SessionId;

    #[test]
    fn test_interactive_labeled_beats_plain_text() {
        let button = ElementNode::new(0, "button").with_attr("aria-label", "Send");
        let paragraph = ElementNode::new(1, "p")
            .with_text("A long paragraph of body copy that nobody clicks")
            .non_interactive();
        assert!(score(&button) > score(&paragraph));
        assert_eq!(score(&button.clone().hidden()), 0.0);
    }

    #[test]
    fn test_compress_environment_keeps_top_in_document_order() {
        let snapshot = EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://example.com",
            vec![
                ElementNode::new(0, "div").non_interactive(),
                ElementNode::new(1, "button").with_text("Send"),
                ElementNode::new(2, "span").with_text("x").non_interactive(),
                ElementNode::new(3, "input").with_attr("placeholder", "Subject"),
            ],
        );
        let compressed = compress_environment(&snapshot, 2);
        let indices: Vec<usize> = compressed.key_elements.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(compressed.total_elements, 4);
        assert_eq!(compressed.key_elements[1].label.as_deref(), Some("Subject"));
    }

    #[test]
    fn test_truncate_long_labels() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
