//! Environment signatures
//!
//! A signature identifies "the same kind of page" across visits: the URL
//! scope plus the set of dynamic controls on it. Indices, text and element
//! counts are left out so ordinary content churn does not change it.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use veer_core::{ElementNode, EnvironmentSnapshot};

/// Hex digits kept from the digest
const SIGNATURE_LEN: usize = 16;

pub fn environment_signature(snapshot: &EnvironmentSnapshot) -> String {
    let mut hasher = Sha256::new();
    hash_str(&mut hasher, &snapshot.url_scope());

    let controls: BTreeSet<String> = snapshot
        .elements
        .iter()
        .filter(|e| is_dynamic_control(e))
        .map(control_key)
        .collect();
    for control in &controls {
        hash_str(&mut hasher, control);
    }

    let digest = hex::encode(hasher.finalize());
    digest[..SIGNATURE_LEN].to_string()
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update(s.as_bytes());
    hasher.update([0]);
}

fn is_dynamic_control(element: &ElementNode) -> bool {
    element.is_combobox()
        || element.attr("aria-expanded").is_some()
        || element.attr("aria-haspopup").is_some()
        || element.attr("aria-live").is_some()
}

fn control_key(element: &ElementNode) -> String {
    let name = element
        .attr("name")
        .or_else(|| element.attr("id"))
        .or_else(|| element.attr("aria-label"))
        .unwrap_or("");
    format!("{}:{}:{}", element.tag, element.role().unwrap_or(""), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::SessionId;

    fn page(url: &str, extra: Vec<ElementNode>) -> EnvironmentSnapshot {
        let mut elements = vec![
            ElementNode::new(0, "input")
                .with_role("combobox")
                .with_attr("name", "to"),
            ElementNode::new(1, "button").with_text("Send"),
        ];
        elements.extend(extra);
        EnvironmentSnapshot::new(SessionId::from("s"), url, elements)
    }

    #[test]
    fn test_signature_ignores_content_churn() {
        let a = page("https://mail.example/compose?draft=1", vec![]);
        let b = page(
            "https://mail.example/compose?draft=2",
            vec![ElementNode::new(2, "p").with_text("Saved").non_interactive()],
        );
        assert_eq!(environment_signature(&a), environment_signature(&b));
        assert_eq!(environment_signature(&a).len(), SIGNATURE_LEN);
    }

    #[test]
    fn test_signature_tracks_scope_and_controls() {
        let compose = page("https://mail.example/compose", vec![]);
        let inbox = page("https://mail.example/inbox", vec![]);
        assert_ne!(environment_signature(&compose), environment_signature(&inbox));

        let with_menu = page(
            "https://mail.example/compose",
            vec![ElementNode::new(2, "button").with_attr("aria-haspopup", "menu")],
        );
        assert_ne!(environment_signature(&compose), environment_signature(&with_menu));
    }
}
