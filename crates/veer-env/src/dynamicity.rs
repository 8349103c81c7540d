//! Pluggable "is this page dynamic" classification

use veer_core::EnvironmentSnapshot;

/// How likely the environment is to mutate in response to input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicityScore {
    /// 0.0 (static) to 1.0 (highly dynamic)
    pub score: f64,
    /// Human-readable reasons behind the score
    pub indicators: Vec<String>,
}

impl DynamicityScore {
    pub fn static_page() -> Self {
        Self::default()
    }

    pub fn is_dynamic(&self) -> bool {
        self.score >= 0.5
    }
}

/// Strategy deciding whether a snapshot shows signs of a dynamic page
pub trait DynamicityClassifier: Send + Sync {
    fn classify(&self, snapshot: &EnvironmentSnapshot) -> DynamicityScore;
}

/// Attribute/role heuristics: comboboxes, live regions, expandable controls
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

impl DynamicityClassifier for HeuristicClassifier {
    fn classify(&self, snapshot: &EnvironmentSnapshot) -> DynamicityScore {
        let mut score: f64 = 0.0;
        let mut indicators = Vec::new();

        let comboboxes = snapshot.elements.iter().filter(|e| e.is_combobox()).count();
        if comboboxes > 0 {
            score += 0.5;
            indicators.push(format!("{} autocomplete inputs", comboboxes));
        }

        let live_regions = snapshot
            .elements
            .iter()
            .filter(|e| e.attr("aria-live").is_some_and(|v| v != "off"))
            .count();
        if live_regions > 0 {
            score += 0.2;
            indicators.push(format!("{} live regions", live_regions));
        }

        let expandable = snapshot
            .elements
            .iter()
            .filter(|e| e.attr("aria-expanded").is_some())
            .count();
        if expandable > 0 {
            score += 0.2;
            indicators.push(format!("{} expandable controls", expandable));
        }

        if snapshot.elements.iter().any(|e| e.is_suggestion_like()) {
            score += 0.1;
            indicators.push("overlay roles present".to_string());
        }

        DynamicityScore {
            score: score.min(1.0),
            indicators,
        }
    }
}

/// Always reports the same score; for tests and forced modes
#[derive(Debug, Clone)]
pub struct FixedClassifier(pub f64);

impl DynamicityClassifier for FixedClassifier {
    fn classify(&self, _snapshot: &EnvironmentSnapshot) -> DynamicityScore {
        DynamicityScore {
            score: self.0,
            indicators: vec!["fixed".to_string()],
        }
    }
}
