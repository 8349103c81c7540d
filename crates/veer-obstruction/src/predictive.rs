//! Advisory obstruction prediction
//!
//! Before a batch runs, each dynamic-triggering action is looked up in the
//! obstruction history by (action kind, environment signature). Counts are
//! Laplace-smoothed so an empty history predicts nothing confidently. When a
//! signature has never been seen, records for the same action kind on any
//! page are used at half weight.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use veer_core::{ActionKind, ActionPlan, ChangeKind, EnvironmentSnapshot, ObstructionRecord, SessionId};

use crate::history::ObstructionHistory;
use crate::signature::environment_signature;

/// Kinds a prediction can name
const PREDICTED_KINDS: [ChangeKind; 3] = [ChangeKind::Interactive, ChangeKind::Blocking, ChangeKind::Minor];

/// Weight of kind-only evidence relative to exact-signature evidence
const FALLBACK_WEIGHT: f64 = 0.5;

/// Likelihood-ranked expected obstructions for a plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObstructionForecast {
    /// Highest likelihood first
    pub ranked: Vec<(ChangeKind, f64)>,
    pub signature: String,
}

impl ObstructionForecast {
    pub fn likelihood(&self, kind: ChangeKind) -> f64 {
        self.ranked
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    /// Whether a disruptive obstruction is at least `threshold` likely
    pub fn expects_disruption(&self, threshold: f64) -> bool {
        self.ranked
            .iter()
            .any(|(kind, p)| kind.is_disruptive() && *p >= threshold)
    }
}

pub struct PredictiveObstructionDetector {
    history: Arc<ObstructionHistory>,
}

impl PredictiveObstructionDetector {
    pub fn new(history: Arc<ObstructionHistory>) -> Self {
        Self { history }
    }

    pub async fn predict(&self, session: &SessionId, plan: &ActionPlan, snapshot: &EnvironmentSnapshot) -> ObstructionForecast {
        let signature = environment_signature(snapshot);
        let session_records = self.history.records(session).await;
        let records = if session_records.is_empty() {
            self.history.all().await
        } else {
            session_records
        };

        let mut best: BTreeMap<ChangeKind, f64> = BTreeMap::new();
        for action in plan.actions.iter().filter(|a| a.is_dynamic_trigger()) {
            for (kind, p) in estimate(&records, action.kind(), &signature) {
                let entry = best.entry(kind).or_insert(0.0);
                if p > *entry {
                    *entry = p;
                }
            }
        }

        let mut ranked: Vec<(ChangeKind, f64)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        debug!(?ranked, signature = %signature, "obstruction forecast");
        ObstructionForecast { ranked, signature }
    }
}

/// One entry per obstruction event: consecutive attempts at the same
/// obstruction collapse until one succeeds or the trigger changes.
fn events<'a>(records: &'a [ObstructionRecord]) -> Vec<&'a ObstructionRecord> {
    let mut out: Vec<&ObstructionRecord> = Vec::new();
    let mut open: Option<&ObstructionRecord> = None;
    for record in records {
        let continues = open.is_some_and(|prev| {
            !prev.success && prev.kind == record.kind && prev.trigger == record.trigger && prev.signature == record.signature
        });
        if !continues {
            out.push(record);
        }
        open = Some(record);
    }
    out
}

fn estimate(records: &[ObstructionRecord], kind: ActionKind, signature: &str) -> Vec<(ChangeKind, f64)> {
    let events = events(records);
    let exact: Vec<&ObstructionRecord> = events
        .iter()
        .copied()
        .filter(|r| r.action_kind == Some(kind) && r.signature == signature)
        .collect();

    let (evidence, weight): (Vec<&ObstructionRecord>, f64) = if exact.is_empty() {
        (
            events.iter().copied().filter(|r| r.action_kind == Some(kind)).collect(),
            FALLBACK_WEIGHT,
        )
    } else {
        (exact, 1.0)
    };

    // One extra outcome for "nothing happened"
    let outcomes = PREDICTED_KINDS.len() as f64 + 1.0;
    let total = evidence.len() as f64 * weight;
    PREDICTED_KINDS
        .iter()
        .map(|k| {
            let count = evidence.iter().filter(|r| r.kind == *k).count() as f64 * weight;
            (*k, (count + 1.0) / (total + outcomes))
        })
        .collect()
}
