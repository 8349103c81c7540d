//! Two-tier history compression
//!
//! 1. Rule pass: merge runs of the same action kind, collapse navigation
//!    chains, deduplicate identical errors.
//! 2. Aggressive pass (only if still over budget): fold older messages into
//!    per-chunk summaries, then drop the lowest-priority entries.
//!
//! The last `preserve_recent` messages are never touched. Summaries are
//! never summarized again, so compressing an already-compressed history with
//! the same budget is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::model::{HistoryMessage, MessageKind};

/// Budget and shape of a compression run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    pub target_tokens: usize,
    pub preserve_recent: usize,
    pub chunk_size: usize,
}

impl CompressionOptions {
    pub fn new(target_tokens: usize, preserve_recent: usize) -> Self {
        Self {
            target_tokens,
            preserve_recent,
            chunk_size: 6,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(2);
        self
    }
}

pub fn total_tokens(messages: &[HistoryMessage]) -> usize {
    messages.iter().map(HistoryMessage::tokens).sum()
}

/// Compress `messages` toward `target_tokens`, keeping the last
/// `preserve_recent` messages byte-identical.
pub fn compress(messages: &[HistoryMessage], options: CompressionOptions) -> Vec<HistoryMessage> {
    if total_tokens(messages) <= options.target_tokens {
        return messages.to_vec();
    }

    let split = messages.len().saturating_sub(options.preserve_recent);
    let (older, recent) = messages.split_at(split);
    let recent_tokens = total_tokens(recent);

    let mut head = rule_pass(older);
    if total_tokens(&head) + recent_tokens > options.target_tokens {
        head = summarize_chunks(&head, options.chunk_size);
    }
    if total_tokens(&head) + recent_tokens > options.target_tokens {
        head = drop_by_priority(head, options.target_tokens.saturating_sub(recent_tokens));
    }

    debug!(
        before = total_tokens(messages),
        after = total_tokens(&head) + recent_tokens,
        target = options.target_tokens,
        "compressed history"
    );

    head.extend(recent.iter().cloned());
    head
}

/// Cheap structural reductions that keep meaning intact
pub fn rule_pass(messages: &[HistoryMessage]) -> Vec<HistoryMessage> {
    merge_runs(&dedupe_errors(messages.to_vec()))
}

fn merge_runs(messages: &[HistoryMessage]) -> Vec<HistoryMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let kind = messages[i].kind;
        let mergeable = matches!(kind, MessageKind::Action(_) | MessageKind::Navigation);
        let mut j = i + 1;
        while mergeable && j < messages.len() && messages[j].kind == kind {
            j += 1;
        }

        let run = &messages[i..j];
        if run.len() < 2 {
            out.push(messages[i].clone());
        } else {
            out.push(merge_run(run));
        }
        i = j;
    }
    out
}

fn merge_run(run: &[HistoryMessage]) -> HistoryMessage {
    let steps = step_range(run);
    let content = match run[0].kind {
        MessageKind::Navigation => {
            let targets: Vec<&str> = run
                .iter()
                .map(|m| strip_step(&m.content).trim_start_matches("opened "))
                .collect();
            format!("{}navigated {}", steps, targets.join(" -> "))
        }
        MessageKind::Action(kind) => {
            let details: Vec<&str> = run.iter().map(|m| strip_step(&m.content)).collect();
            format!("{}{}x {}: {}", steps, run.len(), kind, details.join("; "))
        }
        _ => run[0].content.clone(),
    };
    let mut merged = HistoryMessage::summary(content);
    merged.step = run.first().and_then(|m| m.step);
    merged
}

fn dedupe_errors(messages: Vec<HistoryMessage>) -> Vec<HistoryMessage> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for message in messages.iter().filter(|m| m.kind == MessageKind::Error) {
        *counts.entry(strip_step(&message.content).to_string()).or_default() += 1;
    }

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        if message.kind != MessageKind::Error {
            out.push(message);
            continue;
        }
        let key = strip_step(&message.content).to_string();
        if !seen.insert(key.clone()) {
            continue;
        }
        let count = counts.get(&key).copied().unwrap_or(1);
        if count > 1 {
            let mut deduped = HistoryMessage::new(
                MessageKind::Error,
                format!("{} (seen {} times)", message.content, count),
            );
            deduped.step = message.step;
            out.push(deduped);
        } else {
            out.push(message);
        }
    }
    out
}

/// Fold consecutive non-summary messages into one summary per chunk
pub fn summarize_chunks(messages: &[HistoryMessage], chunk_size: usize) -> Vec<HistoryMessage> {
    let chunk_size = chunk_size.max(2);
    let mut out = Vec::new();
    let mut pending: Vec<HistoryMessage> = Vec::new();

    let flush = |pending: &mut Vec<HistoryMessage>, out: &mut Vec<HistoryMessage>| {
        for chunk in pending.chunks(chunk_size) {
            if chunk.len() < 2 {
                out.extend(chunk.iter().cloned());
                continue;
            }
            let summary = summarize_chunk(chunk);
            if summary.tokens() < total_tokens(chunk) {
                out.push(summary);
            } else {
                out.extend(chunk.iter().cloned());
            }
        }
        pending.clear();
    };

    for message in messages {
        if message.is_summary() {
            flush(&mut pending, &mut out);
            out.push(message.clone());
        } else {
            pending.push(message.clone());
        }
    }
    flush(&mut pending, &mut out);
    out
}

fn summarize_chunk(chunk: &[HistoryMessage]) -> HistoryMessage {
    let failures = chunk.iter().filter(|m| m.kind == MessageKind::Error).count();
    let mut kinds: BTreeMap<String, usize> = BTreeMap::new();
    for message in chunk {
        let label = match message.kind {
            MessageKind::Action(kind) => kind.to_string(),
            MessageKind::Navigation => "navigate".to_string(),
            MessageKind::Error => continue,
            MessageKind::Observation => "observe".to_string(),
            MessageKind::Summary => "summary".to_string(),
        };
        *kinds.entry(label).or_default() += 1;
    }
    let breakdown: Vec<String> = kinds.iter().map(|(k, n)| format!("{} {}", n, k)).collect();

    let mut content = format!("{}{} entries", step_range(chunk), chunk.len());
    if !breakdown.is_empty() {
        content.push_str(&format!(": {}", breakdown.join(", ")));
    }
    if failures > 0 {
        content.push_str(&format!("; {} failed", failures));
    }
    let mut summary = HistoryMessage::summary(content);
    summary.step = chunk.first().and_then(|m| m.step);
    summary
}

fn priority(message: &HistoryMessage) -> u8 {
    match message.kind {
        MessageKind::Error => 4,
        MessageKind::Summary => 3,
        MessageKind::Navigation => 2,
        MessageKind::Action(_) => 1,
        MessageKind::Observation => 0,
    }
}

/// Drop lowest-priority (then oldest) entries until `budget` fits.
///
/// A marker notes how many were dropped; it is left out when nothing of
/// the older history fits at all.
fn drop_by_priority(messages: Vec<HistoryMessage>, budget: usize) -> Vec<HistoryMessage> {
    let mut order: Vec<usize> = (0..messages.len()).collect();
    order.sort_by_key(|&i| (priority(&messages[i]), i));

    let mut kept = vec![true; messages.len()];
    let mut used = total_tokens(&messages);
    let mut dropped = 0usize;

    for i in order {
        if used + marker(dropped).map(|m| m.tokens()).unwrap_or(0) <= budget {
            break;
        }
        kept[i] = false;
        used -= messages[i].tokens();
        dropped += 1;
    }

    let mut out: Vec<HistoryMessage> = messages
        .into_iter()
        .zip(kept)
        .filter_map(|(m, keep)| keep.then_some(m))
        .collect();

    if let Some(note) = marker(dropped) {
        if used + note.tokens() <= budget {
            out.insert(0, note);
        }
    }
    out
}

fn marker(dropped: usize) -> Option<HistoryMessage> {
    (dropped > 0).then(|| HistoryMessage::summary(format!("[{} older entries omitted]", dropped)))
}

fn step_range(messages: &[HistoryMessage]) -> String {
    let first = messages.iter().find_map(|m| m.step);
    let last = messages.iter().rev().find_map(|m| m.step);
    match (first, last) {
        (Some(a), Some(b)) if a != b => format!("steps {}-{}: ", a, b),
        (Some(a), _) => format!("step {}: ", a),
        _ => String::new(),
    }
}

fn strip_step(content: &str) -> &str {
    if let Some(rest) = content.strip_prefix("step ") {
        if let Some((_, tail)) = rest.split_once(": ") {
            return tail;
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_core::ActionKind;

    fn action(step: u32, kind: ActionKind, text: &str) -> HistoryMessage {
        HistoryMessage::new(MessageKind::Action(kind), format!("step {}: {}", step, text)).at_step(step)
    }

    fn error(step: u32, text: &str) -> HistoryMessage {
        HistoryMessage::new(MessageKind::Error, format!("step {}: {}", step, text)).at_step(step)
    }

    fn nav(step: u32, url: &str) -> HistoryMessage {
        HistoryMessage::new(MessageKind::Navigation, format!("step {}: opened {}", step, url)).at_step(step)
    }

    fn long_history(n: u32) -> Vec<HistoryMessage> {
        (0..n)
            .map(|i| match i % 4 {
                0 => action(i, ActionKind::Click, &format!("clicked the button labelled option number {}", i)),
                1 => action(i, ActionKind::InputText, &format!("typed a fairly long search phrase number {}", i)),
                2 => nav(i, &format!("https://example.com/results/page/{}", i)),
                _ => error(i, "element 12 not found in current page snapshot"),
            })
            .collect()
    }

    #[test]
    fn test_under_budget_is_unchanged() {
        let messages = long_history(4);
        let out = compress(&messages, CompressionOptions::new(10_000, 2));
        assert_eq!(out, messages);
    }

    #[test]
    fn test_recent_messages_are_byte_identical() {
        let messages = long_history(40);
        for k in [0usize, 1, 3, 5, 10] {
            let out = compress(&messages, CompressionOptions::new(60, k));
            assert!(out.len() >= k);
            assert_eq!(&out[out.len() - k..], &messages[messages.len() - k..]);
        }
    }

    #[test]
    fn test_compression_reduces_size() {
        let messages = long_history(40);
        let out = compress(&messages, CompressionOptions::new(120, 4));
        assert!(total_tokens(&out) < total_tokens(&messages));
        assert!(total_tokens(&out) <= 120);
    }

    #[test]
    fn test_compression_is_idempotent() {
        let messages = long_history(60);
        for budget in [40usize, 90, 150, 400] {
            let options = CompressionOptions::new(budget, 5).with_chunk_size(4);
            let once = compress(&messages, options);
            let twice = compress(&once, options);
            assert_eq!(total_tokens(&twice), total_tokens(&once), "budget {}", budget);
            assert_eq!(twice, once);
        }
    }

    #[test]
    fn test_rule_pass_merges_runs() {
        let messages = vec![
            action(1, ActionKind::Click, "click a"),
            action(2, ActionKind::Click, "click b"),
            action(3, ActionKind::Click, "click c"),
            nav(4, "https://a.example"),
            nav(5, "https://b.example"),
            action(6, ActionKind::InputText, "typed x"),
        ];
        let out = rule_pass(&messages);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "steps 1-3: 3x click: click a; click b; click c");
        assert!(out[0].is_summary());
        assert_eq!(
            out[1].content,
            "steps 4-5: navigated https://a.example -> https://b.example"
        );
        assert_eq!(out[2], messages[5]);
    }

    #[test]
    fn test_rule_pass_dedupes_errors() {
        let messages = vec![
            error(1, "timeout waiting for selector"),
            action(2, ActionKind::Click, "click a"),
            error(3, "timeout waiting for selector"),
            error(4, "element vanished"),
        ];
        let out = rule_pass(&messages);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "step 1: timeout waiting for selector (seen 2 times)");
        assert_eq!(out[2].content, "step 4: element vanished");
    }

    #[test]
    fn test_summaries_are_not_resummarized() {
        let messages = vec![
            HistoryMessage::summary("steps 1-6: 6 entries: 6 click"),
            HistoryMessage::summary("steps 7-12: 6 entries: 6 input_text"),
        ];
        assert_eq!(summarize_chunks(&messages, 2), messages);
    }

    #[test]
    fn test_drop_keeps_errors_longest() {
        let messages = vec![
            error(1, "card declined by the payment provider"),
            action(2, ActionKind::Scroll, "scrolled down one page to see more results"),
            action(3, ActionKind::Click, "clicked next page of the results list"),
        ];
        let budget = messages[0].tokens() + 8;
        let out = drop_by_priority(messages.clone(), budget);
        assert!(out.iter().any(|m| m == &messages[0]));
        assert!(total_tokens(&out) <= budget);
    }
}
