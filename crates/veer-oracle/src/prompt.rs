//! Prompt builders for the planner, replanner and validator roles

use veer_context::importance::compress_environment;
use veer_context::RoleView;
use veer_core::{Action, ActionRecord, EnvironmentSnapshot};

const ACTION_VOCABULARY: &str = r#"Actions (JSON objects tagged by "type"):
- {"type": "click", "index": N}
- {"type": "input_text", "index": N, "text": "..."}
- {"type": "select_option", "index": N, "option": "..."}
- {"type": "scroll", "direction": "up" | "down", "amount": pixels or null}
- {"type": "navigate", "url": "..."}
- {"type": "send_keys", "keys": "..."}
- {"type": "wait", "ms": N}
- {"type": "done", "success": true | false, "text": "..."}
Indices refer to the [N] markers in the element list. Never invent an index."#;

pub const PLANNER_SYSTEM: &str = "You operate a web page on behalf of a user. \
Propose the next few actions toward the goal. Inputs with autocomplete may open a \
suggestion list after typing; end the batch right after such an input so the page can \
be re-read. Reply with one JSON object only.";

pub const REPLANNER_SYSTEM: &str = "You repair an action plan that was interrupted because \
the page changed. Decide whether the remaining actions are still valid against the fresh \
element list. Reply with one JSON object only.";

pub const VALIDATOR_SYSTEM: &str = "You check whether a browser task is really complete. \
Judge only from the history and the current page. Reply with one JSON object only.";

/// Element lines for the prompt, most important first capped at `max`
pub fn render_elements(snapshot: &EnvironmentSnapshot, max: usize) -> String {
    let compressed = compress_environment(snapshot, max);
    let mut lines: Vec<String> = compressed.key_elements.iter().map(|e| e.render()).collect();
    if compressed.total_elements > lines.len() {
        lines.push(format!(
            "({} of {} elements shown)",
            lines.len(),
            compressed.total_elements
        ));
    }
    lines.join("\n")
}

fn render_actions(actions: &[Action]) -> String {
    serde_json::to_string_pretty(actions).unwrap_or_else(|_| {
        actions
            .iter()
            .map(Action::describe)
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub fn planning_prompt(view: &RoleView, snapshot: &EnvironmentSnapshot, max_actions: usize, max_elements: usize) -> String {
    let mut prompt = String::new();
    prompt.push_str(&view.render());
    prompt.push_str("\n\n## Current page\n");
    prompt.push_str(&format!("{} ({})\n", snapshot.url, snapshot.title));
    prompt.push_str(&render_elements(snapshot, max_elements));
    prompt.push_str("\n\n## Instructions\n");
    prompt.push_str(ACTION_VOCABULARY);
    prompt.push_str(&format!(
        "\n\nPropose at most {} actions. Use \"done\" when the goal is reached.\n",
        max_actions
    ));
    prompt.push_str(
        r#"Reply as {"analysis": "...", "executionMode": "batch" | "single_step" | "adaptive", "actions": [...], "reasoning": "..."}"#,
    );
    prompt
}

/// Everything the replanner is told about an interrupted plan
#[derive(Debug, Clone)]
pub struct ReplanPrompt<'a> {
    pub goal: &'a str,
    pub reason: &'a str,
    pub completed: &'a [ActionRecord],
    pub remaining: &'a [Action],
    pub snapshot: &'a EnvironmentSnapshot,
    pub notes: &'a [String],
    pub max_elements: usize,
}

/// Completed steps shown to the replanner
const COMPLETED_DIGEST: usize = 8;

pub fn replanning_prompt(input: &ReplanPrompt<'_>) -> String {
    let mut prompt = format!("## Goal\n{}\n\n", input.goal);

    prompt.push_str("## Completed steps\n");
    if input.completed.is_empty() {
        prompt.push_str("(none)\n");
    }
    let start = input.completed.len().saturating_sub(COMPLETED_DIGEST);
    for record in &input.completed[start..] {
        let outcome = if record.result.success {
            record.result.memory_line().unwrap_or("ok").to_string()
        } else {
            format!("FAILED: {}", record.result.error.as_deref().unwrap_or("unknown"))
        };
        prompt.push_str(&format!(
            "- step {}: {} -> {}\n",
            record.step,
            record.action.describe(),
            outcome
        ));
    }

    prompt.push_str(&format!("\n## Why the plan was interrupted\n{}\n", input.reason));
    if !input.notes.is_empty() {
        prompt.push_str("\n## Recent notes\n");
        for note in input.notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }

    prompt.push_str(&format!(
        "\n## Fresh page\n{} ({})\n{}\n",
        input.snapshot.url,
        input.snapshot.title,
        render_elements(input.snapshot, input.max_elements)
    ));
    prompt.push_str(&format!(
        "\n## Remaining actions (indices may be stale)\n{}\n",
        render_actions(input.remaining)
    ));

    prompt.push_str("\n## Instructions\n");
    prompt.push_str(ACTION_VOCABULARY);
    prompt.push_str(
        "\n\nIf the remaining actions still fit the fresh page, set needsReplanning to false. \
         Otherwise give a replacement for the remaining actions only.\n",
    );
    prompt.push_str(
        r#"Reply as {"needsReplanning": bool, "analysis": "...", "executionMode": "batch" | "single_step" | "adaptive", "updatedPlan": [...], "reasoning": "..."}"#,
    );
    prompt
}

pub fn validation_prompt(view: &RoleView, claim: &str, snapshot: &EnvironmentSnapshot, max_elements: usize) -> String {
    let mut prompt = view.render();
    prompt.push_str(&format!("\n\n## Agent's completion claim\n{}\n", claim));
    prompt.push_str(&format!(
        "\n## Current page\n{} ({})\n{}\n\n",
        snapshot.url,
        snapshot.title,
        render_elements(snapshot, max_elements)
    ));
    prompt.push_str(r#"Reply as {"isComplete": bool, "reason": "..."}"#);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use veer_context::{AgentRole, SharedContext};
    use veer_core::{ActionResult, ElementNode, SessionId, TaskId};

    fn snapshot() -> EnvironmentSnapshot {
        EnvironmentSnapshot::new(
            SessionId::from("s"),
            "https://mail.example/compose",
            vec![
                ElementNode::new(0, "input").with_attr("aria-label", "To"),
                ElementNode::new(1, "li").with_role("option").with_text("bob@example.com"),
            ],
        )
        .with_title("Compose")
    }

    #[test]
    fn test_replanning_prompt_carries_reason_and_remaining() {
        let completed = vec![ActionRecord::new(
            1,
            Action::InputText {
                index: 0,
                text: "bob".to_string(),
            },
            ActionResult::ok(),
        )];
        let remaining = vec![Action::InputText {
            index: 3,
            text: "Hello".to_string(),
        }];
        let notes = vec!["suggestion list appeared under element 0".to_string()];
        let prompt = replanning_prompt(&ReplanPrompt {
            goal: "send mail to bob",
            reason: "suggestion list appeared",
            completed: &completed,
            remaining: &remaining,
            snapshot: &snapshot(),
            notes: &notes,
            max_elements: 40,
        });

        assert!(prompt.contains("send mail to bob"));
        assert!(prompt.contains("step 1: input 'bob' into element 0"));
        assert!(prompt.contains("suggestion list appeared"));
        assert!(prompt.contains("\"index\": 3"));
        assert!(prompt.contains("[1] <li role=option> bob@example.com"));
        assert!(prompt.contains("needsReplanning"));
    }

    #[test]
    fn test_planning_prompt_includes_view_and_limit() {
        let context = SharedContext::new(TaskId::from("t"), "find the docs");
        let view = RoleView::project(&context, AgentRole::Planner);
        let prompt = planning_prompt(&view, &snapshot(), 4, 40);
        assert!(prompt.starts_with("## Goal\nfind the docs"));
        assert!(prompt.contains("at most 4 actions"));
        assert!(prompt.contains("[0] <input> To"));
    }

    #[test]
    fn test_render_elements_reports_truncation() {
        let rendered = render_elements(&snapshot(), 1);
        assert!(rendered.contains("(1 of 2 elements shown)"));
    }
}
