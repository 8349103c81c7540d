//! Role-scoped projections of a [`SharedContext`]
//!
//! Every role reads the same underlying context. A projection only decides
//! which parts are rendered and in what order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::SharedContext;

/// Cooperating agent roles that share one context per task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Navigator,
    Validator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 3] = [AgentRole::Planner, AgentRole::Navigator, AgentRole::Validator];
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Navigator => write!(f, "navigator"),
            AgentRole::Validator => write!(f, "validator"),
        }
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planner" => Ok(AgentRole::Planner),
            "navigator" => Ok(AgentRole::Navigator),
            "validator" => Ok(AgentRole::Validator),
            _ => Err(format!("Unknown agent role: {}", s)),
        }
    }
}

/// Number of history messages the navigator sees
const NAVIGATOR_RECENT: usize = 3;

/// Rendered, role-specific view of a shared context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleView {
    pub role: AgentRole,
    pub sections: Vec<(String, String)>,
}

impl RoleView {
    pub fn project(context: &SharedContext, role: AgentRole) -> Self {
        let mut view = Self {
            role,
            sections: Vec::new(),
        };

        view.push("Goal", context.goal.clone());
        match role {
            AgentRole::Planner => {
                view.push("Notes", bullet(context.scratch_for(AgentRole::Navigator)));
                view.push("Page", page(context));
                view.push("Action patterns", patterns(context));
                view.push("Recent failures", failures(context));
                view.push("History", history(context, usize::MAX));
                view.push("Planner notes", bullet(context.scratch_for(AgentRole::Planner)));
            }
            AgentRole::Navigator => {
                view.push("Page", page(context));
                view.push("Recent actions", history(context, NAVIGATOR_RECENT));
                view.push("Notes", bullet(context.scratch_for(AgentRole::Navigator)));
            }
            AgentRole::Validator => {
                view.push("History", history(context, usize::MAX));
                view.push("Failures", failures(context));
                view.push("Validator notes", bullet(context.scratch_for(AgentRole::Validator)));
            }
        }
        view
    }

    fn push(&mut self, title: &str, body: String) {
        if !body.trim().is_empty() {
            self.sections.push((title.to_string(), body));
        }
    }

    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, body)| body.as_str())
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|(title, body)| format!("## {}\n{}", title, body))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn bullet(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| format!("- {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn page(context: &SharedContext) -> String {
    let env = &context.environment;
    if env.url.is_empty() && env.key_elements.is_empty() {
        return String::new();
    }
    let mut lines = vec![format!("{} ({})", env.url, env.title)];
    lines.extend(env.key_elements.iter().map(|e| e.render()));
    if env.total_elements > env.key_elements.len() {
        lines.push(format!(
            "... {} more elements not shown",
            env.total_elements - env.key_elements.len()
        ));
    }
    lines.join("\n")
}

fn patterns(context: &SharedContext) -> String {
    context
        .history
        .patterns
        .iter()
        .map(|(kind, stat)| {
            format!(
                "- {}: {} runs, {:.0}% success",
                kind,
                stat.count,
                stat.success_rate() * 100.0
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn failures(context: &SharedContext) -> String {
    context
        .history
        .failures
        .iter()
        .map(|f| format!("- step {}: {} ({})", f.step, f.action, f.error))
        .collect::<Vec<_>>()
        .join("\n")
}

fn history(context: &SharedContext, last: usize) -> String {
    let messages = &context.history.messages;
    let start = messages.len().saturating_sub(last);
    messages[start..]
        .iter()
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}
