//! Activity log - human-readable lifecycle trail in `.veer/activity.md`
//!
//! Implements [`EventSink`], so the executor and runner report to it like to
//! any other sink. State changes open a new paragraph; plan updates, actions,
//! sequence breaks and obstruction outcomes become bullet lines under it.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use veer_core::fail_open::fail_open;
use veer_core::{EventSink, LifecycleEvent};

/// Longest reason kept on a state-change line
const REASON_PREVIEW_CHARS: usize = 300;

pub struct ActivityLogSink {
    output_path: PathBuf,
}

impl ActivityLogSink {
    /// Log into `<veer_dir>/activity.md`
    pub fn new(veer_dir: PathBuf) -> Self {
        Self {
            output_path: veer_dir.join("activity.md"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.output_path
    }

    /// Start a fresh log for one run, replacing any previous content
    ///
    /// This operation is fail-open - logging failures won't crash the run
    pub async fn log_run_start(&self, goal: &str, max_steps: u32) {
        fail_open("activity_logger::log_run_start", || async {
            let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
            let content = format!(
                "# Veer Activity Log\n\n## Goal: {}\n**Started**: {}\n**Max Steps**: {}\n\n---\n\n",
                goal.lines().next().unwrap_or(goal),
                timestamp,
                max_steps
            );

            if let Some(dir) = self.output_path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.output_path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            Ok::<(), veer_core::VeerError>(())
        })
        .await;
    }

    async fn append_internal(&self, content: &str) -> veer_core::Result<()> {
        if let Some(dir) = self.output_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn render(event: &LifecycleEvent) -> String {
    let time = Utc::now().format("%H:%M:%S");
    match event {
        LifecycleEvent::StateChanged {
            task_id, from, to, reason, ..
        } => {
            let mut line = format!("\n### {} `{}`: {} -> {}\n", time, task_id, from, to);
            if let Some(reason) = reason.as_deref().filter(|r| !r.is_empty()) {
                let preview: String = reason.chars().take(REASON_PREVIEW_CHARS).collect();
                line.push_str(&format!("> {}\n", preview.replace('\n', " ")));
            }
            line.push('\n');
            line
        }
        LifecycleEvent::SequenceBreak { .. } => format!("- {} **{}**\n", time, event.summary()),
        _ => format!("- {} {}\n", time, event.summary()),
    }
}

#[async_trait]
impl EventSink for ActivityLogSink {
    async fn emit(&self, event: LifecycleEvent) {
        let content = render(&event);
        fail_open("activity_logger::emit", || self.append_internal(&content)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;
    use veer_core::{ChangeKind, ObstructionRecord, ResolutionStrategy, TaskId, TaskStatus};

    #[tokio::test]
    async fn test_log_run_start_creates_header() {
        let temp_dir = TempDir::new().unwrap();
        let logger = ActivityLogSink::new(temp_dir.path().join(".veer"));

        logger.log_run_start("Send a mail to bob", 40).await;

        let content = fs::read_to_string(logger.path()).await.unwrap();
        assert!(content.contains("# Veer Activity Log"));
        assert!(content.contains("## Goal: Send a mail to bob"));
        assert!(content.contains("**Max Steps**: 40"));
    }

    #[tokio::test]
    async fn test_events_are_appended() {
        let temp_dir = TempDir::new().unwrap();
        let logger = ActivityLogSink::new(temp_dir.path().to_path_buf());
        let task_id = TaskId::from("t1");

        logger.log_run_start("goal", 10).await;
        logger
            .emit(LifecycleEvent::StateChanged {
                task_id: task_id.clone(),
                from: TaskStatus::Executing,
                to: TaskStatus::Replanning,
                reason: Some("dialog 'Confirm' appeared over the page".to_string()),
            })
            .await;
        logger
            .emit(LifecycleEvent::ObstructionOutcome {
                task_id: task_id.clone(),
                record: ObstructionRecord::new(
                    ChangeKind::Blocking,
                    None,
                    "abc",
                    ResolutionStrategy::DismissKey {
                        key: "Escape".to_string(),
                    },
                    false,
                ),
            })
            .await;

        let content = fs::read_to_string(logger.path()).await.unwrap();
        assert!(content.starts_with("# Veer Activity Log"));
        assert!(content.contains("`t1`: executing -> replanning"));
        assert!(content.contains("> dialog 'Confirm' appeared over the page"));
        assert!(content.contains("unresolved"));
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_open() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let logger = ActivityLogSink::new(blocker.join("nested"));
        logger
            .emit(LifecycleEvent::SequenceBreak {
                task_id: TaskId::from("t1"),
                reason: "modal".to_string(),
                discarded: 2,
            })
            .await;
        assert!(!logger.path().exists());
    }
}
