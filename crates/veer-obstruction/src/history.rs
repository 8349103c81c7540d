//! Per-session obstruction history
//!
//! A bounded ring of [`ObstructionRecord`]s per session. When a root
//! directory is configured, each session is mirrored to
//! `.veer/obstructions/<session>.json` after every append. Persistence is
//! fail-open: a write error is logged and the in-memory ring stays
//! authoritative.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, instrument};
use veer_core::config::ObstructionSettings;
use veer_core::fail_open::fail_open;
use veer_core::{ObstructionRecord, Result, SessionId};

pub struct ObstructionHistory {
    dir: Option<PathBuf>,
    capacity: usize,
    sessions: RwLock<HashMap<SessionId, VecDeque<ObstructionRecord>>>,
}

impl ObstructionHistory {
    /// Memory-only history
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            dir: None,
            capacity: capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// History persisted under `<root>/.veer/obstructions`
    pub fn persistent(root: &Path, capacity: usize) -> Self {
        Self {
            dir: Some(root.join(".veer").join("obstructions")),
            ..Self::in_memory(capacity)
        }
    }

    pub fn from_settings(root: Option<&Path>, settings: &ObstructionSettings) -> Self {
        match root {
            Some(root) => Self::persistent(root, settings.history_capacity),
            None => Self::in_memory(settings.history_capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn path_for(&self, session: &SessionId) -> Option<PathBuf> {
        let file: String = session
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", file)))
    }

    /// Append a record, evicting the oldest beyond capacity
    #[instrument(skip(self, record), fields(kind = %record.kind, success = record.success))]
    pub async fn record(&self, session: &SessionId, record: ObstructionRecord) {
        let snapshot: Vec<ObstructionRecord> = {
            let mut sessions = self.sessions.write().await;
            let ring = sessions.entry(session.clone()).or_default();
            ring.push_back(record);
            while ring.len() > self.capacity {
                ring.pop_front();
            }
            ring.iter().cloned().collect()
        };

        if let Some(path) = self.path_for(session) {
            fail_open("obstruction history write", || write_records(path, snapshot)).await;
        }
    }

    /// Load a session's persisted ring, replacing what is in memory.
    ///
    /// A missing file loads nothing. Returns the number of records loaded.
    pub async fn load(&self, session: &SessionId) -> Result<usize> {
        let Some(path) = self.path_for(session) else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let records: Vec<ObstructionRecord> = serde_json::from_str(&content)?;
        let skip = records.len().saturating_sub(self.capacity);
        let ring: VecDeque<ObstructionRecord> = records.into_iter().skip(skip).collect();
        let loaded = ring.len();

        self.sessions.write().await.insert(session.clone(), ring);
        debug!(session = %session, loaded, "loaded obstruction history");
        Ok(loaded)
    }

    pub async fn records(&self, session: &SessionId) -> Vec<ObstructionRecord> {
        self.sessions
            .read()
            .await
            .get(session)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `n` records, oldest first
    pub async fn recent(&self, session: &SessionId, n: usize) -> Vec<ObstructionRecord> {
        let records = self.records(session).await;
        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }

    /// Records of every session; prediction falls back to these
    pub async fn all(&self) -> Vec<ObstructionRecord> {
        self.sessions
            .read()
            .await
            .values()
            .flat_map(|ring| ring.iter().cloned())
            .collect()
    }

    pub async fn len(&self, session: &SessionId) -> usize {
        self.sessions.read().await.get(session).map(VecDeque::len).unwrap_or(0)
    }
}

async fn write_records(path: PathBuf, records: Vec<ObstructionRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(&records)?;
    tokio::fs::write(&path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use veer_core::{Action, ChangeKind, ResolutionStrategy};

    fn record(n: usize) -> ObstructionRecord {
        ObstructionRecord::new(
            ChangeKind::Interactive,
            Some(&Action::InputText {
                index: n,
                text: "bob".to_string(),
            }),
            "sig",
            ResolutionStrategy::AwaitStabilization,
            true,
        )
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let history = ObstructionHistory::in_memory(3);
        let session = SessionId::from("s1");
        for n in 0..5 {
            history.record(&session, record(n)).await;
        }
        let records = history.records(&session).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].trigger.as_ref().and_then(Action::target_index), Some(2));
        assert_eq!(history.recent(&session, 2).await.len(), 2);
        assert!(history.records(&SessionId::from("other")).await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let session = SessionId::from("tab/1");

        let history = ObstructionHistory::persistent(temp.path(), 50);
        history.record(&session, record(1)).await;
        history.record(&session, record(2)).await;
        assert!(temp.path().join(".veer/obstructions/tab_1.json").exists());

        let reloaded = ObstructionHistory::persistent(temp.path(), 50);
        assert_eq!(reloaded.load(&session).await.unwrap(), 2);
        assert_eq!(reloaded.records(&session).await, history.records(&session).await);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let history = ObstructionHistory::persistent(temp.path(), 50);
        assert_eq!(history.load(&SessionId::from("nobody")).await.unwrap(), 0);
        assert_eq!(ObstructionHistory::in_memory(5).load(&SessionId::from("x")).await.unwrap(), 0);
    }
}
