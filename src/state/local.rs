//! Local file-based state storage backend.
//!
//! The snapshot lives in `state.json`. Each committed change is first
//! appended to `state.journal` (one JSON document per line) and synced, then
//! the snapshot is rewritten through a temp file and an atomic rename, and
//! finally the journal is truncated. Loading replays journal entries newer
//! than the snapshot, so a crash at any point leaves a consistent record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{ProvisionedState, StateChange};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Journal file name.
const JOURNAL_FILE: &str = "state.journal";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// One committed change, as journaled before the snapshot is rewritten.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct JournalEntry {
    /// Stack the change belongs to.
    pub(super) stack: String,
    /// State serial after the change.
    pub(super) serial: u64,
    /// When the change was committed.
    pub(super) at: DateTime<Utc>,
    /// The change itself.
    #[serde(flatten)]
    pub(super) change: StateChange,
}

impl JournalEntry {
    /// Journals `change` as the one that produced `state`.
    pub(super) fn for_commit(state: &ProvisionedState, change: &StateChange) -> Self {
        Self {
            stack: state.stack.clone(),
            serial: state.serial,
            at: state.last_updated,
            change: change.clone(),
        }
    }
}

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the journal file.
    journal_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();

        Self {
            state_path: base_dir.join(STATE_FILE),
            journal_path: base_dir.join(JOURNAL_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Returns the state directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Reads the snapshot, if any.
    async fn read_snapshot(&self) -> Result<Option<ProvisionedState>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StackError::State(StateError::corrupted(format!("Failed to read state file: {e}")))
        })?;

        let state: ProvisionedState = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::corrupted(format!(
                "Failed to parse state file {}: {e}",
                self.state_path.display()
            )))
        })?;

        Ok(Some(state))
    }

    /// Reads journal entries. A torn final line is dropped.
    async fn read_journal(&self) -> Result<Vec<JournalEntry>> {
        if !self.journal_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.journal_path).await.map_err(|e| {
            StackError::State(StateError::corrupted(format!("Failed to read journal: {e}")))
        })?;

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i + 1 == lines.len() => {
                    warn!("Ignoring incomplete journal entry at line {}: {e}", i + 1);
                }
                Err(e) => {
                    return Err(StackError::State(StateError::corrupted(format!(
                        "Journal line {} is unreadable: {e}",
                        i + 1
                    ))));
                }
            }
        }

        Ok(entries)
    }

    /// Appends one entry to the journal and syncs it.
    async fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize journal entry: {e}"
            )))
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await
            .map_err(|e| StackError::State(StateError::write(format!("Failed to open journal: {e}"))))?;

        file.write_all(line.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::write(format!("Failed to append journal: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::write(format!("Failed to sync journal: {e}")))
        })?;

        Ok(())
    }

    /// Writes the snapshot through a temp file and an atomic rename.
    async fn write_snapshot(&self, state: &ProvisionedState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StackError::State(StateError::write(format!(
                "Failed to create temp state file: {e}"
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::write(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::write(format!("Failed to sync state file: {e}")))
        })?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            StackError::State(StateError::write(format!("Failed to rename state file: {e}")))
        })?;

        Ok(())
    }

    /// Empties the journal once the snapshot covers it.
    async fn truncate_journal(&self) -> Result<()> {
        if self.journal_path.exists() {
            fs::remove_file(&self.journal_path).await.map_err(|e| {
                StackError::State(StateError::write(format!("Failed to truncate journal: {e}")))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StackError::State(StateError::corrupted(format!("Failed to read lock file: {e}")))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let mut file = fs::File::create(&self.lock_path).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

/// Replays journal entries newer than the snapshot.
pub(super) fn replay(
    snapshot: Option<ProvisionedState>,
    entries: Vec<JournalEntry>,
) -> Result<Option<ProvisionedState>> {
    let mut state = snapshot;

    for entry in entries {
        let current = state.get_or_insert_with(|| ProvisionedState::new(&entry.stack));

        if entry.serial <= current.serial {
            continue;
        }
        if entry.serial != current.serial + 1 {
            return Err(StackError::State(StateError::corrupted(format!(
                "Journal jumps from serial {} to {}",
                current.serial, entry.serial
            ))));
        }

        debug!(
            "Replaying journal entry {} for '{}'",
            entry.serial,
            entry.change.resource_name()
        );
        current.apply_change(&entry.change);
        current.last_updated = entry.at;
    }

    Ok(state)
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ProvisionedState>> {
        let snapshot = self.read_snapshot().await?;
        let entries = self.read_journal().await?;

        if snapshot.is_none() && entries.is_empty() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());
        replay(snapshot, entries)
    }

    async fn save(&self, state: &ProvisionedState) -> Result<()> {
        self.ensure_dir().await?;

        debug!("Saving state to: {}", self.state_path.display());
        self.write_snapshot(state).await?;
        self.truncate_journal().await?;

        Ok(())
    }

    async fn commit(&self, state: &ProvisionedState, change: &StateChange) -> Result<()> {
        self.ensure_dir().await?;

        let entry = JournalEntry::for_commit(state, change);

        self.append_journal(&entry).await?;
        self.write_snapshot(state).await?;
        self.truncate_journal().await?;

        debug!(
            "Committed state serial {} ({})",
            state.serial,
            change.resource_name()
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                StackError::State(StateError::write(format!("Failed to delete state file: {e}")))
            })?;
        }

        self.truncate_journal().await?;
        self.delete_lock_file().await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists() || self.journal_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceType;
    use crate::state::ResourceRecord;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    fn upsert(name: &str) -> StateChange {
        StateChange::Upsert {
            record: ResourceRecord::new(name, ResourceType::Network, &format!("id-{name}"), "h"),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let state = ProvisionedState::new("demo-dev");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.stack, "demo-dev");
        assert_eq!(loaded.serial, 0);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_persists_each_change() {
        let (store, _temp) = create_test_store();
        let mut state = ProvisionedState::new("demo-dev");

        for name in ["vpc", "cluster"] {
            let change = upsert(name);
            state.apply_change(&change);
            store.commit(&state, &change).await.expect("commit failed");
        }

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.serial, 2);
        assert_eq!(loaded.names(), vec!["cluster", "vpc"]);
        assert!(!store.journal_path.exists());
    }

    #[tokio::test]
    async fn test_journal_replayed_after_crash() {
        let (store, _temp) = create_test_store();
        let mut state = ProvisionedState::new("demo-dev");

        let first = upsert("vpc");
        state.apply_change(&first);
        store.commit(&state, &first).await.unwrap();

        // Simulate a crash after the journal append but before the snapshot.
        let second = upsert("cluster");
        state.apply_change(&second);
        store
            .append_journal(&JournalEntry {
                stack: state.stack.clone(),
                serial: state.serial,
                at: state.last_updated,
                change: second,
            })
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.serial, 2);
        assert!(loaded.get("cluster").is_some());
    }

    #[tokio::test]
    async fn test_torn_journal_tail_ignored() {
        let (store, _temp) = create_test_store();
        let mut state = ProvisionedState::new("demo-dev");
        let change = upsert("vpc");
        state.apply_change(&change);
        store.commit(&state, &change).await.unwrap();

        fs::write(&store.journal_path, "{\"stack\":\"demo-dev\",\"ser")
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.serial, 1);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot() {
        let (store, _temp) = create_test_store();
        fs::create_dir_all(store.base_dir()).await.unwrap();
        fs::write(&store.state_path, "not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().operation, "apply");

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "destroy").await;
        assert!(matches!(
            result,
            Err(StackError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.unwrap();
        assert!(store.acquire_lock("holder-2", "destroy").await.is_ok());
    }
}
