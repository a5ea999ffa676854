//! Durable snapshots of the conversation store.
//!
//! Ephemeral conversations never reach disk: every snapshot is filtered on
//! its way out, while the live store keeps them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::conversation::Conversation;
use crate::error::Result;
use crate::store::{ConversationStore, StoreSnapshot};

/// Current snapshot file format
pub const SNAPSHOT_VERSION: u32 = 1;

/// Default delay between the last store change and the autosave write
pub const DEFAULT_AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    conversations: Vec<Conversation>,
    #[serde(default)]
    current_id: Option<String>,
}

/// Reads and writes filtered store snapshots at a fixed path
#[derive(Debug, Clone)]
pub struct PersistenceGate {
    path: PathBuf,
}

impl PersistenceGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strip everything that must not be persisted from a snapshot
    pub fn filter(snapshot: StoreSnapshot) -> StoreSnapshot {
        let conversations: Vec<Conversation> = snapshot
            .conversations
            .into_iter()
            .filter(|c| !c.ephemeral)
            .map(|mut c| {
                for message in &mut c.messages {
                    message.is_streaming = false;
                }
                c
            })
            .collect();
        let current_id = snapshot
            .current_id
            .filter(|id| conversations.iter().any(|c| &c.id == id));
        StoreSnapshot {
            conversations,
            current_id,
        }
    }

    /// Write the store contents, minus ephemeral conversations
    pub fn save(&self, store: &ConversationStore) -> Result<()> {
        self.write(Self::filter(store.snapshot()))
    }

    fn write(&self, snapshot: StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            conversations: snapshot.conversations,
            current_id: snapshot.current_id,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            "Saved {} conversations to {}",
            file.conversations.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the snapshot file. Returns `Ok(None)` if there is none.
    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let file: SnapshotFile = serde_json::from_str(&content)?;
        if file.version > SNAPSHOT_VERSION {
            tracing::warn!(
                "Snapshot {} has newer version {}, reading what we understand",
                self.path.display(),
                file.version
            );
        }
        Ok(Some(Self::filter(StoreSnapshot {
            conversations: file.conversations,
            current_id: file.current_id,
        })))
    }

    /// Restore the snapshot file into `store`.
    ///
    /// A missing file restores nothing. An unreadable or corrupt file is
    /// logged and treated as empty. Returns the number of conversations restored.
    pub fn restore_into(&self, store: &ConversationStore) -> usize {
        match self.load() {
            Ok(Some(snapshot)) => {
                let count = snapshot.conversations.len();
                store.restore(snapshot);
                count
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable snapshot {}: {}",
                    self.path.display(),
                    e
                );
                0
            }
        }
    }
}

/// Save a snapshot whenever store changes settle for `debounce`.
///
/// The task ends once the store is dropped.
pub fn spawn_autosave(
    store: &Arc<ConversationStore>,
    gate: PersistenceGate,
    debounce: Duration,
) -> JoinHandle<()> {
    let mut revisions = store.subscribe_revision();
    let store: Weak<ConversationStore> = Arc::downgrade(store);

    tokio::spawn(async move {
        loop {
            if revisions.changed().await.is_err() {
                break;
            }
            // wait for a quiet period
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            if let Err(e) = gate.save(&store) {
                tracing::warn!("Failed to save conversations: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageFlags;
    use parley_api::Role;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("parley-test-{}", uuid::Uuid::new_v4()))
            .join("conversations.json")
    }

    #[test]
    fn test_ephemeral_excluded_from_snapshot_only() {
        let store = ConversationStore::default();
        let durable = store.create_conversation(false);
        store
            .append_message(Role::User, "keep me", MessageFlags::default())
            .unwrap();
        let temp = store.create_conversation(true);
        store
            .append_message(Role::User, "forget me", MessageFlags::default())
            .unwrap();

        let gate = PersistenceGate::new(temp_path());
        gate.save(&store).unwrap();

        assert_eq!(store.len(), 2);
        let snapshot = gate.load().unwrap().unwrap();
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].id, durable);
        // current was the ephemeral one
        assert_eq!(snapshot.current_id, None);
        assert!(store.conversation(&temp).is_some());
    }

    #[test]
    fn test_restore_round_trip_clears_streaming() {
        let store = ConversationStore::default();
        let id = store.create_conversation(false);
        store
            .append_message(Role::User, "question", MessageFlags::default())
            .unwrap();
        store
            .append_message(Role::Assistant, "half", MessageFlags::streaming())
            .unwrap();

        let gate = PersistenceGate::new(temp_path());
        gate.save(&store).unwrap();

        let restored = ConversationStore::default();
        assert_eq!(gate.restore_into(&restored), 1);
        assert_eq!(restored.current_id(), Some(id));
        assert!(!restored.is_streaming());
        assert_eq!(restored.current().unwrap().messages[1].content, "half");
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let path = temp_path();
        let gate = PersistenceGate::new(&path);
        let store = ConversationStore::default();
        assert!(gate.load().unwrap().is_none());
        assert_eq!(gate.restore_into(&store), 0);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert!(gate.load().is_err());
        assert_eq!(gate.restore_into(&store), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_format() {
        let store = ConversationStore::default();
        store.create_conversation(false);
        let gate = PersistenceGate::new(temp_path());
        gate.save(&store).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(gate.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], SNAPSHOT_VERSION);
        assert_eq!(raw["conversations"].as_array().unwrap().len(), 1);
        assert!(!gate.path().with_extension("json.tmp").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_after_debounce() {
        let store = Arc::new(ConversationStore::default());
        let gate = PersistenceGate::new(temp_path());
        let task = spawn_autosave(&store, gate.clone(), Duration::from_millis(500));
        tokio::task::yield_now().await;

        store.create_conversation(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!gate.path().exists());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(gate.load().unwrap().unwrap().conversations.len(), 1);

        task.abort();
    }
}
