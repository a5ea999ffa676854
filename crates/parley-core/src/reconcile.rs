//! Reconciliation of local conversation state with the backend

use parking_lot::Mutex;
use parley_api::Backend;
use std::sync::Arc;

use crate::conversation::{ChatMessage, Conversation};
use crate::error::{Error, Result};
use crate::store::ConversationStore;

/// Default number of conversations fetched per reconciliation pass
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Aligns the store with the backend's conversation records.
///
/// Backend fetches happen outside the store lock; their results are applied
/// as single store transitions, so a pass never tears an in-flight turn.
pub struct SyncReconciler {
    backend: Arc<dyn Backend>,
    store: Arc<ConversationStore>,
    page_size: u32,
    last_loaded: Mutex<Option<String>>,
}

impl SyncReconciler {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<ConversationStore>, page_size: u32) -> Self {
        Self {
            backend,
            store,
            page_size: page_size.max(1),
            last_loaded: Mutex::new(None),
        }
    }

    /// Fetch the first page of backend conversations and merge it.
    ///
    /// On failure the store is left untouched. Returns the number of backend
    /// conversations merged.
    pub async fn reconcile(&self) -> Result<usize> {
        let page = match self.backend.list_conversations(self.page_size, 0).await {
            Ok(page) => page,
            Err(e) if e.is_transport() => {
                tracing::warn!("Backend unreachable, working offline: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!("Failed to fetch conversations, keeping local state: {}", e);
                return Err(e.into());
            }
        };
        let remote: Vec<Conversation> = page.iter().map(Conversation::from_remote).collect();
        let merged = self.store.merge_remote(remote);
        tracing::debug!("Merged {} backend conversations", merged);
        Ok(merged)
    }

    /// Load the messages of a synced conversation the first time it is activated.
    ///
    /// Returns `true` if messages were installed.
    pub async fn activate(&self, conversation_id: &str) -> Result<bool> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        if !conversation.needs_messages() {
            return Ok(false);
        }

        {
            let mut last = self.last_loaded.lock();
            if last.as_deref() == Some(conversation_id) {
                return Ok(false);
            }
            *last = Some(conversation_id.to_string());
        }

        match self.backend.list_messages(conversation_id).await {
            Ok(messages) => {
                let messages: Vec<ChatMessage> =
                    messages.into_iter().map(ChatMessage::from_remote).collect();
                let count = messages.len();
                let installed = self.store.install_messages(conversation_id, messages);
                if installed {
                    tracing::debug!("Loaded {} messages for {}", count, conversation_id);
                } else {
                    tracing::debug!("Discarded fetched messages for {}", conversation_id);
                }
                Ok(installed)
            }
            Err(e) => {
                tracing::warn!("Failed to load messages for {}: {}", conversation_id, e);
                let mut last = self.last_loaded.lock();
                if last.as_deref() == Some(conversation_id) {
                    *last = None;
                }
                Err(e.into())
            }
        }
    }

    /// Register a local-only conversation with the backend and adopt its id
    pub async fn publish(&self, conversation_id: &str) -> Result<String> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.synced {
            return Err(Error::NotPublishable(format!(
                "{} is already synced",
                conversation_id
            )));
        }
        if conversation.ephemeral {
            return Err(Error::NotPublishable(format!(
                "{} is ephemeral",
                conversation_id
            )));
        }
        if conversation.is_streaming() {
            return Err(Error::TurnInProgress);
        }

        let created = self.backend.create_conversation(&conversation.title).await?;
        self.store.remap_conversation_id(conversation_id, &created.id)?;
        tracing::debug!("Published {} as {}", conversation_id, created.id);
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, remote_conversation};
    use crate::store::MessageFlags;
    use parley_api::Role;
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<MockBackend>, Arc<ConversationStore>, SyncReconciler) {
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(ConversationStore::default());
        let reconciler = SyncReconciler::new(backend.clone(), store.clone(), DEFAULT_PAGE_SIZE);
        (backend, store, reconciler)
    }

    #[tokio::test]
    async fn test_reconcile_merges_backend_before_local() {
        let (backend, store, reconciler) = setup();
        backend.set_list(vec![
            remote_conversation("c1", "First", 2),
            remote_conversation("c2", "Second", 0),
        ]);
        let local = store.create_conversation(false);

        assert_eq!(reconciler.reconcile().await.unwrap(), 2);

        let list = store.conversations();
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", local.as_str()]);
        assert!(list[0].synced);
        assert_eq!(list[0].message_count, 2);
        assert!(store.conversation("c1").unwrap().messages.is_empty());
        assert_eq!(store.current_id(), Some(local));
    }

    #[tokio::test]
    async fn test_reconcile_honors_page_size() {
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(ConversationStore::default());
        let reconciler = SyncReconciler::new(backend.clone(), store.clone(), 1);
        backend.set_list(vec![
            remote_conversation("c1", "a", 1),
            remote_conversation("c2", "b", 1),
        ]);

        assert_eq!(reconciler.reconcile().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_list_leaves_store_untouched() {
        let (backend, store, reconciler) = setup();
        store.create_conversation(false);
        store
            .append_message(Role::User, "hi", MessageFlags::default())
            .unwrap();
        let before = store.snapshot();
        backend.list_fails.store(true, Ordering::SeqCst);

        assert!(reconciler.reconcile().await.is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_activate_loads_once() {
        let (backend, store, reconciler) = setup();
        backend.set_list(vec![remote_conversation("c1", "First", 2)]);
        backend.set_messages("c1", &[("question", Role::User), ("answer", Role::Assistant)]);
        reconciler.reconcile().await.unwrap();

        assert!(reconciler.activate("c1").await.unwrap());
        assert!(!reconciler.activate("c1").await.unwrap());
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 1);

        let conversation = store.conversation("c1").unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].content, "answer");
        assert!(conversation.messages.iter().all(|m| !m.is_streaming));
    }

    #[tokio::test]
    async fn test_activate_skips_empty_and_loaded() {
        let (backend, store, reconciler) = setup();
        backend.set_list(vec![
            remote_conversation("empty", "Nothing", 0),
            remote_conversation("c1", "Loaded", 1),
        ]);
        reconciler.reconcile().await.unwrap();
        store.set_current("c1").unwrap();
        store
            .append_message(Role::User, "already here", MessageFlags::default())
            .unwrap();

        assert!(!reconciler.activate("empty").await.unwrap());
        assert!(!reconciler.activate("c1").await.unwrap());
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_message_fetch_allows_retry() {
        let (backend, store, reconciler) = setup();
        backend.set_list(vec![remote_conversation("c1", "First", 1)]);
        backend.set_messages("c1", &[("hello", Role::User)]);
        reconciler.reconcile().await.unwrap();

        backend.messages_fail.store(true, Ordering::SeqCst);
        assert!(reconciler.activate("c1").await.is_err());
        assert!(store.conversation("c1").unwrap().messages.is_empty());
        assert_eq!(store.len(), 1);

        backend.messages_fail.store(false, Ordering::SeqCst);
        assert!(reconciler.activate("c1").await.unwrap());
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_activate_unknown_conversation() {
        let (_backend, _store, reconciler) = setup();
        assert!(matches!(
            reconciler.activate("missing").await,
            Err(Error::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_remaps_local_conversation() {
        let (backend, store, reconciler) = setup();
        let local = store.create_conversation(false);
        store
            .append_message(Role::User, "Trip planning", MessageFlags::default())
            .unwrap();

        let id = reconciler.publish(&local).await.unwrap();

        assert_eq!(id, "created-1");
        assert_eq!(backend.created.lock().as_slice(), ["Trip planning".to_string()]);
        assert_eq!(store.current_id().as_deref(), Some("created-1"));
        assert!(store.current().unwrap().synced);
    }

    #[tokio::test]
    async fn test_publish_rejects_ephemeral_and_synced() {
        let (backend, store, reconciler) = setup();
        let temp = store.create_conversation(true);
        assert!(matches!(
            reconciler.publish(&temp).await,
            Err(Error::NotPublishable(_))
        ));

        backend.set_list(vec![remote_conversation("c1", "Synced", 0)]);
        reconciler.reconcile().await.unwrap();
        assert!(matches!(
            reconciler.publish("c1").await,
            Err(Error::NotPublishable(_))
        ));
        assert!(backend.created.lock().is_empty());
    }
}
