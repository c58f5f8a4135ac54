//! Named session contexts and their durable representation.
//!
//! The whole store lives under one storage key as a JSON array of
//! `[name, context]` pairs, in the order the names were first saved. The name
//! of the active context is kept next to it under `<key>.active` so the last
//! used profile comes back after a restart.
//!
//! A stored document that cannot be decoded is copied to `<key>.corrupt`
//! before the store starts empty. If that copy cannot be made, or the document
//! could not be read at all, the store refuses to write the key so the
//! original bytes are never overwritten.

use super::{ContextDefaults, KeyValueStorage, LiveSession, SessionContext};
use crate::error::StorageError;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

pub const ACTIVE_KEY_SUFFIX: &str = ".active";
pub const CORRUPT_KEY_SUFFIX: &str = ".corrupt";

pub type ContextMap = IndexMap<String, SessionContext>;

/// Serializes contexts as an ordered array of `[name, context]` pairs.
pub fn encode_contexts(contexts: &ContextMap) -> Result<String, serde_json::Error> {
    let pairs: Vec<(&String, &SessionContext)> = contexts.iter().collect();
    serde_json::to_string(&pairs)
}

pub fn decode_contexts(document: &str) -> Result<ContextMap, serde_json::Error> {
    let pairs: Vec<(String, SessionContext)> = serde_json::from_str(document)?;
    Ok(pairs.into_iter().collect())
}

pub struct ContextStore<S: KeyValueStorage> {
    storage: S,
    key: String,
    contexts: ContextMap,
    active: String,
    defaults: ContextDefaults,
    /// Set when the stored document could not be read or preserved
    protected: bool,
}

impl<S: KeyValueStorage> ContextStore<S> {
    /// Loads the store from `storage`. Unreadable or corrupt documents are
    /// logged and replaced by an empty store. `fallback_active` names the
    /// active context when none was recorded.
    pub async fn open(
        mut storage: S,
        key: impl Into<String>,
        defaults: ContextDefaults,
        fallback_active: &str,
    ) -> Self {
        let key = key.into();
        let mut protected = false;

        let contexts = match storage.get_item(&key).await {
            Ok(Some(document)) => match decode_contexts(&document) {
                Ok(contexts) => {
                    info!("Loaded {} saved contexts", contexts.len());
                    contexts
                }
                Err(e) => {
                    warn!("Stored contexts under {} are corrupt, starting empty: {}", key, e);
                    let backup = format!("{key}{CORRUPT_KEY_SUFFIX}");
                    match storage.set_item(&backup, &document).await {
                        Ok(()) => warn!("Corrupt document kept under {}", backup),
                        Err(e) => {
                            error!("Could not keep corrupt document, saving is disabled: {}", e);
                            protected = true;
                        }
                    }
                    ContextMap::new()
                }
            },
            Ok(None) => {
                debug!("No saved contexts under {}", key);
                ContextMap::new()
            }
            Err(e) => {
                error!("Could not read saved contexts, saving is disabled: {}", e);
                protected = true;
                ContextMap::new()
            }
        };

        let active = match storage.get_item(&format!("{key}{ACTIVE_KEY_SUFFIX}")).await {
            Ok(Some(name)) if !name.trim().is_empty() => name.trim().to_string(),
            Ok(_) => fallback_active.to_string(),
            Err(e) => {
                warn!("Could not read last active context: {}", e);
                fallback_active.to_string()
            }
        };

        Self {
            storage,
            key,
            contexts,
            active,
            defaults,
            protected,
        }
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// Stored context names in the order they were first saved.
    pub fn names(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    /// Whether writes are refused to protect an unreadable stored document.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Context to seed the live session with at startup.
    pub fn initial_context(&self) -> SessionContext {
        self.load(&self.active)
    }

    /// Stores `context` under `name` and writes the whole store through.
    /// An empty name is ignored; `Ok(false)` reports that nothing was saved.
    pub async fn save(&mut self, name: &str, context: SessionContext) -> Result<bool, StorageError> {
        if name.is_empty() {
            debug!("Ignoring save without a context name");
            return Ok(false);
        }
        self.contexts.insert(name.to_string(), context);
        self.persist().await?;
        info!("Context {} saved", name);
        Ok(true)
    }

    /// Saves a snapshot of the live session under the active name.
    pub async fn save_active(&mut self, context: SessionContext) -> Result<bool, StorageError> {
        let name = self.active.clone();
        self.save(&name, context).await
    }

    /// The stored context, or a fresh default when `name` is unknown.
    pub fn load(&self, name: &str) -> SessionContext {
        match self.contexts.get(name) {
            Some(context) => context.clone(),
            None => {
                debug!("Context {} not found, using defaults", name);
                self.defaults.build()
            }
        }
    }

    /// Swaps the live session over to `name`.
    ///
    /// The live state is snapshotted, its connection closed, the snapshot
    /// saved under the previously active name, and the target context loaded
    /// into the session. No connection is opened. The switch completes even
    /// when writing to storage fails; the write error is returned afterwards.
    pub async fn switch<L: LiveSession + ?Sized>(
        &mut self,
        name: &str,
        session: &mut L,
    ) -> Result<bool, StorageError> {
        if name.is_empty() {
            debug!("Ignoring switch without a context name");
            return Ok(false);
        }

        let snapshot = session.snapshot();
        session.close();

        let previous = std::mem::replace(&mut self.active, name.to_string());
        let saved = self.save(&previous, snapshot).await;

        let target = self.load(name);
        session.restore(target);
        info!("Switched context {} -> {}", previous, name);

        let marked = self.persist_active().await;
        saved?;
        marked?;
        Ok(true)
    }

    /// Removes a stored context. The live session is not touched, even when
    /// `name` is the active context.
    pub async fn delete(&mut self, name: &str) -> Result<bool, StorageError> {
        if self.contexts.shift_remove(name).is_none() {
            debug!("Context {} not stored, nothing to delete", name);
            return Ok(false);
        }
        self.persist().await?;
        info!("Context {} deleted", name);
        Ok(true)
    }

    async fn persist(&mut self) -> Result<(), StorageError> {
        if self.protected {
            return Err(StorageError::Protected(self.key.clone()));
        }
        let document = encode_contexts(&self.contexts).map_err(StorageError::Encode)?;
        self.storage.set_item(&self.key, &document).await
    }

    async fn persist_active(&mut self) -> Result<(), StorageError> {
        let key = format!("{}{ACTIVE_KEY_SUFFIX}", self.key);
        self.storage.set_item(&key, &self.active).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::ConnectionParameters;
    use crate::mqtt::message_manager::{PublishDraft, ReceivedMessage};
    use crate::mqtt::topics::{QualityOfService, SubscriptionDescriptor, TopicRegistry};
    use crate::persistence::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const KEY: &str = "contexts";

    fn context(url: &str, filters: &[(&str, u8)]) -> SessionContext {
        SessionContext {
            connection: ConnectionParameters::new(url, "c1"),
            publish_draft: PublishDraft::new("t/1", "hello"),
            subscribe_draft: SubscriptionDescriptor::new("s", QualityOfService::AtLeastOnce),
            topic_registry: filters
                .iter()
                .map(|(f, q)| SubscriptionDescriptor::new(*f, QualityOfService::try_from(*q).unwrap()))
                .collect::<TopicRegistry>(),
            received_messages: vec![ReceivedMessage::arrived_now("t/1", "first")],
        }
    }

    struct FakeSession {
        live: SessionContext,
        closes: usize,
    }

    impl LiveSession for FakeSession {
        fn snapshot(&self) -> SessionContext {
            self.live.clone()
        }

        fn close(&mut self) {
            self.closes += 1;
        }

        fn restore(&mut self, context: SessionContext) {
            self.live = context;
        }
    }

    async fn open(storage: &MemoryStorage) -> ContextStore<MemoryStorage> {
        ContextStore::open(storage.clone(), KEY, ContextDefaults::default(), "default").await
    }

    #[tokio::test]
    async fn empty_name_save_leaves_store_unchanged() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        assert_eq!(store.save("", context("ws://x", &[])).await.unwrap(), false);
        assert!(store.names().is_empty());
        assert_eq!(storage.get_item(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_overwrites_existing_name_in_place() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        store.save("a", context("ws://a", &[])).await.unwrap();
        store.save("b", context("ws://b", &[])).await.unwrap();
        store.save("a", context("ws://a2", &[])).await.unwrap();

        assert_eq!(store.names(), ["a", "b"]);
        assert_eq!(store.load("a").connection.url, "ws://a2");
    }

    #[tokio::test]
    async fn load_unknown_name_returns_defaults() {
        let storage = MemoryStorage::new();
        let store = open(&storage).await;
        let ctx = store.load("nope");
        assert_eq!(ctx.connection.url, ContextDefaults::default().endpoint);
        assert_eq!(ctx.topic_registry.len(), 1);
    }

    #[tokio::test]
    async fn registry_survives_reopen_with_order_and_qos() {
        let storage = MemoryStorage::new();
        let original = context("ws://x", &[("a/#", 0), ("b/#", 2)]);
        {
            let mut store = open(&storage).await;
            store.save("p", original.clone()).await.unwrap();
        }

        let reopened = open(&storage).await;
        let loaded = reopened.load("p");
        assert_eq!(loaded.topic_registry, original.topic_registry);
        let pairs: Vec<_> = loaded
            .topic_registry
            .values()
            .map(|d| (d.filter.as_str(), d.qos.as_u8()))
            .collect();
        assert_eq!(pairs, [("a/#", 0), ("b/#", 2)]);
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn persisted_document_is_array_of_pairs_with_tagged_registry() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        store.save("p", context("ws://x", &[("a/#", 1)])).await.unwrap();

        let raw = storage.get_item(KEY).await.unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc[0][0], "p");
        assert_eq!(doc[0][1]["topicRegistry"]["dataType"], "Map");
        assert_eq!(doc[0][1]["topicRegistry"]["value"][0][0], "a/#");
        assert_eq!(doc[0][1]["connection"]["clientId"], "c1");
    }

    #[tokio::test]
    async fn switch_there_and_back_restores_live_context() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        let before = context("ws://home", &[("home/#", 1)]);
        let mut session = FakeSession {
            live: before.clone(),
            closes: 0,
        };

        store.switch("work", &mut session).await.unwrap();
        assert_eq!(store.active_name(), "work");
        assert_eq!(session.closes, 1);
        assert_ne!(session.live, before);

        session.live.publish_draft.payload = "edited at work".to_string();
        store.switch("default", &mut session).await.unwrap();

        assert_eq!(session.live, before);
        assert_eq!(store.load("work").publish_draft.payload, "edited at work");
    }

    #[tokio::test]
    async fn active_name_is_remembered_across_reopen() {
        let storage = MemoryStorage::new();
        let mut session = FakeSession {
            live: context("ws://x", &[]),
            closes: 0,
        };
        {
            let mut store = open(&storage).await;
            store.switch("lab", &mut session).await.unwrap();
        }
        let reopened = open(&storage).await;
        assert_eq!(reopened.active_name(), "lab");
        assert_eq!(reopened.names(), ["default"]);
    }

    #[tokio::test]
    async fn corrupt_document_is_kept_aside_before_next_save() {
        let storage = MemoryStorage::new();
        let mut good = ContextMap::new();
        good.insert("prod".to_string(), context("ws://prod", &[("p/#", 1)]));
        let document = encode_contexts(&good).unwrap();
        let truncated = &document[..document.len() - 1];
        storage.clone().set_item(KEY, truncated).await.unwrap();

        let mut store = open(&storage).await;
        assert!(store.names().is_empty());
        assert!(!store.is_protected());

        store.save("scratch", context("ws://x", &[])).await.unwrap();
        let backup = storage.get_item(&format!("{KEY}{CORRUPT_KEY_SUFFIX}")).await.unwrap();
        assert_eq!(backup.as_deref(), Some(truncated));
        assert_eq!(open(&storage).await.names(), ["scratch"]);
    }

    #[tokio::test]
    async fn untagged_registry_document_is_treated_as_corrupt() {
        let mut storage = MemoryStorage::new();
        let doc = r#"[["p", {
            "connection": {"url": "ws://x", "clientId": "c"},
            "publishDraft": {"topic": "t", "payload": "", "qos": 0, "retain": false},
            "topicRegistry": {"a/#": {"filter": "a/#", "qos": 0}}
        }]]"#;
        storage.set_item(KEY, doc).await.unwrap();
        let store = open(&storage).await;
        assert!(!store.contains("p"));
        let backup = storage.get_item(&format!("{KEY}{CORRUPT_KEY_SUFFIX}")).await.unwrap();
        assert_eq!(backup.as_deref(), Some(doc));
    }

    /// Reads of the main key fail; every write is counted.
    struct UnreadableStorage {
        writes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KeyValueStorage for UnreadableStorage {
        async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            if key == KEY {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(None)
        }

        async fn set_item(&mut self, _key: &str, _value: &str) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn unreadable_document_is_never_overwritten() {
        let writes = Arc::new(AtomicUsize::new(0));
        let storage = UnreadableStorage {
            writes: writes.clone(),
        };
        let mut store = ContextStore::open(storage, KEY, ContextDefaults::default(), "default").await;
        assert!(store.is_protected());

        let result = store.save("a", context("ws://a", &[])).await;
        assert!(matches!(result, Err(StorageError::Protected(_))));
        assert!(matches!(store.delete("a").await, Err(StorageError::Protected(_))));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_removes_and_persists() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        store.save("a", context("ws://a", &[])).await.unwrap();
        store.save("b", context("ws://b", &[])).await.unwrap();
        store.save("c", context("ws://c", &[])).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(open(&storage).await.names(), ["b", "c"]);
    }

    #[tokio::test]
    async fn save_active_uses_active_name() {
        let storage = MemoryStorage::new();
        let mut store = open(&storage).await;
        assert!(store.save_active(context("ws://live", &[])).await.unwrap());
        assert_eq!(store.load("default").connection.url, "ws://live");
    }
}
