//! # Persistence Module
//!
//! ## Why This Module Exists
//! Operators keep several broker setups around (a local test broker, a staging
//! broker with credentials, ...). Each one is saved as a named
//! [`SessionContext`]: connection parameters, the drafts being edited, the
//! topic registry and the received messages. Switching profiles freezes the
//! live context into the store and seeds the live session from another one.
//!
//! ## Key Abstractions
//! - **SessionContext**: the unit of persistence and of hot-swap
//! - **LiveSession**: the explicit snapshot/close/restore interface the store
//!   uses to talk to whatever owns the live session
//! - **KeyValueStorage**: the durable backend, a plain string key/value store
//!
//! ## Error Handling Strategy
//! Reading is fail-safe: a missing or corrupt document degrades to an empty
//! store instead of preventing startup. Write failures are returned to the
//! caller so they can be shown, the in-memory state is kept either way.

pub mod context_store;
pub mod storage;

pub use context_store::ContextStore;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};

use crate::mqtt::config::ConnectionParameters;
use crate::mqtt::message_manager::{PublishDraft, ReceivedMessage};
use crate::mqtt::topics::{QualityOfService, SubscriptionDescriptor, TopicRegistry};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SUBSCRIBE_DRAFT_TOPIC: &str = "additional/subscribe/topic";

fn default_subscribe_draft() -> SubscriptionDescriptor {
    SubscriptionDescriptor::new(DEFAULT_SUBSCRIBE_DRAFT_TOPIC, QualityOfService::AtMostOnce)
}

/// Everything that makes up one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub connection: ConnectionParameters,
    pub publish_draft: PublishDraft,
    /// Pending "add subscription" input
    #[serde(default = "default_subscribe_draft")]
    pub subscribe_draft: SubscriptionDescriptor,
    pub topic_registry: TopicRegistry,
    #[serde(default)]
    pub received_messages: Vec<ReceivedMessage>,
}

/// Whatever owns the live session, as seen by the context store.
pub trait LiveSession {
    /// Freezes the live state into a context.
    fn snapshot(&self) -> SessionContext;

    /// Closes any open connection.
    fn close(&mut self);

    /// Replaces the live state. Does not open a connection.
    fn restore(&mut self, context: SessionContext);
}

/// Values a fresh context starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDefaults {
    pub endpoint: String,
    pub client_id_prefix: String,
    pub publish_topic: String,
    pub subscribe_topics: Vec<String>,
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:9090/mqtt".to_string(),
            client_id_prefix: "workbench_".to_string(),
            publish_topic: "testtopic/1".to_string(),
            subscribe_topics: vec!["testtopic/#".to_string()],
        }
    }
}

impl ContextDefaults {
    /// Client ids must not collide between sessions, so every fresh context
    /// gets a new random suffix.
    pub fn generate_client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.client_id_prefix, &suffix[..8])
    }

    pub fn build(&self) -> SessionContext {
        SessionContext {
            connection: ConnectionParameters::new(self.endpoint.clone(), self.generate_client_id()),
            publish_draft: PublishDraft::new(self.publish_topic.clone(), ""),
            subscribe_draft: default_subscribe_draft(),
            topic_registry: self
                .subscribe_topics
                .iter()
                .map(|filter| SubscriptionDescriptor::new(filter.clone(), QualityOfService::AtMostOnce))
                .collect(),
            received_messages: Vec::new(),
        }
    }
}
