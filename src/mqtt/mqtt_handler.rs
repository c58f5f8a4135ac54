//! Session controller: owns the one live protocol connection and the live
//! session state (connection parameters, drafts, topic registry, message log).
//!
//! # State Machine
//!
//! ```text
//!               connect()                 Connected event
//! Disconnected ───────────► Connecting ─────────────────► Connected
//!      ▲                        │                             │
//!      │ disconnect()           │ Error event / timeout       │ Error event
//!      │                        ▼                             │
//!      └──────────────────── Errored ◄────────────────────────┘
//! ```
//!
//! `disconnect()` is valid from every state and always lands in
//! `Disconnected`. `connect()` tears down any open or opening connection
//! before starting a new one, so at most one connection exists at a time.
//!
//! Events carry the id of the connection that produced them. Anything that
//! does not belong to the current connection is dropped, which keeps a closed
//! or replaced connection from touching the message log.

use super::client::{
    ConnectionHandle, ConnectionId, EventSink, EventStream, ProtocolClient, SessionEvent,
    TaggedEvent,
};
use super::config::{ConnectOptions, ConnectionParameters};
use super::message_manager::{MessageLog, PublishDraft, ReceivedMessage};
use super::topics::{SubscriptionDescriptor, TopicRegistry};
use crate::error::SessionError;
use crate::persistence::{LiveSession, SessionContext};
use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const CONNECT_TIMEOUT_MESSAGE: &str = "connection attempt timed out";

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Errored => "errored",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    /// Last connection error, kept until the next successful connect
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Settings that shape every connection a controller opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect: ConnectOptions,
    /// `None` leaves a connect attempt pending until the client reports back
    pub connect_timeout: Option<Duration>,
    pub max_log_messages: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            connect_timeout: Some(Duration::from_secs(30)),
            max_log_messages: None,
        }
    }
}

struct ActiveConnection {
    id: ConnectionId,
    handle: Box<dyn ConnectionHandle>,
    started: Instant,
}

pub struct SessionController {
    client: Box<dyn ProtocolClient>,
    settings: SessionSettings,
    events: EventSink,
    next_id: u64,
    active: Option<ActiveConnection>,
    status: SessionStatus,
    connection: ConnectionParameters,
    publish_draft: PublishDraft,
    subscribe_draft: SubscriptionDescriptor,
    registry: TopicRegistry,
    log: MessageLog,
}

impl SessionController {
    /// Creates a disconnected controller seeded with `context`. The returned
    /// stream yields the events of every connection the controller opens and
    /// must be fed back through [`SessionController::handle_event`].
    pub fn new(
        client: Box<dyn ProtocolClient>,
        settings: SessionSettings,
        context: SessionContext,
    ) -> (Self, EventStream) {
        let (events, stream) = mpsc::unbounded_channel();
        let log = MessageLog::with_messages(context.received_messages, settings.max_log_messages);
        let controller = Self {
            client,
            events,
            next_id: 0,
            active: None,
            status: SessionStatus::default(),
            connection: context.connection,
            publish_draft: context.publish_draft,
            subscribe_draft: context.subscribe_draft,
            registry: context.topic_registry,
            log,
            settings,
        };
        (controller, stream)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.connection_state
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn connection(&self) -> &ConnectionParameters {
        &self.connection
    }

    pub fn publish_draft(&self) -> &PublishDraft {
        &self.publish_draft
    }

    pub fn subscribe_draft(&self) -> &SubscriptionDescriptor {
        &self.subscribe_draft
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn messages(&self) -> &MessageLog {
        &self.log
    }

    /// Id of the open or opening connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Opens a connection with `params`, replacing any current one.
    pub fn connect(&mut self, params: ConnectionParameters) {
        if self.active.is_some() {
            info!("Closing current connection before reconnecting");
            self.close_active();
        }
        self.connection = params;

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.status.connection_state = ConnectionState::Connecting;
        info!("{} connecting to {}", id, self.connection.url);

        match self
            .client
            .connect(id, &self.connection, &self.settings.connect, self.events.clone())
        {
            Ok(handle) => {
                self.active = Some(ActiveConnection {
                    id,
                    handle,
                    started: Instant::now(),
                });
            }
            Err(e) => {
                error!("{} could not be opened: {}", id, e);
                self.status.last_error = Some(e.to_string());
                self.status.connection_state = ConnectionState::Errored;
            }
        }
    }

    /// Closes the current connection, if any. Always ends in `Disconnected`.
    pub fn disconnect(&mut self) {
        if self.active.is_some() {
            info!("Disconnecting from {}", self.connection.url);
            self.close_active();
        }
        self.status.connection_state = ConnectionState::Disconnected;
    }

    fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.handle.end();
        }
    }

    fn fail(&mut self, message: String) {
        warn!("Connection to {} failed: {}", self.connection.url, message);
        self.close_active();
        self.status.last_error = Some(message);
        self.status.connection_state = ConnectionState::Errored;
    }

    /// Applies one connection event. Returns the appended message for
    /// `Message` events so callers can forward it to a display.
    pub fn handle_event(&mut self, tagged: TaggedEvent) -> Option<ReceivedMessage> {
        if self.connection_id() != Some(tagged.connection) {
            debug!("Dropping event from stale {}", tagged.connection);
            return None;
        }

        match tagged.event {
            SessionEvent::Connected => {
                if self.status.connection_state != ConnectionState::Connecting {
                    debug!(
                        "Ignoring connected event in state {}",
                        self.status.connection_state
                    );
                    return None;
                }
                self.resubscribe();
                self.status.last_error = None;
                self.status.connection_state = ConnectionState::Connected;
                info!(
                    "{} connected to {} ({} subscriptions)",
                    tagged.connection,
                    self.connection.url,
                    self.registry.len()
                );
                None
            }
            SessionEvent::Error(message) => {
                self.fail(message);
                None
            }
            SessionEvent::Message { topic, payload } => {
                if self.status.connection_state != ConnectionState::Connected {
                    debug!("Ignoring message on {} before connect completed", topic);
                    return None;
                }
                let message = ReceivedMessage::arrived_now(topic, payload);
                debug!("Received {}", message);
                self.log.append(message.clone());
                self.status.messages_received += 1;
                self.status.last_activity = message.received_at;
                Some(message)
            }
        }
    }

    fn resubscribe(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        for descriptor in self.registry.values() {
            debug!("Subscribing {} (QoS {})", descriptor.filter, descriptor.qos);
            if let Err(e) = active.handle.subscribe(&descriptor.filter, descriptor.qos) {
                warn!("Subscribe to {} failed: {}", descriptor.filter, e);
            }
        }
    }

    /// Instant at which a pending connect attempt times out.
    pub fn connect_deadline(&self) -> Option<Instant> {
        if self.status.connection_state != ConnectionState::Connecting {
            return None;
        }
        let timeout = self.settings.connect_timeout?;
        self.active.as_ref().map(|active| active.started + timeout)
    }

    /// Fails a connect attempt whose deadline has passed. Returns whether it did.
    pub fn expire_connect_attempt(&mut self, now: Instant) -> bool {
        match self.connect_deadline() {
            Some(deadline) if now >= deadline => {
                self.fail(CONNECT_TIMEOUT_MESSAGE.to_string());
                true
            }
            _ => false,
        }
    }

    /// Sends `draft`. Silently skipped unless connected.
    pub fn publish(&mut self, draft: &PublishDraft) {
        if self.status.connection_state != ConnectionState::Connected {
            debug!("Not connected, skipping publish to {}", draft.topic);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active
            .handle
            .publish(&draft.topic, &draft.payload, draft.qos, draft.retain)
        {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(Local::now());
                debug!(
                    "Published {} bytes to {} (QoS {}, retain {})",
                    draft.payload.len(),
                    draft.topic,
                    draft.qos,
                    draft.retain
                );
            }
            Err(e) => warn!("Publish to {} failed: {}", draft.topic, e),
        }
    }

    /// Publishes the live draft without clearing it.
    pub fn publish_current_draft(&mut self) {
        let draft = self.publish_draft.clone();
        self.publish(&draft);
    }

    /// Clears the retained message at `topic`.
    pub fn publish_clear(&mut self, topic: &str) {
        self.publish(&PublishDraft::clear_retained(topic));
    }

    /// Records the subscription and forwards it when connected.
    pub fn subscribe(&mut self, descriptor: SubscriptionDescriptor) {
        if self.status.connection_state == ConnectionState::Connected {
            if let Some(active) = self.active.as_mut() {
                if let Err(e) = active.handle.subscribe(&descriptor.filter, descriptor.qos) {
                    warn!("Subscribe to {} failed: {}", descriptor.filter, e);
                }
            }
        } else {
            debug!("Not connected, {} will be subscribed on connect", descriptor.filter);
        }
        self.registry.upsert(descriptor);
    }

    /// Forgets the subscription and forwards the unsubscribe when connected.
    pub fn unsubscribe(&mut self, filter: &str) {
        if self.status.connection_state == ConnectionState::Connected {
            if let Some(active) = self.active.as_mut() {
                if let Err(e) = active.handle.unsubscribe(filter) {
                    warn!("Unsubscribe from {} failed: {}", filter, e);
                }
            }
        }
        self.registry.remove(filter);
    }

    /// Replaces the connection parameters while nothing is open.
    pub fn update_connection(&mut self, params: ConnectionParameters) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::ConnectionActive(match self.state() {
                ConnectionState::Connecting => "opening",
                _ => "open",
            }));
        }
        self.connection = params;
        Ok(())
    }

    /// Closes any connection and then replaces the connection parameters.
    pub fn reconfigure(&mut self, params: ConnectionParameters) {
        self.disconnect();
        self.connection = params;
    }

    pub fn set_publish_draft(&mut self, draft: PublishDraft) {
        self.publish_draft = draft;
    }

    pub fn set_subscribe_draft(&mut self, draft: SubscriptionDescriptor) {
        self.subscribe_draft = draft;
    }
}

impl LiveSession for SessionController {
    fn snapshot(&self) -> SessionContext {
        SessionContext {
            connection: self.connection.clone(),
            publish_draft: self.publish_draft.clone(),
            subscribe_draft: self.subscribe_draft.clone(),
            topic_registry: self.registry.clone(),
            received_messages: self.log.to_vec(),
        }
    }

    fn close(&mut self) {
        self.disconnect();
    }

    fn restore(&mut self, context: SessionContext) {
        self.disconnect();
        self.connection = context.connection;
        self.publish_draft = context.publish_draft;
        self.subscribe_draft = context.subscribe_draft;
        self.registry = context.topic_registry;
        self.log = MessageLog::with_messages(context.received_messages, self.settings.max_log_messages);
        self.status = SessionStatus::default();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close_active();
    }
}
