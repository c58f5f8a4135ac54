//! The session runtime: one task that owns the session controller and the
//! context store and applies everything that happens to them in order.
//!
//! Operator intents, connection events, the connect deadline and the autosave
//! tick are all multiplexed with `tokio::select!`. Each one is handled to
//! completion before the next is looked at, so the state needs no locks.
//! Callers talk to the task through a [`RuntimeClient`]; intents that produce
//! an answer carry a oneshot sender for it.

use crate::error::{RuntimeError, SessionError, StorageError};
use crate::mqtt::client::{EventStream, ProtocolClient};
use crate::mqtt::config::ConnectionParameters;
use crate::mqtt::message_manager::{PublishDraft, ReceivedMessage};
use crate::mqtt::mqtt_handler::{SessionController, SessionSettings, SessionStatus};
use crate::mqtt::topics::{QualityOfService, SubscriptionDescriptor};
use crate::persistence::{ContextStore, KeyValueStorage, LiveSession, SessionContext};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const INTENT_CAPACITY: usize = 32;
const MESSAGE_FEED_CAPACITY: usize = 256;

macro_rules! respond {
    ($response_tx:expr, $result:expr) => {
        if $response_tx.send($result).is_err() {
            debug!("Requester went away before the response was sent");
        }
    };
}

/// What the UI can ask of the runtime.
#[derive(Debug)]
pub enum Intent {
    Connect,
    Disconnect,
    /// Publishes the live publish draft
    Publish,
    /// Clears the retained message at `topic`, or at the draft topic
    ClearRetained {
        topic: Option<String>,
    },
    Subscribe(SubscriptionDescriptor),
    /// Subscribes the live subscribe draft
    SubscribeDraft,
    Unsubscribe(String),
    UpdateConnection {
        params: ConnectionParameters,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Closes any connection, then replaces the connection parameters
    Reconfigure(ConnectionParameters),
    UpdatePublishDraft(PublishDraft),
    /// Changes one field of the publish draft
    EditPublishDraft(DraftEdit),
    UpdateSubscribeDraft(SubscriptionDescriptor),
    SaveContext {
        name: String,
        response_tx: oneshot::Sender<Result<bool, StorageError>>,
    },
    SwitchContext {
        name: String,
        response_tx: oneshot::Sender<Result<bool, StorageError>>,
    },
    DeleteContext {
        name: String,
        response_tx: oneshot::Sender<Result<bool, StorageError>>,
    },
    ListContexts {
        response_tx: oneshot::Sender<ContextListing>,
    },
    Status {
        response_tx: oneshot::Sender<StatusReport>,
    },
    Connection {
        response_tx: oneshot::Sender<ConnectionParameters>,
    },
    CurrentDraft {
        response_tx: oneshot::Sender<PublishDraft>,
    },
    Topics {
        response_tx: oneshot::Sender<Vec<SubscriptionDescriptor>>,
    },
    /// The newest `count` received messages, oldest first
    RecentMessages {
        count: usize,
        response_tx: oneshot::Sender<Vec<ReceivedMessage>>,
    },
    /// The full live context, message log included
    Snapshot {
        response_tx: oneshot::Sender<SessionContext>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftEdit {
    Topic(String),
    Payload(String),
    Qos(QualityOfService),
    Retain(bool),
}

impl DraftEdit {
    pub fn apply(self, draft: &mut PublishDraft) {
        match self {
            DraftEdit::Topic(topic) => draft.topic = topic,
            DraftEdit::Payload(payload) => draft.payload = payload,
            DraftEdit::Qos(qos) => draft.qos = qos,
            DraftEdit::Retain(retain) => draft.retain = retain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextListing {
    pub active: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub active_context: String,
    pub url: String,
    pub status: SessionStatus,
}

/// Cloneable sender side of the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    intents: mpsc::Sender<Intent>,
}

impl RuntimeClient {
    pub async fn send(&self, intent: Intent) -> Result<(), RuntimeError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| RuntimeError::Closed)
    }

    async fn request<T>(
        &self,
        intent: impl FnOnce(oneshot::Sender<T>) -> Intent,
    ) -> Result<T, RuntimeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(intent(response_tx)).await?;
        response_rx.await.map_err(|_| RuntimeError::Closed)
    }

    pub async fn update_connection(
        &self,
        params: ConnectionParameters,
    ) -> Result<Result<(), SessionError>, RuntimeError> {
        self.request(|response_tx| Intent::UpdateConnection {
            params,
            response_tx,
        })
        .await
    }

    pub async fn save_context(
        &self,
        name: impl Into<String>,
    ) -> Result<Result<bool, StorageError>, RuntimeError> {
        let name = name.into();
        self.request(|response_tx| Intent::SaveContext { name, response_tx })
            .await
    }

    pub async fn switch_context(
        &self,
        name: impl Into<String>,
    ) -> Result<Result<bool, StorageError>, RuntimeError> {
        let name = name.into();
        self.request(|response_tx| Intent::SwitchContext { name, response_tx })
            .await
    }

    pub async fn delete_context(
        &self,
        name: impl Into<String>,
    ) -> Result<Result<bool, StorageError>, RuntimeError> {
        let name = name.into();
        self.request(|response_tx| Intent::DeleteContext { name, response_tx })
            .await
    }

    pub async fn list_contexts(&self) -> Result<ContextListing, RuntimeError> {
        self.request(|response_tx| Intent::ListContexts { response_tx })
            .await
    }

    pub async fn status(&self) -> Result<StatusReport, RuntimeError> {
        self.request(|response_tx| Intent::Status { response_tx })
            .await
    }

    pub async fn connection(&self) -> Result<ConnectionParameters, RuntimeError> {
        self.request(|response_tx| Intent::Connection { response_tx })
            .await
    }

    pub async fn publish_draft(&self) -> Result<PublishDraft, RuntimeError> {
        self.request(|response_tx| Intent::CurrentDraft { response_tx })
            .await
    }

    pub async fn topics(&self) -> Result<Vec<SubscriptionDescriptor>, RuntimeError> {
        self.request(|response_tx| Intent::Topics { response_tx })
            .await
    }

    pub async fn recent_messages(&self, count: usize) -> Result<Vec<ReceivedMessage>, RuntimeError> {
        self.request(|response_tx| Intent::RecentMessages { count, response_tx })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionContext, RuntimeError> {
        self.request(|response_tx| Intent::Snapshot { response_tx })
            .await
    }
}

/// Everything a front end needs to drive and observe a runtime.
pub struct RuntimeHandle {
    pub client: RuntimeClient,
    pub status: watch::Receiver<StatusReport>,
    /// Messages as they arrive; dropped when the receiver falls behind
    pub messages: mpsc::Receiver<ReceivedMessage>,
}

pub struct ClientRuntime<S: KeyValueStorage> {
    controller: SessionController,
    events: EventStream,
    store: ContextStore<S>,
    intents: mpsc::Receiver<Intent>,
    status_tx: watch::Sender<StatusReport>,
    messages_tx: mpsc::Sender<ReceivedMessage>,
    autosave: Option<Duration>,
}

impl<S: KeyValueStorage + 'static> ClientRuntime<S> {
    /// Builds a runtime whose live session starts from the store's active context.
    pub fn new(
        client: Box<dyn ProtocolClient>,
        store: ContextStore<S>,
        settings: SessionSettings,
        autosave: Option<Duration>,
    ) -> (Self, RuntimeHandle) {
        let (controller, events) = SessionController::new(client, settings, store.initial_context());
        let (intents_tx, intents) = mpsc::channel(INTENT_CAPACITY);
        let (messages_tx, messages) = mpsc::channel(MESSAGE_FEED_CAPACITY);

        let initial = StatusReport {
            active_context: store.active_name().to_string(),
            url: controller.connection().url.clone(),
            status: controller.status().clone(),
        };
        let (status_tx, status) = watch::channel(initial);

        let runtime = Self {
            controller,
            events,
            store,
            intents,
            status_tx,
            messages_tx,
            autosave,
        };
        let handle = RuntimeHandle {
            client: RuntimeClient { intents: intents_tx },
            status,
            messages,
        };
        (runtime, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Session runtime started with context {}", self.store.active_name());
        let mut autosave = self.autosave.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let deadline = self.controller.connect_deadline();
            tokio::select! {
                intent = self.intents.recv() => {
                    let Some(intent) = intent else {
                        debug!("All runtime clients dropped");
                        break;
                    };
                    if self.handle_intent(intent).await.is_break() {
                        break;
                    }
                }
                Some(tagged) = self.events.recv() => {
                    if let Some(message) = self.controller.handle_event(tagged) {
                        self.forward(message);
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    self.controller.expire_connect_attempt(Instant::now());
                }
                _ = autosave_tick(&mut autosave) => {
                    self.save_live("autosave").await;
                }
            }
            self.publish_status();
        }

        self.shutdown().await;
    }

    async fn handle_intent(&mut self, intent: Intent) -> ControlFlow<()> {
        match intent {
            Intent::Connect => {
                let params = self.controller.connection().clone();
                self.controller.connect(params);
            }
            Intent::Disconnect => self.controller.disconnect(),
            Intent::Publish => self.controller.publish_current_draft(),
            Intent::ClearRetained { topic } => {
                let topic = topic.unwrap_or_else(|| self.controller.publish_draft().topic.clone());
                self.controller.publish_clear(&topic);
            }
            Intent::Subscribe(descriptor) => self.controller.subscribe(descriptor),
            Intent::SubscribeDraft => {
                let descriptor = self.controller.subscribe_draft().clone();
                self.controller.subscribe(descriptor);
            }
            Intent::Unsubscribe(filter) => self.controller.unsubscribe(&filter),
            Intent::UpdateConnection {
                params,
                response_tx,
            } => {
                respond!(response_tx, self.controller.update_connection(params));
            }
            Intent::Reconfigure(params) => self.controller.reconfigure(params),
            Intent::UpdatePublishDraft(draft) => self.controller.set_publish_draft(draft),
            Intent::EditPublishDraft(edit) => {
                let mut draft = self.controller.publish_draft().clone();
                edit.apply(&mut draft);
                self.controller.set_publish_draft(draft);
            }
            Intent::UpdateSubscribeDraft(draft) => self.controller.set_subscribe_draft(draft),
            Intent::SaveContext { name, response_tx } => {
                let result = self.store.save(&name, self.controller.snapshot()).await;
                if let Err(e) = &result {
                    error!("Saving context {} failed: {}", name, e);
                }
                respond!(response_tx, result);
            }
            Intent::SwitchContext { name, response_tx } => {
                let result = self.store.switch(&name, &mut self.controller).await;
                if let Err(e) = &result {
                    error!("Switching to context {} could not persist: {}", name, e);
                }
                respond!(response_tx, result);
            }
            Intent::DeleteContext { name, response_tx } => {
                let result = self.store.delete(&name).await;
                if let Err(e) = &result {
                    error!("Deleting context {} failed: {}", name, e);
                }
                respond!(response_tx, result);
            }
            Intent::ListContexts { response_tx } => {
                respond!(
                    response_tx,
                    ContextListing {
                        active: self.store.active_name().to_string(),
                        names: self.store.names(),
                    }
                );
            }
            Intent::Status { response_tx } => respond!(response_tx, self.status_report()),
            Intent::Connection { response_tx } => {
                respond!(response_tx, self.controller.connection().clone());
            }
            Intent::CurrentDraft { response_tx } => {
                respond!(response_tx, self.controller.publish_draft().clone());
            }
            Intent::Topics { response_tx } => {
                respond!(response_tx, self.controller.registry().values().cloned().collect());
            }
            Intent::RecentMessages { count, response_tx } => {
                respond!(
                    response_tx,
                    self.controller.messages().recent(count).cloned().collect()
                );
            }
            Intent::Snapshot { response_tx } => respond!(response_tx, self.controller.snapshot()),
            Intent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn forward(&self, message: ReceivedMessage) {
        match self.messages_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                debug!("Message feed full, not forwarding message on {}", message.topic);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn save_live(&mut self, reason: &str) {
        match self.store.save_active(self.controller.snapshot()).await {
            Ok(_) => debug!("Live context saved ({})", reason),
            Err(e) => warn!("Could not save live context ({}): {}", reason, e),
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            active_context: self.store.active_name().to_string(),
            url: self.controller.connection().url.clone(),
            status: self.controller.status().clone(),
        }
    }

    fn publish_status(&self) {
        let report = self.status_report();
        self.status_tx.send_if_modified(|current| {
            if *current == report {
                false
            } else {
                *current = report;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        if self.autosave.is_some() {
            self.save_live("shutdown").await;
        }
        self.controller.close();
        self.publish_status();
        info!("Session runtime stopped");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn autosave_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
