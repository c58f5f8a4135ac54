//! Scripted protocol client for driving a runtime without a broker.

#![allow(dead_code)]

use mqtt_workbench::error::ProtocolError;
use mqtt_workbench::mqtt::client::EventSink;
use mqtt_workbench::mqtt::{
    ConnectOptions, ConnectionHandle, ConnectionId, ConnectionParameters, ConnectionState,
    ProtocolClient, QualityOfService, SessionEvent, TaggedEvent,
};
use mqtt_workbench::persistence::{ContextDefaults, ContextStore, KeyValueStorage, MemoryStorage};
use mqtt_workbench::mqtt::SessionSettings;
use mqtt_workbench::runtime::{ClientRuntime, RuntimeHandle, StatusReport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const KEY: &str = "contexts";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect(ConnectionId, String),
    Publish {
        id: ConnectionId,
        topic: String,
        payload: String,
        qos: QualityOfService,
        retain: bool,
    },
    Subscribe(ConnectionId, String, QualityOfService),
    Unsubscribe(ConnectionId, String),
    End(ConnectionId),
}

/// Shared view of everything the runtime asked the client to do.
#[derive(Clone, Default)]
pub struct Script {
    calls: Arc<Mutex<Vec<Call>>>,
    sinks: Arc<Mutex<Vec<(ConnectionId, EventSink)>>>,
}

impl Script {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// Delivers `event` as if connection `id` had produced it.
    pub fn emit(&self, id: ConnectionId, event: SessionEvent) {
        let sinks = self.sinks.lock().unwrap();
        let (_, sink) = sinks
            .iter()
            .find(|(known, _)| *known == id)
            .expect("connection was opened");
        sink.send(TaggedEvent {
            connection: id,
            event,
        })
        .unwrap();
    }

    pub fn message(&self, id: ConnectionId, topic: &str, payload: &str) {
        self.emit(
            id,
            SessionEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            },
        );
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sinks.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

pub struct ScriptedClient {
    script: Script,
    auto_connack: bool,
}

impl ScriptedClient {
    pub fn new(script: Script, auto_connack: bool) -> Self {
        Self {
            script,
            auto_connack,
        }
    }
}

impl ProtocolClient for ScriptedClient {
    fn connect(
        &mut self,
        id: ConnectionId,
        params: &ConnectionParameters,
        _options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn ConnectionHandle>, ProtocolError> {
        self.script.push(Call::Connect(id, params.url.clone()));
        if self.auto_connack {
            events
                .send(TaggedEvent {
                    connection: id,
                    event: SessionEvent::Connected,
                })
                .unwrap();
        }
        self.script.sinks.lock().unwrap().push((id, events));
        Ok(Box::new(ScriptedHandle {
            id,
            script: self.script.clone(),
        }))
    }
}

struct ScriptedHandle {
    id: ConnectionId,
    script: Script,
}

impl ConnectionHandle for ScriptedHandle {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        self.script.push(Call::Publish {
            id: self.id,
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, qos: QualityOfService) -> Result<(), ProtocolError> {
        self.script.push(Call::Subscribe(self.id, filter.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), ProtocolError> {
        self.script.push(Call::Unsubscribe(self.id, filter.to_string()));
        Ok(())
    }

    fn end(&mut self) {
        self.script.push(Call::End(self.id));
    }
}

pub struct Harness {
    pub handle: RuntimeHandle,
    pub task: JoinHandle<()>,
    pub script: Script,
}

pub fn defaults() -> ContextDefaults {
    ContextDefaults {
        endpoint: "mqtt://broker.test:1883".to_string(),
        ..ContextDefaults::default()
    }
}

pub async fn start_with<S: KeyValueStorage + 'static>(
    storage: S,
    settings: SessionSettings,
    autosave: Option<Duration>,
    auto_connack: bool,
) -> Harness {
    let script = Script::default();
    let store = ContextStore::open(storage, KEY, defaults(), "default").await;
    let client = ScriptedClient::new(script.clone(), auto_connack);
    let (runtime, handle) = ClientRuntime::new(Box::new(client), store, settings, autosave);
    Harness {
        handle,
        task: runtime.spawn(),
        script,
    }
}

pub async fn start() -> Harness {
    start_with(MemoryStorage::new(), SessionSettings::default(), None, true).await
}

impl Harness {
    pub async fn wait_for_state(&mut self, state: ConnectionState) -> StatusReport {
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            self.handle
                .status
                .wait_for(|report| report.status.connection_state == state),
        )
        .await
        .expect("state reached in time")
        .expect("runtime alive");
        (*report).clone()
    }

    pub async fn connect(&mut self) -> ConnectionId {
        self.handle
            .client
            .send(mqtt_workbench::runtime::Intent::Connect)
            .await
            .unwrap();
        self.wait_for_state(ConnectionState::Connected).await;
        *self.script.connection_ids().last().unwrap()
    }

    pub async fn next_message(&mut self) -> mqtt_workbench::mqtt::ReceivedMessage {
        tokio::time::timeout(Duration::from_secs(5), self.handle.messages.recv())
            .await
            .expect("message forwarded in time")
            .expect("feed open")
    }

    pub async fn shutdown(self) {
        self.handle
            .client
            .send(mqtt_workbench::runtime::Intent::Shutdown)
            .await
            .unwrap();
        self.task.await.unwrap();
    }
}
