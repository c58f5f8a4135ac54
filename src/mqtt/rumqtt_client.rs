//! [`ProtocolClient`] backed by `rumqttc`.
//!
//! Each connection gets its own `AsyncClient`/`EventLoop` pair. The event loop
//! is polled by a spawned task that translates incoming packets into
//! [`SessionEvent`]s and stops on the first error; there is no reconnect.
//! Closing the handle cancels that task through a `CancellationToken`.

use super::client::{
    ConnectionHandle, ConnectionId, EventSink, ProtocolClient, SessionEvent, TaggedEvent,
};
use super::config::{ConnectOptions, ConnectionParameters, Endpoint, TransportKind};
use super::topics::QualityOfService;
use crate::error::ProtocolError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

impl From<QualityOfService> for QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Default)]
pub struct RumqttClient;

impl RumqttClient {
    pub fn new() -> Self {
        Self
    }
}

fn build_options(
    endpoint: &Endpoint,
    params: &ConnectionParameters,
    options: &ConnectOptions,
) -> Result<MqttOptions, ProtocolError> {
    // rumqttc panics on these instead of returning an error
    if params.client_id.is_empty() || params.client_id.starts_with(' ') {
        return Err(ProtocolError::InvalidClientId(params.client_id.clone()));
    }

    // websocket transports dial the full url, the port argument is unused
    let host = if endpoint.transport.is_websocket() {
        endpoint.url.clone()
    } else {
        endpoint.host.clone()
    };

    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), host, endpoint.port);
    // sub-second keep-alives are rejected by rumqttc
    mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive.as_secs()));
    if !params.username.is_empty() {
        mqtt_options.set_credentials(params.username.clone(), params.password.clone());
    }

    match endpoint.transport {
        TransportKind::Tcp => {}
        TransportKind::Tls => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        TransportKind::Ws => {
            mqtt_options.set_transport(Transport::Ws);
        }
        TransportKind::Wss => {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
    }

    Ok(mqtt_options)
}

impl ProtocolClient for RumqttClient {
    fn connect(
        &mut self,
        id: ConnectionId,
        params: &ConnectionParameters,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn ConnectionHandle>, ProtocolError> {
        let endpoint = Endpoint::parse(&params.url)?;
        let mqtt_options = build_options(&endpoint, params, options)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity.max(1));

        let token = CancellationToken::new();
        tokio::spawn(drive_connection(id, eventloop, events, token.clone()));

        info!(
            "{} opening {} as {:?} (keep-alive {}s)",
            id,
            endpoint.url,
            params.client_id,
            options.keep_alive.as_secs()
        );

        Ok(Box::new(RumqttConnection { id, client, token }))
    }
}

async fn drive_connection(
    id: ConnectionId,
    mut eventloop: EventLoop,
    events: EventSink,
    token: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("{} event loop cancelled", id);
                break;
            }
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("{} connack: {:?}", id, ack.code);
                SessionEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => SessionEvent::Message {
                topic: publish.topic,
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            },
            Ok(other) => {
                trace!("{} event: {:?}", id, other);
                continue;
            }
            Err(e) => {
                warn!("{} connection error: {}", id, e);
                let _ = events.send(TaggedEvent {
                    connection: id,
                    event: SessionEvent::Error(e.to_string()),
                });
                break;
            }
        };

        if events
            .send(TaggedEvent {
                connection: id,
                event,
            })
            .is_err()
        {
            debug!("{} event receiver dropped, stopping", id);
            break;
        }
    }
}

struct RumqttConnection {
    id: ConnectionId,
    client: AsyncClient,
    token: CancellationToken,
}

fn rejected(e: rumqttc::ClientError) -> ProtocolError {
    ProtocolError::Request(e.to_string())
}

impl ConnectionHandle for RumqttConnection {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), ProtocolError> {
        self.client
            .try_publish(topic, qos.into(), retain, payload.as_bytes().to_vec())
            .map_err(rejected)
    }

    fn subscribe(&mut self, filter: &str, qos: QualityOfService) -> Result<(), ProtocolError> {
        self.client.try_subscribe(filter, qos.into()).map_err(rejected)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), ProtocolError> {
        self.client.try_unsubscribe(filter).map_err(rejected)
    }

    fn end(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!("{} disconnect request not queued: {}", self.id, e);
        }
        self.token.cancel();
        info!("{} closed", self.id);
    }
}

impl Drop for RumqttConnection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
