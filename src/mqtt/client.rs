//! The surface the session controller expects from a protocol client.
//!
//! A [`ProtocolClient`] opens connections; each connection is driven by the
//! client on its own and reports back through an [`EventSink`]. Every event is
//! tagged with the [`ConnectionId`] it belongs to, so the controller can drop
//! late events from a connection it has already abandoned.

use super::config::{ConnectOptions, ConnectionParameters};
use super::topics::QualityOfService;
use crate::error::ProtocolError;
use std::fmt;
use tokio::sync::mpsc;

/// Monotonic identifier of one opened connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected,
    /// Connection failed or broke; the message is shown to the operator
    Error(String),
    Message { topic: String, payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub connection: ConnectionId,
    pub event: SessionEvent,
}

pub type EventSink = mpsc::UnboundedSender<TaggedEvent>;
pub type EventStream = mpsc::UnboundedReceiver<TaggedEvent>;

/// Opens protocol connections.
pub trait ProtocolClient: Send {
    /// Starts connecting and returns immediately. The outcome arrives later as
    /// a `Connected` or `Error` event on `events`.
    fn connect(
        &mut self,
        id: ConnectionId,
        params: &ConnectionParameters,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn ConnectionHandle>, ProtocolError>;
}

/// Commands on one open connection. All of them are fire-and-forget.
pub trait ConnectionHandle: Send {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QualityOfService,
        retain: bool,
    ) -> Result<(), ProtocolError>;

    fn subscribe(&mut self, filter: &str, qos: QualityOfService) -> Result<(), ProtocolError>;

    fn unsubscribe(&mut self, filter: &str) -> Result<(), ProtocolError>;

    /// Closes the connection and stops its event source. Events already in
    /// flight may still arrive and are dropped by the controller.
    fn end(&mut self);
}
