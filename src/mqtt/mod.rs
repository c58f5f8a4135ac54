//! # MQTT Integration Module
//!
//! Everything that touches the publish/subscribe side of the workbench: the
//! live session state machine, the data it carries, and the adapter that maps
//! it onto `rumqttc`.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── client.rs           - ProtocolClient / ConnectionHandle seam and events
//! ├── config.rs           - Connection parameters, endpoint parsing, keep-alive
//! ├── message_manager.rs  - Publish drafts, received messages, message log
//! ├── mqtt_handler.rs     - Session controller state machine
//! ├── rumqtt_client.rs    - rumqttc-backed ProtocolClient
//! └── topics.rs           - QoS, subscription descriptors, topic registry
//! ```
//!
//! ## Design Philosophy
//!
//! - The wire protocol is someone else's job. The controller only sees the
//!   command/event surface in `client.rs`, which keeps it testable without a
//!   broker.
//! - One connection at a time, owned by the controller. Commands are
//!   fire-and-forget; outcomes come back later as events.
//! - No automatic retry. A failed connect is shown to the operator, who
//!   decides whether to try again.

pub mod client;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod rumqtt_client;
pub mod topics;

pub use client::{ConnectionHandle, ConnectionId, ProtocolClient, SessionEvent, TaggedEvent};
pub use config::{ConnectOptions, ConnectionParameters, KEEP_ALIVE};
pub use message_manager::{MessageLog, PublishDraft, ReceivedMessage};
pub use mqtt_handler::{ConnectionState, SessionController, SessionSettings, SessionStatus};
pub use rumqtt_client::RumqttClient;
pub use topics::{QualityOfService, SubscriptionDescriptor, TopicRegistry};
