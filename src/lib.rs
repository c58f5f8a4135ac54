//! Interactive MQTT publish/subscribe workbench.
//!
//! One live session talks to one broker at a time. Named session contexts
//! (connection parameters, drafts, subscriptions and received messages) can be
//! saved, switched and restored across restarts.

pub mod config;
pub mod console;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod runtime;
