use super::topics::QualityOfService;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

const PREVIEW_CHARS: usize = 40;

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Local>>,
}

impl ReceivedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: None,
        }
    }

    /// Stamps the message with the current local time.
    pub fn arrived_now(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            received_at: Some(Local::now()),
            ..Self::new(topic, payload)
        }
    }

    pub fn render(&self) -> String {
        match self.received_at {
            Some(ts) => format!("{} {}: {}", ts.format("%H:%M:%S"), self.topic, self.payload),
            None => format!("{}: {}", self.topic, self.payload),
        }
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(PREVIEW_CHARS).collect();
        if preview.len() < self.payload.len() {
            write!(f, "{} - {}...", self.topic, preview)
        } else {
            write!(f, "{} - {}", self.topic, preview)
        }
    }
}

/// The next message the operator intends to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDraft {
    pub topic: String,
    pub payload: String,
    pub qos: QualityOfService,
    pub retain: bool,
}

impl PublishDraft {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QualityOfService::AtMostOnce,
            retain: false,
        }
    }

    /// Empty retained publish that clears the retained message at `topic`.
    pub fn clear_retained(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: String::new(),
            qos: QualityOfService::AtMostOnce,
            retain: true,
        }
    }
}

/// Received messages in arrival order.
///
/// Unbounded unless a retention cap is configured, in which case the oldest
/// entries are evicted first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: VecDeque<ReceivedMessage>,
    max_messages: Option<usize>,
}

impl MessageLog {
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            messages: VecDeque::new(),
            max_messages,
        }
    }

    pub fn with_messages(messages: Vec<ReceivedMessage>, max_messages: Option<usize>) -> Self {
        let mut log = Self::new(max_messages);
        for message in messages {
            log.append(message);
        }
        log
    }

    pub fn append(&mut self, message: ReceivedMessage) {
        if let Some(cap) = self.max_messages {
            if cap == 0 {
                return;
            }
            while self.messages.len() >= cap {
                self.messages.pop_front();
            }
        }
        self.messages.push_back(message);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceivedMessage> + Clone {
        self.messages.iter()
    }

    /// The newest `count` messages, oldest first, without walking the rest.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &ReceivedMessage> + Clone {
        let start = self.messages.len().saturating_sub(count);
        self.messages.range(start..)
    }

    pub fn last(&self) -> Option<&ReceivedMessage> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ReceivedMessage> {
        self.messages.iter().cloned().collect()
    }
}
