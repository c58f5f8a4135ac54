//! Quality-of-service levels, subscription descriptors and the topic registry.
//!
//! The registry remembers every filter the operator wants to be subscribed to,
//! whether or not a connection is currently open. On every successful connect
//! the session controller replays it in insertion order.

use crate::error::ValidationError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// MQTT delivery guarantee, serialized as the bare integer 0, 1 or 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QualityOfService {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    pub fn as_u8(self) -> u8 {
        match self {
            QualityOfService::AtMostOnce => 0,
            QualityOfService::AtLeastOnce => 1,
            QualityOfService::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<i64> for QualityOfService {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            2 => Ok(QualityOfService::ExactlyOnce),
            other => Err(ValidationError::QosOutOfRange(other)),
        }
    }
}

impl TryFrom<u8> for QualityOfService {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl From<QualityOfService> for u8 {
    fn from(qos: QualityOfService) -> Self {
        qos.as_u8()
    }
}

impl FromStr for QualityOfService {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| ValidationError::QosNotANumber(s.to_string()))?;
        Self::try_from(raw)
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A topic filter together with the QoS it is subscribed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub filter: String,
    pub qos: QualityOfService,
}

impl SubscriptionDescriptor {
    pub fn new(filter: impl Into<String>, qos: QualityOfService) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// Insertion-ordered set of subscriptions keyed by filter.
///
/// Persisted as a tagged association list,
/// `{"dataType": "Map", "value": [[filter, descriptor], ...]}`, so a reader can
/// tell it apart from a plain object and rebuild the ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "TaggedRegistry", into = "TaggedRegistry")]
pub struct TopicRegistry {
    entries: IndexMap<String, SubscriptionDescriptor>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the descriptor, or overwrites the QoS of an existing filter in place.
    pub fn upsert(&mut self, descriptor: SubscriptionDescriptor) {
        self.entries.insert(descriptor.filter.clone(), descriptor);
    }

    pub fn remove(&mut self, filter: &str) -> Option<SubscriptionDescriptor> {
        self.entries.shift_remove(filter)
    }

    pub fn get(&self, filter: &str) -> Option<&SubscriptionDescriptor> {
        self.entries.get(filter)
    }

    /// Descriptors in insertion order. The iterator is `Clone`, so callers can
    /// walk it more than once without collecting.
    pub fn values(&self) -> impl Iterator<Item = &SubscriptionDescriptor> + Clone {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// IndexMap equality ignores order; two registries only match in the same order.
impl PartialEq for TopicRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.entries.iter().eq(other.entries.iter())
    }
}

impl Eq for TopicRegistry {}

impl FromIterator<SubscriptionDescriptor> for TopicRegistry {
    fn from_iter<I: IntoIterator<Item = SubscriptionDescriptor>>(iter: I) -> Self {
        let mut registry = Self::new();
        for descriptor in iter {
            registry.upsert(descriptor);
        }
        registry
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum MapTag {
    Map,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaggedRegistry {
    #[serde(rename = "dataType")]
    data_type: MapTag,
    value: Vec<(String, SubscriptionDescriptor)>,
}

impl From<TaggedRegistry> for TopicRegistry {
    fn from(tagged: TaggedRegistry) -> Self {
        // the pair key is authoritative
        tagged
            .value
            .into_iter()
            .map(|(filter, descriptor)| SubscriptionDescriptor {
                filter,
                qos: descriptor.qos,
            })
            .collect()
    }
}

impl From<TopicRegistry> for TaggedRegistry {
    fn from(registry: TopicRegistry) -> Self {
        TaggedRegistry {
            data_type: MapTag::Map,
            value: registry.entries.into_iter().collect(),
        }
    }
}
