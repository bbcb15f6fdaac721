//! Message definitions for the broker
//!
//! `Message` is the broker's internal representation of an application
//! message, independent of the PUBLISH packet it arrived in or leaves in.
//!
//! Notes on fields:
//! - `topic`: publish topic used for routing
//! - `payload`: opaque bytes
//! - `qos`: the QoS the message was published with (or, for a copy queued for
//!   a subscriber, the QoS it will be delivered with)
//! - `retain`: the retain flag to put on the wire
//! - `timestamp`: milliseconds since UNIX epoch; set when the broker accepts it

use bytes::Bytes;

use crate::codec::{LastWill, Publish, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub timestamp: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn from_publish(publish: Publish) -> Self {
        Self::new(publish.topic, publish.payload, publish.qos, publish.retain)
    }

    pub fn from_will(will: LastWill) -> Self {
        Self::new(will.topic, will.message, will.qos, will.retain)
    }

    /// Copy of this message as it should go out to one subscriber.
    pub fn for_delivery(&self, qos: QoS, retain: bool) -> Self {
        Self {
            qos,
            retain,
            ..self.clone()
        }
    }

    pub fn to_publish(&self, pkid: u16, dup: bool) -> Publish {
        Publish {
            dup,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            pkid,
            payload: self.payload.clone(),
        }
    }
}
