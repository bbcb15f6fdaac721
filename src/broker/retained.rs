//! Retained message table
//!
//! One message per topic, last write wins. A retained publish with an empty
//! payload clears the topic. The table is independent of sessions.

use std::collections::HashMap;

use crate::broker::message::Message;
use crate::broker::topic::matches_filter;

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: HashMap<String, Message>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear the retained message for `message.topic`.
    pub fn store(&mut self, message: &Message) {
        if message.payload.is_empty() {
            self.messages.remove(&message.topic);
        } else {
            self.messages.insert(message.topic.clone(), message.clone());
        }
    }

    pub fn get(&self, topic: &str) -> Option<&Message> {
        self.messages.get(topic)
    }

    /// Retained messages whose topic matches `filter`, ordered by topic.
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let mut matched: Vec<Message> = self
            .messages
            .values()
            .filter(|m| matches_filter(filter, &m.topic))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        matched
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
