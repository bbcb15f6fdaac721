//! Subscription tree
//!
//! Topic filters are stored in a trie keyed by topic level. A `+` level is an
//! ordinary child keyed `"+"`; a trailing `#` is recorded on the node where it
//! appears, so `sport/#` lives on the `sport` node and also matches `sport`
//! itself. Matching a publish topic walks its levels once, following the exact
//! child and the `+` child at each step, which keeps the cost proportional to
//! topic depth rather than to the number of subscribers.
//!
//! Subscribers are referenced by client id only. The registry owns sessions;
//! an id found here without a live session is stale and gets pruned.
//!
//! Concurrency note: callers must synchronize access (the broker lock).

use std::collections::HashMap;

use crate::codec::QoS;

pub type ClientId = String;

#[derive(Debug, Default)]
struct TopicNode {
    /// Filters ending exactly at this node.
    subscribers: HashMap<ClientId, QoS>,
    /// Filters ending in `#` at this node.
    multi_wildcard: HashMap<ClientId, QoS>,
    children: HashMap<String, TopicNode>,
}

impl TopicNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.multi_wildcard.is_empty() && self.children.is_empty()
    }

    fn insert(&mut self, levels: &[&str], client_id: &str, qos: QoS) -> bool {
        let Some((level, remaining)) = levels.split_first() else {
            return self.subscribers.insert(client_id.to_string(), qos).is_none();
        };

        if *level == "#" {
            return self.multi_wildcard.insert(client_id.to_string(), qos).is_none();
        }

        self.children
            .entry(level.to_string())
            .or_default()
            .insert(remaining, client_id, qos)
    }

    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((level, remaining)) = levels.split_first() else {
            return self.subscribers.remove(client_id).is_some();
        };

        if *level == "#" {
            return self.multi_wildcard.remove(client_id).is_some();
        }

        let Some(child) = self.children.get_mut(*level) else {
            return false;
        };
        let removed = child.remove(remaining, client_id);
        if child.is_empty() {
            self.children.remove(*level);
        }
        removed
    }

    fn remove_client(&mut self, client_id: &str) -> usize {
        let mut removed = self.subscribers.remove(client_id).is_some() as usize
            + self.multi_wildcard.remove(client_id).is_some() as usize;

        for child in self.children.values_mut() {
            removed += child.remove_client(client_id);
        }
        self.children.retain(|_, child| !child.is_empty());
        removed
    }

    fn collect(&self, levels: &[&str], is_root: bool, result: &mut HashMap<ClientId, QoS>) {
        // Topics starting with $ are not matched by wildcards at the first level
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            merge(result, &self.multi_wildcard);
        }

        let Some((level, remaining)) = levels.split_first() else {
            merge(result, &self.subscribers);
            return;
        };

        if !skip_wildcards {
            if let Some(child) = self.children.get("+") {
                child.collect(remaining, false, result);
            }
        }

        if let Some(child) = self.children.get(*level) {
            child.collect(remaining, false, result);
        }
    }
}

/// Overlapping filters for one client collapse into a single entry carrying
/// the highest granted QoS.
fn merge(result: &mut HashMap<ClientId, QoS>, subscribers: &HashMap<ClientId, QoS>) {
    for (client_id, qos) in subscribers {
        result
            .entry(client_id.clone())
            .and_modify(|granted| *granted = (*granted).max(*qos))
            .or_insert(*qos);
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionTree {
    root: TopicNode,
    len: usize,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription. Returns `true` if the (client, filter)
    /// pair was not present before.
    pub fn subscribe(&mut self, filter: &str, client_id: &str, qos: QoS) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let added = self.root.insert(&levels, client_id, qos);
        if added {
            self.len += 1;
        }
        added
    }

    /// Remove a subscription, pruning nodes left empty.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self.root.remove(&levels, client_id);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Remove every subscription held by `client_id`, wherever it sits.
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let removed = self.root.remove_client(client_id);
        self.len -= removed;
        removed
    }

    /// Subscribers whose filters match a publish topic, one entry per client.
    pub fn matches(&self, topic: &str) -> HashMap<ClientId, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut result = HashMap::new();
        self.root.collect(&levels, true, &mut result);
        result
    }

    /// Number of (client, filter) pairs stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A publish topic is non-empty and carries no wildcard characters.
pub fn valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return false;
        }
        if level.contains('+') && level != "+" {
            return false;
        }
    }
    true
}

/// Checks a single filter against a topic, with the same rules as the tree.
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
