//! `$SYS` topic publisher
//!
//! Broker statistics are published as retained QoS 0 messages so a client
//! subscribing to `$SYS/#` gets the latest values immediately. Wildcard
//! filters starting at the first level never match these topics.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::broker::engine::{Broker, SharedBroker};
use crate::broker::message::Message;
use crate::codec::QoS;

pub const VERSION: &str = "$SYS/broker/version";
pub const UPTIME: &str = "$SYS/broker/uptime";
pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
pub const CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
pub const CLIENTS_EXPIRED: &str = "$SYS/broker/clients/expired";
pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
pub const MESSAGES_DROPPED: &str = "$SYS/broker/messages/dropped";
pub const SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";
pub const RETAINED_MESSAGES_COUNT: &str = "$SYS/broker/retained messages/count";

/// Current values, topic first.
pub fn snapshot(broker: &Broker) -> Vec<(&'static str, String)> {
    let stats = &broker.stats;
    vec![
        (VERSION, format!("mqbroker {}", env!("CARGO_PKG_VERSION"))),
        (
            UPTIME,
            format!("{} seconds", stats.started_at.elapsed().as_secs()),
        ),
        (
            CLIENTS_CONNECTED,
            broker.registry.connected_count().to_string(),
        ),
        (CLIENTS_TOTAL, broker.registry.len().to_string()),
        (CLIENTS_EXPIRED, stats.sessions_expired.to_string()),
        (MESSAGES_RECEIVED, stats.messages_received.to_string()),
        (MESSAGES_SENT, stats.messages_sent.to_string()),
        (MESSAGES_DROPPED, stats.messages_dropped.to_string()),
        (
            SUBSCRIPTIONS_COUNT,
            broker.registry.subscription_count().to_string(),
        ),
        (RETAINED_MESSAGES_COUNT, broker.retained.len().to_string()),
    ]
}

/// Publish one round of statistics.
pub fn publish_stats(broker: &mut Broker) {
    for (topic, value) in snapshot(broker) {
        broker.publish(Message::new(topic, value, QoS::AtMostOnce, true));
    }
}

/// Publishes statistics every `interval` until `shutdown` turns true.
pub async fn start_sys_loop(
    broker: SharedBroker,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => publish_stats(&mut broker.lock()),
            _ = shutdown.changed() => break,
        }
    }
    debug!("$SYS publisher stopped");
}
