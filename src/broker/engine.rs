//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - accepting or refusing CONNECTs and attaching them to sessions
//! - routing PUBLISHes through the subscription tree to every matching session
//! - running the QoS 1 and QoS 2 acknowledgement flows in both directions
//! - keeping the retained table and replaying it to new subscriptions
//! - retrying unacknowledged deliveries and expiring idle sessions
//!
//! Concurrency and usage notes:
//! - The public API is synchronous and designed to be held behind a lock
//!   (`SharedBroker`) by the transport layer. Packets produced here are only
//!   queued on each client's outbound channel; the socket writes happen in the
//!   connection's send loop, so the lock is never held across network I/O.
//! - The retry and expiry loops run as background tasks and stop when the
//!   shutdown flag flips.

use std::cmp::min;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broker::message::Message;
use crate::broker::retained::RetainedStore;
use crate::broker::session::{Delivery, DeliveryState, SessionRegistry};
use crate::broker::topic::{valid_filter, valid_topic_name};
use crate::client::Client;
use crate::codec::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use crate::config::BrokerSettings;
use crate::utils::error::{BrokerError, Result};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Counters published under `$SYS`.
#[derive(Debug, Clone, Copy)]
pub struct BrokerStats {
    pub started_at: Instant,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub sessions_expired: u64,
}

impl BrokerStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_received: 0,
            messages_sent: 0,
            messages_dropped: 0,
            sessions_expired: 0,
        }
    }

    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.messages_sent += 1,
            Delivery::Dropped => self.messages_dropped += 1,
            Delivery::Queued => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted {
        client_id: String,
        session_present: bool,
    },
    /// CONNACK with this code has been queued; the connection must close.
    Refused(ConnectReturnCode),
}

pub struct Broker {
    pub registry: SessionRegistry,
    pub retained: RetainedStore,
    pub stats: BrokerStats,
    settings: BrokerSettings,
    authenticator: Arc<dyn Authenticator>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("retained", &self.retained)
            .field("stats", &self.stats)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            retained: RetainedStore::new(),
            stats: BrokerStats::new(),
            settings,
            authenticator,
        }
    }

    pub fn shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Handle a CONNECT arriving on `client`.
    ///
    /// The CONNACK is queued here, followed, for a resumed session, by the
    /// in-flight retransmissions and the queued backlog. Errors mean the
    /// CONNECT itself was unusable and nothing was sent.
    pub fn connect(&mut self, connect: Connect, client: Client) -> Result<ConnectOutcome> {
        if !connect.is_supported_version() {
            return Ok(self.refuse(&client, ConnectReturnCode::UnacceptableProtocolVersion));
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Ok(self.refuse(&client, ConnectReturnCode::IdentifierRejected));
            }
            format!("auto-{}", Uuid::new_v4().simple())
        } else {
            connect.client_id
        };

        let auth = self.authenticator.authenticate(
            &client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        );
        if !auth.is_allowed() {
            warn!(client_id = %client_id, code = ?auth.return_code(), "authentication rejected");
            return Ok(self.refuse(&client, auth.return_code()));
        }

        let will = match connect.will {
            Some(will) if !valid_topic_name(&will.topic) => {
                return Err(BrokerError::protocol(format!(
                    "invalid will topic {:?}",
                    will.topic
                )));
            }
            will => will.map(Message::from_will),
        };

        let registration = match self.registry.register(
            &client_id,
            connect.clean_session,
            will,
            client.clone(),
            self.settings.max_connections,
        ) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(client_id = %client_id, kind = e.kind().as_str(), "{e}");
                return Ok(self.refuse(&client, ConnectReturnCode::ServerUnavailable));
            }
        };

        client.send(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
            registration.session_present,
        )));

        if let Some(will) = registration.takeover_will {
            info!(client_id = %client_id, "session taken over, publishing will of previous connection");
            self.publish(will);
        }

        let now = Instant::now();
        if let Some(session) = self.registry.get_mut(&client_id) {
            let resent = session.resend_inflight(now);
            let pumped = session.pump_queue(&self.settings, now);
            if resent + pumped > 0 {
                debug!(client_id = %client_id, resent, pumped, "resumed session backlog");
            }
            self.stats.messages_sent += pumped as u64;
        }

        info!(
            client_id = %client_id,
            clean_session = connect.clean_session,
            session_present = registration.session_present,
            keep_alive = connect.keep_alive,
            "client connected"
        );

        Ok(ConnectOutcome::Accepted {
            client_id,
            session_present: registration.session_present,
        })
    }

    fn refuse(&self, client: &Client, code: ConnectReturnCode) -> ConnectOutcome {
        client.send(Packet::ConnAck(ConnAck::new(code, false)));
        ConnectOutcome::Refused(code)
    }

    /// PUBLISH received from `client_id` on connection `connection_id`.
    ///
    /// This and the other client packet handlers fail with a protocol error
    /// when `connection_id` no longer owns the session, so a connection that
    /// was taken over cannot touch its successor's state.
    pub fn handle_publish(
        &mut self,
        client_id: &str,
        connection_id: &str,
        publish: Publish,
    ) -> Result<()> {
        if !valid_topic_name(&publish.topic) {
            return Err(BrokerError::protocol(format!(
                "invalid publish topic {:?}",
                publish.topic
            )));
        }

        let session = self.registry.owned_mut(client_id, connection_id)?;

        let pkid = publish.pkid;
        let route = match publish.qos {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => {
                session.send(Packet::PubAck(pkid));
                true
            }
            QoS::ExactlyOnce => {
                let first = session.incoming.insert(pkid);
                session.send(Packet::PubRec(pkid));
                first
            }
        };

        if !route {
            debug!(client_id, pkid, "duplicate QoS 2 publish acknowledged again");
            return Ok(());
        }

        self.stats.messages_received += 1;
        debug!(client_id, topic = %publish.topic, qos = publish.qos as u8, "publish received");

        if publish.topic.starts_with('$') {
            debug!(client_id, topic = %publish.topic, "publish to reserved topic not routed");
            return Ok(());
        }

        self.publish(Message::from_publish(publish));
        Ok(())
    }

    pub fn handle_puback(&mut self, client_id: &str, connection_id: &str, pkid: u16) -> Result<()> {
        self.complete(client_id, connection_id, pkid, DeliveryState::AwaitingAck)
    }

    pub fn handle_pubrec(&mut self, client_id: &str, connection_id: &str, pkid: u16) -> Result<()> {
        let session = self.registry.owned_mut(client_id, connection_id)?;
        if !session.release(pkid, Instant::now()) {
            debug!(client_id, pkid, "PUBREC for unknown packet id");
        }
        Ok(())
    }

    pub fn handle_pubrel(&mut self, client_id: &str, connection_id: &str, pkid: u16) -> Result<()> {
        let session = self.registry.owned_mut(client_id, connection_id)?;
        session.incoming.remove(&pkid);
        session.send(Packet::PubComp(pkid));
        Ok(())
    }

    pub fn handle_pubcomp(&mut self, client_id: &str, connection_id: &str, pkid: u16) -> Result<()> {
        self.complete(client_id, connection_id, pkid, DeliveryState::AwaitingComplete)
    }

    /// Final acknowledgement of an outgoing delivery frees a slot for the
    /// queue.
    fn complete(
        &mut self,
        client_id: &str,
        connection_id: &str,
        pkid: u16,
        state: DeliveryState,
    ) -> Result<()> {
        let now = Instant::now();
        let session = self.registry.owned_mut(client_id, connection_id)?;

        if session.acknowledge(pkid, state).is_none() {
            debug!(client_id, pkid, ?state, "acknowledgement for unknown packet id");
            return Ok(());
        }

        let sent = session.pump_queue(&self.settings, now);
        self.stats.messages_sent += sent as u64;
        Ok(())
    }

    /// SUBSCRIBE: grant each valid filter, answer with SUBACK, then replay
    /// matching retained messages.
    pub fn subscribe(
        &mut self,
        client_id: &str,
        connection_id: &str,
        subscribe: Subscribe,
    ) -> Result<()> {
        self.registry.owned_mut(client_id, connection_id)?;

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for filter in subscribe.filters {
            if !valid_filter(&filter.path) {
                warn!(client_id, filter = %filter.path, "rejected invalid topic filter");
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let added = self
                .registry
                .record_subscription(client_id, &filter.path, filter.qos);
            info!(client_id, filter = %filter.path, qos = filter.qos as u8, added, "subscribed");
            return_codes.push(SubscribeReturnCode::Success(filter.qos));
            granted.push((filter.path, filter.qos));
        }

        let now = Instant::now();
        let session = self.registry.owned_mut(client_id, connection_id)?;
        session.send(Packet::SubAck(SubAck {
            pkid: subscribe.pkid,
            return_codes,
        }));

        for (filter, granted_qos) in granted {
            for message in self.retained.matching(&filter) {
                let qos = min(message.qos, granted_qos);
                let delivery = session.deliver(message.for_delivery(qos, true), &self.settings, now);
                self.stats.record(delivery);
            }
        }
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        client_id: &str,
        connection_id: &str,
        unsubscribe: Unsubscribe,
    ) -> Result<()> {
        self.registry.owned_mut(client_id, connection_id)?;

        for filter in &unsubscribe.topics {
            let removed = self.registry.remove_subscription(client_id, filter);
            info!(client_id, filter = %filter, removed, "unsubscribed");
        }

        if let Some(session) = self.registry.get(client_id) {
            session.send(Packet::UnsubAck(unsubscribe.pkid));
        }
        Ok(())
    }

    /// Connection `connection_id` of `client_id` has ended. The will is
    /// published unless the client sent DISCONNECT.
    pub fn disconnect(&mut self, client_id: &str, connection_id: &str, graceful: bool) {
        let Some(disconnected) = self.registry.disconnect(client_id, connection_id) else {
            return;
        };

        info!(
            client_id,
            graceful,
            session_removed = disconnected.session_removed,
            "client disconnected"
        );

        if graceful {
            return;
        }
        if let Some(will) = disconnected.will {
            info!(client_id, topic = %will.topic, "publishing will");
            self.publish(will);
        }
    }

    /// Route a message to every matching session and update the retained
    /// table. Returns the number of sessions it was handed to.
    pub fn publish(&mut self, message: Message) -> usize {
        if message.retain {
            self.retained.store(&message);
        }

        let now = Instant::now();
        let subscribers = self.registry.subscribers(&message.topic);
        for (client_id, granted) in &subscribers {
            let Some(session) = self.registry.get_mut(client_id) else {
                continue;
            };
            let copy = message.for_delivery(min(message.qos, *granted), false);
            let delivery = session.deliver(copy, &self.settings, now);
            if delivery == Delivery::Dropped {
                debug!(client_id = %client_id, topic = %message.topic, "message dropped");
            }
            self.stats.record(delivery);
        }
        subscribers.len()
    }

    /// Retransmit deliveries unacknowledged for longer than the retry
    /// interval and resume queues held back while a connection was
    /// congested. Clients that exhausted their retries are closed as
    /// unresponsive and their wills published; their ids are returned.
    pub fn retry_expired(&mut self, now: Instant) -> Vec<String> {
        let interval = self.settings.retry_interval();
        let max_retries = self.settings.max_retries;
        let mut unresponsive = Vec::new();

        for session in self.registry.sessions_mut() {
            let Some(client) = session.client.clone() else {
                continue;
            };

            for delivery in session.outgoing.iter_mut() {
                if now.saturating_duration_since(delivery.sent_at) < interval {
                    continue;
                }
                if delivery.retries >= max_retries {
                    unresponsive.push((session.client_id.clone(), client.id.clone()));
                    break;
                }

                delivery.retries += 1;
                delivery.sent_at = now;
                debug!(
                    client_id = %session.client_id,
                    pkid = delivery.pkid,
                    retry = delivery.retries,
                    "retransmitting"
                );
                client.send(delivery.retransmission());
            }

            if !session.queued.is_empty() {
                let sent = session.pump_queue(&self.settings, now);
                self.stats.messages_sent += sent as u64;
            }
        }

        for (client_id, connection_id) in &unresponsive {
            let err = BrokerError::DeliveryTimeout(client_id.clone());
            warn!(client_id = %client_id, kind = err.kind().as_str(), "{err}");
            if let Some(client) = self.registry.get(client_id).and_then(|s| s.client.clone()) {
                client.close();
            }
            self.disconnect(client_id, connection_id, false);
        }

        unresponsive.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove persistent sessions disconnected for longer than the expiry
    /// interval.
    pub fn expire_sessions(&mut self, now: Instant) -> usize {
        let Some(interval) = self.settings.session_expiry() else {
            return 0;
        };

        let expired = self.registry.expired(now, interval);
        for client_id in &expired {
            if let Some(will) = self.registry.expire(client_id) {
                self.publish(will);
            }
            info!(client_id = %client_id, "session expired");
            self.stats.sessions_expired += 1;
        }
        expired.len()
    }

    /// Periodically retransmits unacknowledged deliveries until `shutdown`
    /// turns true.
    pub async fn start_retry_loop(broker: SharedBroker, mut shutdown: watch::Receiver<bool>) {
        let period = {
            let broker = broker.lock();
            tick_period(broker.settings.retry_interval())
        };
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broker.lock().retry_expired(Instant::now());
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("retry loop stopped");
    }

    /// Periodically drops expired persistent sessions until `shutdown` turns
    /// true.
    pub async fn start_expiry_loop(broker: SharedBroker, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    broker.lock().expire_sessions(Instant::now());
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("expiry loop stopped");
    }
}

/// Check often enough that a retry is never late by more than a fraction of
/// its interval.
fn tick_period(retry_interval: Duration) -> Duration {
    (retry_interval / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}
