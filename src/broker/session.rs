//! Session registry
//!
//! A `Session` is the broker-side state for one client id: its subscriptions,
//! the QoS 1/2 messages it has not yet acknowledged, the QoS 2 packet ids it
//! has sent but not released, and whatever is waiting to be sent. Sessions
//! started without clean-session outlive their connection until they expire.
//!
//! The registry owns every session and the subscription tree, so a
//! subscription is always added to or removed from both at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::broker::message::Message;
use crate::broker::topic::{ClientId, SubscriptionTree};
use crate::client::Client;
use crate::codec::{Packet, QoS};
use crate::config::BrokerSettings;
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Where an outgoing QoS 1/2 message is in its acknowledgement flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK.
    AwaitingAck,
    /// QoS 2 PUBLISH sent, waiting for PUBREC.
    AwaitingReceived,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingComplete,
}

#[derive(Debug, Clone)]
pub struct InflightDelivery {
    pub pkid: u16,
    pub message: Message,
    pub state: DeliveryState,
    pub sent_at: Instant,
    pub retries: u8,
}

impl InflightDelivery {
    /// The packet to send when this delivery is retried or resumed.
    pub fn retransmission(&self) -> Packet {
        match self.state {
            DeliveryState::AwaitingComplete => Packet::PubRel(self.pkid),
            _ => Packet::Publish(self.message.to_publish(self.pkid, true)),
        }
    }
}

/// What happened to a message handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Dropped,
}

#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    pub state: SessionState,
    pub clean_session: bool,
    pub will: Option<Message>,
    /// filter -> granted QoS
    pub subscriptions: HashMap<String, QoS>,
    /// Outgoing QoS 1/2 messages in send order.
    pub outgoing: VecDeque<InflightDelivery>,
    /// Incoming QoS 2 packet ids awaiting PUBREL.
    pub incoming: HashSet<u16>,
    /// Messages waiting for an in-flight slot or for the client to return.
    pub queued: VecDeque<Message>,
    pub disconnected_at: Option<Instant>,
    pub client: Option<Client>,
    last_pkid: u16,
}

impl Session {
    pub fn new(
        client_id: impl Into<ClientId>,
        clean_session: bool,
        will: Option<Message>,
        client: Client,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            state: SessionState::Connected,
            clean_session,
            will,
            subscriptions: HashMap::new(),
            outgoing: VecDeque::new(),
            incoming: HashSet::new(),
            queued: VecDeque::new(),
            disconnected_at: None,
            client: Some(client),
            last_pkid: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Connection id of the transport currently attached, if any.
    pub fn connection_id(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.id.as_str())
    }

    pub fn send(&self, packet: Packet) -> bool {
        self.client.as_ref().is_some_and(|c| c.send(packet))
    }

    /// Whether the attached connection has more waiting on its send loop
    /// than `max_outbound_backlog`.
    pub fn is_congested(&self, limits: &BrokerSettings) -> bool {
        self.client
            .as_ref()
            .is_some_and(|c| c.backlog() >= limits.max_outbound_backlog)
    }

    /// Hand over a message that already carries its delivery QoS and retain
    /// flag.
    ///
    /// Order is preserved per session: while anything is queued, new
    /// messages line up behind it. QoS 0 messages are not kept for offline
    /// or congested connections. A full queue drops the incoming message.
    pub fn deliver(&mut self, message: Message, limits: &BrokerSettings, now: Instant) -> Delivery {
        let online = self.is_connected() && self.client.is_some();
        let congested = self.is_congested(limits);

        if online && !congested && self.queued.is_empty() {
            match message.qos {
                QoS::AtMostOnce => {
                    return if self.send(Packet::Publish(message.to_publish(0, false))) {
                        Delivery::Sent
                    } else {
                        Delivery::Dropped
                    };
                }
                _ if self.outgoing.len() < limits.inflight_window() => {
                    self.send_inflight(message, now);
                    return Delivery::Sent;
                }
                _ => {}
            }
        }

        if message.qos == QoS::AtMostOnce && (!online || congested) {
            return Delivery::Dropped;
        }

        if self.queued.len() >= limits.max_queued_messages {
            return Delivery::Dropped;
        }

        self.queued.push_back(message);
        Delivery::Queued
    }

    /// Send a QoS 1/2 message and start tracking it.
    fn send_inflight(&mut self, message: Message, now: Instant) {
        let pkid = self.next_pkid();
        let state = match message.qos {
            QoS::ExactlyOnce => DeliveryState::AwaitingReceived,
            _ => DeliveryState::AwaitingAck,
        };

        self.send(Packet::Publish(message.to_publish(pkid, false)));
        self.outgoing.push_back(InflightDelivery {
            pkid,
            message,
            state,
            sent_at: now,
            retries: 0,
        });
    }

    /// Move queued messages into flight while slots are free and the
    /// connection keeps up. Returns the
    /// number of messages sent.
    pub fn pump_queue(&mut self, limits: &BrokerSettings, now: Instant) -> usize {
        if !self.is_connected() {
            return 0;
        }

        let mut sent = 0;
        while let Some(front) = self.queued.front() {
            if self.is_congested(limits) {
                break;
            }
            if front.qos != QoS::AtMostOnce && self.outgoing.len() >= limits.inflight_window() {
                break;
            }

            let Some(message) = self.queued.pop_front() else {
                break;
            };
            if message.qos == QoS::AtMostOnce {
                self.send(Packet::Publish(message.to_publish(0, false)));
            } else {
                self.send_inflight(message, now);
            }
            sent += 1;
        }
        sent
    }

    /// Resend every unacknowledged delivery, used when a persistent session
    /// reconnects.
    pub fn resend_inflight(&mut self, now: Instant) -> usize {
        let Some(client) = self.client.clone() else {
            return 0;
        };

        for delivery in self.outgoing.iter_mut() {
            client.send(delivery.retransmission());
            delivery.sent_at = now;
        }
        self.outgoing.len()
    }

    /// Stop tracking `pkid` if it is in `state`.
    pub fn acknowledge(&mut self, pkid: u16, state: DeliveryState) -> Option<InflightDelivery> {
        let index = self
            .outgoing
            .iter()
            .position(|d| d.pkid == pkid && d.state == state)?;
        self.outgoing.remove(index)
    }

    /// PUBREC received: answer with PUBREL and wait for PUBCOMP. A repeated
    /// PUBREC gets the PUBREL again.
    pub fn release(&mut self, pkid: u16, now: Instant) -> bool {
        let Some(delivery) = self.outgoing.iter_mut().find(|d| {
            d.pkid == pkid
                && matches!(
                    d.state,
                    DeliveryState::AwaitingReceived | DeliveryState::AwaitingComplete
                )
        }) else {
            return false;
        };

        if delivery.state == DeliveryState::AwaitingReceived {
            delivery.state = DeliveryState::AwaitingComplete;
            delivery.retries = 0;
        }
        delivery.sent_at = now;
        self.send(Packet::PubRel(pkid));
        true
    }

    /// Next free packet id. Ids wrap and skip 0 and anything still in flight.
    fn next_pkid(&mut self) -> u16 {
        loop {
            self.last_pkid = self.last_pkid.wrapping_add(1);
            if self.last_pkid == 0 {
                self.last_pkid = 1;
            }
            let pkid = self.last_pkid;
            if !self.outgoing.iter().any(|d| d.pkid == pkid) {
                return pkid;
            }
        }
    }
}

/// Result of attaching a connection to a client id.
#[derive(Debug)]
pub struct Registration {
    pub session_present: bool,
    /// Will of a connection that was taken over, to be published.
    pub takeover_will: Option<Message>,
}

#[derive(Debug)]
pub struct Disconnected {
    pub will: Option<Message>,
    pub session_removed: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ClientId, Session>,
    tree: SubscriptionTree,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `client` to `client_id`.
    ///
    /// A connection already holding the id is closed and its will returned.
    /// Previous state is resumed only when neither the old nor the new
    /// connection asked for a clean session.
    pub fn register(
        &mut self,
        client_id: &str,
        clean_session: bool,
        will: Option<Message>,
        client: Client,
        max_connections: usize,
    ) -> Result<Registration, BrokerError> {
        let takeover = self
            .sessions
            .get(client_id)
            .is_some_and(|s| s.is_connected());

        if !takeover && self.connected_count() >= max_connections {
            return Err(BrokerError::ResourceExhausted(format!(
                "{max_connections} clients already connected"
            )));
        }

        let mut takeover_will = None;
        if let Some(session) = self.sessions.get_mut(client_id) {
            if session.is_connected() {
                if let Some(old) = session.client.take() {
                    old.close();
                }
                takeover_will = session.will.take();
            }

            if !clean_session && !session.clean_session {
                session.state = SessionState::Connected;
                session.will = will;
                session.client = Some(client);
                session.disconnected_at = None;
                return Ok(Registration {
                    session_present: true,
                    takeover_will,
                });
            }
        }

        if self.sessions.remove(client_id).is_some() {
            self.tree.remove_client(client_id);
        }
        self.sessions.insert(
            client_id.to_string(),
            Session::new(client_id, clean_session, will, client),
        );

        Ok(Registration {
            session_present: false,
            takeover_will,
        })
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    /// The session of `client_id`, provided connection `connection_id` is
    /// the one attached to it. A connection that was taken over gets a
    /// protocol error.
    pub fn owned_mut(
        &mut self,
        client_id: &str,
        connection_id: &str,
    ) -> Result<&mut Session, BrokerError> {
        match self.sessions.get_mut(client_id) {
            Some(session) if session.connection_id() == Some(connection_id) => Ok(session),
            Some(_) => Err(BrokerError::protocol(format!(
                "session {client_id} is attached to another connection"
            ))),
            None => Err(BrokerError::protocol(format!("no session for {client_id}"))),
        }
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Record a granted subscription in the session and the tree. Returns
    /// `false` if it replaced an existing one for the same filter.
    pub fn record_subscription(&mut self, client_id: &str, filter: &str, qos: QoS) -> bool {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        session.subscriptions.insert(filter.to_string(), qos);
        self.tree.subscribe(filter, client_id, qos)
    }

    pub fn remove_subscription(&mut self, client_id: &str, filter: &str) -> bool {
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.subscriptions.remove(filter);
        }
        self.tree.unsubscribe(filter, client_id)
    }

    /// Detach the connection `connection_id` from `client_id`.
    ///
    /// Does nothing if another connection has taken the session over. The
    /// pending will is returned; publishing it is the caller's decision.
    pub fn disconnect(&mut self, client_id: &str, connection_id: &str) -> Option<Disconnected> {
        let session = self.sessions.get_mut(client_id)?;
        if session.connection_id() != Some(connection_id) {
            return None;
        }

        let will = session.will.take();
        if session.clean_session {
            self.sessions.remove(client_id);
            self.tree.remove_client(client_id);
            return Some(Disconnected {
                will,
                session_removed: true,
            });
        }

        session.state = SessionState::Disconnected;
        session.client = None;
        session.disconnected_at = Some(Instant::now());
        Some(Disconnected {
            will,
            session_removed: false,
        })
    }

    /// Drop a disconnected session and its subscriptions.
    pub fn expire(&mut self, client_id: &str) -> Option<Message> {
        match self.sessions.get(client_id) {
            Some(session) if !session.is_connected() => {}
            _ => return None,
        }

        self.tree.remove_client(client_id);
        self.sessions
            .remove(client_id)
            .and_then(|session| session.will)
    }

    /// Disconnected sessions idle for at least `interval`.
    pub fn expired(&self, now: Instant, interval: Duration) -> Vec<ClientId> {
        self.sessions
            .values()
            .filter(|s| {
                s.disconnected_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= interval)
            })
            .map(|s| s.client_id.clone())
            .collect()
    }

    /// Sessions subscribed to `topic`, with the granted QoS. Tree entries
    /// without a session are removed on the way.
    pub fn subscribers(&mut self, topic: &str) -> Vec<(ClientId, QoS)> {
        let mut matched = Vec::new();
        let mut stale = Vec::new();

        for (client_id, qos) in self.tree.matches(topic) {
            if self.sessions.contains_key(&client_id) {
                matched.push((client_id, qos));
            } else {
                stale.push(client_id);
            }
        }

        for client_id in stale {
            self.tree.remove_client(&client_id);
        }
        matched
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_connected()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.tree.len()
    }
}
