//! Per-connection MQTT state machine.
//!
//! A connection starts in `AwaitingConnect`, where the only acceptable packet
//! is CONNECT and the wait for it is bounded. Once the broker accepts it the
//! connection is `Connected` to a client id and every packet is dispatched to
//! the broker. Reads are bounded by 1.5 times the negotiated keep-alive.
//!
//! Outbound packets never go straight to the socket: the broker queues them
//! on the connection's `Client`, and a separate send loop encodes and writes
//! them in order.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::{ConnectOutcome, SharedBroker};
use crate::client::{self, Client, Outbound, Outbox};
use crate::codec::{self, ConnectReturnCode, Packet, PacketReader};
use crate::transport::{ByteSink, ByteSource};
use crate::utils::error::{BrokerError, Result};

/// Time allowed for the send loop to flush once the connection is done.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingConnect,
    Connected { client_id: String },
    Closed,
}

/// Keep-alive deadline for a negotiated keep-alive in seconds. Zero disables.
pub fn keep_alive_deadline(keep_alive: u16) -> Option<Duration> {
    (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500))
}

struct Connection<R> {
    reader: R,
    packets: PacketReader,
    client: Client,
    broker: SharedBroker,
    peer: String,
    state: ConnectionState,
    keep_alive: Option<Duration>,
    /// DISCONNECT received; suppresses the will.
    graceful: bool,
}

/// Run one client connection to completion.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    broker: SharedBroker,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) where
    R: ByteSource,
    W: ByteSink,
{
    let (client, outbox) = client::channel();
    let mut send_task = tokio::spawn(send_loop(writer, outbox, peer.clone()));

    let max_packet_size = broker.lock().settings().max_packet_size;
    let mut connection = Connection {
        reader,
        packets: PacketReader::new(max_packet_size),
        client,
        broker,
        peer,
        state: ConnectionState::AwaitingConnect,
        keep_alive: None,
        graceful: false,
    };

    let result = connection.drive(&mut shutdown).await;
    connection.finish(result);

    if timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

impl<R: ByteSource> Connection<R> {
    fn client_id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Connected { client_id } => Some(client_id),
            _ => None,
        }
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let connect_timeout =
            Duration::from_secs(self.broker.lock().settings().connect_timeout_secs);

        let first = tokio::select! {
            first = self.next_packet(Some(connect_timeout)) => first?,
            _ = shutdown.changed() => return Ok(()),
        };

        match first {
            Some(Packet::Connect(connect)) => self.on_connect(connect)?,
            Some(other) => {
                return Err(BrokerError::protocol(format!(
                    "expected CONNECT, got {}",
                    other.name()
                )));
            }
            None => return Ok(()),
        }

        let client = self.client.clone();
        loop {
            let packet = tokio::select! {
                packet = self.next_packet(self.keep_alive) => packet?,
                _ = client.closed() => {
                    debug!(peer = %self.peer, "send loop stopped, closing connection");
                    return Ok(());
                }
                _ = shutdown.changed() => return Ok(()),
            };

            let Some(packet) = packet else {
                return Ok(());
            };
            if !self.dispatch(packet)? {
                return Ok(());
            }
        }
    }

    /// Next complete packet, or `None` if the peer closed the transport.
    async fn next_packet(&mut self, deadline: Option<Duration>) -> Result<Option<Packet>> {
        match deadline {
            Some(limit) => timeout(limit, self.read_packet()).await.map_err(|_| {
                BrokerError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("nothing received for {limit:?}"),
                ))
            })?,
            None => self.read_packet().await,
        }
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.packets.next_packet()? {
                return Ok(Some(packet));
            }
            if self.reader.read_bytes(self.packets.buffer_mut()).await? == 0 {
                return Ok(None);
            }
        }
    }

    fn on_connect(&mut self, connect: codec::Connect) -> Result<()> {
        let keep_alive = connect.keep_alive;
        let outcome = self.broker.lock().connect(connect, self.client.clone())?;

        match outcome {
            ConnectOutcome::Accepted { client_id, .. } => {
                self.keep_alive = keep_alive_deadline(keep_alive);
                self.state = ConnectionState::Connected { client_id };
                Ok(())
            }
            ConnectOutcome::Refused(ConnectReturnCode::ServerUnavailable) => Err(
                BrokerError::ResourceExhausted("connection limit reached".to_string()),
            ),
            ConnectOutcome::Refused(
                code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
            ) => Err(BrokerError::AuthRejected(code)),
            ConnectOutcome::Refused(code) => {
                Err(BrokerError::protocol(format!("connect refused with {code:?}")))
            }
        }
    }

    /// Hand a packet to the broker. Returns `false` when the client asked to
    /// disconnect.
    fn dispatch(&mut self, packet: Packet) -> Result<bool> {
        let Some(client_id) = self.client_id().map(str::to_string) else {
            return Err(BrokerError::protocol("packet before CONNECT"));
        };

        let connection_id = self.client.id.as_str();
        match packet {
            Packet::Publish(publish) => {
                self.broker
                    .lock()
                    .handle_publish(&client_id, connection_id, publish)?
            }
            Packet::PubAck(pkid) => self.broker.lock().handle_puback(&client_id, connection_id, pkid)?,
            Packet::PubRec(pkid) => self.broker.lock().handle_pubrec(&client_id, connection_id, pkid)?,
            Packet::PubRel(pkid) => self.broker.lock().handle_pubrel(&client_id, connection_id, pkid)?,
            Packet::PubComp(pkid) => {
                self.broker
                    .lock()
                    .handle_pubcomp(&client_id, connection_id, pkid)?
            }
            Packet::Subscribe(subscribe) => {
                self.broker
                    .lock()
                    .subscribe(&client_id, connection_id, subscribe)?
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.broker
                    .lock()
                    .unsubscribe(&client_id, connection_id, unsubscribe)?
            }
            Packet::PingReq => {
                self.client.send(Packet::PingResp);
            }
            Packet::Disconnect => {
                self.graceful = true;
                return Ok(false);
            }
            Packet::Connect(_) => return Err(BrokerError::protocol("second CONNECT")),
            other @ (Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp) => {
                return Err(BrokerError::protocol(format!(
                    "{} is not sent by clients",
                    other.name()
                )));
            }
        }
        Ok(true)
    }

    /// Detach from the session, then let the send loop flush and close.
    fn finish(&mut self, result: Result<()>) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
        let client_id = match &state {
            ConnectionState::Connected { client_id } => Some(client_id.as_str()),
            _ => None,
        };

        match &result {
            Ok(()) => debug!(peer = %self.peer, client_id, graceful = self.graceful, "connection closed"),
            Err(e) => warn!(
                peer = %self.peer,
                client_id,
                kind = e.kind().as_str(),
                error = %e,
                "connection closed with error"
            ),
        }

        if let Some(client_id) = client_id {
            self.broker
                .lock()
                .disconnect(client_id, &self.client.id, self.graceful);
        }
        self.client.close();
    }
}

/// Encode queued packets and write them out, batching whatever is already
/// waiting into a single write. A packet that fails to encode is skipped
/// whole.
pub(crate) async fn send_loop<W: ByteSink>(mut writer: W, mut outbox: Outbox, peer: String) {
    let mut buffer = BytesMut::with_capacity(4096);

    while let Some(first) = outbox.recv().await {
        let mut close = false;
        let mut next = Some(first);

        while let Some(outbound) = next.take() {
            match outbound {
                Outbound::Packet(packet) => {
                    let mark = buffer.len();
                    if let Err(e) = codec::encode(&packet, &mut buffer) {
                        buffer.truncate(mark);
                        warn!(%peer, packet = packet.name(), error = %e, "failed to encode packet");
                    }
                }
                Outbound::Close => {
                    close = true;
                    break;
                }
            }
            next = outbox.try_recv().ok();
        }

        if !buffer.is_empty() {
            if let Err(e) = writer.write_bytes(&buffer).await {
                debug!(%peer, error = %e, "write failed");
                break;
            }
            buffer.clear();
        }

        if close {
            break;
        }
    }

    if let Err(e) = writer.close().await {
        debug!(%peer, error = %e, "close failed");
    }
    debug!(%peer, "send loop closed");
}
