use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::codec::Packet;

/// Instruction for a connection's send loop.
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    /// Flush what is queued, then close the transport.
    Close,
}

/// Create a connection's outbound queue.
pub fn channel() -> (Client, Outbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    let client = Client {
        id: Uuid::new_v4().to_string(),
        sender,
        backlog: backlog.clone(),
    };
    (client, Outbox { receiver, backlog })
}

#[derive(Debug, Clone)]
pub struct Client {
    /// Unique per transport connection. A client id can move between
    /// connections; this id cannot.
    pub id: String,
    sender: UnboundedSender<Outbound>,
    backlog: Arc<AtomicUsize>,
}

impl Client {
    /// Queue a packet. Returns `false` if the connection is already gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.push(Outbound::Packet(packet))
    }

    /// Ask the connection to close after flushing.
    pub fn close(&self) {
        self.push(Outbound::Close);
    }

    fn push(&self, outbound: Outbound) -> bool {
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(outbound).is_err() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Instructions queued and not yet taken by the send loop.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the send loop has stopped.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

/// Receiving end of a connection's outbound queue, owned by its send loop.
#[derive(Debug)]
pub struct Outbox {
    receiver: UnboundedReceiver<Outbound>,
    backlog: Arc<AtomicUsize>,
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Outbound> {
        let outbound = self.receiver.recv().await?;
        self.backlog.fetch_sub(1, Ordering::Relaxed);
        Some(outbound)
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        let outbound = self.receiver.try_recv()?;
        self.backlog.fetch_sub(1, Ordering::Relaxed);
        Ok(outbound)
    }
}
