//! The `transport` module is responsible for network communication with
//! clients.
//!
//! Every connection, whatever carries it, runs the same MQTT state machine in
//! `connection`. The carriers only have to move bytes:
//! - `tcp`: plain MQTT on a TCP socket
//! - `websocket`: MQTT over WebSocket, one or more packets per binary frame

pub mod connection;
pub mod tcp;
pub mod websocket;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Reading half of a client transport.
pub trait ByteSource: Send + 'static {
    /// Append whatever arrives next to `buf`. `Ok(0)` means the peer closed.
    fn read_bytes(&mut self, buf: &mut BytesMut) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Writing half of a client transport.
pub trait ByteSink: Send + 'static {
    fn write_bytes(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Accept connections until `shutdown` turns true, then give the open ones
/// `grace` to finish before aborting them.
pub(crate) async fn accept_loop<H, Fut>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr, watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    connections.spawn(handler(stream, peer, shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);

    let open = connections.len();
    if open > 0 {
        info!(open, "waiting for connections to close");
    }

    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "grace period elapsed, aborting connections"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests;
