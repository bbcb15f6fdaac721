//! Plain TCP transport.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::info;

use crate::broker::SharedBroker;
use crate::transport::{ByteSink, ByteSource, accept_loop, connection};

pub struct TcpSource(OwnedReadHalf);

pub struct TcpSink(OwnedWriteHalf);

impl ByteSource for TcpSource {
    async fn read_bytes(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.0.read_buf(buf).await
    }
}

impl ByteSink for TcpSink {
    async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// Serve MQTT on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    broker: SharedBroker,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "MQTT listener started");
    }

    accept_loop(listener, shutdown, grace, move |stream, peer, shutdown| {
        let broker = broker.clone();
        async move {
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            connection::serve(
                TcpSource(reader),
                TcpSink(writer),
                broker,
                peer.to_string(),
                shutdown,
            )
            .await;
        }
    })
    .await;

    info!("MQTT listener stopped");
}
