//! MQTT over WebSocket
//!
//! Clients are expected to offer the `mqtt` sub-protocol; when they do it is
//! echoed back in the handshake response. Only binary frames carry MQTT
//! data, and a frame may hold any number of packets or part of one.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::SharedBroker;
use crate::transport::{ByteSink, ByteSource, accept_loop, connection};

pub const SUBPROTOCOL: &str = "mqtt";
const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

pub struct WsSource(SplitStream<WebSocketStream<TcpStream>>);

pub struct WsSink(SplitSink<WebSocketStream<TcpStream>, WsMessage>);

impl ByteSource for WsSource {
    async fn read_bytes(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            match self.0.next().await {
                Some(Ok(WsMessage::Binary(data))) if !data.is_empty() => {
                    buf.extend_from_slice(&data);
                    return Ok(data.len());
                }
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frames cannot carry MQTT",
                    ));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(0),
                // ping, pong, empty binary
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
}

impl ByteSink for WsSink {
    async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0
            .send(WsMessage::binary(Bytes::copy_from_slice(bytes)))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.close().await.map_err(io::Error::other)
    }
}

/// Echo `mqtt` back if the client offered it.
fn negotiate_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SUBPROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|protocols| protocols.split(',').any(|p| p.trim() == SUBPROTOCOL));

    if offered {
        response
            .headers_mut()
            .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

/// Serve MQTT over WebSocket on `listener` until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    broker: SharedBroker,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "MQTT over WebSocket listener started");
    }

    accept_loop(listener, shutdown, grace, move |stream, peer, shutdown| {
        let broker = broker.clone();
        async move {
            let _ = stream.set_nodelay(true);
            let ws_stream = match accept_hdr_async(stream, negotiate_subprotocol).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket handshake failed");
                    return;
                }
            };

            let (sink, source) = ws_stream.split();
            connection::serve(
                WsSource(source),
                WsSink(sink),
                broker,
                peer.to_string(),
                shutdown,
            )
            .await;
        }
    })
    .await;

    info!("MQTT over WebSocket listener stopped");
}
