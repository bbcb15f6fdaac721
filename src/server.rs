//! Broker supervisor
//!
//! Binds the listeners, starts the background loops and owns the shutdown
//! sequence: stop accepting, signal every connection, wait for the grace
//! period, abort whatever is left.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::broker::{Broker, SharedBroker, sys};
use crate::config::Settings;
use crate::transport::{tcp, websocket};
use crate::utils::error::Result;

pub struct Server {
    settings: Settings,
    broker: SharedBroker,
    listener: TcpListener,
    ws_listener: Option<TcpListener>,
}

impl Server {
    /// Bind every configured listener, authenticating against the configured
    /// user table.
    pub async fn bind(settings: Settings) -> Result<Self> {
        let authenticator = Arc::new(StaticAuthenticator::new(&settings.auth));
        Self::bind_with(settings, authenticator).await
    }

    pub async fn bind_with(settings: Settings, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        let host = settings.server.host.as_str();
        let listener = TcpListener::bind((host, settings.server.port)).await?;

        let ws_listener = match settings.server.ws_port {
            Some(port) => Some(TcpListener::bind((host, port)).await?),
            None => None,
        };

        if !settings.auth.allow_anonymous && settings.auth.users.is_empty() {
            warn!("anonymous access is disabled and no users are configured; every client will be refused");
        }

        let broker = Broker::new(settings.broker.clone(), authenticator).shared();
        Ok(Self {
            settings,
            broker,
            listener,
            ws_listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn broker(&self) -> SharedBroker {
        self.broker.clone()
    }

    /// Serve until `shutdown` completes.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let (stop, stopped) = watch::channel(false);
        let limits = &self.settings.broker;
        let grace = Duration::from_secs(limits.shutdown_grace_secs);
        let mut tasks = JoinSet::new();

        tasks.spawn(tcp::serve(
            self.listener,
            self.broker.clone(),
            stopped.clone(),
            grace,
        ));
        if let Some(ws_listener) = self.ws_listener {
            tasks.spawn(websocket::serve(
                ws_listener,
                self.broker.clone(),
                stopped.clone(),
                grace,
            ));
        }

        tasks.spawn(Broker::start_retry_loop(self.broker.clone(), stopped.clone()));
        tasks.spawn(Broker::start_expiry_loop(self.broker.clone(), stopped.clone()));
        if limits.sys_interval_secs > 0 {
            tasks.spawn(sys::start_sys_loop(
                self.broker.clone(),
                Duration::from_secs(limits.sys_interval_secs),
                stopped.clone(),
            ));
        }

        info!(
            max_connections = limits.max_connections,
            session_expiry_secs = limits.session_expiry_secs,
            "broker running"
        );

        shutdown.await;
        info!("shutdown requested, closing listeners and connections");
        let _ = stop.send(true);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "broker task ended abnormally");
            }
        }
        info!("broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    use super::*;
    use crate::codec::{self, ConnectReturnCode, Connect, Packet, PacketReader};
    use crate::config::{AuthSettings, ServerSettings};

    fn local_settings(ws: bool) -> Settings {
        Settings {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
                ws_port: ws.then_some(0),
            },
            auth: AuthSettings {
                allow_anonymous: true,
                users: HashMap::new(),
            },
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn bind_reports_addresses() {
        let server = Server::bind(local_settings(true)).await.expect("bind");
        assert_ne!(server.local_addr().expect("addr").port(), 0);
        assert!(server.ws_local_addr().is_some());

        let server = Server::bind(local_settings(false)).await.expect("bind");
        assert!(server.ws_local_addr().is_none());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut settings = local_settings(false);
        settings.server.port = taken.local_addr().expect("addr").port();

        let err = Server::bind(settings).await.err().expect("bind should fail");
        assert_eq!(err.kind(), crate::utils::error::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let server = Server::bind(local_settings(false)).await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let mut buf = BytesMut::new();
        codec::encode(&Packet::Connect(Connect::new("smoke", true, 30)), &mut buf)
            .expect("encode");
        stream.write_all(&buf).await.expect("write");

        let mut reader = PacketReader::new(codec::MAX_REMAINING_LENGTH);
        let connack = loop {
            if let Some(packet) = reader.next_packet().expect("decode") {
                break packet;
            }
            stream
                .read_buf(reader.buffer_mut())
                .await
                .expect("read");
        };
        assert!(matches!(
            connack,
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Accepted
        ));

        let _ = stop.send(());
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("server did not stop")
            .expect("server panicked");
    }
}
