use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use super::connection::{keep_alive_deadline, send_loop};
use super::{ByteSink, tcp, websocket};
use crate::auth::{Authenticator, StaticAuthenticator};
use crate::broker::{Broker, SharedBroker};
use crate::client;
use crate::codec::{
    self, ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketReader, Publish, QoS,
    Subscribe, SubscribeFilter, SubscribeReturnCode,
};
use crate::config::BrokerSettings;

const WAIT: Duration = Duration::from_secs(5);

/// Sink that keeps everything written to it.
#[derive(Clone, Default)]
struct RecordingSink {
    written: Arc<parking_lot::Mutex<Vec<u8>>>,
    closed: Arc<parking_lot::Mutex<bool>>,
}

impl ByteSink for RecordingSink {
    async fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.written.lock().extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    broker: SharedBroker,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(settings: BrokerSettings, auth: Arc<dyn Authenticator>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let broker = Broker::new(settings, auth).shared();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(tcp::serve(
            listener,
            broker.clone(),
            rx,
            Duration::from_secs(1),
        ));
        Self {
            addr,
            broker,
            shutdown,
            task,
        }
    }

    async fn anonymous() -> Self {
        Self::start(
            BrokerSettings::default(),
            Arc::new(StaticAuthenticator::anonymous()),
        )
        .await
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        timeout(WAIT, self.task)
            .await
            .expect("listener did not stop")
            .expect("listener panicked");
    }
}

struct TestClient {
    stream: TcpStream,
    reader: PacketReader,
}

impl TestClient {
    async fn open(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("connect"),
            reader: PacketReader::new(codec::MAX_REMAINING_LENGTH),
        }
    }

    async fn connect(addr: SocketAddr, connect: Connect) -> Self {
        let mut client = Self::open(addr).await;
        client.send(Packet::Connect(connect)).await;
        match client.recv().await {
            Some(Packet::ConnAck(ConnAck {
                code: ConnectReturnCode::Accepted,
                ..
            })) => {}
            other => panic!("expected CONNACK, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        codec::encode(&packet, &mut buf).expect("encode");
        self.stream.write_all(&buf).await.expect("write");
    }

    /// Next packet, or `None` once the broker closed the connection.
    async fn recv(&mut self) -> Option<Packet> {
        timeout(WAIT, async {
            loop {
                if let Some(packet) = self.reader.next_packet().expect("decode") {
                    return Some(packet);
                }
                match self.stream.read_buf(self.reader.buffer_mut()).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("timed out waiting for the broker")
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) {
        self.send(Packet::Subscribe(Subscribe {
            pkid: 1,
            filters: vec![SubscribeFilter::new(filter, qos)],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(suback)) => {
                assert_eq!(suback.return_codes, vec![SubscribeReturnCode::Success(qos)]);
            }
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }
}

#[test]
fn keep_alive_allows_half_again() {
    assert_eq!(keep_alive_deadline(0), None);
    assert_eq!(keep_alive_deadline(10), Some(Duration::from_secs(15)));
    assert_eq!(keep_alive_deadline(1), Some(Duration::from_millis(1500)));
}

#[tokio::test]
async fn publish_reaches_wildcard_subscriber_over_tcp() {
    let server = TestServer::anonymous().await;

    let mut a = TestClient::connect(server.addr, Connect::new("A", true, 30)).await;
    a.subscribe("sensors/+/temp", QoS::AtLeastOnce).await;

    let mut b = TestClient::connect(server.addr, Connect::new("B", true, 30)).await;
    let mut publish = Publish::new("sensors/kitchen/temp", QoS::AtLeastOnce, "21.5");
    publish.pkid = 5;
    b.send(Packet::Publish(publish)).await;
    assert_eq!(b.recv().await, Some(Packet::PubAck(5)));

    match a.recv().await {
        Some(Packet::Publish(received)) => {
            assert_eq!(received.topic, "sensors/kitchen/temp");
            assert_eq!(received.payload, Bytes::from_static(b"21.5"));
            assert_eq!(received.qos, QoS::AtLeastOnce);
            a.send(Packet::PubAck(received.pkid)).await;
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    a.send(Packet::PingReq).await;
    assert_eq!(a.recv().await, Some(Packet::PingResp));

    server.stop().await;
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let server = TestServer::anonymous().await;

    let mut client = TestClient::open(server.addr).await;
    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn second_connect_closes_connection() {
    let server = TestServer::anonymous().await;

    let mut client = TestClient::connect(server.addr, Connect::new("twice", true, 30)).await;
    client
        .send(Packet::Connect(Connect::new("twice", true, 30)))
        .await;
    assert_eq!(client.recv().await, None);
    assert!(server.broker.lock().registry.get("twice").is_none());

    server.stop().await;
}

#[tokio::test]
async fn malformed_packet_closes_connection() {
    let server = TestServer::anonymous().await;

    let mut client = TestClient::connect(server.addr, Connect::new("bad", true, 30)).await;
    // PUBLISH with QoS 3
    client
        .stream
        .write_all(&[0x36, 0x03, 0x00, 0x01, b'a'])
        .await
        .expect("write");
    assert_eq!(client.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn refused_credentials_get_connack_then_close() {
    let server = TestServer::start(
        BrokerSettings::default(),
        Arc::new(StaticAuthenticator::default()),
    )
    .await;

    let mut client = TestClient::open(server.addr).await;
    client
        .send(Packet::Connect(Connect::new("anon", true, 30)))
        .await;
    assert_eq!(
        client.recv().await,
        Some(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false
        )))
    );
    assert_eq!(client.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn keep_alive_expiry_publishes_will() {
    let server = TestServer::anonymous().await;

    let mut watcher = TestClient::connect(server.addr, Connect::new("watcher", true, 30)).await;
    watcher.subscribe("status/#", QoS::AtMostOnce).await;

    let mut connect = Connect::new("sleepy", true, 1);
    connect.will = Some(LastWill {
        topic: "status/sleepy".to_string(),
        message: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let mut sleepy = TestClient::connect(server.addr, connect).await;

    // Nothing is sent; the broker gives up after 1.5 seconds.
    match watcher.recv().await {
        Some(Packet::Publish(will)) => {
            assert_eq!(will.topic, "status/sleepy");
            assert_eq!(will.payload, Bytes::from_static(b"offline"));
        }
        other => panic!("expected will, got {other:?}"),
    }
    assert_eq!(sleepy.recv().await, None);

    server.stop().await;
}

#[tokio::test]
async fn graceful_disconnect_suppresses_will() {
    let server = TestServer::anonymous().await;

    let mut watcher = TestClient::connect(server.addr, Connect::new("watcher", true, 30)).await;
    watcher.subscribe("status/#", QoS::AtMostOnce).await;

    let mut connect = Connect::new("polite", true, 30);
    connect.will = Some(LastWill {
        topic: "status/polite".to_string(),
        message: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let mut polite = TestClient::connect(server.addr, connect).await;
    polite.send(Packet::Disconnect).await;
    assert_eq!(polite.recv().await, None);

    watcher.send(Packet::PingReq).await;
    assert_eq!(watcher.recv().await, Some(Packet::PingResp));

    server.stop().await;
}

#[tokio::test]
async fn takeover_closes_previous_connection() {
    let server = TestServer::anonymous().await;

    let mut first = TestClient::connect(server.addr, Connect::new("dev", false, 30)).await;
    let mut second = TestClient::connect(server.addr, Connect::new("dev", false, 30)).await;
    assert_eq!(first.recv().await, None);

    second.send(Packet::PingReq).await;
    assert_eq!(second.recv().await, Some(Packet::PingResp));
    assert_eq!(server.broker.lock().registry.connected_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let server = TestServer::anonymous().await;
    let addr = server.addr;

    let mut client = TestClient::connect(addr, Connect::new("c", true, 30)).await;
    server.stop().await;

    assert_eq!(client.recv().await, None);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn mqtt_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = Broker::new(
        BrokerSettings::default(),
        Arc::new(StaticAuthenticator::anonymous()),
    )
    .shared();
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(websocket::serve(
        listener,
        broker,
        rx,
        Duration::from_secs(1),
    ));

    let mut request = format!("ws://{addr}")
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(websocket::SUBPROTOCOL),
    );
    let (mut ws, response) = connect_async(request).await.expect("ws connect");
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("mqtt")
    );

    // CONNECT and SUBSCRIBE in one frame
    let mut buf = BytesMut::new();
    codec::encode(&Packet::Connect(Connect::new("ws", true, 30)), &mut buf).expect("encode");
    codec::encode(
        &Packet::Subscribe(Subscribe {
            pkid: 2,
            filters: vec![SubscribeFilter::new("ws/echo", QoS::AtMostOnce)],
        }),
        &mut buf,
    )
    .expect("encode");
    codec::encode(
        &Packet::Publish(Publish::new("ws/echo", QoS::AtMostOnce, "hi")),
        &mut buf,
    )
    .expect("encode");
    ws.send(WsMessage::binary(buf.freeze())).await.expect("send");

    let mut reader = PacketReader::new(codec::MAX_REMAINING_LENGTH);
    let mut received = Vec::new();
    while received.len() < 3 {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("ws error");
        if let WsMessage::Binary(data) = frame {
            reader.extend(&data);
            while let Some(packet) = reader.next_packet().expect("decode") {
                received.push(packet);
            }
        }
    }

    assert!(matches!(
        &received[0],
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Accepted
    ));
    assert!(matches!(&received[1], Packet::SubAck(suback) if suback.pkid == 2));
    assert!(matches!(
        &received[2],
        Packet::Publish(publish) if publish.topic == "ws/echo" && publish.payload == Bytes::from_static(b"hi")
    ));

    let _ = shutdown.send(true);
    timeout(WAIT, task)
        .await
        .expect("listener did not stop")
        .expect("listener panicked");
}

#[tokio::test]
async fn send_loop_skips_packets_that_fail_to_encode() {
    let (client, outbox) = client::channel();
    let sink = RecordingSink::default();

    let mut broken = Publish::new("a/b", QoS::AtLeastOnce, "no packet id");
    broken.pkid = 0;
    let bad_topic = Publish::new("x".repeat(70_000), QoS::AtMostOnce, "too long");

    client.send(Packet::PingResp);
    client.send(Packet::Publish(broken));
    client.send(Packet::Publish(bad_topic));
    client.send(Packet::PubAck(3));
    client.close();

    timeout(WAIT, send_loop(sink.clone(), outbox, "test".to_string()))
        .await
        .expect("send loop did not finish");

    let mut expected = BytesMut::new();
    codec::encode(&Packet::PingResp, &mut expected).expect("encode");
    codec::encode(&Packet::PubAck(3), &mut expected).expect("encode");
    assert_eq!(&sink.written.lock()[..], &expected[..]);
    assert!(*sink.closed.lock());
    assert_eq!(client.backlog(), 0);
}
