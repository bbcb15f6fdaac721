//! CLI for mqbroker
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: connect, publish one message and disconnect (useful for smoke tests)

use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};

use mqbroker::Server;
use mqbroker::codec::{self, Connect, ConnectReturnCode, Packet, PacketReader, Publish, QoS};
use mqbroker::config::load_config;
use mqbroker::utils::logging;

#[derive(Parser)]
#[command(name = "mqbroker")]
enum Command {
    /// Start the broker
    Server {
        /// Configuration file layered over config/default.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Publish a single message to a running broker
    Publish {
        /// Broker address
        #[arg(long, default_value = "127.0.0.1:1883")]
        addr: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        /// 0, 1 or 2
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    match Command::parse() {
        Command::Server { config } => {
            if let Err(e) = run_server(config).await {
                // Configuration errors happen before the configured subscriber
                // exists; this is a no-op once it does.
                logging::init("info");
                error!(kind = e.kind().as_str(), "Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Publish {
            addr,
            topic,
            message,
            qos,
            retain,
        } => {
            logging::init("info");
            if let Err(e) = run_publish(&addr, topic, message, qos, retain).await {
                error!("Publish failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config: Option<PathBuf>) -> mqbroker::utils::error::Result<()> {
    let settings = load_config(config.as_deref())?;
    logging::init(&settings.log.level);

    let server = Server::bind(settings).await?;
    info!(addr = %server.local_addr()?, "listening for MQTT");
    if let Some(ws_addr) = server.ws_local_addr() {
        info!(addr = %ws_addr, "listening for MQTT over WebSocket");
    }

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
        })
        .await;

    Ok(())
}

async fn run_publish(
    addr: &str,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let mut stream = TcpStream::connect(addr).await?;
    let mut reader = PacketReader::new(codec::MAX_REMAINING_LENGTH);

    let client_id = format!("mqbroker-pub-{}", std::process::id());
    send(&mut stream, &Packet::Connect(Connect::new(client_id, true, 30))).await?;
    match recv(&mut stream, &mut reader).await? {
        Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Accepted => {}
        other => return Err(format!("connection refused: {other:?}").into()),
    }

    let mut publish = Publish::new(topic.clone(), qos, message);
    publish.retain = retain;
    if qos != QoS::AtMostOnce {
        publish.pkid = 1;
    }
    send(&mut stream, &Packet::Publish(publish)).await?;

    match qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => expect(&mut stream, &mut reader, Packet::PubAck(1)).await?,
        QoS::ExactlyOnce => {
            expect(&mut stream, &mut reader, Packet::PubRec(1)).await?;
            send(&mut stream, &Packet::PubRel(1)).await?;
            expect(&mut stream, &mut reader, Packet::PubComp(1)).await?;
        }
    }

    send(&mut stream, &Packet::Disconnect).await?;
    info!(%topic, qos = qos as u8, "published");
    Ok(())
}

async fn send(stream: &mut TcpStream, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = BytesMut::new();
    codec::encode(packet, &mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Waits for `expected`, failing on anything else.
async fn expect(
    stream: &mut TcpStream,
    reader: &mut PacketReader,
    expected: Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    match recv(stream, reader).await? {
        Some(packet) if packet == expected => Ok(()),
        Some(packet) => Err(format!("expected {}, got {packet:?}", expected.name()).into()),
        None => Err(format!("connection closed while waiting for {}", expected.name()).into()),
    }
}

async fn recv(
    stream: &mut TcpStream,
    reader: &mut PacketReader,
) -> Result<Option<Packet>, Box<dyn std::error::Error>> {
    loop {
        if let Some(packet) = reader.next_packet()? {
            return Ok(Some(packet));
        }
        let read = stream.read_buf(reader.buffer_mut());
        if tokio::time::timeout(Duration::from_secs(5), read).await?? == 0 {
            return Ok(None);
        }
    }
}
