//! Error types shared across the broker.
//!
//! `CodecError` covers everything the wire codec can reject (the MQTT
//! "malformed packet" family). `BrokerError` is what a connection task or the
//! supervisor ends with; `kind()` maps it onto the broker's error taxonomy for
//! log output.

use std::io;

use thiserror::Error;

use crate::codec::ConnectReturnCode;

/// Errors produced while decoding or encoding MQTT control packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("invalid fixed header flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },
    #[error("remaining length uses more than four bytes")]
    MalformedRemainingLength,
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),
    #[error("payload of {0} bytes cannot be encoded")]
    PayloadTooLong(usize),
    #[error("invalid QoS {0}")]
    InvalidQoS(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("length prefix of {0} bytes crosses the packet boundary")]
    BoundaryCrossed(usize),
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
    #[error("invalid protocol name {0:?}")]
    InvalidProtocol(String),
    #[error("invalid connect flags {0:#010b}")]
    InvalidConnectFlags(u8),
    #[error("packet identifier must be non-zero")]
    PacketIdZero,
    #[error("subscribe or unsubscribe without topics")]
    EmptySubscription,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Taxonomy tag used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedPacket,
    ProtocolError,
    AuthRejected,
    DeliveryTimeout,
    ResourceExhausted,
    Transport,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedPacket => "MALFORMED_PACKET",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::AuthRejected => "AUTH_REJECTED",
            ErrorKind::DeliveryTimeout => "DELIVERY_TIMEOUT",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Config => "CONFIG",
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] CodecError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection refused: {0:?}")]
    AuthRejected(ConnectReturnCode),
    #[error("client {0} did not acknowledge in time")]
    DeliveryTimeout(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BrokerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        BrokerError::Protocol(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Malformed(_) => ErrorKind::MalformedPacket,
            BrokerError::Protocol(_) => ErrorKind::ProtocolError,
            BrokerError::AuthRejected(_) => ErrorKind::AuthRejected,
            BrokerError::DeliveryTimeout(_) => ErrorKind::DeliveryTimeout,
            BrokerError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            BrokerError::Io(_) => ErrorKind::Transport,
            BrokerError::Config(_) => ErrorKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
