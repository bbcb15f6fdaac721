//! # mqbroker
//!
//! `mqbroker` is an in-memory MQTT 3.1.1 broker built on tokio. It accepts
//! MQTT over plain TCP and, optionally, over WebSocket.
//!
//! ## Core Modules
//!
//! - `codec`: encoding and decoding of MQTT control packets.
//! - `broker`: sessions, the subscription tree, retained messages and QoS delivery.
//! - `client`: the outbound queue attached to each connection.
//! - `auth`: credential checks performed on CONNECT.
//! - `transport`: the per-connection state machine and the TCP/WebSocket listeners.
//! - `server`: binds listeners and supervises startup and shutdown.
//! - `config`: layered configuration loading.
//! - `utils`: error types and logging setup.

pub mod auth;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod server;
pub mod transport;
pub mod utils;

pub use server::Server;
