//! The `client` module defines the broker's handle on a live connection.
//!
//! A `Client` is what the session registry stores while a session is
//! connected: an identifier for the transport connection and the sending half
//! of that connection's outbound queue. Everything the broker wants written to
//! the socket goes through this one FIFO channel, so packets reach a client in
//! the order the broker produced them. The handle also counts what is still
//! waiting in the queue, so the broker can hold back from a client that has
//! stopped reading.

pub mod handle;
pub use handle::{Client, Outbound, Outbox, channel};

#[cfg(test)]
mod tests;
