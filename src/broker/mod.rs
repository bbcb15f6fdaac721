//! Broker core: sessions, subscriptions, retained messages and delivery.

pub mod engine;
pub mod message;
pub mod retained;
pub mod session;
pub mod sys;
pub mod topic;

pub use engine::{Broker, BrokerStats, ConnectOutcome, SharedBroker};
pub use message::Message;
