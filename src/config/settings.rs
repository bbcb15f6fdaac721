use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Largest usable in-flight window: one packet id is always left free.
pub const MAX_INFLIGHT: usize = u16::MAX as usize - 1;

/// Top-level configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
    pub log: LogSettings,
}

/// Listener addresses.
///
/// `ws_port` enables MQTT over WebSocket on the same host when set.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub ws_port: Option<u16>,
}

/// Session, delivery and lifecycle limits.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Concurrently connected sessions; further CONNECTs get "server unavailable".
    pub max_connections: usize,
    /// How long a disconnected persistent session is kept. 0 keeps it forever.
    pub session_expiry_secs: u64,
    /// How long a new connection may take to send CONNECT.
    pub connect_timeout_secs: u64,
    /// Retransmissions of an unacknowledged packet before the client is dropped.
    pub max_retries: u8,
    pub retry_interval_ms: u64,
    /// Outgoing QoS 1/2 messages awaiting acknowledgement per session.
    pub max_inflight: usize,
    /// Messages held per session beyond the in-flight window or while offline.
    pub max_queued_messages: usize,
    /// Packets waiting on a connection's send loop before new publishes are
    /// held back. QoS 0 is dropped, QoS 1/2 waits in the session queue.
    pub max_outbound_backlog: usize,
    pub max_packet_size: usize,
    pub shutdown_grace_secs: u64,
    /// Period of the $SYS publications. 0 disables them.
    pub sys_interval_secs: u64,
}

impl BrokerSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// `max_inflight` limited to what 16-bit packet ids can track.
    pub fn inflight_window(&self) -> usize {
        self.max_inflight.clamp(1, MAX_INFLIGHT)
    }

    pub fn session_expiry(&self) -> Option<Duration> {
        match self.session_expiry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Credential check configuration.
///
/// Anonymous access is off unless explicitly enabled.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSettings {
    pub allow_anonymous: bool,
    /// username -> password
    pub users: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ws_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub session_expiry_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_retries: Option<u8>,
    pub retry_interval_ms: Option<u64>,
    pub max_inflight: Option<usize>,
    pub max_queued_messages: Option<usize>,
    pub max_outbound_backlog: Option<usize>,
    pub max_packet_size: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
    pub sys_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAuthSettings {
    pub allow_anonymous: Option<bool>,
    pub users: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            broker: self.broker.unwrap_or_default().merge(default.broker),
            auth: self.auth.unwrap_or_default().merge(default.auth),
            log: LogSettings {
                level: self
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            ws_port: self.ws_port.or(default.ws_port),
        }
    }
}

impl PartialBrokerSettings {
    fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            session_expiry_secs: self
                .session_expiry_secs
                .unwrap_or(default.session_expiry_secs),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(default.connect_timeout_secs),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            retry_interval_ms: self.retry_interval_ms.unwrap_or(default.retry_interval_ms),
            max_inflight: self
                .max_inflight
                .unwrap_or(default.max_inflight)
                .clamp(1, MAX_INFLIGHT),
            max_queued_messages: self
                .max_queued_messages
                .unwrap_or(default.max_queued_messages),
            max_outbound_backlog: self
                .max_outbound_backlog
                .unwrap_or(default.max_outbound_backlog),
            max_packet_size: self.max_packet_size.unwrap_or(default.max_packet_size),
            shutdown_grace_secs: self
                .shutdown_grace_secs
                .unwrap_or(default.shutdown_grace_secs),
            sys_interval_secs: self.sys_interval_secs.unwrap_or(default.sys_interval_secs),
        }
    }
}

impl PartialAuthSettings {
    fn merge(self, default: AuthSettings) -> AuthSettings {
        AuthSettings {
            allow_anonymous: self.allow_anonymous.unwrap_or(default.allow_anonymous),
            users: self.users.unwrap_or(default.users),
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 1883,
                ws_port: None,
            },
            broker: BrokerSettings::default(),
            auth: AuthSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            session_expiry_secs: 3600,
            connect_timeout_secs: 10,
            max_retries: 5,
            retry_interval_ms: 5000,
            max_inflight: 20,
            max_queued_messages: 1000,
            max_outbound_backlog: 1000,
            max_packet_size: crate::codec::MAX_REMAINING_LENGTH,
            shutdown_grace_secs: 5,
            sys_interval_secs: 10,
        }
    }
}
