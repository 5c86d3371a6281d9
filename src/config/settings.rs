use serde::{Deserialize, Serialize};

/// Top-level configuration settings for the client.
///
/// Every section falls back to its defaults when it is missing from the
/// configuration sources, and so does every field inside a section.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub transport: TransportSettings,
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
    pub logging: LoggingSettings,
}

/// Where the broker is and how to introduce ourselves to it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// Empty means a client id is generated at connect time.
    pub client_id: String,
    /// Zero disables keep-alive.
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bounds the transport open and the CONNECT/CONNACK exchange.
    pub connect_timeout_ms: u64,
    pub max_packet_size: usize,
    pub last_will: Option<LastWillSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LastWillSettings {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Transport layering: an optional proxy tunnel, then plain TCP or websocket.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub proxy: Option<ProxySettings>,
    pub websocket: WebSocketSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    WebSocket,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Socks4,
    #[default]
    Socks5,
    Http,
}

/// Proxy the TCP connection is tunneled through.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProxySettings {
    #[serde(default)]
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_proxy_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_proxy_handshake_timeout_ms() -> u64 {
    10_000
}

/// Websocket endpoint details, used when `kind` is `websocket`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Path without the leading slash.
    pub server_path: String,
    pub query: Option<String>,
    pub subprotocol: String,
}

/// In-flight bookkeeping of the session.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Unacknowledged PUBLISH/PUBREL packets are resent after this long.
    pub retry_interval_ms: u64,
    /// Resends before an exchange is reported as failed.
    pub max_retries: u8,
    /// SUBSCRIBE/UNSUBSCRIBE fail when not acknowledged within this.
    pub ack_timeout_ms: u64,
    /// Directory for the outgoing flow store; `None` keeps flows in memory only.
    pub persistence_path: Option<String>,
}

/// Parameters of the exponential backoff reconnect policy.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: String::new(),
            keep_alive_secs: 60,
            clean_session: true,
            username: None,
            password: None,
            connect_timeout_ms: 10_000,
            max_packet_size: crate::codec::MAX_PACKET_SIZE,
            last_will: None,
        }
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            server_path: "mqtt".to_string(),
            query: None,
            subprotocol: "mqtt".to_string(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5_000,
            max_retries: 5,
            ack_timeout_ms: 10_000,
            persistence_path: None,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 1_000,
            max_delay_ms: 120_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
