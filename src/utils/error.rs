//! The `error` module defines the error types used across `mqttlink`.
//!
//! Errors are split by layer: [`ConnectError`] for establishing a transport,
//! [`MalformedPacketError`] for bytes that do not decode to a valid MQTT
//! packet, and [`Error`] which everything above the transport returns.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::codec::{ConnectReturnCode, PacketType};
use crate::connection::ConnectionState;

/// Failure to open a transport channel to the broker.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The TCP connection to the broker or proxy could not be made.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A connect phase did not finish in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The proxy refused or broke the tunneling handshake.
    #[error("proxy handshake failed: {0}")]
    Proxy(String),

    /// I/O failure while talking to the proxy.
    #[error("proxy handshake i/o error: {0}")]
    ProxyIo(#[source] io::Error),

    /// The websocket upgrade failed.
    #[error("websocket upgrade failed: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Host, path or header values could not form a valid request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Bytes received from the peer do not form a valid MQTT 3.1.1 packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedPacketError {
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("invalid fixed header flags {flags:#06b} for {packet_type:?}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet of {size} bytes exceeds maximum packet size of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unexpected end of packet")]
    UnexpectedEof,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("invalid QoS {0}")]
    InvalidQoS(u8),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("string or binary field of {0} bytes is too long")]
    FieldTooLong(usize),

    #[error("unsupported protocol name or level")]
    UnsupportedProtocol,

    #[error("invalid CONNACK return code {0}")]
    InvalidReturnCode(u8),

    #[error("invalid SUBACK return code {0:#04x}")]
    InvalidSubscribeReturnCode(u8),

    #[error("packet identifier must not be zero")]
    ZeroPacketId,

    #[error("{0}")]
    Invalid(&'static str),
}

/// Errors returned by the client, the connection task and the session.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] MalformedPacketError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection refused by broker: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("no PINGRESP within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("CONNACK not received within {0:?}")]
    ConnAckTimeout(Duration),

    #[error("packet {packet_id} was not acknowledged in time")]
    AckTimeout { packet_id: u16 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("client is not connected")]
    NotConnected,

    #[error("illegal connection state transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("all packet identifiers are in use")]
    PacketIdsExhausted,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("broker rejected subscription to {0}")]
    SubscriptionRejected(String),

    #[error("session state was discarded")]
    SessionDiscarded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors move the connection to its terminal failed state;
    /// everything else leaves reconnection to the reconnect policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_) | Error::ConnectionRefused(_))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
