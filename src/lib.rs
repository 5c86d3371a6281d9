//! # mqttlink
//!
//! `mqttlink` is an MQTT 3.1.1 client built on tokio. It speaks to the broker
//! over plain TCP, through a SOCKS4/SOCKS5/HTTP CONNECT proxy, or inside a
//! WebSocket, and keeps QoS 1/2 exchanges alive across reconnects.
//!
//! ## Core Modules
//!
//! - `client`: The [`MqttClient`] handle applications use to publish and subscribe.
//! - `codec`: Encoding and decoding of MQTT control packets, plus topic matching.
//! - `config`: Loading and validating client settings.
//! - `connection`: The connection task, its state machine, keep-alive and reconnect policies.
//! - `session`: Packet identifiers, in-flight exchanges, subscriptions and the on-disk flow store.
//! - `transport`: Byte channels over TCP, proxies and WebSockets.
//! - `utils`: Error types and logging setup.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod session;
pub mod transport;
pub mod utils;


pub use crate::client::{ClientBuilder, Events, MqttClient};
pub use crate::codec::{Publish, QoS, SubscribeFilter, SubscribeReturnCode};
pub use crate::config::Settings;
pub use crate::connection::{ConnectionState, DisconnectSource, Event, ExponentialBackoff, ReconnectPolicy};
pub use crate::utils::error::{Error, Result};
