//! The `connection` module runs the MQTT protocol over a transport channel.
//!
//! It owns the connection lifecycle ([`ConnectionState`]), the
//! CONNECT/CONNACK handshake, keep-alive, orderly and abrupt disconnects and
//! reconnection under a pluggable [`ReconnectPolicy`]. All of it happens in a
//! single task; see [`eventloop`] for how that task is driven.

mod event;
pub(crate) mod eventloop;
mod keepalive;
pub mod reconnect;
mod state;


pub use event::{DisconnectSource, Event};
pub use keepalive::{KeepAlive, KeepAliveAction};
pub use reconnect::{ExponentialBackoff, NoReconnect, ReconnectPolicy};
pub use state::{ConnectionState, StateMachine};
