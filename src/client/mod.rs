//! The `client` module is the public face of the crate.
//!
//! [`MqttClient`] is a cheap handle onto the connection task. Every call
//! becomes a request message with a one-shot reply, so callers never touch
//! session state directly, and dropping a pending call's future abandons it.

pub mod mqtt_client;
pub use mqtt_client::{ClientBuilder, Events, MqttClient, generate_client_id};
