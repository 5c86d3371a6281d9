//! The `config` module loads and validates client configuration.
//!
//! Sources are layered, later ones winning:
//! 1. built-in defaults ([`Settings::default`])
//! 2. `config/default.{toml,yaml,json,...}` in the working directory, if present
//! 3. an explicit file passed by the caller (for example `--config`)
//! 4. environment variables such as `MQTTLINK__BROKER__PORT=8883`

mod settings;

#[cfg(test)]
mod tests;

use std::path::Path;

use config::{Config, Environment, File};

use crate::codec::{MAX_PACKET_SIZE, topic};
use crate::utils::error::{Error, Result};

pub use settings::{
    BrokerSettings, LastWillSettings, LoggingSettings, ProxyProtocol, ProxySettings,
    ReconnectSettings, SessionSettings, Settings, TransportKind, TransportSettings,
    WebSocketSettings,
};

pub const ENV_PREFIX: &str = "MQTTLINK";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings> {
    load_config_from(None)
}

/// Like [`load_config`], with `path` layered between the default file and
/// the environment. A given path must exist.
pub fn load_config_from(path: Option<&Path>) -> Result<Settings> {
    let mut builder = Config::builder().add_source(File::with_name("config/default").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    /// Reject combinations that cannot produce a working connection.
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.host.is_empty() {
            return Err(Error::InvalidConfig("broker.host must not be empty".into()));
        }
        if broker.port == 0 {
            return Err(Error::InvalidConfig("broker.port must not be 0".into()));
        }
        if broker.password.is_some() && broker.username.is_none() {
            return Err(Error::InvalidConfig(
                "broker.password requires broker.username".into(),
            ));
        }
        if broker.max_packet_size < 64 || broker.max_packet_size > MAX_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "broker.max_packet_size must be between 64 and {MAX_PACKET_SIZE}"
            )));
        }
        if let Some(will) = &broker.last_will {
            if !topic::valid_topic_name(&will.topic) {
                return Err(Error::InvalidConfig(format!(
                    "broker.last_will.topic {:?} is not a valid topic name",
                    will.topic
                )));
            }
            if will.qos > 2 {
                return Err(Error::InvalidConfig("broker.last_will.qos must be 0, 1 or 2".into()));
            }
        }

        if let Some(proxy) = &self.transport.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                return Err(Error::InvalidConfig(
                    "transport.proxy needs a host and a non-zero port".into(),
                ));
            }
            if proxy.protocol == ProxyProtocol::Socks4 && proxy.password.is_some() {
                return Err(Error::InvalidConfig(
                    "SOCKS4 proxies do not support passwords".into(),
                ));
            }
        }
        if self.transport.websocket.server_path.starts_with('/') {
            return Err(Error::InvalidConfig(
                "transport.websocket.server_path must not start with '/'".into(),
            ));
        }

        if self.session.retry_interval_ms == 0 || self.session.ack_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "session timeouts must be greater than zero".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::InvalidConfig("reconnect.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}
