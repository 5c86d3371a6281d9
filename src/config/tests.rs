use super::*;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.host, "127.0.0.1");
    assert_eq!(settings.broker.port, 1883);
    assert_eq!(settings.broker.keep_alive_secs, 60);
    assert!(settings.broker.clean_session);
    assert_eq!(settings.transport.kind, TransportKind::Tcp);
    assert!(settings.transport.proxy.is_none());
    assert_eq!(settings.transport.websocket.server_path, "mqtt");
    assert_eq!(settings.transport.websocket.subprotocol, "mqtt");
    assert_eq!(settings.session.max_retries, 5);
    assert!(!settings.reconnect.enabled);
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_password_without_username() {
    let mut settings = Settings::default();
    settings.broker.password = Some("secret".to_string());
    assert!(matches!(settings.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_validate_rejects_wildcard_last_will_topic() {
    let mut settings = Settings::default();
    settings.broker.last_will = Some(LastWillSettings {
        topic: "status/#".to_string(),
        payload: "gone".to_string(),
        qos: 1,
        retain: false,
    });
    assert!(settings.validate().is_err());
}

#[test]
fn test_validate_rejects_socks4_password() {
    let mut settings = Settings::default();
    settings.transport.proxy = Some(ProxySettings {
        protocol: ProxyProtocol::Socks4,
        host: "proxy.local".to_string(),
        port: 1080,
        username: Some("user".to_string()),
        password: Some("pw".to_string()),
        handshake_timeout_ms: 1_000,
    });
    assert!(settings.validate().is_err());
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("MQTTLINK__BROKER__HOST", Some("broker.example")),
            ("MQTTLINK__BROKER__PORT", Some("8883")),
            ("MQTTLINK__BROKER__CLIENT_ID", Some("env-client")),
            ("MQTTLINK__TRANSPORT__KIND", Some("websocket")),
            ("MQTTLINK__SESSION__MAX_RETRIES", Some("2")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.host, "broker.example");
            assert_eq!(cfg.broker.port, 8883);
            assert_eq!(cfg.broker.client_id, "env-client");
            assert_eq!(cfg.transport.kind, TransportKind::WebSocket);
            assert_eq!(cfg.session.max_retries, 2);
            // untouched values keep their defaults
            assert_eq!(cfg.broker.keep_alive_secs, 60);
        },
    );
}

#[test]
#[serial]
fn test_invalid_env_value_is_rejected() {
    temp_env::with_var("MQTTLINK__BROKER__PORT", Some("0"), || {
        assert!(matches!(load_config(), Err(Error::InvalidConfig(_))));
    });
}

#[test]
#[serial]
fn test_explicit_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("client.toml");
    let toml = r#"
        [broker]
        host = "10.0.0.5"
        keep_alive_secs = 15
        clean_session = false

        [transport]
        kind = "websocket"

        [transport.websocket]
        server_path = "ws/mqtt"
        query = "token=abc"

        [transport.proxy]
        protocol = "http"
        host = "proxy.local"
        port = 3128

        [reconnect]
        enabled = true
        max_attempts = 3
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(Some(&path)).expect("load_config_from failed");
    assert_eq!(cfg.broker.host, "10.0.0.5");
    assert_eq!(cfg.broker.port, 1883);
    assert_eq!(cfg.broker.keep_alive_secs, 15);
    assert!(!cfg.broker.clean_session);
    assert_eq!(cfg.transport.kind, TransportKind::WebSocket);
    assert_eq!(cfg.transport.websocket.server_path, "ws/mqtt");
    assert_eq!(cfg.transport.websocket.query.as_deref(), Some("token=abc"));
    assert_eq!(cfg.transport.websocket.subprotocol, "mqtt");
    let proxy = cfg.transport.proxy.expect("proxy section");
    assert_eq!(proxy.protocol, ProxyProtocol::Http);
    assert_eq!(proxy.port, 3128);
    assert_eq!(proxy.handshake_timeout_ms, 10_000);
    assert!(cfg.reconnect.enabled);
    assert_eq!(cfg.reconnect.max_attempts, Some(3));
}

#[test]
#[serial]
fn test_default_file_in_working_directory() {
    // Create a temporary directory and set it as current dir so load_config
    // will pick up config/default.toml from there.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        port = 1884

        [logging]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure does not leak the tempdir cwd
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.port, 1884);
    assert_eq!(cfg.logging.level, "debug");
}
