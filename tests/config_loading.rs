use std::io::Write;

use flowlink_core::config::AppConfig;
use flowlink_core::error::FlowlinkError;
use flowlink_engine::EngineConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[connection]
url = "wss://backend.example.com/ws"
keepalive_interval_secs = 15
reconnect_delay_ms = 1500

[requests]
default_timeout_secs = 45

[events]
capacity = 1024

[log]
filter = "flowlink=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.connection.url, "wss://backend.example.com/ws");
    assert_eq!(config.connection.keepalive_interval_secs, 15);
    assert_eq!(config.connection.reconnect_delay_ms, 1500);
    assert_eq!(config.requests.default_timeout_secs, 45);
    assert_eq!(config.events.capacity, 1024);
    assert_eq!(config.log.filter, "flowlink=debug");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) =
        flowlink_test_utils::write_config(&flowlink_test_utils::minimal_config("ws://127.0.0.1:5680/ws"));
    let config = AppConfig::load(&path).expect("load config");
    let engine = EngineConfig::from(&config);

    assert_eq!(engine.keepalive_interval.as_secs(), 30);
    assert_eq!(engine.reconnect_delay.as_millis(), 3000);
    assert_eq!(engine.request_timeout.as_secs(), 30);
    assert_eq!(engine.event_capacity, 256);
}

#[test]
fn test_env_var_expansion_in_url() {
    std::env::set_var("FLOWLINK_TEST_BACKEND_HOST", "exec.internal:9000");
    let config = AppConfig::parse(
        r#"
[connection]
url = "ws://${FLOWLINK_TEST_BACKEND_HOST}/ws"
"#,
    )
    .expect("parse config");
    std::env::remove_var("FLOWLINK_TEST_BACKEND_HOST");

    assert_eq!(config.connection.url, "ws://exec.internal:9000/ws");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FlowlinkError::ConfigNotFound(_)));
}

#[test]
fn test_zero_keepalive_rejected() {
    let err = AppConfig::parse(
        r#"
[connection]
url = "ws://localhost/ws"
keepalive_interval_secs = 0
"#,
    )
    .unwrap_err();
    assert!(matches!(err, FlowlinkError::Config(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::for_url("ws://localhost:5680/ws");
    let text = toml::to_string_pretty(&config).expect("serialize config");
    let reparsed = AppConfig::parse(&text).expect("reparse config");
    assert_eq!(reparsed.connection.url, config.connection.url);
    assert_eq!(reparsed.log.filter, config.log.filter);
}
