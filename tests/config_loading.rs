use std::io::Write;

use graphex_core::config::AppConfig;
use graphex_core::{CoercionMode, GraphexError};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrency = 8
default_node_timeout_secs = 30
cancel_grace_ms = 250
event_buffer = 1024
retained_runs = 10
coercion = "strict"
working_dir = "/tmp/graphex-test"

[gateway]
bind = "0.0.0.0:9999"

[log]
enabled = true
log_dir = "/tmp/graphex-test/logs"

[secrets]
router_password = "hunter2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 8);
    assert_eq!(config.engine.default_node_timeout_secs, 30);
    assert_eq!(config.engine.cancel_grace_ms, 250);
    assert_eq!(config.engine.event_buffer, 1024);
    assert_eq!(config.engine.retained_runs, 10);
    assert_eq!(config.engine.coercion, CoercionMode::Strict);
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert!(config.log.enabled);
    assert_eq!(
        config.log_dir(),
        std::path::PathBuf::from("/tmp/graphex-test/logs")
    );
    assert_eq!(config.secrets["router_password"], "hunter2");
    assert!(config.validate().is_ok());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("GRAPHEX_TEST_SECRET", "expanded-secret");

    let toml_content = r#"
[secrets]
api_token = "${GRAPHEX_TEST_SECRET}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.secrets["api_token"], "expanded-secret");

    std::env::remove_var("GRAPHEX_TEST_SECRET");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[gateway]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.default_node_timeout_secs, 300);
    assert_eq!(config.engine.cancel_grace_ms, 500);
    assert_eq!(config.engine.event_buffer, 256);
    assert_eq!(config.engine.retained_runs, 64);
    assert_eq!(config.engine.coercion, CoercionMode::Lenient);
    assert_eq!(config.gateway.bind, "127.0.0.1:18790");
    assert!(config.log.enabled);
    assert!(config.secrets.is_empty());
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, GraphexError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_concurrency = \"many\"\n")
        .expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, GraphexError::Config(_)));
}

#[test]
fn test_zero_event_buffer_fails_validation() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nevent_buffer = 0\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.validate().is_err());
}
