use super::settings::{ClientSettings, ServerSettings, Settings, SettingsError};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.sync_interval_ms, 1000);
    assert!(!settings.server.notify_expired);
    assert!(settings.client.reconnect);
    assert_eq!(settings.log_level, "info");
    assert!(settings.server.validate().is_ok());
    assert!(settings.client.validate().is_ok());
}

#[test]
fn test_reserved_client_id_rejected() {
    for reserved in ["init", "request", "response", "error", "acknowledge", "receivers"] {
        let client = ClientSettings {
            id: reserved.to_string(),
            ..ClientSettings::default()
        };
        assert!(matches!(
            client.validate(),
            Err(SettingsError::ReservedId(id)) if id == reserved
        ));
    }
}

#[test]
fn test_invalid_values_fail_fast() {
    let low_port = ServerSettings {
        port: 80,
        ..ServerSettings::default()
    };
    assert!(matches!(
        low_port.validate(),
        Err(SettingsError::InvalidPort { port: 80, .. })
    ));

    let zero_sync = ServerSettings {
        sync_interval_ms: 0,
        ..ServerSettings::default()
    };
    assert!(matches!(
        zero_sync.validate(),
        Err(SettingsError::ZeroInterval { .. })
    ));

    let empty_key = ClientSettings {
        secure_key: Some(String::new()),
        ..ClientSettings::default()
    };
    assert!(matches!(
        empty_key.validate(),
        Err(SettingsError::Empty { .. })
    ));
}

#[test]
fn test_invalid_proxy_is_reported_with_index() {
    let server = ServerSettings {
        proxy_to: vec![
            ClientSettings::default(),
            ClientSettings {
                id: "init".to_string(),
                ..ClientSettings::default()
            },
        ],
        ..ServerSettings::default()
    };
    match server.validate() {
        Err(SettingsError::Proxy { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected proxy error, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    // load_config reads config/default.* relative to the working directory.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        log_level = "debug"

        [server]
        id = "edge"
        port = 9000
        sweep_interval_ms = 250
        secure_key = "s3cret"

        [[server.proxy_to]]
        host = "10.0.0.2"
        port = 9100
        id = "edge-link"

        [client]
        id = "svc-a"
        reconnect = false
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.log_level, "debug");
    assert_eq!(cfg.server.id, "edge");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.sweep_interval_ms, 250);
    assert_eq!(cfg.server.sync_interval_ms, 1000);
    assert_eq!(cfg.server.secure_key.as_deref(), Some("s3cret"));
    assert_eq!(cfg.server.proxy_to.len(), 1);
    assert_eq!(cfg.server.proxy_to[0].id, "edge-link");
    assert_eq!(cfg.server.proxy_to[0].port, 9100);
    assert!(cfg.server.proxy_to[0].reconnect);
    assert_eq!(cfg.client.id, "svc-a");
    assert!(!cfg.client.reconnect);
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("RELAYQ__SERVER__PORT", Some("9443")),
            ("RELAYQ__CLIENT__ID", Some("svc-env")),
        ],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.server.port, 9443);
            assert_eq!(cfg.client.id, "svc-env");
            assert_eq!(cfg.server.host, "127.0.0.1");
        },
    );
}
