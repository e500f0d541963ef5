use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::Error;
use crate::Metadata;

fn cleanup_all_registry_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("REGISTRY__") || key == ENV_CONFIG_PATH {
            std::env::remove_var(&key);
        }
    }
}

fn write_config(contents: &str) -> (tempfile::TempDir, String) {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("registry.toml");
    std::fs::write(&path, contents).unwrap();
    let path = path.to_str().unwrap().to_string();
    (temp_dir, path)
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = RegistryConfig::default();

    assert_eq!(config.store.dial_timeout_ms, 5000);
    assert_eq!(config.store.lease_ttl_secs, 60);
    assert_eq!(config.store.revoke_timeout_ms, 5000);
    assert_eq!(config.store.shutdown_delay_ms, 300);
    assert_eq!(config.retry.lease_rebootstrap_interval_ms, 5000);
    assert_eq!(config.retry.watch_reopen_interval_ms, 1000);
    assert_eq!(config.retry.watch_max_failed_attempts, 10);
    assert_eq!(config.retry.watch_error_pause_ms, 100);
    assert_eq!(config.sync.resync_delay_ms, 5000);
    assert!(!config.monitoring.prometheus_enabled);
    assert_eq!(config.monitoring.prometheus_port, 9100);
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_registry_env_vars();
    with_vars(
        vec![
            ("REGISTRY__STORE__LEASE_TTL_SECS", Some("30")),
            ("REGISTRY__RETRY__WATCH_MAX_FAILED_ATTEMPTS", Some("3")),
            ("REGISTRY__REGISTRATION__SERVER_TYPE", Some("gate")),
        ],
        || {
            let config = RegistryConfig::new().unwrap();

            assert_eq!(config.store.lease_ttl_secs, 30);
            assert_eq!(config.retry.watch_max_failed_attempts, 3);
            assert_eq!(config.registration.server_type, "gate");
            // Untouched sections keep their defaults
            assert_eq!(config.store.dial_timeout_ms, 5000);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_registry_env_vars();
    let (_dir, path) = write_config(
        r#"
        [store]
        lease_ttl_secs = 15

        [registration]
        server_type = "app"
        namespace_prefix = "/staging"
        store_endpoints = "http://etcd-0:2379,http://etcd-1:2379"

        [registration.metadata]
        httpHost = "10.1.0.4"
        httpPort = "8080"
        "#,
    );

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let config = RegistryConfig::default().with_override_config(&path).unwrap();

        assert_eq!(config.store.lease_ttl_secs, 15);
        assert_eq!(config.store.revoke_timeout_ms, 5000);
        assert_eq!(config.registration.namespace_prefix, "/staging");
        assert_eq!(
            config.registration.endpoints(),
            vec!["http://etcd-0:2379", "http://etcd-1:2379"]
        );
        assert_eq!(
            config.registration.metadata,
            Some(Metadata::http("10.1.0.4", "8080"))
        );
        assert!(config.registration.validate().is_ok());
    });
}

#[test]
#[serial]
fn environment_should_win_over_file() {
    cleanup_all_registry_env_vars();
    let (_dir, path) = write_config(
        r#"
        [store]
        lease_ttl_secs = 15
        "#,
    );

    with_vars(vec![("REGISTRY__STORE__LEASE_TTL_SECS", Some("45"))], || {
        let config = RegistryConfig::default().with_override_config(&path).unwrap();
        assert_eq!(config.store.lease_ttl_secs, 45);
    });
}

#[test]
#[serial]
fn config_path_env_should_be_required_when_set() {
    cleanup_all_registry_env_vars();
    with_vars(vec![(ENV_CONFIG_PATH, Some("/nonexistent/registry.toml"))], || {
        assert!(matches!(RegistryConfig::new(), Err(Error::Config(_))));
    });
}

#[test]
#[serial]
fn load_should_reject_invalid_values() {
    cleanup_all_registry_env_vars();
    let (_dir, path) = write_config(
        r#"
        [store]
        lease_ttl_secs = 0
        "#,
    );

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let err = RegistryConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("lease_ttl_secs")));
    });
}

#[test]
fn validate_should_reject_privileged_metrics_port() {
    let mut config = RegistryConfig::default();
    config.monitoring.prometheus_enabled = true;
    config.monitoring.prometheus_port = 80;

    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn validate_should_reject_zero_intervals() {
    let mut config = RegistryConfig::default();
    config.retry.watch_reopen_interval_ms = 0;
    assert!(config.validate().is_err());

    let mut config = RegistryConfig::default();
    config.store.dial_timeout_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn resync_delay_zero_disables_resync() {
    let mut sync = SyncConfig::default();
    assert_eq!(sync.resync_delay(), Some(std::time::Duration::from_secs(5)));

    sync.resync_delay_ms = 0;
    assert_eq!(sync.resync_delay(), None);
}
