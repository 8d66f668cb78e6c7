use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_gohan_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("GOHAN__") || key == ENV_CONFIG_PATH {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = Settings::default();

    assert_eq!(config.cluster.master_ttl_secs, 10);
    assert_eq!(config.database.transaction_retries.attempts, 1);
    assert_eq!(config.database.transaction_retries.strategy, "deadlock");
    assert_eq!(config.database.transaction_retries.interval_between_attempts_ms, 100);
    assert_eq!(config.sync.poll_interval_ms, 30_000);
    assert_eq!(config.sync.batch_limit, 10_000);
    assert_eq!(config.state_watch.backoff_ms, 5_000);
    assert!(config.watch.keys.is_empty());
    assert!(!config.monitoring.prometheus_enabled);
}

#[test]
#[serial]
fn load_should_merge_environment_overrides() {
    cleanup_all_gohan_env_vars();
    with_vars(
        vec![
            ("GOHAN__SYNC__BATCH_LIMIT", Some("500")),
            ("GOHAN__CLUSTER__MASTER_TTL_SECS", Some("3")),
        ],
        || {
            let config = Settings::load().unwrap();

            assert_eq!(config.sync.batch_limit, 500);
            assert_eq!(config.cluster.master_ttl_secs, 3);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_gohan_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("override.toml");

    std::fs::write(
        &config_path,
        r#"
        [database.transaction_retries]
        attempts = -1
        interval_between_attempts_ms = 5

        [watch]
        keys = ["/foo", "/bar"]
        events = ["foo"]
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = Settings::default();
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .expect("override should succeed");

        assert_eq!(config.database.transaction_retries.attempts, -1);
        assert_eq!(config.database.transaction_retries.interval_between_attempts_ms, 5);
        assert_eq!(config.watch.keys, vec!["/foo".to_string(), "/bar".to_string()]);
        assert_eq!(config.watch.events, vec!["foo".to_string()]);
        // untouched sections keep their defaults
        assert_eq!(config.sync.batch_limit, 10_000);
    });
}

#[test]
#[serial]
fn config_path_env_should_be_loaded() {
    cleanup_all_gohan_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("gohan_test.toml");
    std::fs::write(
        &config_path,
        r#"
        [sync]
        poll_interval_ms = 1000
        "#,
    )
    .unwrap();

    with_vars(
        vec![
            (ENV_CONFIG_PATH, Some(config_path.to_str().unwrap())),
            ("GOHAN__SYNC__POLL_INTERVAL_MS", Some("2000")),
        ],
        || {
            let config = Settings::load().unwrap();
            // environment variables have the highest priority
            assert_eq!(config.sync.poll_interval_ms, 2000);
        },
    );
}

#[test]
fn validation_should_reject_zero_attempts() {
    let mut config = Settings::default();
    config.database.transaction_retries.attempts = 0;

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_relative_watch_keys() {
    let mut config = Settings::default();
    config.watch.keys = vec!["foo".to_string()];

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_duplicate_watch_keys() {
    let mut config = Settings::default();
    config.watch.keys = vec!["/foo".to_string(), "/foo".to_string()];

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_zero_master_ttl() {
    let mut config = Settings::default();
    config.cluster.master_ttl_secs = 0;

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_process_id_with_slash() {
    let mut config = Settings::default();
    config.cluster.process_id = Some("a/b".to_string());

    assert!(config.validate().is_err());
}

#[test]
fn validation_should_check_the_metrics_endpoint_only_when_enabled() {
    let mut config = Settings::default();
    config.monitoring.prometheus_port = 0;
    config.monitoring.bind_address = "239.0.0.1".parse().unwrap();
    assert!(config.validate().is_ok());

    config.monitoring.prometheus_enabled = true;
    assert!(config.validate().is_err());

    config.monitoring.prometheus_port = 9464;
    assert!(config.validate().is_err());

    config.monitoring.bind_address = "127.0.0.1".parse().unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.monitoring.metrics_addr().to_string(), "127.0.0.1:9464");
}

#[test]
#[serial]
fn load_should_parse_the_metrics_bind_address() {
    cleanup_all_gohan_env_vars();
    with_vars(
        vec![
            ("GOHAN__MONITORING__PROMETHEUS_ENABLED", Some("true")),
            ("GOHAN__MONITORING__BIND_ADDRESS", Some("10.0.0.7")),
        ],
        || {
            let config = Settings::load().unwrap();

            assert_eq!(config.monitoring.metrics_addr().to_string(), "10.0.0.7:9090");
        },
    );
}

#[test]
fn generated_process_ids_are_unique() {
    let config = ClusterConfig::default();
    assert_ne!(config.resolve_process_id(), config.resolve_process_id());
}
