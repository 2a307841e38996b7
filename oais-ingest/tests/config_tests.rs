//! Bootstrap configuration tests
//!
//! Uses serial_test: tests touching OAIS_INGEST_CONFIG are marked #[serial].

use oais_common::config::{load_or_default, locate_config_file};
use oais_ingest::config::{IngestConfig, CONFIG_ENV, SERVICE_NAME};
use serial_test::serial;
use std::env;
use std::path::Path;
use tempfile::TempDir;

#[test]
#[serial]
fn test_config_file_from_environment() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("oais-ingest.toml");
    std::fs::write(
        &path,
        r#"
        tenants = ["project-a", "project-b"]

        [scheduler]
        page_size = 25

        [worker]
        slots = 2
        "#,
    )
    .unwrap();
    env::set_var(CONFIG_ENV, &path);

    let located = locate_config_file(None, CONFIG_ENV, SERVICE_NAME);
    env::remove_var(CONFIG_ENV);

    assert_eq!(located.as_deref(), Some(path.as_path()));
    let config: IngestConfig = load_or_default(located.as_deref()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.tenants, vec!["project-a", "project-b"]);
    assert_eq!(config.scheduler.page_size, 25);
    assert_eq!(config.worker.slots, 2);
    assert_eq!(config.ingest.max_bulk_size, 1000);
}

#[test]
#[serial]
fn test_cli_path_wins_over_environment() {
    env::set_var(CONFIG_ENV, "/tmp/oais-from-env.toml");
    let located = locate_config_file(Some(Path::new("/tmp/oais-from-cli.toml")), CONFIG_ENV, SERVICE_NAME);
    env::remove_var(CONFIG_ENV);

    assert_eq!(located.as_deref(), Some(Path::new("/tmp/oais-from-cli.toml")));
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.toml");

    let config: IngestConfig = load_or_default(Some(missing.as_path())).unwrap();
    assert_eq!(config.tenants, vec!["default"]);
    assert_eq!(config.ingest.default_chain, "DefaultProcessingChain");
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut config = IngestConfig::default();
    config.worker.slots = 0;
    assert!(config.validate().unwrap_err().to_string().contains("worker.slots"));

    let mut config = IngestConfig::default();
    config.tenants.clear();
    assert!(config.validate().is_err());

    let mut config = IngestConfig::default();
    config.scheduler.unblock_delay_ms = 0;
    assert!(config.validate().unwrap_err().to_string().contains("unblock_delay_ms"));

    let mut config = IngestConfig::default();
    config.worker.poll_interval_ms = 0;
    assert!(config.validate().is_err());

    let mut config = IngestConfig::default();
    config.ingest.remote_request_timeout_minutes = u64::MAX / 2;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_zero_period_in_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("oais-ingest.toml");
    std::fs::write(&path, "[storage]\npoll_interval_ms = 0\n").unwrap();

    let config: IngestConfig = load_or_default(Some(path.as_path())).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("storage.poll_interval_ms"));
}

#[test]
fn test_malformed_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "tenants = [").unwrap();

    let result: oais_common::Result<IngestConfig> = load_or_default(Some(path.as_path()));
    assert!(result.is_err());
}
