//! Configuration for oais-ingest
//!
//! Bootstrap TOML layout. Every key has a default so an absent file (or an
//! absent table) still yields a runnable service.
//!
//! ```toml
//! root_folder = "/var/lib/oais"
//! tenants = ["default"]
//!
//! [logging]
//! level = "info"
//!
//! [scheduler]
//! page_size = 100
//!
//! [ingest]
//! remote_request_timeout_minutes = 60
//!
//! [storage]
//! base_url = "http://storage:9000"
//!
//! [worker]
//! slots = 4
//! job_lease_secs = 300
//! ```

use oais_common::config::LoggingConfig;
use oais_common::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "OAIS_INGEST_CONFIG";

/// Service name used for default config and data paths
pub const SERVICE_NAME: &str = "oais-ingest";

/// Upper bound for timeouts and leases (one year)
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub root_folder: Option<PathBuf>,
    /// One database per tenant
    pub tenants: Vec<String>,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub ingest: IngestSettings,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            tenants: vec!["default".to_string()],
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            ingest: IngestSettings::default(),
            storage: StorageConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tenants.is_empty() {
            return Err(Error::Config("at least one tenant is required".to_string()));
        }
        if self.tenants.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::Config("tenant names must not be empty".to_string()));
        }
        if self.scheduler.page_size == 0 {
            return Err(Error::Config("scheduler.page_size must be greater than 0".to_string()));
        }
        if self.worker.slots == 0 {
            return Err(Error::Config("worker.slots must be greater than 0".to_string()));
        }
        if self.ingest.max_bulk_size == 0 {
            return Err(Error::Config("ingest.max_bulk_size must be greater than 0".to_string()));
        }

        let periods = [
            ("scheduler.ingest_delay_ms", self.scheduler.ingest_delay_ms),
            ("scheduler.update_delay_ms", self.scheduler.update_delay_ms),
            ("scheduler.save_metadata_delay_ms", self.scheduler.save_metadata_delay_ms),
            ("scheduler.deletion_delay_ms", self.scheduler.deletion_delay_ms),
            ("scheduler.updates_creator_delay_ms", self.scheduler.updates_creator_delay_ms),
            ("scheduler.unblock_delay_ms", self.scheduler.unblock_delay_ms),
            ("scheduler.reclaim_delay_ms", self.scheduler.reclaim_delay_ms),
            ("storage.poll_interval_ms", self.storage.poll_interval_ms),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            ("worker.job_lease_secs", self.worker.job_lease_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be greater than 0", name)));
        }

        let timeouts = [
            (
                "ingest.remote_request_timeout_minutes",
                self.ingest.remote_request_timeout_minutes.saturating_mul(60),
            ),
            ("scheduler.running_reclaim_timeout_secs", self.scheduler.running_reclaim_timeout_secs),
            ("worker.job_lease_secs", self.worker.job_lease_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs > MAX_TIMEOUT_SECS) {
            return Err(Error::Config(format!("{} must not exceed one year", name)));
        }
        Ok(())
    }
}

/// Polling intervals and page size of the schedulers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub page_size: u32,
    pub ingest_delay_ms: u64,
    pub update_delay_ms: u64,
    pub save_metadata_delay_ms: u64,
    pub deletion_delay_ms: u64,
    pub updates_creator_delay_ms: u64,
    pub unblock_delay_ms: u64,
    pub reclaim_delay_ms: u64,
    /// RUNNING requests without a job for this long are reclaimed
    pub running_reclaim_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            ingest_delay_ms: 1000,
            update_delay_ms: 10_000,
            save_metadata_delay_ms: 2000,
            deletion_delay_ms: 2000,
            updates_creator_delay_ms: 2000,
            unblock_delay_ms: 5000,
            reclaim_delay_ms: 60_000,
            running_reclaim_timeout_secs: 300,
        }
    }
}

impl SchedulerConfig {
    /// Bounded by `validate`
    pub fn reclaim_timeout(&self) -> chrono::Duration {
        secs_to_duration(self.running_reclaim_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// SIPs accepted in one submission
    pub max_bulk_size: usize,
    pub remote_request_timeout_minutes: u64,
    pub default_chain: String,
    /// Upper bound for retrying a locked database (overridable in `settings`)
    pub max_lock_wait_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_bulk_size: 1000,
            remote_request_timeout_minutes: 60,
            default_chain: "DefaultProcessingChain".to_string(),
            max_lock_wait_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 2000,
            request_timeout_ms: 30_000,
        }
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs executed concurrently per tenant
    pub slots: usize,
    /// Idle wait between two empty job queue scans
    pub poll_interval_ms: u64,
    /// A RUNNING job whose worker stopped renewing it for this long is
    /// considered lost
    pub job_lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_interval_ms: 500,
            job_lease_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_lease(&self) -> chrono::Duration {
        secs_to_duration(self.job_lease_secs)
    }

    /// Lease renewal period, a third of the lease
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.job_lease_secs.saturating_mul(1000) / 3).max(1))
    }
}

fn secs_to_duration(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
