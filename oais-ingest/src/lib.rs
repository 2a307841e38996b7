//! oais-ingest library interface
//!
//! OAIS ingestion pipeline: SIP submission, per-SIP processing chains, AIP
//! storage/update/deletion requests and the lifecycle state machine that
//! schedules them without conflicting on the same AIP or session.
//!
//! Exposes public APIs for the binary and for integration testing.

pub mod chain;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod policy;
pub mod services;
pub mod utils;

pub use crate::error::{IngestError, IngestResult};

use oais_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::chain::ChainRegistry;
use crate::clients::{JobDispatcher, SessionNotifier, StorageClient};
use crate::config::IngestConfig;

/// Per-tenant state shared by services, schedulers and the worker
#[derive(Clone)]
pub struct IngestContext {
    pub tenant: String,
    /// Tenant database; the single source of truth for requests and entities
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub config: Arc<IngestConfig>,
    pub storage: Arc<dyn StorageClient>,
    pub notifier: Arc<dyn SessionNotifier>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub chains: Arc<ChainRegistry>,
}

impl IngestContext {
    pub fn new(
        tenant: impl Into<String>,
        db: SqlitePool,
        event_bus: EventBus,
        config: Arc<IngestConfig>,
        storage: Arc<dyn StorageClient>,
        notifier: Arc<dyn SessionNotifier>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            db,
            event_bus,
            config,
            storage,
            notifier,
            dispatcher,
            chains: Arc::new(ChainRegistry::with_defaults()),
        }
    }

    pub fn with_chains(mut self, chains: ChainRegistry) -> Self {
        self.chains = Arc::new(chains);
        self
    }

    pub fn max_lock_wait_ms(&self) -> u64 {
        self.config.ingest.max_lock_wait_ms
    }

    pub fn page_size(&self) -> i64 {
        i64::from(self.config.scheduler.page_size)
    }
}
