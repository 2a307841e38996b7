//! oais-ingest - OAIS ingestion service
//!
//! Runs, for every configured tenant, the request schedulers, the unblock
//! and maintenance sweeps, the storage result poller and the job worker,
//! all against the tenant's SQLite database, until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use oais_common::config::{locate_config_file, load_or_default, RootFolderInitializer, RootFolderResolver};
use oais_common::events::EventBus;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oais_ingest::clients::{DbJobDispatcher, EventBusNotifier, HttpStorageClient};
use oais_ingest::config::{IngestConfig, CONFIG_ENV, SERVICE_NAME};
use oais_ingest::db;
use oais_ingest::models::RequestType;
use oais_ingest::services::{run_every, Reconciler, RequestService, Scheduler, Worker};
use oais_ingest::{IngestContext, IngestError};

/// Command-line arguments for oais-ingest
#[derive(Parser, Debug)]
#[command(name = "oais-ingest")]
#[command(about = "OAIS ingestion service: SIP processing, AIP storage, updates and deletions")]
#[command(version)]
struct Args {
    /// Bootstrap TOML configuration file
    #[arg(short, long, env = "OAIS_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the tenant databases
    #[arg(short, long, env = "OAIS_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = locate_config_file(args.config.as_deref(), CONFIG_ENV, SERVICE_NAME);
    let config: IngestConfig =
        load_or_default(config_path.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config)?;

    info!("Starting oais-ingest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration: {}", path.display());
    }

    let root_folder = RootFolderResolver::new(SERVICE_NAME)
        .with_cli_arg(args.root_folder)
        .with_toml_value(config.root_folder.clone())
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let event_bus = EventBus::new(1000);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for tenant in &config.tenants {
        let db_path = initializer.database_path(tenant);
        let pool = db::init_database_pool(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        let mut tenant_config = config.clone();
        tenant_config.ingest.max_lock_wait_ms =
            db::settings::get_max_lock_wait_ms(&pool, config.ingest.max_lock_wait_ms)
                .await
                .context("Failed to read lock wait setting")?;

        let storage = HttpStorageClient::new(
            tenant_config.storage.base_url.clone(),
            tenant_config.storage.request_timeout_ms,
        )
        .context("Failed to build storage client")?;
        let dispatcher = DbJobDispatcher::new(pool.clone(), tenant_config.ingest.max_lock_wait_ms);

        let ctx = IngestContext::new(
            tenant.clone(),
            pool,
            event_bus.clone(),
            Arc::new(tenant_config),
            Arc::new(storage),
            Arc::new(EventBusNotifier::new(event_bus.clone())),
            Arc::new(dispatcher),
        );
        info!(tenant = %tenant, database = %db_path.display(), "Tenant ready");

        let worker = Worker::new(ctx.clone());
        worker
            .recover()
            .await
            .with_context(|| format!("Failed to recover jobs of tenant {}", tenant))?;

        tasks.extend(spawn_tenant(ctx, worker, &cancel));
    }

    shutdown_signal().await;
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &IngestConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("oais_ingest={0},oais_common={0}", config.logging.level).into());

    let (stderr_layer, file_layer) = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            (None, Some(layer))
        }
        None => (Some(tracing_subscriber::fmt::layer()), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Periodic tasks of one tenant
fn spawn_tenant(ctx: IngestContext, worker: Worker, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    let delays = &ctx.config.scheduler;
    let scheduled = [
        (RequestType::Ingest, "ingest_scheduler", delays.ingest_delay_ms),
        (RequestType::AipUpdatesCreator, "updates_creator_scheduler", delays.updates_creator_delay_ms),
        (RequestType::AipUpdate, "update_scheduler", delays.update_delay_ms),
        (RequestType::AipStoreMetadata, "save_metadata_scheduler", delays.save_metadata_delay_ms),
        (RequestType::OaisDeletion, "oais_deletion_scheduler", delays.deletion_delay_ms),
        (RequestType::StorageDeletion, "storage_deletion_scheduler", delays.deletion_delay_ms),
    ];

    let mut tasks = Vec::new();
    for (request_type, name, delay_ms) in scheduled {
        let scheduler = Scheduler::new(ctx.clone());
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_every(name, Duration::from_millis(delay_ms), cancel, || {
                let scheduler = scheduler.clone();
                async move { scheduler.schedule(request_type).await.map(|_| ()) }
            })
            .await
        }));
    }

    {
        let requests = RequestService::new(ctx.clone());
        let cancel = cancel.clone();
        let period = Duration::from_millis(delays.unblock_delay_ms);
        tasks.push(tokio::spawn(async move {
            run_every("unblock", period, cancel, || {
                let requests = requests.clone();
                async move { requests.unblock(None).await.map(|_| ()) }
            })
            .await
        }));
    }

    {
        let scheduler = Scheduler::new(ctx.clone());
        let reconciler = Reconciler::new(ctx.clone());
        let recovery = worker.clone();
        let cancel = cancel.clone();
        let period = Duration::from_millis(delays.reclaim_delay_ms);
        tasks.push(tokio::spawn(async move {
            run_every("maintenance", period, cancel, || {
                let scheduler = scheduler.clone();
                let reconciler = reconciler.clone();
                let recovery = recovery.clone();
                async move {
                    recovery.recover().await?;
                    scheduler.reclaim().await?;
                    reconciler.expire_deadlines().await?;
                    scheduler.purge_jobs().await?;
                    Ok::<(), IngestError>(())
                }
            })
            .await
        }));
    }

    {
        let reconciler = Reconciler::new(ctx.clone());
        let cancel = cancel.clone();
        let period = ctx.config.storage.poll_interval();
        tasks.push(tokio::spawn(async move {
            run_every("storage_poller", period, cancel, || {
                let reconciler = reconciler.clone();
                async move { reconciler.poll_pending().await.map(|_| ()) }
            })
            .await
        }));
    }

    {
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    tasks
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
