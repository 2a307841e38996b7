//! Ingestion services
//!
//! - [`RequestService`]: request lifecycle (register, transitions, unblock,
//!   retry, delete)
//! - [`IngestService`]: submission entry points
//! - [`Scheduler`]: claims CREATED requests and dispatches jobs
//! - [`Worker`]: executes queued jobs
//! - [`Reconciler`]: applies remote storage results

pub mod deletion;
pub mod ingest_service;
pub mod reconciler;
pub mod request_service;
pub mod scheduler;
pub mod worker;

pub use ingest_service::{IngestService, RequestInfo};
pub use reconciler::{ReconcileReport, Reconciler};
pub use request_service::{Registration, RequestService};
pub use scheduler::{run_every, ScheduleReport, Scheduler};
pub use worker::Worker;
