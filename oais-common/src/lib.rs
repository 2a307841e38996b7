//! # OAIS Common Library
//!
//! Shared code for the OAIS ingestion services including:
//! - Error type and result alias
//! - Bootstrap configuration loading and root folder resolution
//! - Event types (IngestEvent enum) and the EventBus
//! - Request type/state enums shared by events and the request store
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{RequestState, RequestType};
