//! Test Helper Utilities
//!
//! Shared utilities for testing oais-ingest

#![allow(unused_imports)]

pub mod db_utils;

// Re-export commonly used items
pub use db_utils::{
    create_harness, create_harness_with, create_test_db, data_file, expire_job_leases, ingest_metadata,
    registered_id, requests_of_type, seed_stored_aip, TestHarness,
};
