//! Monitored write transactions
//!
//! Wraps `pool.begin()` with acquisition/hold timing logs so lock contention
//! between the scheduler, the worker and callbacks shows up in traces.

use oais_common::Result;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

pub struct MonitoredTransaction<'c> {
    tx: Transaction<'c, Sqlite>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> MonitoredTransaction<'c> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<()> {
        let held_ms = self.acquired_at.elapsed().as_millis();
        self.tx.commit().await?;

        if held_ms > 1000 {
            tracing::warn!(caller = self.caller, held_ms, "Long write transaction");
        } else {
            tracing::trace!(caller = self.caller, held_ms, "Transaction committed");
        }
        Ok(())
    }
}

/// Begin a transaction, logging slow connection acquisition
pub async fn begin_monitored<'c>(
    pool: &'c SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();
    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 500 {
        tracing::warn!(caller, wait_ms, "Slow connection acquisition, pool may be saturated");
    }

    Ok(MonitoredTransaction {
        tx,
        caller,
        acquired_at: Instant::now(),
    })
}
