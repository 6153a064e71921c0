//! Ownership of the one active store handle.
//!
//! Operations take a shared [`SchemaLease`] for their whole duration; swapping
//! or closing the handle needs the exclusive side of the same lock, so a handle
//! is never closed under an operation that is still using it.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, RwLockWriteGuard};
use tracing::{info, warn};

use super::{PooledConn, SchemaName};
use crate::error::AuditError;

/// A live, schema-scoped connection pool plus the generation it was installed as.
pub struct ActiveSchema {
    name: SchemaName,
    generation: u64,
    pool: Pool<SqliteConnectionManager>,
}

impl ActiveSchema {
    pub fn name(&self) -> &SchemaName {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, AuditError> {
        Ok(self.pool.get()?)
    }
}

/// Shared hold on the current handle. Valid for one operation; drop it promptly.
pub struct SchemaLease(OwnedRwLockReadGuard<Option<ActiveSchema>, ActiveSchema>);

impl Deref for SchemaLease {
    type Target = ActiveSchema;

    fn deref(&self) -> &ActiveSchema {
        &self.0
    }
}

pub struct ConnectionSupervisor {
    slot: Arc<RwLock<Option<ActiveSchema>>>,
    generations: AtomicU64,
    timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            generations: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lease the active handle. Waits while a swap is in progress.
    pub async fn current(&self) -> Result<SchemaLease, AuditError> {
        let guard = Arc::clone(&self.slot).read_owned().await;
        OwnedRwLockReadGuard::try_map(guard, |slot| slot.as_ref())
            .map(SchemaLease)
            .map_err(|_| AuditError::NoActiveSchema)
    }

    /// Run a blocking store operation against a fresh lease on the blocking pool.
    ///
    /// The lease is held until `f` returns. Lease wait and execution together
    /// are bounded by the store timeout.
    pub async fn with_current<F, T>(&self, f: F) -> Result<T, AuditError>
    where
        F: FnOnce(&ActiveSchema) -> Result<T, AuditError> + Send + 'static,
        T: Send + 'static,
    {
        let run = async {
            let lease = self.current().await?;
            tokio::task::spawn_blocking(move || f(&lease))
                .await
                .map_err(|e| AuditError::Internal(e.to_string()))?
        };
        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "store call timed out");
                Err(AuditError::Timeout(self.timeout))
            }
        }
    }

    /// Exclusive access to the slot; waits for every outstanding lease to drop.
    pub async fn exclusive(&self) -> ExclusiveSlot<'_> {
        ExclusiveSlot {
            guard: self.slot.write().await,
            supervisor: self,
        }
    }

    pub(crate) fn try_exclusive(&self) -> Option<ExclusiveSlot<'_>> {
        self.slot.try_write().ok().map(|guard| ExclusiveSlot {
            guard,
            supervisor: self,
        })
    }

    /// Install `pool` as the current handle and close the previous one.
    /// Returns the new generation.
    pub async fn replace(&self, name: SchemaName, pool: Pool<SqliteConnectionManager>) -> u64 {
        self.exclusive().await.install(name, pool)
    }

    /// Close the active handle, if any, and return the name of its schema.
    pub async fn close_current(&self) -> Option<SchemaName> {
        self.exclusive().await.close_current()
    }
}

/// Write side of the supervisor's lock. While it lives no lease can be taken.
pub struct ExclusiveSlot<'a> {
    guard: RwLockWriteGuard<'a, Option<ActiveSchema>>,
    supervisor: &'a ConnectionSupervisor,
}

impl ExclusiveSlot<'_> {
    pub fn active(&self) -> Option<&ActiveSchema> {
        self.guard.as_ref()
    }

    pub fn close_current(&mut self) -> Option<SchemaName> {
        self.guard.take().map(close)
    }

    pub fn install(&mut self, name: SchemaName, pool: Pool<SqliteConnectionManager>) -> u64 {
        let generation = self.supervisor.generations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(schema = %name, generation, "store handle installed");
        let previous = self.guard.replace(ActiveSchema { name, generation, pool });
        if let Some(prev) = previous {
            close(prev);
        }
        generation
    }
}

/// Best-effort close: the pool's connections are released on drop, and
/// anything unexpected is only logged.
fn close(schema: ActiveSchema) -> SchemaName {
    let ActiveSchema { name, generation, pool } = schema;
    let state = pool.state();
    let in_use = state.connections.saturating_sub(state.idle_connections);
    if in_use > 0 {
        warn!(schema = %name, in_use, "closing store handle with connections checked out");
    }
    drop(pool);
    info!(schema = %name, generation, "store handle closed");
    name
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod supervisor_tests;
