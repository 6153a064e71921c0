//! Schema lifecycle: create, reset and tear down the disposable schema.
//!
//! A schema is either absent or active. `initialize` builds a fresh one and
//! installs its pool; `reset` closes the current pool, drops its schema and
//! builds a new one under a new name, all under the supervisor's exclusive
//! lock. Any failure leaves no active schema rather than a half-valid one.

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::supervisor::{ConnectionSupervisor, ExclusiveSlot};
use super::{SchemaName, StoreConfig, TABLES};
use crate::error::AuditError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub active: bool,
    pub schema: Option<String>,
    pub generation: Option<u64>,
}

pub struct SchemaLifecycle {
    config: StoreConfig,
    supervisor: Arc<ConnectionSupervisor>,
    /// Held for the whole of an initialize or reset. Holds schemas that exist
    /// but are no longer active and still need dropping.
    gate: Mutex<Vec<SchemaName>>,
}

impl SchemaLifecycle {
    pub fn new(config: StoreConfig) -> Result<Self, AuditError> {
        config.validate()?;
        Ok(Self {
            supervisor: Arc::new(ConnectionSupervisor::new(config.timeout)),
            config,
            gate: Mutex::new(Vec::new()),
        })
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Absent → Active. Rejected while a schema is active or another
    /// initialize/reset is running.
    pub async fn initialize(&self) -> Result<SchemaName, AuditError> {
        let mut stale = self.gate.try_lock().map_err(|_| AuditError::ResetInProgress)?;
        let mut slot = self.supervisor.exclusive().await;
        if let Some(active) = slot.active() {
            return Err(AuditError::SchemaActive(active.name().to_string()));
        }
        if let Err(e) = self.drop_stale(&mut stale).await {
            warn!(error = %e, "leftover schema could not be dropped, continuing");
        }
        self.build_into(&mut slot, &mut stale).await
    }

    /// Active → Absent → Active under a new name. Returns the new schema name.
    pub async fn reset(&self) -> Result<SchemaName, AuditError> {
        let mut stale = self.gate.try_lock().map_err(|_| AuditError::ResetInProgress)?;
        let mut slot = self.supervisor.exclusive().await;
        if let Some(old) = slot.close_current() {
            stale.push(old);
        }
        self.drop_stale(&mut stale).await.map_err(into_lifecycle)?;
        let name = self.build_into(&mut slot, &mut stale).await.map_err(into_lifecycle)?;
        info!(schema = %name, "schema reset");
        Ok(name)
    }

    pub async fn status(&self) -> SchemaStatus {
        match self.supervisor.current().await {
            Ok(lease) => SchemaStatus {
                active: true,
                schema: Some(lease.name().to_string()),
                generation: Some(lease.generation()),
            },
            Err(_) => SchemaStatus { active: false, schema: None, generation: None },
        }
    }

    async fn build_into(
        &self,
        slot: &mut ExclusiveSlot<'_>,
        stale: &mut Vec<SchemaName>,
    ) -> Result<SchemaName, AuditError> {
        let name = SchemaName::generate(&self.config.schema_prefix)?;
        let config = self.config.clone();
        let target = name.clone();
        match self.blocking(move || build_schema(&config, &target)).await {
            Ok(pool) => {
                slot.install(name.clone(), pool);
                Ok(name)
            }
            Err(e) => {
                warn!(schema = %name, error = %e, "schema build failed, no schema active");
                if self.may_have_left(&name, &e) {
                    stale.push(name);
                }
                Err(e)
            }
        }
    }

    /// Whether a failed build can leave `name` behind. A timed-out build keeps
    /// running on the blocking pool and may create the file after we return.
    fn may_have_left(&self, name: &SchemaName, err: &AuditError) -> bool {
        matches!(err, AuditError::Timeout(_)) || self.config.location.schema_exists(name)
    }

    /// Drop every stale schema, newest first. A failure keeps the rest queued.
    async fn drop_stale(&self, stale: &mut Vec<SchemaName>) -> Result<(), AuditError> {
        while let Some(name) = stale.last().cloned() {
            let location = self.config.location.clone();
            let target = name.clone();
            let existed = self.blocking(move || location.drop_schema(&target)).await?;
            stale.pop();
            info!(schema = %name, existed, "schema dropped");
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AuditError>
    where
        F: FnOnce() -> Result<T, AuditError> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(joined) => joined.map_err(|e| AuditError::Internal(e.to_string()))?,
            Err(_) => Err(AuditError::Timeout(timeout)),
        }
    }
}

fn build_schema(
    config: &StoreConfig,
    name: &SchemaName,
) -> Result<Pool<SqliteConnectionManager>, AuditError> {
    config.location.create_schema(name)?;
    let pool = config.location.open_pool(name, config)?;
    pool.get()?.execute_batch(TABLES)?;
    Ok(pool)
}

fn into_lifecycle(e: AuditError) -> AuditError {
    match e {
        AuditError::Lifecycle(_) => e,
        other => AuditError::Lifecycle(other.to_string()),
    }
}

/// Scoped teardown: whatever exits the owning scope, the active schema and
/// any leftovers are dropped unless the config says to keep them.
impl Drop for SchemaLifecycle {
    fn drop(&mut self) {
        if self.config.keep_on_exit {
            return;
        }
        let mut doomed = std::mem::take(self.gate.get_mut());
        match self.supervisor.try_exclusive() {
            Some(mut slot) => doomed.extend(slot.close_current()),
            None => warn!("store handle still leased at teardown, leaving active schema"),
        }
        for name in doomed {
            match self.config.location.drop_schema(&name) {
                Ok(_) => info!(schema = %name, "schema dropped on exit"),
                Err(e) => warn!(schema = %name, error = %e, "failed to drop schema on exit"),
            }
        }
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod lifecycle_tests;
