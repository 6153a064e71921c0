//! Batch ingestion into the Visit, Terminal and Scan tables.

use rusqlite::{params_from_iter, TransactionBehavior};
use tracing::debug;

use super::supervisor::{ActiveSchema, ConnectionSupervisor};
use super::{ScanRecord, TerminalRecord, VisitRecord};
use crate::error::AuditError;

/// A record kind that maps onto one table.
pub trait IngestRecord: Send + Sync + 'static {
    /// Table name, also used in messages.
    const KIND: &'static str;
    /// One-row insert; positional parameters in [`IngestRecord::values`] order.
    const INSERT_SQL: &'static str;
    /// Rows conflicting on a unique key are dropped instead of written.
    const SKIPS_DUPLICATES: bool = false;

    fn values(&self) -> Vec<Option<&str>>;
}

fn text(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

impl IngestRecord for VisitRecord {
    const KIND: &'static str = "Visit";
    const INSERT_SQL: &'static str = "INSERT INTO Visit (customer_code) VALUES (?1)";

    fn values(&self) -> Vec<Option<&str>> {
        vec![text(&self.customer_code)]
    }
}

// Upsert-skip: a row whose customer_code already exists is ignored, not replaced.
impl IngestRecord for TerminalRecord {
    const KIND: &'static str = "Terminal";
    const INSERT_SQL: &'static str = "INSERT OR IGNORE INTO Terminal \
         (customer_code, customer_name, area, region) VALUES (?1, ?2, ?3, ?4)";
    const SKIPS_DUPLICATES: bool = true;

    fn values(&self) -> Vec<Option<&str>> {
        vec![
            text(&self.customer_code),
            text(&self.customer_name),
            text(&self.area),
            text(&self.region),
        ]
    }
}

impl IngestRecord for ScanRecord {
    const KIND: &'static str = "Scan";
    const INSERT_SQL: &'static str =
        "INSERT INTO Scan (customer_code, product_code, product_name) VALUES (?1, ?2, ?3)";

    fn values(&self) -> Vec<Option<&str>> {
        vec![
            text(&self.customer_code),
            text(&self.product_code),
            text(&self.product_name),
        ]
    }
}

fn invalid_batch(kind: &str) -> AuditError {
    AuditError::Validation(format!("Invalid {kind} data provided"))
}

impl ActiveSchema {
    /// Write a batch in one immediate transaction; all rows land or none do.
    /// Returns the number of rows actually written.
    pub fn insert_batch<R: IngestRecord>(&self, records: &[R]) -> Result<usize, AuditError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(R::INSERT_SQL)?;
            for record in records {
                written += stmt.execute(params_from_iter(record.values()))?;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

/// Validate and persist a batch through the current handle.
pub async fn ingest<R: IngestRecord>(
    supervisor: &ConnectionSupervisor,
    records: Vec<R>,
) -> Result<usize, AuditError> {
    if records.is_empty() {
        return Err(invalid_batch(R::KIND));
    }
    let requested = records.len();
    let written = supervisor
        .with_current(move |schema| schema.insert_batch(&records))
        .await?;
    debug!(kind = R::KIND, requested, written, "batch ingested");
    Ok(written)
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod ingest_tests;
