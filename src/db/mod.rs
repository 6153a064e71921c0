//! SQLite-backed storage for the three record tables.
//!
//! Each schema is one SQLite database: a file under the data directory, or a
//! named shared-cache in-memory database. Schemas are disposable; the
//! lifecycle manager creates a fresh one on startup and on every reset.

mod ingest;
pub mod lifecycle;
mod merged;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::AuditError;

pub use ingest::{ingest, IngestRecord};
pub use lifecycle::{SchemaLifecycle, SchemaStatus};
pub use merged::{query_merged, MergedFilter, MergedRow};
pub use supervisor::{ActiveSchema, ConnectionSupervisor, SchemaLease};

pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_SCHEMA_NAME_LEN: usize = 64;

/// Set busy_timeout on every connection handed out by the pool.
/// Concurrent batches wait for the writer lock instead of failing with SQLITE_BUSY.
#[derive(Debug)]
struct BusyTimeoutCustomizer(Duration);

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(self.0)?;
        Ok(())
    }
}

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS Visit (
    customer_code TEXT
);
CREATE INDEX IF NOT EXISTS idx_visit_customer ON Visit(customer_code);

CREATE TABLE IF NOT EXISTS Terminal (
    customer_code TEXT,
    customer_name TEXT,
    area TEXT,
    region TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_terminal_customer ON Terminal(customer_code);

CREATE TABLE IF NOT EXISTS Scan (
    customer_code TEXT,
    product_code TEXT,
    product_name TEXT
);
CREATE INDEX IF NOT EXISTS idx_scan_customer ON Scan(customer_code);
"#;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn is_safe_ident(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    s.len() <= MAX_SCHEMA_NAME_LEN
        && first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identifier of one schema generation.
///
/// Only ever holds `[A-Za-z0-9_]`, starting with a letter, so it can be
/// spliced into file names and URIs without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn parse(s: &str) -> Result<Self, AuditError> {
        if is_safe_ident(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(AuditError::Validation(format!(
                "invalid schema name '{s}' \
                 (letters, digits and '_' only, max {MAX_SCHEMA_NAME_LEN})"
            )))
        }
    }

    /// `<prefix>_<unix millis>`; strictly increasing for the life of the process,
    /// so two generations never share a name even inside one millisecond.
    pub fn generate(prefix: &str) -> Result<Self, AuditError> {
        static LAST_STAMP: AtomicI64 = AtomicI64::new(0);
        let now = now_ms();
        let prev = match LAST_STAMP.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        }) {
            Ok(p) | Err(p) => p,
        };
        Self::parse(&format!("{prefix}_{}", now.max(prev + 1)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where schemas live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Named shared-cache in-memory databases; a schema lives as long as its pool.
    Memory,
    /// One `<schema>.db` file per schema under this directory.
    Directory(PathBuf),
}

impl StoreLocation {
    pub fn from_arg(arg: &str) -> Self {
        if arg == ":memory:" {
            Self::Memory
        } else {
            Self::Directory(PathBuf::from(arg))
        }
    }

    pub fn schema_path(&self, name: &SchemaName) -> Option<PathBuf> {
        match self {
            Self::Memory => None,
            Self::Directory(dir) => Some(dir.join(format!("{name}.db"))),
        }
    }

    /// Whether the schema's backing file exists. Always false for memory schemas.
    pub fn schema_exists(&self, name: &SchemaName) -> bool {
        self.schema_path(name).is_some_and(|p| p.exists())
    }

    /// Create the schema if absent, through a short-lived administrative
    /// connection that has no schema selected.
    pub(crate) fn create_schema(&self, name: &SchemaName) -> Result<(), AuditError> {
        let (Self::Directory(dir), Some(path)) = (self, self.schema_path(name)) else {
            // memory schemas come into existence with their first pooled connection
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| {
            AuditError::Connection(format!("cannot create data dir {}: {e}", dir.display()))
        })?;

        let admin = Connection::open_in_memory()?;
        admin.execute("ATTACH DATABASE ?1 AS pending", [path.to_string_lossy().into_owned()])?;
        admin.execute_batch("PRAGMA pending.journal_mode=WAL; DETACH DATABASE pending;")?;
        admin.close().map_err(|(_, e)| AuditError::Database(e))?;
        debug!(schema = %name, path = %path.display(), "schema created");
        Ok(())
    }

    /// Drop the schema if it exists. Returns whether anything was removed.
    pub(crate) fn drop_schema(&self, name: &SchemaName) -> Result<bool, AuditError> {
        let Some(path) = self.schema_path(name) else {
            return Ok(false);
        };
        let mut existed = false;
        for suffix in ["", "-wal", "-shm"] {
            let file = sidecar(&path, suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => existed |= suffix.is_empty(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AuditError::Lifecycle(format!(
                        "cannot drop schema {name} ({}): {e}",
                        file.display()
                    )))
                }
            }
        }
        Ok(existed)
    }

    /// Open the schema-scoped pool. File schemas must already exist.
    pub(crate) fn open_pool(
        &self,
        name: &SchemaName,
        config: &StoreConfig,
    ) -> Result<Pool<SqliteConnectionManager>, AuditError> {
        let builder = Pool::builder()
            .connection_timeout(config.timeout)
            .connection_customizer(Box::new(BusyTimeoutCustomizer(config.timeout)));
        let (builder, manager) = match self.schema_path(name) {
            // a single connection avoids shared-cache table locks, and it must
            // never be recycled or the database disappears with it
            None => (
                builder.max_size(1).idle_timeout(None).max_lifetime(None),
                SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared")),
            ),
            Some(path) => (
                builder.max_size(config.pool_size.max(1)),
                SqliteConnectionManager::file(path).with_flags(
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                ),
            ),
        };
        Ok(builder.build(manager)?)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Settings for the store and its schemas.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: StoreLocation,
    pub schema_prefix: String,
    pub pool_size: u32,
    /// Upper bound for a single store call, pool checkout and lock waits included.
    pub timeout: Duration,
    pub keep_on_exit: bool,
}

impl StoreConfig {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            schema_prefix: "terminal".into(),
            pool_size: 8,
            timeout: Duration::from_secs(30),
            keep_on_exit: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::Memory)
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        // room for "_" plus a 13-digit millisecond stamp
        if !is_safe_ident(&self.schema_prefix)
            || self.schema_prefix.len() > MAX_SCHEMA_NAME_LEN - 14
        {
            return Err(AuditError::Validation(format!(
                "invalid schema prefix '{}'",
                self.schema_prefix
            )));
        }
        if self.timeout.is_zero() {
            return Err(AuditError::Validation("store timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Accept text, numbers and booleans; empty strings and nulls become NULL.
/// Spreadsheet exports routinely send codes as numbers.
fn lenient_text<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.is_empty() => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        serde_json::Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(D::Error::custom(format!("expected a text value, got {other}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VisitRecord {
    #[serde(
        default,
        rename = "customerCode",
        alias = "客户编码",
        deserialize_with = "lenient_text"
    )]
    pub customer_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TerminalRecord {
    #[serde(
        default,
        rename = "customerCode",
        alias = "客户编码",
        deserialize_with = "lenient_text"
    )]
    pub customer_code: Option<String>,
    #[serde(
        default,
        rename = "customerName",
        alias = "客户名称",
        deserialize_with = "lenient_text"
    )]
    pub customer_name: Option<String>,
    #[serde(default, alias = "所属片区", deserialize_with = "lenient_text")]
    pub area: Option<String>,
    #[serde(default, alias = "所属大区", deserialize_with = "lenient_text")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScanRecord {
    #[serde(
        default,
        rename = "customerCode",
        alias = "客户编码",
        deserialize_with = "lenient_text"
    )]
    pub customer_code: Option<String>,
    #[serde(default, rename = "productCode", alias = "产品编码", deserialize_with = "lenient_text")]
    pub product_code: Option<String>,
    #[serde(default, rename = "productName", alias = "产品名称", deserialize_with = "lenient_text")]
    pub product_name: Option<String>,
}

impl VisitRecord {
    pub fn new(customer_code: &str) -> Self {
        Self {
            customer_code: Some(customer_code.into()),
        }
    }
}

impl TerminalRecord {
    pub fn new(customer_code: &str, customer_name: &str, area: &str, region: &str) -> Self {
        Self {
            customer_code: Some(customer_code.into()),
            customer_name: Some(customer_name.into()),
            area: Some(area.into()),
            region: Some(region.into()),
        }
    }
}

impl ScanRecord {
    pub fn new(customer_code: &str, product_code: &str, product_name: &str) -> Self {
        Self {
            customer_code: Some(customer_code.into()),
            product_code: Some(product_code.into()),
            product_name: Some(product_name.into()),
        }
    }
}
