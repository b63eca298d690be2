pub mod cache_store;
pub mod catalog;
pub mod datasource;
pub mod duckdb;
pub mod migrations;
pub mod stores;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ::duckdb::Connection;
use serde::Serialize;
use thiserror::Error;
use vizq_core::{CacheError, CoreError, SourceError, Table};

pub use cache_store::WarehouseCacheStore;
pub use catalog::{load_catalog, Catalog, CatalogReport, DatasetSpec};
pub use datasource::{load_datasources, WarehouseDatasource};
pub use duckdb::{Database, Deadline, Session, SessionKind, IN_MEMORY};
pub use stores::{WarehouseAnnotationStore, WarehouseChartStore};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("invalid record in {table}: {reason}")]
    InvalidRecord { table: &'static str, reason: String },

    #[error("database handle lock poisoned")]
    DatabaseLockPoisoned,
}

impl From<WarehouseError> for SourceError {
    fn from(error: WarehouseError) -> Self {
        match error {
            WarehouseError::QueryTimeout { .. } => SourceError::timeout(error.to_string()),
            WarehouseError::QueryRejected(_) => SourceError::invalid_request(error.to_string()),
            WarehouseError::Io(_) | WarehouseError::DatabaseLockPoisoned => {
                SourceError::unavailable(error.to_string())
            }
            _ => SourceError::internal(error.to_string()),
        }
    }
}

impl From<WarehouseError> for CoreError {
    fn from(error: WarehouseError) -> Self {
        CoreError::Source(error.into())
    }
}

impl From<WarehouseError> for CacheError {
    fn from(error: WarehouseError) -> Self {
        CacheError::backend(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub vizq_home: PathBuf,
    /// Database file, or `:memory:` for a throwaway in-process database.
    pub db_path: PathBuf,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::at(resolve_vizq_home())
    }
}

impl WarehouseConfig {
    /// Layout rooted at `vizq_home`.
    pub fn at(vizq_home: impl Into<PathBuf>) -> Self {
        let vizq_home = vizq_home.into();
        let db_path = vizq_home.join("cache").join("warehouse.duckdb");
        Self { vizq_home, db_path }
    }

    /// Same layout, with the database kept in memory.
    pub fn in_memory(vizq_home: impl Into<PathBuf>) -> Self {
        Self {
            db_path: PathBuf::from(IN_MEMORY),
            ..Self::at(vizq_home)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryGuardrails {
    pub max_rows: usize,
    pub query_timeout_ms: u64,
}

impl Default for QueryGuardrails {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            query_timeout_ms: 5_000,
        }
    }
}

impl QueryGuardrails {
    pub(crate) fn timeout(self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }

    fn validate(self) -> Result<(), WarehouseError> {
        if self.max_rows == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "max_rows must be greater than zero",
            )));
        }
        if self.query_timeout_ms == 0 {
            return Err(WarehouseError::QueryRejected(String::from(
                "query_timeout_ms must be greater than zero",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<SqlColumn>,
    pub table: Table,
    pub truncated: bool,
}

/// Handle on the embedded database. Cloning shares the database.
#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    database: Arc<Database>,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if config.db_path.as_os_str() != IN_MEMORY {
            if let Some(parent) = config.db_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let database = Arc::new(Database::open(config.db_path.clone())?);
        let warehouse = Self { config, database };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let session = self.database.session(SessionKind::Metadata)?;
        migrations::apply_migrations(&session)?;
        Ok(())
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        self.database.path()
    }

    pub(crate) fn session(&self, kind: SessionKind) -> Result<Session, WarehouseError> {
        self.database.session(kind)
    }

    /// Runs `work` inside a transaction, rolling back when it fails.
    pub(crate) fn transaction<T>(
        &self,
        work: impl FnOnce(&Connection) -> Result<T, WarehouseError>,
    ) -> Result<T, WarehouseError> {
        let session = self.database.session(SessionKind::Metadata)?;
        session.execute_batch("BEGIN TRANSACTION")?;
        let result = work(&session);
        finalize_transaction(&session, result)
    }

    /// Executes `sql` within `guardrails`. Without `allow_write` only a single
    /// SELECT-like statement is accepted.
    pub fn execute_query(
        &self,
        sql: &str,
        guardrails: QueryGuardrails,
        allow_write: bool,
    ) -> Result<QueryResult, WarehouseError> {
        guardrails.validate()?;
        let sql = normalize_sql(sql)?;

        if !allow_write {
            enforce_read_only_query(sql)?;
        }

        let kind = if allow_write {
            SessionKind::Metadata
        } else {
            SessionKind::Query
        };
        self.database.session(kind)?.run(sql, guardrails)
    }
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn normalize_sql(sql: &str) -> Result<&str, WarehouseError> {
    let normalized = sql.trim();
    if normalized.is_empty() {
        return Err(WarehouseError::QueryRejected(String::from(
            "query must not be empty",
        )));
    }
    Ok(normalized.trim_end_matches(';').trim())
}

fn enforce_read_only_query(sql: &str) -> Result<(), WarehouseError> {
    if !is_select_like(sql) {
        return Err(WarehouseError::QueryRejected(String::from(
            "read-only mode accepts only SELECT/CTE queries",
        )));
    }
    if has_multiple_statements(sql) {
        return Err(WarehouseError::QueryRejected(String::from(
            "multiple SQL statements are not allowed in read-only mode",
        )));
    }
    Ok(())
}

pub(crate) fn is_select_like(sql: &str) -> bool {
    let first_keyword = sql
        .trim_start_matches('(')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first_keyword.as_str(),
        "SELECT" | "WITH" | "EXPLAIN" | "SHOW" | "DESCRIBE" | "FROM" | "VALUES"
    )
}

fn has_multiple_statements(sql: &str) -> bool {
    sql.split(';')
        .filter(|part| !part.trim().is_empty())
        .count()
        > 1
}

fn resolve_vizq_home() -> PathBuf {
    if let Some(path) = env::var_os("VIZQ_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".vizq");
    }

    PathBuf::from(".vizq")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use vizq_core::{Cell, UtcDateTime};

    use super::*;

    fn open(temp: &tempfile::TempDir) -> Warehouse {
        Warehouse::open(WarehouseConfig::at(temp.path().join("vizq-home"))).expect("warehouse open")
    }

    #[test]
    fn initializes_catalog_and_cache_tables() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(&temp);

        let result = warehouse
            .execute_query(
                "SELECT COUNT(*) AS c FROM information_schema.tables WHERE table_name IN ('cache_entries', 'datasets', 'charts')",
                QueryGuardrails::default(),
                false,
            )
            .expect("query");
        assert_eq!(result.table.row(0), vec![Cell::Int(3)]);
    }

    #[test]
    fn migrations_are_idempotent() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(&temp);
        warehouse.initialize().expect("second initialize");

        let result = warehouse
            .execute_query(
                "SELECT COUNT(*) FROM schema_migrations",
                QueryGuardrails::default(),
                false,
            )
            .expect("query");
        assert_eq!(result.table.row(0), vec![Cell::Int(2)]);
    }

    #[test]
    fn in_memory_warehouse_keeps_writes_visible_to_later_queries() {
        let temp = tempdir().expect("tempdir");
        let warehouse =
            Warehouse::open(WarehouseConfig::in_memory(temp.path())).expect("in-memory warehouse");

        warehouse
            .execute_query(
                "CREATE TABLE seeds AS SELECT * FROM range(3) t(i)",
                QueryGuardrails::default(),
                true,
            )
            .expect("write");
        let result = warehouse
            .execute_query("SELECT SUM(i) FROM seeds", QueryGuardrails::default(), false)
            .expect("read");

        assert_eq!(result.table.row(0), vec![Cell::Int(3)]);
        assert!(!temp.path().join("cache").exists(), "nothing is written to disk");
    }

    #[test]
    fn read_only_mode_rejects_write_query() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(&temp);

        let error = warehouse
            .execute_query(
                "CREATE TABLE test_write (id INTEGER)",
                QueryGuardrails::default(),
                false,
            )
            .expect_err("should reject");

        assert!(matches!(error, WarehouseError::QueryRejected(_)));
    }

    #[test]
    fn max_rows_truncates_and_timestamps_become_cells() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(&temp);

        let result = warehouse
            .execute_query(
                "SELECT TIMESTAMP '2024-01-01 00:00:00' + INTERVAL (i) DAY AS ds, i FROM range(5) t(i)",
                QueryGuardrails {
                    max_rows: 2,
                    query_timeout_ms: 5_000,
                },
                false,
            )
            .expect("query");

        assert!(result.truncated);
        assert_eq!(result.table.row_count(), 2);
        assert_eq!(result.table.column_names(), vec!["ds", "i"]);
        assert_eq!(
            result.table.row(1)[0],
            Cell::Timestamp(UtcDateTime::parse("2024-01-02T00:00:00Z").expect("ts"))
        );
    }

    #[test]
    fn warehouse_errors_map_to_source_error_kinds() {
        let timeout: SourceError = WarehouseError::QueryTimeout { timeout_ms: 5 }.into();
        assert_eq!(timeout.kind(), vizq_core::SourceErrorKind::Timeout);

        let rejected: SourceError = WarehouseError::QueryRejected(String::from("no")).into();
        assert_eq!(rejected.kind(), vizq_core::SourceErrorKind::InvalidRequest);
    }
}
