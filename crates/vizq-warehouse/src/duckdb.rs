//! Sessions on the embedded database and the guarded statement runner.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ::duckdb::types::{TimeUnit, Value as DuckValue};
use ::duckdb::{Connection, ToSql};
use tracing::{debug, warn};
use vizq_core::{Cell, Table, UtcDateTime};

use crate::{is_select_like, QueryGuardrails, QueryResult, SqlColumn, WarehouseError};

pub const IN_MEMORY: &str = ":memory:";

/// What a session is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Catalog, cache and chart tables. Migrations and transactions run here.
    Metadata,
    /// Dataset statements. Only single read statements are executed.
    Query,
}

/// One database instance. Sessions are cloned from the root connection so
/// they share it, in-memory databases included.
pub struct Database {
    path: PathBuf,
    root: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WarehouseError> {
        let path = path.into();
        let root = if path.as_os_str() == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(&path)?
        };
        debug!(path = %path.display(), "database opened");
        Ok(Self {
            path,
            root: Mutex::new(root),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }

    pub fn session(&self, kind: SessionKind) -> Result<Session, WarehouseError> {
        let connection = self
            .root
            .lock()
            .map_err(|_| WarehouseError::DatabaseLockPoisoned)?
            .try_clone()?;
        connection.execute_batch("PRAGMA disable_progress_bar;")?;
        Ok(Session { kind, connection })
    }
}

pub struct Session {
    kind: SessionKind,
    connection: Connection,
}

impl Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Runs one statement within `guardrails`. Query sessions refuse anything
    /// but reads.
    pub fn run(&self, sql: &str, guardrails: QueryGuardrails) -> Result<QueryResult, WarehouseError> {
        let deadline = Deadline::start(guardrails.timeout());
        if is_select_like(sql) {
            return self.select(sql, guardrails.max_rows, &deadline);
        }
        if self.kind == SessionKind::Query {
            return Err(WarehouseError::QueryRejected(String::from(
                "only SELECT/CTE queries are allowed without write access",
            )));
        }
        self.connection.execute_batch(sql)?;
        deadline.check()?;
        Ok(QueryResult {
            columns: Vec::new(),
            table: Table::empty(),
            truncated: false,
        })
    }

    fn select(&self, sql: &str, max_rows: usize, deadline: &Deadline) -> Result<QueryResult, WarehouseError> {
        let mut statement = self.connection.prepare(sql)?;
        let mut cursor = statement.query([] as [&dyn ToSql; 0])?;

        let mut rows = Vec::new();
        let mut truncated = false;
        let mut column_count = 0;
        while let Some(row) = cursor.next()? {
            deadline.check()?;

            if rows.len() >= max_rows {
                truncated = true;
                break;
            }

            column_count = row.as_ref().column_count();
            let mut cells = Vec::with_capacity(column_count);
            for index in 0..column_count {
                cells.push(to_cell(row.get::<_, DuckValue>(index)?));
            }
            rows.push(cells);
        }
        drop(cursor);
        deadline.check()?;

        if column_count == 0 {
            column_count = statement.column_count();
        }
        let columns = (0..column_count)
            .map(|index| SqlColumn {
                name: statement
                    .column_name(index)
                    .map_or_else(|_| format!("column_{index}"), ToString::to_string),
                r#type: statement.column_type(index).to_string(),
            })
            .collect::<Vec<_>>();

        if truncated {
            warn!(max_rows, "query result truncated");
        }
        debug!(rows = rows.len(), elapsed_ms = deadline.elapsed_ms(), "query executed");

        let table = Table::from_rows(columns.iter().map(|column| column.name.clone()), rows)
            .map_err(|err| WarehouseError::InvalidRecord {
                table: "query result",
                reason: err.to_string(),
            })?;
        Ok(QueryResult {
            columns,
            table,
            truncated,
        })
    }
}

/// Elapsed-time budget checked between fetched rows.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn start(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn check(&self) -> Result<(), WarehouseError> {
        if self.started.elapsed() > self.timeout {
            return Err(WarehouseError::QueryTimeout {
                timeout_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            });
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }
}

fn to_cell(value: DuckValue) -> Cell {
    match value {
        DuckValue::Null => Cell::Null,
        DuckValue::Boolean(value) => Cell::Bool(value),
        DuckValue::TinyInt(value) => Cell::Int(i64::from(value)),
        DuckValue::SmallInt(value) => Cell::Int(i64::from(value)),
        DuckValue::Int(value) => Cell::Int(i64::from(value)),
        DuckValue::BigInt(value) => Cell::Int(value),
        DuckValue::UTinyInt(value) => Cell::Int(i64::from(value)),
        DuckValue::USmallInt(value) => Cell::Int(i64::from(value)),
        DuckValue::UInt(value) => Cell::Int(i64::from(value)),
        DuckValue::UBigInt(value) => i64::try_from(value)
            .map(Cell::Int)
            .unwrap_or_else(|_| Cell::float(value as f64)),
        DuckValue::HugeInt(value) => i64::try_from(value)
            .map(Cell::Int)
            .unwrap_or_else(|_| Cell::float(value as f64)),
        DuckValue::Float(value) => Cell::float(f64::from(value)),
        DuckValue::Double(value) => Cell::float(value),
        DuckValue::Decimal(value) => value
            .to_string()
            .parse::<f64>()
            .map(Cell::float)
            .unwrap_or(Cell::Null),
        DuckValue::Timestamp(unit, value) => {
            let millis = match unit {
                TimeUnit::Second => value as f64 * 1_000.0,
                TimeUnit::Millisecond => value as f64,
                TimeUnit::Microsecond => value as f64 / 1_000.0,
                TimeUnit::Nanosecond => value as f64 / 1_000_000.0,
            };
            UtcDateTime::from_unix_millis(millis)
                .map(Cell::Timestamp)
                .unwrap_or(Cell::Null)
        }
        DuckValue::Date32(days) => UtcDateTime::from_unix_seconds(f64::from(days) * 86_400.0)
            .map(Cell::Timestamp)
            .unwrap_or(Cell::Null),
        DuckValue::Text(value) => Cell::Text(value),
        DuckValue::Blob(value) => Cell::Text(hex::encode(value)),
        other => Cell::Text(format!("{other:?}")),
    }
}
