//! Persistent cache store on the `cache_entries` table.

use ::duckdb::{params, OptionalExt};
use serde_json::Value;
use tracing::debug;
use vizq_core::{CacheError, CacheStore};

use crate::{SessionKind, Warehouse, WarehouseError};

/// Cache entries survive restarts; expiry is checked on read against the
/// stored `expires_at` (unix seconds, NULL for none).
#[derive(Clone)]
pub struct WarehouseCacheStore {
    warehouse: Warehouse,
}

impl WarehouseCacheStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Deletes every entry written for one datasource uid.
    pub fn invalidate_namespace(&self, namespace: &str) -> Result<usize, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        let removed = connection.execute(
            "DELETE FROM cache_entries WHERE namespace = ?",
            params![namespace],
        )?;
        debug!(namespace, removed, "cache namespace invalidated");
        Ok(removed)
    }

    /// Deletes expired entries.
    pub fn purge_expired(&self) -> Result<usize, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        let removed = connection.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
            params![unix_now()],
        )?;
        debug!(removed, "expired cache entries purged");
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        Ok(connection.execute("DELETE FROM cache_entries", params![])?)
    }

    /// Live entry count.
    pub fn len(&self) -> Result<usize, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE expires_at IS NULL OR expires_at > ?",
            params![unix_now()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, WarehouseError> {
        Ok(self.len()? == 0)
    }

    fn read(&self, key: &str) -> Result<Option<Value>, WarehouseError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT payload FROM cache_entries WHERE cache_key = ? AND (expires_at IS NULL OR expires_at > ?)",
                params![key, unix_now()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload))
            .transpose()
            .map_err(WarehouseError::from)
    }

    fn write(
        &self,
        key: &str,
        value: &Value,
        timeout_seconds: u64,
        namespace: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let payload = serde_json::to_string(value)?;
        let expires_at = (timeout_seconds > 0).then(|| {
            unix_now().saturating_add(i64::try_from(timeout_seconds).unwrap_or(i64::MAX))
        });
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        connection.execute(
            "INSERT OR REPLACE INTO cache_entries (cache_key, namespace, payload, expires_at, updated_at) VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)",
            params![key, namespace, payload, expires_at],
        )?;
        Ok(())
    }
}

impl CacheStore for WarehouseCacheStore {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.read(key)?)
    }

    fn set(
        &self,
        key: &str,
        value: &Value,
        timeout_seconds: u64,
        namespace: Option<&str>,
    ) -> Result<(), CacheError> {
        Ok(self.write(key, value, timeout_seconds, namespace)?)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let connection = self.warehouse.session(SessionKind::Metadata)?;
        connection
            .execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])
            .map_err(WarehouseError::from)?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
