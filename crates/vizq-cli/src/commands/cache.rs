use serde_json::{json, Value};
use vizq_core::CacheStore;
use vizq_warehouse::{Warehouse, WarehouseCacheStore};

use crate::cli::{CacheArgs, CacheCommand};
use crate::error::CliError;

pub fn run(args: &CacheArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let cache = WarehouseCacheStore::new(warehouse.clone());

    match &args.command {
        CacheCommand::Get { key } => {
            let value = cache.get(key).map_err(vizq_core::CoreError::from)?;
            Ok(json!({
                "key": key,
                "hit": value.is_some(),
                "value": value,
            }))
        }
        CacheCommand::Invalidate { datasource_uid } => {
            let removed = cache.invalidate_namespace(datasource_uid)?;
            Ok(json!({ "namespace": datasource_uid, "removed": removed }))
        }
        CacheCommand::Purge { expired_only } => {
            let removed = if *expired_only {
                cache.purge_expired()?
            } else {
                cache.clear()?
            };
            Ok(json!({ "removed": removed, "remaining": cache.len()? }))
        }
    }
}
