use serde_json::Value;
use vizq_core::QueryContext;
use vizq_warehouse::Warehouse;

use crate::cli::ContextArgs;
use crate::error::CliError;

use super::services;

pub fn run(args: &ContextArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let services = services(warehouse)?;
    let context = QueryContext::load_cached(&args.cache_key, &services)?;
    let payload = context.get_payload(false, args.force_cached)?;
    Ok(serde_json::to_value(payload)?)
}
