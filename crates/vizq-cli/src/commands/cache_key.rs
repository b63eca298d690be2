use serde_json::{json, Value};
use vizq_core::QueryContext;
use vizq_warehouse::Warehouse;

use crate::cli::RequestArgs;
use crate::error::CliError;

use super::{read_request, services};

pub fn run(args: &RequestArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let services = services(warehouse)?;
    let context = QueryContext::new(read_request(&args.request)?, &services)?;

    let queries = context
        .queries()
        .iter()
        .map(|query| context.query_cache_key(query))
        .collect::<Vec<_>>();

    Ok(json!({
        "cache_key": context.cache_key()?,
        "cache_timeout": context.cache_timeout(),
        "queries": queries,
    }))
}
