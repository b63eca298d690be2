use serde_json::Value;
use tracing::info;
use vizq_core::{Datasource, QueryContext};
use vizq_warehouse::Warehouse;

use crate::cli::ChartDataArgs;
use crate::error::CliError;

use super::{read_request, services};

pub fn run(args: &ChartDataArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let services = services(warehouse)?;
    let mut request = read_request(&args.request)?;
    if args.force {
        request = request.with_force(true);
    }

    let context = QueryContext::new(request, &services)?;
    info!(
        datasource = %context.datasource().reference(),
        queries = context.queries().len(),
        force = context.force(),
        force_cached = args.force_cached,
        "running chart-data request"
    );
    let payload = context.get_payload(args.cache_context, args.force_cached)?;
    Ok(serde_json::to_value(payload)?)
}
