use serde_json::Value;
use vizq_warehouse::{load_catalog, Catalog, Warehouse};

use crate::cli::{CatalogArgs, CatalogCommand};
use crate::error::CliError;

use super::read_json;

pub fn run(args: &CatalogArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    match &args.command {
        CatalogCommand::Load { file } => {
            let catalog: Catalog = serde_json::from_value(read_json(file)?)?;
            let report = load_catalog(warehouse, &catalog)?;
            Ok(serde_json::to_value(report)?)
        }
    }
}
