mod cache;
mod cache_key;
mod catalog;
mod chart_data;
mod context;

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use vizq_core::{QueryContextConfig, QueryContextRequest, QueryContextServices, ValidationError};
use vizq_warehouse::{
    load_datasources, QueryGuardrails, Warehouse, WarehouseAnnotationStore, WarehouseCacheStore,
    WarehouseChartStore, WarehouseConfig,
};

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub fn run(cli: &Cli) -> Result<Value, CliError> {
    let warehouse = open_warehouse(cli)?;

    match &cli.command {
        Command::Catalog(args) => catalog::run(args, &warehouse),
        Command::CacheKey(args) => cache_key::run(args, &warehouse),
        Command::ChartData(args) => chart_data::run(args, &warehouse),
        Command::Context(args) => context::run(args, &warehouse),
        Command::Cache(args) => cache::run(args, &warehouse),
    }
}

fn open_warehouse(cli: &Cli) -> Result<Warehouse, CliError> {
    let config = match &cli.home {
        Some(home) => WarehouseConfig::at(home),
        None => WarehouseConfig::default(),
    };
    Ok(Warehouse::open(config)?)
}

/// Wires the warehouse collaborators into the orchestrator.
fn services(warehouse: &Warehouse) -> Result<QueryContextServices, CliError> {
    let registry = load_datasources(warehouse, QueryGuardrails::default())?;
    Ok(QueryContextServices::new(registry)
        .with_cache(Arc::new(WarehouseCacheStore::new(warehouse.clone())))
        .with_annotation_layers(Arc::new(WarehouseAnnotationStore::new(warehouse.clone())))
        .with_charts(Arc::new(WarehouseChartStore::new(warehouse.clone())))
        .with_config(QueryContextConfig::from_env()?))
}

/// Reads a JSON document from `path`, or stdin for `-`.
fn read_json(path: &Path) -> Result<Value, CliError> {
    let text = if path.as_os_str() == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        text
    } else {
        fs::read_to_string(path)?
    };
    if text.trim().is_empty() {
        return Err(CliError::Command(format!("{} is empty", path.display())));
    }
    Ok(serde_json::from_str(&text)?)
}

fn read_request(path: &Path) -> Result<QueryContextRequest, CliError> {
    serde_json::from_value(read_json(path)?).map_err(|err| {
        CliError::Validation(ValidationError::MalformedRequest {
            reason: err.to_string(),
        })
    })
}
