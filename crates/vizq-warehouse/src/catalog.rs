//! Declarative catalog: datasets, annotation layers and saved charts loaded
//! into the warehouse tables from a JSON document.

use ::duckdb::{params, Connection, ToSql};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vizq_core::{AnnotationLayer, Chart, ColumnDescriptor, DatasourceKind, UtcDateTime};

use crate::{Warehouse, WarehouseError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Statements run before the datasets are registered, typically
    /// `CREATE TABLE ... AS` over seed data.
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub annotation_layers: Vec<AnnotationLayer>,
    #[serde(default)]
    pub charts: Vec<Chart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub id: i64,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: DatasourceKind,
    pub name: String,
    pub sql: String,
    /// Inferred from the statement's result schema when empty.
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
    /// Saved metric name to SQL aggregate expression.
    #[serde(default)]
    pub metrics: IndexMap<String, String>,
    #[serde(default)]
    pub cache_timeout: Option<u64>,
    #[serde(default)]
    pub database_cache_timeout: Option<u64>,
    #[serde(default)]
    pub offset: i32,
    #[serde(default)]
    pub is_rls_supported: bool,
    #[serde(default)]
    pub changed_on: Option<UtcDateTime>,
}

const fn default_kind() -> DatasourceKind {
    DatasourceKind::Table
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogReport {
    pub setup_statements: usize,
    pub datasets: usize,
    pub columns: usize,
    pub metrics: usize,
    pub annotation_layers: usize,
    pub annotations: usize,
    pub charts: usize,
}

/// Writes `catalog` in one transaction. Existing entries with the same ids
/// are replaced.
pub fn load_catalog(warehouse: &Warehouse, catalog: &Catalog) -> Result<CatalogReport, WarehouseError> {
    let report = warehouse.transaction(|connection| {
        let mut report = CatalogReport::default();

        for statement in &catalog.setup {
            connection.execute_batch(statement)?;
            report.setup_statements += 1;
        }
        for dataset in &catalog.datasets {
            let (columns, metrics) = write_dataset(connection, dataset)?;
            report.datasets += 1;
            report.columns += columns;
            report.metrics += metrics;
        }
        for layer in &catalog.annotation_layers {
            report.annotations += write_annotation_layer(connection, layer)?;
            report.annotation_layers += 1;
        }
        for chart in &catalog.charts {
            write_chart(connection, chart)?;
            report.charts += 1;
        }
        Ok(report)
    })?;

    info!(
        datasets = report.datasets,
        annotation_layers = report.annotation_layers,
        charts = report.charts,
        "catalog loaded"
    );
    Ok(report)
}

fn write_dataset(connection: &Connection, dataset: &DatasetSpec) -> Result<(usize, usize), WarehouseError> {
    let kind = dataset.kind.as_str();
    let columns = if dataset.columns.is_empty() {
        infer_columns(connection, &dataset.sql)?
    } else {
        dataset.columns.clone()
    };

    connection.execute(
        "INSERT OR REPLACE INTO datasets (id, datasource_type, name, sql, cache_timeout, database_cache_timeout, offset_hours, is_rls_supported, changed_on, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
        params![
            dataset.id,
            kind,
            dataset.name,
            dataset.sql,
            dataset.cache_timeout.map(clamp_i64),
            dataset.database_cache_timeout.map(clamp_i64),
            dataset.offset,
            dataset.is_rls_supported,
            dataset.changed_on.map(UtcDateTime::format_rfc3339),
        ],
    )?;

    connection.execute(
        "DELETE FROM dataset_columns WHERE datasource_type = ? AND dataset_id = ?",
        params![kind, dataset.id],
    )?;
    for (position, column) in columns.iter().enumerate() {
        connection.execute(
            "INSERT INTO dataset_columns (datasource_type, dataset_id, position, column_name, is_dttm, date_format, type_name) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                kind,
                dataset.id,
                position as i64,
                column.column_name,
                column.is_dttm,
                column.date_format,
                column.type_name,
            ],
        )?;
    }

    connection.execute(
        "DELETE FROM dataset_metrics WHERE datasource_type = ? AND dataset_id = ?",
        params![kind, dataset.id],
    )?;
    for (position, (name, expression)) in dataset.metrics.iter().enumerate() {
        connection.execute(
            "INSERT INTO dataset_metrics (datasource_type, dataset_id, position, metric_name, expression) VALUES (?, ?, ?, ?, ?)",
            params![kind, dataset.id, position as i64, name, expression],
        )?;
    }

    debug!(dataset = %dataset.name, columns = columns.len(), "dataset registered");
    Ok((columns.len(), dataset.metrics.len()))
}

/// Reads the result schema of `sql` without fetching rows.
fn infer_columns(connection: &Connection, sql: &str) -> Result<Vec<ColumnDescriptor>, WarehouseError> {
    let mut statement = connection.prepare(&format!("SELECT * FROM ({sql}) AS inferred_schema LIMIT 0"))?;
    let cursor = statement.query([] as [&dyn ToSql; 0])?;
    drop(cursor);

    let columns = (0..statement.column_count())
        .map(|index| {
            let name = statement
                .column_name(index)
                .map_or_else(|_| format!("column_{index}"), ToString::to_string);
            let type_name = statement.column_type(index).to_string().to_uppercase();
            ColumnDescriptor {
                is_dttm: type_name.contains("TIMESTAMP") || type_name.starts_with("DATE"),
                type_name: Some(type_name),
                ..ColumnDescriptor::new(name)
            }
        })
        .collect();
    Ok(columns)
}

fn write_annotation_layer(connection: &Connection, layer: &AnnotationLayer) -> Result<usize, WarehouseError> {
    connection.execute(
        "INSERT OR REPLACE INTO annotation_layers (id, name, descr) VALUES (?, ?, ?)",
        params![layer.id, layer.name, layer.descr],
    )?;
    connection.execute("DELETE FROM annotations WHERE layer_id = ?", params![layer.id])?;

    for (position, annotation) in layer.annotations.iter().enumerate() {
        connection.execute(
            "INSERT INTO annotations (layer_id, position, start_dttm, end_dttm, short_descr, long_descr, json_metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                layer.id,
                position as i64,
                annotation.start_dttm.map(UtcDateTime::format_rfc3339),
                annotation.end_dttm.map(UtcDateTime::format_rfc3339),
                annotation.short_descr,
                annotation.long_descr,
                annotation.json_metadata,
            ],
        )?;
    }
    Ok(layer.annotations.len())
}

fn write_chart(connection: &Connection, chart: &Chart) -> Result<(), WarehouseError> {
    connection.execute(
        "INSERT OR REPLACE INTO charts (id, slice_name, datasource_type, datasource_id, form_data) VALUES (?, ?, ?, ?, ?)",
        params![
            chart.id,
            chart.slice_name,
            chart.datasource.kind.as_str(),
            chart.datasource.id,
            serde_json::to_string(&chart.form_data)?,
        ],
    )?;
    Ok(())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
