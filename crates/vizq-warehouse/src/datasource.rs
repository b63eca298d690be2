//! Catalog datasets exposed as query datasources.

use std::collections::BTreeMap;
use std::sync::Arc;

use ::duckdb::params;
use indexmap::IndexMap;
use tracing::{debug, warn};
use vizq_core::plan::{quote_identifier, QueryPlan};
use vizq_core::{
    ColumnDescriptor, CoreError, Datasource, DatasourceKind, DatasourceRef, DatasourceRegistry,
    DatasourceResult, QueryObject, UtcDateTime,
};

use crate::{QueryGuardrails, SessionKind, Warehouse, WarehouseError};

/// Dataset defined by a SQL statement over the warehouse. Queries wrap the
/// statement as a subquery.
#[derive(Clone)]
pub struct WarehouseDatasource {
    warehouse: Warehouse,
    reference: DatasourceRef,
    name: String,
    sql: String,
    columns: Vec<ColumnDescriptor>,
    metrics: IndexMap<String, String>,
    cache_timeout: Option<u64>,
    database_cache_timeout: Option<u64>,
    offset: i32,
    rls_supported: bool,
    changed_on: Option<UtcDateTime>,
    guardrails: QueryGuardrails,
}

impl std::fmt::Debug for WarehouseDatasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseDatasource")
            .field("reference", &self.reference)
            .field("name", &self.name)
            .field("columns", &self.columns.len())
            .field("metrics", &self.metrics.len())
            .finish_non_exhaustive()
    }
}

impl WarehouseDatasource {
    pub fn new(
        warehouse: Warehouse,
        reference: DatasourceRef,
        name: impl Into<String>,
        sql: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            warehouse,
            reference,
            name: name.into(),
            sql: sql.into(),
            columns,
            metrics: IndexMap::new(),
            cache_timeout: None,
            database_cache_timeout: None,
            offset: 0,
            rls_supported: false,
            changed_on: None,
            guardrails: QueryGuardrails::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: IndexMap<String, String>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_guardrails(mut self, guardrails: QueryGuardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn render(&self, query: &QueryObject) -> Result<String, CoreError> {
        let plan = QueryPlan::build(query, &self.metrics)?.retain_filters_on(&self.column_names());
        let from = format!("({}) AS {}", self.sql, quote_identifier(&self.name));
        Ok(plan.to_sql(&from))
    }
}

impl Datasource for WarehouseDatasource {
    fn reference(&self) -> DatasourceRef {
        self.reference
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| column.column_name.clone())
            .collect()
    }

    fn column(&self, name: &str) -> Option<ColumnDescriptor> {
        self.columns
            .iter()
            .find(|column| column.column_name == name)
            .cloned()
    }

    fn metric_names(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    fn offset(&self) -> i32 {
        self.offset
    }

    fn cache_timeout(&self) -> Option<u64> {
        self.cache_timeout
    }

    fn database_cache_timeout(&self) -> Option<u64> {
        self.database_cache_timeout
    }

    fn changed_on(&self) -> Option<UtcDateTime> {
        self.changed_on
    }

    fn is_rls_supported(&self) -> bool {
        self.rls_supported
    }

    fn query_text(&self, query: &QueryObject) -> Result<String, CoreError> {
        self.render(query)
    }

    /// Engine errors come back as a failed result carrying the rendered SQL;
    /// session and guardrail errors propagate.
    fn query(&self, query: &QueryObject) -> Result<DatasourceResult, CoreError> {
        let text = self.render(query)?;
        match self.warehouse.execute_query(&text, self.guardrails, false) {
            Ok(result) => {
                debug!(
                    datasource = %self.reference,
                    rows = result.table.row_count(),
                    truncated = result.truncated,
                    "warehouse dataset queried"
                );
                Ok(DatasourceResult::success(result.table, text))
            }
            Err(WarehouseError::DuckDb(err)) => {
                warn!(datasource = %self.reference, error = %err, "warehouse dataset query failed");
                Ok(DatasourceResult::failed(text, err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct DatasetRow {
    reference: DatasourceRef,
    name: String,
    sql: String,
    cache_timeout: Option<i64>,
    database_cache_timeout: Option<i64>,
    offset_hours: i32,
    is_rls_supported: bool,
    changed_on: Option<String>,
}

/// Builds a registry with one datasource per catalog dataset.
pub fn load_datasources(
    warehouse: &Warehouse,
    guardrails: QueryGuardrails,
) -> Result<DatasourceRegistry, WarehouseError> {
    let connection = warehouse.session(SessionKind::Metadata)?;

    let mut columns: BTreeMap<DatasourceRef, Vec<ColumnDescriptor>> = BTreeMap::new();
    let mut statement = connection.prepare(
        "SELECT datasource_type, dataset_id, column_name, is_dttm, date_format, type_name \
         FROM dataset_columns ORDER BY datasource_type, dataset_id, position",
    )?;
    let mut rows = statement.query(params![])?;
    while let Some(row) = rows.next()? {
        let reference = read_reference(row.get(0)?, row.get(1)?)?;
        columns.entry(reference).or_default().push(ColumnDescriptor {
            column_name: row.get(2)?,
            is_dttm: row.get(3)?,
            date_format: row.get(4)?,
            type_name: row.get(5)?,
        });
    }

    let mut metrics: BTreeMap<DatasourceRef, IndexMap<String, String>> = BTreeMap::new();
    let mut statement = connection.prepare(
        "SELECT datasource_type, dataset_id, metric_name, expression \
         FROM dataset_metrics ORDER BY datasource_type, dataset_id, position",
    )?;
    let mut rows = statement.query(params![])?;
    while let Some(row) = rows.next()? {
        let reference = read_reference(row.get(0)?, row.get(1)?)?;
        metrics
            .entry(reference)
            .or_default()
            .insert(row.get(2)?, row.get(3)?);
    }

    let mut datasets = Vec::new();
    let mut statement = connection.prepare(
        "SELECT datasource_type, id, name, sql, cache_timeout, database_cache_timeout, \
         offset_hours, is_rls_supported, changed_on FROM datasets ORDER BY datasource_type, id",
    )?;
    let mut rows = statement.query(params![])?;
    while let Some(row) = rows.next()? {
        datasets.push(DatasetRow {
            reference: read_reference(row.get(0)?, row.get(1)?)?,
            name: row.get(2)?,
            sql: row.get(3)?,
            cache_timeout: row.get(4)?,
            database_cache_timeout: row.get(5)?,
            offset_hours: row.get(6)?,
            is_rls_supported: row.get(7)?,
            changed_on: row.get(8)?,
        });
    }

    let mut registry = DatasourceRegistry::new();
    for dataset in datasets {
        let changed_on = dataset
            .changed_on
            .as_deref()
            .map(UtcDateTime::parse)
            .transpose()
            .map_err(|err| WarehouseError::InvalidRecord {
                table: "datasets",
                reason: err.to_string(),
            })?;

        let mut datasource = WarehouseDatasource::new(
            warehouse.clone(),
            dataset.reference,
            dataset.name,
            dataset.sql,
            columns.remove(&dataset.reference).unwrap_or_default(),
        )
        .with_metrics(metrics.remove(&dataset.reference).unwrap_or_default())
        .with_guardrails(guardrails);
        datasource.cache_timeout = non_negative(dataset.cache_timeout);
        datasource.database_cache_timeout = non_negative(dataset.database_cache_timeout);
        datasource.offset = dataset.offset_hours;
        datasource.rls_supported = dataset.is_rls_supported;
        datasource.changed_on = changed_on;

        registry.register(Arc::new(datasource));
    }

    debug!(datasets = registry.len(), "warehouse datasources loaded");
    Ok(registry)
}

fn read_reference(kind: String, id: i64) -> Result<DatasourceRef, WarehouseError> {
    let kind: DatasourceKind = kind.parse().map_err(|err: vizq_core::ValidationError| {
        WarehouseError::InvalidRecord {
            table: "datasets",
            reason: err.to_string(),
        }
    })?;
    Ok(DatasourceRef::new(kind, id))
}

fn non_negative(value: Option<i64>) -> Option<u64> {
    value.and_then(|value| u64::try_from(value).ok())
}
