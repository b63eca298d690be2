use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::data_source::{ColumnDescriptor, DatasourceResult};
use crate::plan::{filter_matches, quote_identifier, MetricExpression, QueryPlan};
use crate::{
    Cell, Column, CoreError, DataType, Datasource, DatasourceRef, QueryObject, SourceError,
    Table, UtcDateTime,
};

/// Datasource over a fixed in-memory table.
///
/// Queries are evaluated row by row: time range and filters, grouping with
/// aggregates, ordering, then offset and limit.
#[derive(Debug)]
pub struct StaticDatasource {
    reference: DatasourceRef,
    name: String,
    columns: Vec<ColumnDescriptor>,
    metrics: IndexMap<String, String>,
    table: Table,
    offset: i32,
    cache_timeout: Option<u64>,
    database_cache_timeout: Option<u64>,
    changed_on: Option<UtcDateTime>,
    rls_supported: bool,
    extra_cache_keys: Vec<Value>,
    failure: Option<SourceError>,
    executions: AtomicUsize,
}

impl StaticDatasource {
    /// Column descriptors are derived from the table; temporal columns are
    /// those holding timestamps.
    pub fn new(reference: DatasourceRef, name: impl Into<String>, table: Table) -> Self {
        let columns = table
            .columns()
            .iter()
            .map(|column| {
                let mut descriptor = ColumnDescriptor::new(column.name.clone());
                descriptor.is_dttm = column.dtype == DataType::Datetime;
                descriptor.type_name = Some(format!("{:?}", column.dtype).to_uppercase());
                descriptor
            })
            .collect();

        Self {
            reference,
            name: name.into(),
            columns,
            metrics: IndexMap::new(),
            table,
            offset: 0,
            cache_timeout: None,
            database_cache_timeout: None,
            changed_on: None,
            rls_supported: false,
            extra_cache_keys: Vec::new(),
            failure: None,
            executions: AtomicUsize::new(0),
        }
    }

    /// Replaces the descriptor of an existing column, e.g. to attach a date
    /// format hint.
    pub fn with_column(mut self, descriptor: ColumnDescriptor) -> Self {
        match self
            .columns
            .iter_mut()
            .find(|column| column.column_name == descriptor.column_name)
        {
            Some(column) => *column = descriptor,
            None => self.columns.push(descriptor),
        }
        self
    }

    /// Saved metric computed by `expression`, e.g. `SUM(amount)`.
    pub fn with_metric(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.metrics.insert(name.into(), expression.into());
        self
    }

    pub fn with_offset(mut self, hours: i32) -> Self {
        self.offset = hours;
        self
    }

    pub fn with_cache_timeout(mut self, seconds: u64) -> Self {
        self.cache_timeout = Some(seconds);
        self
    }

    pub fn with_database_cache_timeout(mut self, seconds: u64) -> Self {
        self.database_cache_timeout = Some(seconds);
        self
    }

    pub fn with_changed_on(mut self, changed_on: UtcDateTime) -> Self {
        self.changed_on = Some(changed_on);
        self
    }

    pub fn with_row_level_security(mut self) -> Self {
        self.rls_supported = true;
        self
    }

    pub fn with_extra_cache_key(mut self, key: Value) -> Self {
        self.extra_cache_keys.push(key);
        self
    }

    /// Every query fails with `error`.
    pub fn failing(mut self, error: SourceError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Number of queries executed so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn plan(&self, query: &QueryObject) -> Result<QueryPlan, CoreError> {
        Ok(QueryPlan::build(query, &self.metrics)?.retain_filters_on(&self.column_names()))
    }

    fn source_column(&self, name: &str) -> Result<Column, SourceError> {
        self.table
            .column(name)
            .ok_or_else(|| SourceError::invalid_request(format!("column '{name}' does not exist in {}", self.name)))
    }

    fn matching_rows(&self, plan: &QueryPlan) -> Result<Vec<usize>, SourceError> {
        let mut rows = (0..self.table.row_count()).collect::<Vec<_>>();

        if let (Some(column), Some(bounds)) = (&plan.granularity, &plan.bounds) {
            let column = self.source_column(column)?;
            rows.retain(|row| match &column.values[*row] {
                Cell::Timestamp(value) => bounds.contains(*value),
                Cell::Text(text) => UtcDateTime::parse_iso8601(text)
                    .map(|value| bounds.contains(value))
                    .unwrap_or(false),
                _ => false,
            });
        }

        for filter in &plan.filters {
            let column = self.source_column(&filter.col)?;
            rows.retain(|row| filter_matches(filter, &column.values[*row]));
        }
        Ok(rows)
    }

    fn execute(&self, plan: &QueryPlan) -> Result<Table, SourceError> {
        let rows = self.matching_rows(plan)?;
        let keys = plan
            .time_column
            .iter()
            .chain(plan.dimensions.iter())
            .map(|name| self.source_column(name))
            .collect::<Result<Vec<_>, _>>()?;

        let output: Vec<Vec<Cell>> = if plan.is_aggregate() {
            let mut groups: Vec<(Vec<Cell>, Vec<usize>)> = Vec::new();
            let mut lookup: HashMap<String, usize> = HashMap::new();
            for row in rows {
                let key = keys
                    .iter()
                    .map(|column| column.values[row].clone())
                    .collect::<Vec<_>>();
                let fingerprint = serde_json::to_string(&key).unwrap_or_default();
                match lookup.get(&fingerprint) {
                    Some(group) => groups[*group].1.push(row),
                    None => {
                        lookup.insert(fingerprint, groups.len());
                        groups.push((key, vec![row]));
                    }
                }
            }
            if keys.is_empty() && groups.is_empty() {
                groups.push((Vec::new(), Vec::new()));
            }

            groups
                .into_iter()
                .map(|(mut key, members)| {
                    for metric in &plan.metrics {
                        key.push(self.aggregate(&metric.expression, &metric.label, &members)?);
                    }
                    Ok(key)
                })
                .collect::<Result<_, SourceError>>()?
        } else {
            let columns = if keys.is_empty() {
                self.table.columns()
            } else {
                keys
            };
            rows.into_iter()
                .map(|row| columns.iter().map(|column| column.values[row].clone()).collect())
                .collect()
        };

        let names: Vec<String> = if plan.dimensions.is_empty()
            && plan.time_column.is_none()
            && !plan.is_aggregate()
        {
            self.table
                .column_names()
                .into_iter()
                .map(str::to_owned)
                .collect()
        } else {
            plan.output_columns()
        };

        for (column, _) in &plan.order {
            if !names.contains(column) {
                return Err(SourceError::invalid_request(format!(
                    "cannot order by unknown column '{column}'"
                )));
            }
        }
        let order = plan
            .order
            .iter()
            .map(|(column, ascending)| (column.as_str(), *ascending))
            .collect::<Vec<_>>();

        let table = Table::from_rows(names, output).map_err(|err| SourceError::internal(err.to_string()))?;
        let sorted = table
            .sort_by(&order)
            .map_err(|err| SourceError::internal(err.to_string()))?;
        Ok(sorted.slice(plan.row_offset, plan.row_limit).reset_index())
    }

    fn aggregate(&self, expression: &MetricExpression, label: &str, rows: &[usize]) -> Result<Cell, SourceError> {
        match expression {
            MetricExpression::Aggregate {
                aggregate,
                column: Some(column),
            } => {
                let column = self.source_column(column)?;
                let cells = rows.iter().map(|row| &column.values[*row]).collect::<Vec<_>>();
                Ok(aggregate.evaluate(&cells))
            }
            MetricExpression::Aggregate { column: None, .. } => Ok(Cell::Int(rows.len() as i64)),
            MetricExpression::Sql(_) => Err(SourceError::invalid_request(format!(
                "metric '{label}' needs a SQL engine"
            ))),
        }
    }
}

impl Datasource for StaticDatasource {
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

    fn extra_cache_keys(&self, _query: &QueryObject) -> Vec<Value> {
        self.extra_cache_keys.clone()
    }

    fn query_text(&self, query: &QueryObject) -> Result<String, CoreError> {
        Ok(self.plan(query)?.to_sql(&quote_identifier(&self.name)))
    }

    fn query(&self, query: &QueryObject) -> Result<DatasourceResult, CoreError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let plan = self.plan(query)?;
        let text = plan.to_sql(&quote_identifier(&self.name));
        if let Some(failure) = &self.failure {
            return Err(failure.clone().into());
        }

        let table = self.execute(&plan)?;
        debug!(
            datasource = %self.reference,
            rows = table.row_count(),
            "static datasource query executed"
        );
        Ok(DatasourceResult::success(table, text))
    }
}
