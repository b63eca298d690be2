use thiserror::Error;

use crate::cache::CacheError;
use crate::data_source::SourceError;

/// Request-shape errors. Always recovered into a failed query payload when they
/// happen while a query is being fetched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Columns missing in datasource: {}", format_names(.columns))]
    MissingColumns { columns: Vec<String> },

    #[error("Empty query: at least one column, group-by or metric is required")]
    EmptyQuery,

    #[error("Duplicate column/metric labels: {}", format_names(.labels))]
    DuplicateLabels { labels: Vec<String> },

    #[error("`operation` property of post processing object undefined")]
    UndefinedPostProcessingOperation,

    #[error("Unsupported post processing operation: {operation}")]
    UnsupportedPostProcessing { operation: String },

    #[error("Invalid options for post processing operation '{operation}': {reason}")]
    InvalidPostProcessingOptions { operation: String, reason: String },

    #[error("invalid time shift '{value}', expected '<n> <unit>[s] [ago]'")]
    InvalidTimeShift { value: String },

    #[error("invalid time range '{value}', expected '<since> : <until>'")]
    InvalidTimeRange { value: String },

    #[error("invalid filter on column '{column}': {reason}")]
    InvalidFilter { column: String, reason: String },

    #[error("column '{column}' has a value that cannot be parsed as a timestamp: '{value}'")]
    InvalidTimestamp { column: String, value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("timestamp arithmetic overflowed in column '{column}'")]
    TimestampOverflow { column: String },

    #[error("invalid date format hint '{value}'")]
    InvalidDateFormat { value: String },

    #[error("The chart {chart_id} does not exist")]
    ChartNotFound { chart_id: i64 },

    #[error("{message}")]
    ChartRender { message: String },

    #[error("annotation layer '{name}' has an invalid value: {reason}")]
    InvalidAnnotationLayer { name: String, reason: String },

    #[error("metric '{label}' cannot be computed: {reason}")]
    InvalidMetric { label: String, reason: String },

    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },

    #[error("datasource {kind}:{id} does not exist")]
    DatasourceNotFound { kind: String, id: i64 },

    #[error("invalid datasource type '{value}', expected one of table, druid")]
    InvalidDatasourceType { value: String },

    #[error("column '{column}' has {actual} values, expected {expected}")]
    RaggedTable {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate column name '{column}'")]
    DuplicateColumn { column: String },

    #[error("table cannot be built: {reason}")]
    InvalidTable { reason: String },

    #[error("invalid configuration value for {key}: '{value}'")]
    InvalidConfig { key: &'static str, value: String },
}

/// Permission or row-level-security denial. Propagated to the caller as is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("access denied to datasource '{datasource}'")]
    DatasourceDenied { datasource: String },

    #[error("access denied to row level secured data on '{datasource}': {reason}")]
    RowLevelSecurity { datasource: String, reason: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("Error loading data from cache: no cached value for key {}", .cache_key.as_deref().unwrap_or("<none>"))]
    CacheUnavailable { cache_key: Option<String> },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error("frame error: {0}")]
    Frame(#[from] polars::prelude::PolarsError),
}

impl CoreError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

fn format_names(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
