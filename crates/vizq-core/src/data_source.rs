use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, QueryObject, QueryStatus, Table, UtcDateTime, ValidationError};

/// Backend family of a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceKind {
    Table,
    Druid,
}

impl DatasourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Druid => "druid",
        }
    }
}

impl Display for DatasourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasourceKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "druid" => Ok(Self::Druid),
            _ => Err(ValidationError::InvalidDatasourceType {
                value: value.to_owned(),
            }),
        }
    }
}

/// `{type, id}` pointer to a datasource, as carried by requests and charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasourceRef {
    #[serde(rename = "type")]
    pub kind: DatasourceKind,
    pub id: i64,
}

impl DatasourceRef {
    pub const fn new(kind: DatasourceKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub const fn table(id: i64) -> Self {
        Self::new(DatasourceKind::Table, id)
    }

    /// Stable identifier such as `7__table`, also used as cache namespace.
    pub fn uid(&self) -> String {
        format!("{}__{}", self.id, self.kind)
    }
}

impl Display for DatasourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uid())
    }
}

/// Metadata of one datasource column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub column_name: String,
    #[serde(default)]
    pub is_dttm: bool,
    /// `epoch_s`, `epoch_ms` or a `time` format description for textual values.
    #[serde(default, alias = "python_date_format")]
    pub date_format: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            is_dttm: false,
            date_format: None,
            type_name: None,
        }
    }

    pub fn temporal(column_name: impl Into<String>, date_format: Option<&str>) -> Self {
        Self {
            is_dttm: true,
            date_format: date_format.map(str::to_owned),
            ..Self::new(column_name)
        }
    }
}

/// What a datasource hands back for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasourceResult {
    pub table: Table,
    pub query: String,
    pub status: QueryStatus,
    pub error_message: Option<String>,
}

impl DatasourceResult {
    pub fn success(table: Table, query: impl Into<String>) -> Self {
        Self {
            table,
            query: query.into(),
            status: QueryStatus::Success,
            error_message: None,
        }
    }

    pub fn failed(query: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            table: Table::empty(),
            query: query.into(),
            status: QueryStatus::Failed,
            error_message: Some(error_message.into()),
        }
    }
}

/// Polymorphic tabular data origin.
pub trait Datasource: Send + Sync {
    fn reference(&self) -> DatasourceRef;

    fn name(&self) -> &str;

    fn uid(&self) -> String {
        self.reference().uid()
    }

    fn kind(&self) -> DatasourceKind {
        self.reference().kind
    }

    fn column_names(&self) -> Vec<String>;

    fn column(&self, name: &str) -> Option<ColumnDescriptor>;

    /// Names of saved metrics defined on the datasource.
    fn metric_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Hours to add to every value of the time column.
    fn offset(&self) -> i32 {
        0
    }

    fn cache_timeout(&self) -> Option<u64> {
        None
    }

    /// Timeout configured on the owning database connection.
    fn database_cache_timeout(&self) -> Option<u64> {
        None
    }

    /// Last metadata edit; part of every per-query cache key.
    fn changed_on(&self) -> Option<UtcDateTime> {
        None
    }

    fn is_rls_supported(&self) -> bool {
        false
    }

    /// Datasource-specific state that invalidates cached results.
    fn extra_cache_keys(&self, _query: &QueryObject) -> Vec<Value> {
        Vec::new()
    }

    fn query_language(&self) -> &str {
        "sql"
    }

    /// Renders the query text without executing it.
    fn query_text(&self, query: &QueryObject) -> Result<String, CoreError>;

    fn query(&self, query: &QueryObject) -> Result<DatasourceResult, CoreError>;
}

/// Resolves `{type, id}` references to registered datasources.
#[derive(Clone, Default)]
pub struct DatasourceRegistry {
    sources: HashMap<DatasourceRef, Arc<dyn Datasource>>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, datasource: Arc<dyn Datasource>) {
        self.sources.insert(datasource.reference(), datasource);
    }

    pub fn with(mut self, datasource: Arc<dyn Datasource>) -> Self {
        self.register(datasource);
        self
    }

    pub fn resolve(&self, reference: DatasourceRef) -> Result<Arc<dyn Datasource>, ValidationError> {
        self.sources
            .get(&reference)
            .cloned()
            .ok_or_else(|| ValidationError::DatasourceNotFound {
                kind: reference.kind.to_string(),
                id: reference.id,
            })
    }

    pub fn references(&self) -> Vec<DatasourceRef> {
        let mut references = self.sources.keys().copied().collect::<Vec<_>>();
        references.sort();
        references
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for DatasourceRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceRegistry")
            .field("sources", &self.references())
            .finish()
    }
}

/// Datasource-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Unavailable,
    Timeout,
    InvalidRequest,
    Internal,
}

/// Structured failure raised by a datasource backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Internal,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Unavailable => "source.unavailable",
            SourceErrorKind::Timeout => "source.timeout",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
            SourceErrorKind::Internal => "source.internal",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}
