use serde::{Deserialize, Serialize};

use crate::{AnnotationData, Table, UtcDateTime};

/// Lifecycle state of a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Stopped,
    Failed,
    Pending,
    Running,
    Scheduled,
    Success,
    TimedOut,
}

impl QueryStatus {
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Outcome of retrieving one query, from cache or from the datasource.
///
/// A failed envelope always carries an error message, and `is_cached` is only
/// set when a cache key exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEnvelope {
    pub cache_key: Option<String>,
    pub cached_dttm: Option<UtcDateTime>,
    pub cache_timeout: u64,
    #[serde(skip)]
    pub table: Table,
    pub annotation_data: AnnotationData,
    pub error: Option<String>,
    pub is_cached: bool,
    pub query: String,
    pub status: QueryStatus,
    pub stacktrace: Option<String>,
    pub rowcount: usize,
}

impl ResultEnvelope {
    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }
}

/// Per-query cache entry. The table is stored fully post-processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQueryResult {
    pub df: Table,
    pub query: String,
    #[serde(default)]
    pub annotation_data: AnnotationData,
    /// Set by the cache writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dttm: Option<UtcDateTime>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Cell, Column};

    #[test]
    fn status_uses_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(QueryStatus::TimedOut).expect("json"),
            json!("timed_out")
        );
    }

    #[test]
    fn cached_result_reads_back_its_table() {
        let table = Table::new(vec![Column::new("a", vec![Cell::Int(1), Cell::float(0.5)])])
            .expect("table");
        let cached = CachedQueryResult {
            df: table.clone(),
            query: String::from("SELECT a"),
            annotation_data: AnnotationData::new(),
            dttm: None,
        };

        let value = serde_json::to_value(&cached).expect("json");
        let decoded: CachedQueryResult = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded.df, table);
    }
}
