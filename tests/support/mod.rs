//! Fixtures shared by the behavior tests.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use vizq_core::{
    Cell, ColumnDescriptor, DatasourceRef, DatasourceRegistry, MemoryCacheStore, MemoryStats,
    QueryContextRequest, QueryContextServices, QueryObject, StaticDatasource, Table,
};

pub const SALES_ID: i64 = 1;

/// Daily sales per region, `ds` holding RFC3339 text.
pub fn sales_table() -> Table {
    Table::from_rows(
        ["ds", "region", "sales"],
        vec![
            vec![Cell::from("2024-01-01T00:00:00Z"), Cell::from("east"), Cell::Int(10)],
            vec![Cell::from("2024-01-01T00:00:00Z"), Cell::from("west"), Cell::Int(4)],
            vec![Cell::from("2024-01-02T00:00:00Z"), Cell::from("east"), Cell::Int(7)],
            vec![Cell::from("2024-01-03T00:00:00Z"), Cell::from("west"), Cell::Int(12)],
        ],
    )
    .expect("sales table is rectangular")
}

pub fn sales_datasource() -> StaticDatasource {
    StaticDatasource::new(DatasourceRef::table(SALES_ID), "sales", sales_table())
        .with_column(ColumnDescriptor::temporal("ds", None))
        .with_metric("total_sales", "SUM(sales)")
}

/// Datasource with only `region` and `sales`.
pub fn region_sales_datasource() -> StaticDatasource {
    let table = Table::from_rows(
        ["region", "sales"],
        vec![
            vec![Cell::from("east"), Cell::Int(17)],
            vec![Cell::from("west"), Cell::Int(16)],
        ],
    )
    .expect("region table is rectangular");
    StaticDatasource::new(DatasourceRef::table(SALES_ID), "region_sales", table)
}

/// Orchestrator services around one static datasource, with handles kept for
/// assertions.
pub struct Fixture {
    pub datasource: Arc<StaticDatasource>,
    pub cache: Arc<MemoryCacheStore>,
    pub stats: Arc<MemoryStats>,
    pub services: QueryContextServices,
}

impl Fixture {
    pub fn new(datasource: StaticDatasource) -> Self {
        let datasource = Arc::new(datasource);
        let cache = Arc::new(MemoryCacheStore::new());
        let stats = Arc::new(MemoryStats::new());
        let registry = DatasourceRegistry::new().with(datasource.clone());
        let services = QueryContextServices::new(registry)
            .with_cache(cache.clone())
            .with_stats(stats.clone());
        Self {
            datasource,
            cache,
            stats,
            services,
        }
    }

    pub fn sales() -> Self {
        Self::new(sales_datasource())
    }

    pub fn map_services(mut self, map: impl FnOnce(QueryContextServices) -> QueryContextServices) -> Self {
        self.services = map(self.services);
        self
    }

    pub fn executions(&self) -> usize {
        self.datasource.executions()
    }
}

pub fn query(value: Value) -> QueryObject {
    serde_json::from_value(value).expect("query object should deserialize")
}

/// Total sales per region.
pub fn sales_by_region() -> Value {
    json!({
        "groupby": ["region"],
        "metrics": ["total_sales"],
        "row_limit": 100
    })
}

pub fn request(queries: Vec<Value>) -> QueryContextRequest {
    QueryContextRequest {
        datasource: DatasourceRef::table(SALES_ID),
        queries,
        force: false,
        custom_cache_timeout: None,
        result_type: None,
        result_format: None,
    }
}
