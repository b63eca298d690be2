//! Core contracts for vizq.
//!
//! This crate contains:
//! - Query objects, tables and the post-processing pipeline
//! - Datasource, cache, annotation and security contracts
//! - The query context that orchestrates cached retrieval
//! - In-memory adapters for every contract

pub mod adapters;
pub mod annotation;
pub mod cache;
pub mod cache_key;
pub mod chart_render;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod formatter;
pub mod frame;
pub mod plan;
pub mod post_processing;
pub mod query_actions;
pub mod query_context;
pub mod query_object;
pub mod security;
pub mod stats;

pub use adapters::{MemoryAnnotationLayerStore, MemoryChartStore, StaticDatasource};
pub use annotation::{
    Annotation, AnnotationData, AnnotationLayer, AnnotationLayerRef, AnnotationLayerStore,
    AnnotationMerger, Chart, ChartRenderer, ChartStore, NATIVE_ANNOTATION_COLUMNS,
};
pub use cache::{CacheError, CacheStore, MemoryCacheStore};
pub use chart_render::FormDataRenderer;
pub use config::QueryContextConfig;
pub use data_source::{
    ColumnDescriptor, Datasource, DatasourceKind, DatasourceRef, DatasourceRegistry,
    DatasourceResult, SourceError, SourceErrorKind,
};
pub use domain::{TimeShift, UtcDateTime};
pub use envelope::{CachedQueryResult, QueryStatus, ResultEnvelope};
pub use error::{AccessError, CoreError, ValidationError};
pub use formatter::{FormattedData, Record};
pub use frame::{Cell, Column, DataType, GenericDataType, Index, Table};
pub use post_processing::{PostProcessor, PostProcessorRegistry};
pub use query_context::{ContextPayload, QueryContext, QueryContextRequest, QueryContextServices};
pub use query_object::{
    AdhocColumn, AdhocExpression, AdhocMetric, FilterOperator, Metric, PostProcessingStep,
    QueryFilter, QueryObject, ResultFormat, ResultType, TimeBounds, DTTM_ALIAS,
};
pub use security::{AllowAll, SecurityManager, StaticAccessPolicy};
pub use stats::{MemoryStats, NoopStats, StatsLogger};
