//! Result orchestration for a list of queries against one datasource.
//!
//! Per query: derive the cache key, try the cache, otherwise validate columns,
//! fetch from the datasource, run the post-processing pipeline, merge
//! annotations, and write the result back.

use std::backtrace::Backtrace;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::cache::set_and_log_cache;
use crate::cache_key::{derive_key, query_cache_key, CONTEXT_KEY_PREFIX};
use crate::post_processing::{apply_pipeline, PipelineHints};
use crate::query_actions::get_query_results;
use crate::stats::{
    LOADED_FROM_CACHE, LOADED_FROM_SOURCE, LOADED_FROM_SOURCE_WITHOUT_FORCE, LOADING_FROM_CACHE,
};
use crate::{
    AccessError, AllowAll, AnnotationData, AnnotationLayerStore, AnnotationMerger, CacheStore,
    CachedQueryResult, ChartRenderer, ChartStore, CoreError, Datasource, DatasourceKind,
    DatasourceRef, DatasourceRegistry, DatasourceResult, FormDataRenderer, FormattedData,
    NoopStats, PostProcessorRegistry, QueryContextConfig, QueryObject, QueryStatus,
    ResultEnvelope, ResultFormat, ResultType, SecurityManager, StatsLogger, Table,
    ValidationError, DTTM_ALIAS,
};

/// Collaborators shared by every query context of a process.
pub struct QueryContextServices {
    datasources: DatasourceRegistry,
    data_cache: Option<Arc<dyn CacheStore>>,
    context_cache: Option<Arc<dyn CacheStore>>,
    security: Arc<dyn SecurityManager>,
    annotation_layers: Option<Arc<dyn AnnotationLayerStore>>,
    charts: Option<Arc<dyn ChartStore>>,
    chart_renderer: Arc<dyn ChartRenderer>,
    post_processors: PostProcessorRegistry,
    stats: Arc<dyn StatsLogger>,
    config: QueryContextConfig,
}

impl QueryContextServices {
    /// No caches, no annotation stores, open access and default settings.
    pub fn new(datasources: DatasourceRegistry) -> Self {
        Self {
            datasources,
            data_cache: None,
            context_cache: None,
            security: Arc::new(AllowAll),
            annotation_layers: None,
            charts: None,
            chart_renderer: Arc::new(FormDataRenderer),
            post_processors: PostProcessorRegistry::with_builtins(),
            stats: Arc::new(NoopStats),
            config: QueryContextConfig::default(),
        }
    }

    /// Uses `cache` for both query results and context snapshots.
    pub fn with_cache(self, cache: Arc<dyn CacheStore>) -> Self {
        self.with_data_cache(Arc::clone(&cache))
            .with_context_cache(cache)
    }

    pub fn with_data_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.data_cache = Some(cache);
        self
    }

    pub fn with_context_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.context_cache = Some(cache);
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = security;
        self
    }

    pub fn with_annotation_layers(mut self, store: Arc<dyn AnnotationLayerStore>) -> Self {
        self.annotation_layers = Some(store);
        self
    }

    pub fn with_charts(mut self, store: Arc<dyn ChartStore>) -> Self {
        self.charts = Some(store);
        self
    }

    pub fn with_chart_renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.chart_renderer = renderer;
        self
    }

    pub fn with_post_processors(mut self, registry: PostProcessorRegistry) -> Self {
        self.post_processors = registry;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsLogger>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_config(mut self, config: QueryContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn datasources(&self) -> &DatasourceRegistry {
        &self.datasources
    }

    pub fn data_cache(&self) -> Option<&dyn CacheStore> {
        self.data_cache.as_deref()
    }

    pub fn context_cache(&self) -> Option<&dyn CacheStore> {
        self.context_cache.as_deref()
    }

    pub fn security(&self) -> &dyn SecurityManager {
        self.security.as_ref()
    }

    pub fn annotation_layers(&self) -> Option<&dyn AnnotationLayerStore> {
        self.annotation_layers.as_deref()
    }

    pub fn charts(&self) -> Option<&dyn ChartStore> {
        self.charts.as_deref()
    }

    pub fn chart_renderer(&self) -> &dyn ChartRenderer {
        self.chart_renderer.as_ref()
    }

    pub fn post_processors(&self) -> &PostProcessorRegistry {
        &self.post_processors
    }

    pub fn stats(&self) -> &dyn StatsLogger {
        self.stats.as_ref()
    }

    pub fn config(&self) -> &QueryContextConfig {
        &self.config
    }
}

/// Chart-data request as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContextRequest {
    pub datasource: DatasourceRef,
    /// Query objects exactly as sent; they are cached verbatim with the context.
    pub queries: Vec<Value>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub custom_cache_timeout: Option<u64>,
    #[serde(default)]
    pub result_type: Option<ResultType>,
    #[serde(default)]
    pub result_format: Option<ResultFormat>,
}

impl QueryContextRequest {
    pub fn new(datasource: DatasourceRef, queries: &[QueryObject]) -> Result<Self, CoreError> {
        Ok(Self {
            datasource,
            queries: queries
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            force: false,
            custom_cache_timeout: None,
            result_type: None,
            result_format: None,
        })
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = Some(result_type);
        self
    }

    pub fn with_result_format(mut self, result_format: ResultFormat) -> Self {
        self.result_format = Some(result_format);
        self
    }

    pub fn with_custom_cache_timeout(mut self, timeout: u64) -> Self {
        self.custom_cache_timeout = Some(timeout);
        self
    }
}

/// What `get_payload` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub queries: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

/// Fetch result before it becomes an envelope.
enum FetchOutcome {
    Loaded {
        result: DatasourceResult,
        annotation_data: AnnotationData,
    },
    Failed {
        table: Table,
        query: String,
        annotation_data: AnnotationData,
        error: String,
        stacktrace: Option<String>,
    },
}

/// State collected while fetching, kept when a later step fails.
#[derive(Default)]
struct PartialFetch {
    table: Table,
    query: String,
    status: Option<QueryStatus>,
    error_message: Option<String>,
    annotation_data: AnnotationData,
}

pub struct QueryContext<'s> {
    services: &'s QueryContextServices,
    datasource: Arc<dyn Datasource>,
    queries: Vec<QueryObject>,
    force: bool,
    custom_cache_timeout: Option<u64>,
    result_type: ResultType,
    result_format: ResultFormat,
    cache_values: Value,
}

impl<'s> QueryContext<'s> {
    /// Resolves the datasource and parses every query of `request`.
    pub fn new(request: QueryContextRequest, services: &'s QueryContextServices) -> Result<Self, CoreError> {
        let datasource = services.datasources().resolve(request.datasource)?;
        let queries = request
            .queries
            .iter()
            .enumerate()
            .map(|(position, query)| {
                serde_json::from_value::<QueryObject>(query.clone()).map_err(|err| {
                    ValidationError::MalformedRequest {
                        reason: format!("query {position}: {err}"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result_type = request.result_type.unwrap_or_default();
        let result_format = request.result_format.unwrap_or_default();
        let cache_values = json!({
            "datasource": request.datasource,
            "queries": request.queries,
            "result_type": result_type,
            "result_format": result_format,
        });

        Ok(Self {
            services,
            datasource,
            queries,
            force: request.force,
            custom_cache_timeout: request.custom_cache_timeout,
            result_type,
            result_format,
            cache_values,
        })
    }

    pub fn from_value(request: Value, services: &'s QueryContextServices) -> Result<Self, CoreError> {
        let request = serde_json::from_value::<QueryContextRequest>(request).map_err(|err| {
            ValidationError::MalformedRequest {
                reason: err.to_string(),
            }
        })?;
        Self::new(request, services)
    }

    /// Rebuilds a context from a snapshot stored by `get_payload`.
    pub fn load_cached(cache_key: &str, services: &'s QueryContextServices) -> Result<Self, CoreError> {
        let unavailable = || CoreError::CacheUnavailable {
            cache_key: Some(cache_key.to_owned()),
        };
        let cache = services.context_cache().ok_or_else(unavailable)?;
        let entry = match cache.get(cache_key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(unavailable()),
            Err(err) => {
                error!(cache_key, error = %err, "error reading cached query context");
                return Err(unavailable());
            }
        };
        let request = entry
            .get("data")
            .cloned()
            .and_then(|data| serde_json::from_value::<QueryContextRequest>(data).ok())
            .ok_or_else(|| {
                error!(cache_key, "cached query context is malformed");
                unavailable()
            })?;

        Self::new(request, services)
    }

    pub fn services(&self) -> &'s QueryContextServices {
        self.services
    }

    pub fn datasource(&self) -> &dyn Datasource {
        self.datasource.as_ref()
    }

    pub fn queries(&self) -> &[QueryObject] {
        &self.queries
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn result_format(&self) -> ResultFormat {
        self.result_format
    }

    /// Minimal state needed to rebuild this context.
    pub fn cache_values(&self) -> &Value {
        &self.cache_values
    }

    /// Override, then datasource, then its database, then the process default.
    pub fn cache_timeout(&self) -> u64 {
        self.custom_cache_timeout
            .or_else(|| self.datasource.cache_timeout())
            .or_else(|| self.datasource.database_cache_timeout())
            .unwrap_or(self.services.config().cache_default_timeout)
    }

    /// Whole-context key over the cache values.
    pub fn cache_key(&self) -> Result<String, CoreError> {
        Ok(derive_key(&self.cache_values, CONTEXT_KEY_PREFIX)?)
    }

    /// Per-query key, or `None` when it cannot be derived.
    pub fn query_cache_key(&self, query: &QueryObject) -> Option<String> {
        let row_level_security_ids = if self.services.config().row_level_security
            && self.datasource.is_rls_supported()
        {
            self.services
                .security()
                .row_level_security_ids(self.datasource.as_ref())
        } else {
            Vec::new()
        };

        match query_cache_key(query, self.datasource.as_ref(), &row_level_security_ids) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "could not derive query cache key");
                None
            }
        }
    }

    /// Validates every query, then checks access to the datasource once.
    pub fn raise_for_access(&self) -> Result<(), CoreError> {
        for query in &self.queries {
            query.validate()?;
        }
        self.services.security().raise_for_access(self)?;
        Ok(())
    }

    /// Runs the access gate and every query.
    pub fn get_payload(&self, cache_query_context: bool, force_cached: bool) -> Result<ContextPayload, CoreError> {
        self.raise_for_access()?;

        let queries = self
            .queries
            .iter()
            .map(|query| {
                get_query_results(
                    query.result_type.unwrap_or(self.result_type),
                    self,
                    query,
                    force_cached,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut payload = ContextPayload {
            queries,
            cache_key: None,
        };

        if cache_query_context {
            let cache_key = self.cache_key()?;
            match self.services.context_cache() {
                Some(cache) => set_and_log_cache(
                    cache,
                    self.services.stats(),
                    &cache_key,
                    json!({ "data": self.cache_values }),
                    self.cache_timeout(),
                    None,
                ),
                None => warn!(cache_key = %cache_key, "no context cache configured"),
            }
            payload.cache_key = Some(cache_key);
        }

        Ok(payload)
    }

    /// Encodes a table in the context's result format.
    pub fn get_data(&self, table: &Table) -> Result<FormattedData, CoreError> {
        crate::formatter::format_table(table, self.result_format, self.services.config().csv_delimiter)
    }

    /// Executes `query` on the datasource and runs the post-processing pipeline
    /// on the returned table.
    pub fn get_query_result(&self, query: &QueryObject) -> Result<DatasourceResult, CoreError> {
        let date_format = match (self.datasource.kind(), query.granularity.as_deref()) {
            (DatasourceKind::Table, Some(granularity)) => self
                .datasource
                .column(granularity)
                .and_then(|column| column.date_format),
            _ => None,
        };

        let mut result = self.datasource.query(query)?;
        let hints = PipelineHints {
            date_format,
            offset_hours: query.time_offset.unwrap_or_else(|| self.datasource.offset()),
            time_shift: query.parsed_time_shift()?,
            metric_labels: query.metric_labels(),
            enforce_numerical_metrics: self.services.config().enforce_numerical_metrics,
        };
        let table = std::mem::take(&mut result.table);
        result.table = apply_pipeline(
            table,
            &query.post_processing,
            &hints,
            self.services.post_processors(),
        )?;
        Ok(result)
    }

    /// Cache-aware retrieval of one query.
    pub fn get_df_payload(&self, query: &QueryObject, force_cached: bool) -> Result<ResultEnvelope, CoreError> {
        let cache_key = self.query_cache_key(query);
        info!(cache_key = cache_key.as_deref().unwrap_or("<none>"), "cache key");
        let cache_timeout = self.cache_timeout();

        if !self.force {
            if let (Some(key), Some(cache)) = (cache_key.as_deref(), self.services.data_cache()) {
                if let Some(entry) = self.read_cache(cache, key) {
                    info!(cache_key = key, "serving from cache");
                    return Ok(ResultEnvelope {
                        cache_key,
                        cached_dttm: entry.dttm,
                        cache_timeout,
                        rowcount: entry.df.row_count(),
                        table: entry.df,
                        annotation_data: entry.annotation_data,
                        error: None,
                        is_cached: true,
                        query: entry.query,
                        status: QueryStatus::Success,
                        stacktrace: None,
                    });
                }
            }
        }

        if force_cached {
            warn!(
                cache_key = cache_key.as_deref().unwrap_or("<none>"),
                "force_cached: value not found"
            );
            return Err(CoreError::CacheUnavailable { cache_key });
        }

        let envelope = match self.fetch(query)? {
            FetchOutcome::Loaded {
                result,
                annotation_data,
            } => {
                let stats = self.services.stats();
                stats.incr(LOADED_FROM_SOURCE);
                if !self.force {
                    stats.incr(LOADED_FROM_SOURCE_WITHOUT_FORCE);
                }

                if let (Some(key), Some(cache)) = (cache_key.as_deref(), self.services.data_cache()) {
                    self.write_cache(cache, key, &result, &annotation_data, cache_timeout);
                }

                ResultEnvelope {
                    cache_key,
                    cached_dttm: None,
                    cache_timeout,
                    rowcount: result.table.row_count(),
                    table: result.table,
                    annotation_data,
                    error: result.error_message,
                    is_cached: false,
                    query: result.query,
                    status: result.status,
                    stacktrace: None,
                }
            }
            FetchOutcome::Failed {
                table,
                query,
                annotation_data,
                error,
                stacktrace,
            } => ResultEnvelope {
                cache_key,
                cached_dttm: None,
                cache_timeout,
                rowcount: table.row_count(),
                table,
                annotation_data,
                error: Some(error),
                is_cached: false,
                query,
                status: QueryStatus::Failed,
                stacktrace,
            },
        };

        Ok(envelope)
    }

    fn read_cache(&self, cache: &dyn CacheStore, cache_key: &str) -> Option<CachedQueryResult> {
        let value = match cache.get(cache_key) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                error!(cache_key, error = %err, "error reading cache");
                return None;
            }
        };

        let stats = self.services.stats();
        stats.incr(LOADING_FROM_CACHE);
        match serde_json::from_value::<CachedQueryResult>(value) {
            Ok(entry) => {
                stats.incr(LOADED_FROM_CACHE);
                Some(entry)
            }
            Err(err) => {
                error!(cache_key, error = %err, "error reading cache");
                None
            }
        }
    }

    fn write_cache(
        &self,
        cache: &dyn CacheStore,
        cache_key: &str,
        result: &DatasourceResult,
        annotation_data: &AnnotationData,
        cache_timeout: u64,
    ) {
        let entry = CachedQueryResult {
            df: result.table.clone(),
            query: result.query.clone(),
            annotation_data: annotation_data.clone(),
            dttm: None,
        };
        match serde_json::to_value(&entry) {
            Ok(value) => set_and_log_cache(
                cache,
                self.services.stats(),
                cache_key,
                value,
                cache_timeout,
                Some(&self.datasource.uid()),
            ),
            Err(err) => warn!(cache_key, error = %err, "could not serialize cache entry"),
        }
    }

    /// Validation and source errors become a failed outcome; access denials
    /// propagate.
    fn fetch(&self, query: &QueryObject) -> Result<FetchOutcome, AccessError> {
        let mut partial = PartialFetch::default();
        match self.try_fetch(query, &mut partial) {
            Ok(()) => {
                let status = partial.status.unwrap_or(QueryStatus::Success);
                if status.is_failed() {
                    let error = partial
                        .error_message
                        .unwrap_or_else(|| format!("query on {} failed", self.datasource.name()));
                    return Ok(FetchOutcome::Failed {
                        table: partial.table,
                        query: partial.query,
                        annotation_data: partial.annotation_data,
                        error,
                        stacktrace: None,
                    });
                }
                Ok(FetchOutcome::Loaded {
                    result: DatasourceResult {
                        table: partial.table,
                        query: partial.query,
                        status,
                        error_message: partial.error_message,
                    },
                    annotation_data: partial.annotation_data,
                })
            }
            Err(CoreError::Access(err)) => Err(err),
            Err(CoreError::Validation(err)) => {
                debug!(error = %err, "query failed validation");
                Ok(FetchOutcome::Failed {
                    table: partial.table,
                    query: partial.query,
                    annotation_data: partial.annotation_data,
                    error: err.to_string(),
                    stacktrace: None,
                })
            }
            Err(err) => {
                let stacktrace = Backtrace::force_capture().to_string();
                error!(error = %err, stacktrace = %stacktrace, "unexpected error while fetching query");
                Ok(FetchOutcome::Failed {
                    table: partial.table,
                    query: partial.query,
                    annotation_data: partial.annotation_data,
                    error: partial.error_message.unwrap_or_else(|| err.to_string()),
                    stacktrace: Some(stacktrace),
                })
            }
        }
    }

    fn try_fetch(&self, query: &QueryObject, partial: &mut PartialFetch) -> Result<(), CoreError> {
        let known_columns = self.datasource.column_names();
        let invalid_columns = query
            .referenced_columns(&self.datasource.metric_names())
            .into_iter()
            .filter(|column| column != DTTM_ALIAS && !known_columns.contains(column))
            .collect::<Vec<_>>();
        if !invalid_columns.is_empty() {
            return Err(ValidationError::MissingColumns {
                columns: invalid_columns,
            }
            .into());
        }

        let result = self.get_query_result(query)?;
        partial.table = result.table;
        partial.query = result.query;
        partial.status = Some(result.status);
        partial.error_message = result.error_message;
        partial.annotation_data = AnnotationMerger::new(self.services, self.force).merge(query)?;
        Ok(())
    }
}
