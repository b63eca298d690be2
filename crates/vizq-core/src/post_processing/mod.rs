//! Fixed pipeline run on every freshly fetched, non-empty table.
//!
//! Order: time column normalization, metric coercion, infinity scrubbing, then
//! the query's own post-processing steps and a last infinity scrub over their
//! output. The fixed steps are idempotent.

mod operations;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use polars::prelude::{ChunkSet, DataType as PolarsType, IntoSeries};
use serde_json::{Map, Value};
use time::format_description::{self, OwnedFormatItem};
use time::{Date, Duration, PrimitiveDateTime};
use tracing::debug;

use crate::{
    Cell, Column, CoreError, DataType, PostProcessingStep, Table, TimeShift, UtcDateTime,
    ValidationError, DTTM_ALIAS,
};

pub use operations::{cum, rolling, select, sort};

/// Encoding of raw time column values.
#[derive(Debug, Clone)]
pub enum DateFormat {
    EpochSeconds,
    EpochMillis,
    /// `time` format description, e.g. `[year]-[month]-[day]`.
    Pattern(OwnedFormatItem),
}

impl DateFormat {
    pub fn parse(hint: &str) -> Result<Self, ValidationError> {
        match hint.trim() {
            "epoch_s" => Ok(Self::EpochSeconds),
            "epoch_ms" => Ok(Self::EpochMillis),
            pattern => format_description::parse_owned::<2>(pattern)
                .map(Self::Pattern)
                .map_err(|_| ValidationError::InvalidDateFormat {
                    value: hint.to_owned(),
                }),
        }
    }

    fn is_epoch(&self) -> bool {
        matches!(self, Self::EpochSeconds | Self::EpochMillis)
    }

    fn from_number(&self, value: f64) -> Option<UtcDateTime> {
        match self {
            Self::EpochSeconds => UtcDateTime::from_unix_seconds(value),
            Self::EpochMillis => UtcDateTime::from_unix_millis(value),
            Self::Pattern(_) => None,
        }
    }

    fn from_text(&self, value: &str) -> Option<UtcDateTime> {
        match self {
            Self::Pattern(format) => PrimitiveDateTime::parse(value, format)
                .map(UtcDateTime::from_primitive)
                .or_else(|_| {
                    Date::parse(value, format)
                        .map(|date| UtcDateTime::from_primitive(date.midnight()))
                })
                .ok(),
            _ => value
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|number| self.from_number(number)),
        }
    }
}

/// Datasource and query facts the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct PipelineHints {
    /// Format hint of the granularity column, when the datasource declares one.
    pub date_format: Option<String>,
    pub offset_hours: i32,
    pub time_shift: Option<TimeShift>,
    pub metric_labels: Vec<String>,
    pub enforce_numerical_metrics: bool,
}

/// A named table transform.
pub trait PostProcessor: Send + Sync {
    fn apply(&self, table: Table, options: &Map<String, Value>) -> Result<Table, CoreError>;
}

impl<F> PostProcessor for F
where
    F: Fn(Table, &Map<String, Value>) -> Result<Table, CoreError> + Send + Sync,
{
    fn apply(&self, table: Table, options: &Map<String, Value>) -> Result<Table, CoreError> {
        self(table, options)
    }
}

/// Named post-processing operations available to queries.
#[derive(Clone)]
pub struct PostProcessorRegistry {
    operations: HashMap<String, Arc<dyn PostProcessor>>,
}

impl Default for PostProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Debug for PostProcessorRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = self.operations.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("PostProcessorRegistry")
            .field("operations", &names)
            .finish()
    }
}

impl PostProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Registry holding `select`, `sort`, `rolling` and `cum`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("select", select);
        registry.register("sort", sort);
        registry.register("rolling", rolling);
        registry.register("cum", cum);
        registry
    }

    pub fn register<P>(&mut self, name: impl Into<String>, operation: P)
    where
        P: PostProcessor + 'static,
    {
        self.operations.insert(name.into(), Arc::new(operation));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Runs `steps` in order, each consuming the previous output.
    pub fn apply_all(&self, mut table: Table, steps: &[PostProcessingStep]) -> Result<Table, CoreError> {
        for step in steps {
            let name = step.operation.trim();
            if name.is_empty() {
                return Err(ValidationError::UndefinedPostProcessingOperation.into());
            }
            let operation =
                self.operations
                    .get(name)
                    .ok_or_else(|| ValidationError::UnsupportedPostProcessing {
                        operation: name.to_owned(),
                    })?;
            debug!(operation = name, rows = table.row_count(), "applying post processing");
            table = operation.apply(table, &step.options)?;
        }
        Ok(table)
    }
}

/// Runs the whole pipeline. Empty tables pass through untouched.
pub fn apply_pipeline(
    mut table: Table,
    steps: &[PostProcessingStep],
    hints: &PipelineHints,
    registry: &PostProcessorRegistry,
) -> Result<Table, CoreError> {
    if table.is_empty() {
        return Ok(table);
    }

    let date_format = hints
        .date_format
        .as_deref()
        .map(DateFormat::parse)
        .transpose()?;
    normalize_time_column(&mut table, date_format.as_ref(), hints.offset_hours, hints.time_shift)?;

    if hints.enforce_numerical_metrics {
        coerce_metrics_to_numeric(&mut table, &hints.metric_labels)?;
    }
    scrub_infinities(&mut table)?;

    let mut table = registry.apply_all(table, steps)?;
    scrub_infinities(&mut table)?;
    Ok(table)
}

/// Parses the time column into timestamps and applies offset and shift. A table
/// that was already normalized is left alone.
pub fn normalize_time_column(
    table: &mut Table,
    date_format: Option<&DateFormat>,
    offset_hours: i32,
    time_shift: Option<TimeShift>,
) -> Result<(), ValidationError> {
    if table.is_time_normalized() {
        return Ok(());
    }

    if let Some(column) = table.column(DTTM_ALIAS) {
        let adjustment = Duration::hours(i64::from(offset_hours))
            + time_shift.map(TimeShift::duration).unwrap_or(Duration::ZERO);

        let mut values = Vec::with_capacity(column.len());
        for cell in &column.values {
            let parsed = parse_time_cell(cell, date_format).ok_or_else(|| {
                ValidationError::InvalidTimestamp {
                    column: DTTM_ALIAS.to_owned(),
                    value: cell.to_string(),
                }
            })?;
            let shifted = match parsed {
                Some(timestamp) => Cell::Timestamp(timestamp.checked_add(adjustment).ok_or_else(
                    || ValidationError::TimestampOverflow {
                        column: DTTM_ALIAS.to_owned(),
                    },
                )?),
                None => Cell::Null,
            };
            values.push(shifted);
        }
        table.put_column(Column::with_dtype(DTTM_ALIAS, DataType::Datetime, values))?;
    }

    table.mark_time_normalized();
    Ok(())
}

/// `None` when the value cannot be read; `Some(None)` for nulls.
fn parse_time_cell(cell: &Cell, date_format: Option<&DateFormat>) -> Option<Option<UtcDateTime>> {
    match cell {
        Cell::Null => Some(None),
        Cell::Timestamp(value) => Some(Some(*value)),
        Cell::Int(_) | Cell::Float(_) => {
            let number = cell.as_f64()?;
            date_format
                .filter(|format| format.is_epoch())
                .and_then(|format| format.from_number(number))
                .map(Some)
        }
        Cell::Text(value) => match date_format {
            Some(format) => format.from_text(value).map(Some),
            None => UtcDateTime::parse_iso8601(value).map(Some),
        },
        Cell::Bool(_) => None,
    }
}

/// Converts text metric columns to numbers when every value converts,
/// preferring integers over floats.
pub fn coerce_metrics_to_numeric(table: &mut Table, metric_labels: &[String]) -> Result<(), CoreError> {
    for label in metric_labels {
        if table.dtype(label) != Some(DataType::Object) {
            continue;
        }

        let series = table.frame().column(label)?.clone();
        let converted = series
            .strict_cast(&PolarsType::Int64)
            .or_else(|_| series.strict_cast(&PolarsType::Float64));
        match converted {
            Ok(converted) => {
                debug!(column = %label, dtype = %converted.dtype(), "coerced metric column to numeric");
                table.put_series(converted)?;
            }
            Err(_) => debug!(column = %label, "metric column left as text"),
        }
    }
    Ok(())
}

/// Replaces `inf` and `-inf` with nulls in every float column.
pub fn scrub_infinities(table: &mut Table) -> Result<(), CoreError> {
    let mut scrubbed = Vec::new();
    for series in table.frame().get_columns() {
        if series.dtype() != &PolarsType::Float64 {
            continue;
        }
        let values = series.f64()?;
        let infinite = values.is_infinite();
        if infinite.any() {
            scrubbed.push(values.set(&infinite, None)?.into_series());
        }
    }
    for series in scrubbed {
        table.put_series(series)?;
    }
    Ok(())
}
