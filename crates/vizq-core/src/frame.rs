//! Column-oriented tabular results.
//!
//! A [`Table`] is what datasources return, what the post-processing pipeline
//! transforms, and what per-query cache entries store. Values live in a polars
//! [`DataFrame`]; [`Column`] and [`Cell`] are the owned view used to build
//! tables and to read values back out.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use polars::prelude::{
    DataFrame, DataType as PolarsType, IdxCa, IdxSize, Int64Chunked, IntoSeries, NamedFrom,
    NewChunkedArray, PolarsResult, Series, SortMultipleOptions, TimeUnit,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{UtcDateTime, ValidationError};

const ROW_POSITION: &str = "__row_position";

/// One value of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
    Timestamp(UtcDateTime),
}

impl Cell {
    /// Float cell; NaN collapses to [`Cell::Null`].
    pub fn float(value: f64) -> Self {
        if value.is_nan() {
            Self::Null
        } else {
            Self::Float(value)
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Ordering across variants: booleans, numbers, timestamps, text, null.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(left), Self::Bool(right)) => left.cmp(right),
            (Self::Timestamp(left), Self::Timestamp(right)) => left.cmp(right),
            (Self::Text(left), Self::Text(right)) => left.cmp(right),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::Float(_) => 1,
            Self::Timestamp(_) => 2,
            Self::Text(_) => 3,
            Self::Null => 4,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Converts a JSON scalar as returned by a datasource driver.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(*value),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::float))
                .unwrap_or(Self::Null),
            Value::String(value) => Self::Text(value.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    /// Record representation: timestamps become epoch milliseconds and non-finite
    /// floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::from(*value),
            Self::Float(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(value) => Value::String(value.clone()),
            Self::Timestamp(value) => Value::from(value.unix_millis()),
        }
    }

    fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DataType::Boolean),
            Self::Int(_) => Some(DataType::Int64),
            Self::Float(_) => Some(DataType::Float64),
            Self::Text(_) => Some(DataType::Object),
            Self::Timestamp(_) => Some(DataType::Datetime),
        }
    }
}

/// JSON has no literal for non-finite floats, so they are written as strings.
mod float_repr {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid float '{other}'"))),
            },
        }
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(value) => write!(f, "{}", if *value { "True" } else { "False" }),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => {
                if value.is_infinite() {
                    f.write_str(if *value > 0.0 { "inf" } else { "-inf" })
                } else if value.fract() == 0.0 && value.abs() < 1e16 {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Self::Text(value) => f.write_str(value),
            Self::Timestamp(value) => f.write_str(&value.format_naive()),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::float(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<UtcDateTime> for Cell {
    fn from(value: UtcDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T> From<Option<T>> for Cell
where
    T: Into<Cell>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Storage type of a column. `Object` is the text storage also used for
/// mixed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Object,
    Boolean,
    Int64,
    Float64,
    Datetime,
}

impl DataType {
    /// Infers the narrowest storage type able to hold every non-null value.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Cell>) -> Self {
        let mut inferred = None;
        for value in values {
            let Some(current) = value.data_type() else {
                continue;
            };
            inferred = Some(match (inferred, current) {
                (None, current) => current,
                (Some(previous), current) if previous == current => previous,
                (Some(Self::Int64), Self::Float64) | (Some(Self::Float64), Self::Int64) => {
                    Self::Float64
                }
                _ => return Self::Object,
            });
        }
        inferred.unwrap_or(Self::Object)
    }

    /// Storage type of a polars column.
    pub fn of(dtype: &PolarsType) -> Self {
        match dtype {
            PolarsType::Boolean => Self::Boolean,
            PolarsType::Float32 | PolarsType::Float64 => Self::Float64,
            PolarsType::Datetime(_, _) => Self::Datetime,
            dtype if dtype.is_numeric() => Self::Int64,
            _ => Self::Object,
        }
    }

    pub const fn generic(self) -> GenericDataType {
        match self {
            Self::Int64 | Self::Float64 => GenericDataType::Numeric,
            Self::Object => GenericDataType::String,
            Self::Datetime => GenericDataType::Temporal,
            Self::Boolean => GenericDataType::Boolean,
        }
    }

    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }
}

/// Coarse column type reported to renderers as `coltypes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericDataType {
    Numeric,
    String,
    Temporal,
    Boolean,
}

/// Owned copy of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub dtype: DataType,
    pub values: Vec<Cell>,
}

impl Column {
    /// Column with an inferred storage type. Integers in a float column are
    /// widened to floats.
    pub fn new(name: impl Into<String>, values: Vec<Cell>) -> Self {
        let dtype = DataType::infer(&values);
        Self {
            name: name.into(),
            dtype,
            values: widen(dtype, values),
        }
    }

    /// Column with an explicit storage type, as declared by a driver.
    pub fn with_dtype(name: impl Into<String>, dtype: DataType, values: Vec<Cell>) -> Self {
        Self {
            name: name.into(),
            dtype,
            values,
        }
    }

    pub fn from_series(series: &Series) -> Self {
        Self {
            name: series.name().to_owned(),
            dtype: DataType::of(series.dtype()),
            values: cells(series),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Polars column holding these values. Values that do not fit the storage
    /// type become nulls; mixed `Object` values are stored as text.
    pub fn to_series(&self) -> Series {
        let name = self.name.as_str();
        match self.dtype {
            DataType::Boolean => Series::new(
                name,
                self.values
                    .iter()
                    .map(|cell| match cell {
                        Cell::Bool(value) => Some(*value),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            ),
            DataType::Int64 => Series::new(
                name,
                self.values
                    .iter()
                    .map(|cell| match cell {
                        Cell::Int(value) => Some(*value),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            ),
            DataType::Float64 => Series::new(
                name,
                self.values.iter().map(Cell::as_f64).collect::<Vec<_>>(),
            ),
            DataType::Datetime => Int64Chunked::from_iter_options(
                name,
                self.values.iter().map(|cell| match cell {
                    Cell::Timestamp(value) => value.unix_micros(),
                    _ => None,
                }),
            )
            .into_datetime(TimeUnit::Microseconds, None)
            .into_series(),
            DataType::Object => Series::new(
                name,
                self.values
                    .iter()
                    .map(|cell| match cell {
                        Cell::Null => None,
                        Cell::Text(value) => Some(value.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<Option<String>>>(),
            ),
        }
    }
}

fn widen(dtype: DataType, values: Vec<Cell>) -> Vec<Cell> {
    if dtype != DataType::Float64 {
        return values;
    }
    values
        .into_iter()
        .map(|cell| match cell {
            Cell::Int(value) => Cell::Float(value as f64),
            other => other,
        })
        .collect()
}

/// Reads a polars column back into cells. Unsupported types are read as text.
fn cells(series: &Series) -> Vec<Cell> {
    let read = match series.dtype() {
        PolarsType::Boolean => bool_cells(series),
        PolarsType::String => text_cells(series),
        PolarsType::Datetime(unit, _) => timestamp_cells(series, *unit),
        PolarsType::Float32 | PolarsType::Float64 => float_cells(series),
        dtype if dtype.is_numeric() => int_cells(series),
        _ => series
            .cast(&PolarsType::String)
            .and_then(|text| text_cells(&text)),
    };
    read.unwrap_or_else(|_| vec![Cell::Null; series.len()])
}

fn bool_cells(series: &Series) -> PolarsResult<Vec<Cell>> {
    let values = series.bool()?.into_iter().map(Cell::from).collect();
    Ok(values)
}

fn text_cells(series: &Series) -> PolarsResult<Vec<Cell>> {
    let values = series
        .str()?
        .into_iter()
        .map(|value| value.map(Cell::text).unwrap_or(Cell::Null))
        .collect();
    Ok(values)
}

fn int_cells(series: &Series) -> PolarsResult<Vec<Cell>> {
    let ints = series.cast(&PolarsType::Int64)?;
    let values = ints.i64()?.into_iter().map(Cell::from).collect();
    Ok(values)
}

fn float_cells(series: &Series) -> PolarsResult<Vec<Cell>> {
    let floats = series.cast(&PolarsType::Float64)?;
    let values = floats
        .f64()?
        .into_iter()
        .map(|value| value.map(Cell::float).unwrap_or(Cell::Null))
        .collect();
    Ok(values)
}

fn timestamp_cells(series: &Series, unit: TimeUnit) -> PolarsResult<Vec<Cell>> {
    let physical = series.to_physical_repr();
    let values = physical
        .i64()?
        .into_iter()
        .map(|value| {
            value
                .and_then(|value| timestamp(value, unit))
                .map(Cell::Timestamp)
                .unwrap_or(Cell::Null)
        })
        .collect();
    Ok(values)
}

fn timestamp(value: i64, unit: TimeUnit) -> Option<UtcDateTime> {
    match unit {
        TimeUnit::Nanoseconds => UtcDateTime::from_unix_micros(value.div_euclid(1_000)),
        TimeUnit::Microseconds => UtcDateTime::from_unix_micros(value),
        TimeUnit::Milliseconds => UtcDateTime::from_unix_micros(value.checked_mul(1_000)?),
    }
}

/// Row labels. A trivial `Range` index is not written to delimited output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Index {
    #[default]
    Range,
    Labels { values: Vec<Cell> },
}

impl Index {
    pub const fn is_range(&self) -> bool {
        matches!(self, Self::Range)
    }

    fn label(&self, position: usize) -> Cell {
        match self {
            Self::Range => Cell::Int(position as i64),
            Self::Labels { values } => values.get(position).cloned().unwrap_or(Cell::Null),
        }
    }
}

/// Serialized layout of a [`Table`], as stored in cache entries.
#[derive(Serialize, Deserialize)]
struct TableRecord {
    columns: Vec<Column>,
    #[serde(default)]
    index: Index,
    #[serde(default)]
    time_normalized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "TableRecord", try_from = "TableRecord")]
pub struct Table {
    frame: DataFrame,
    index: Index,
    time_normalized: bool,
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.time_normalized == other.time_normalized
            && self.columns() == other.columns()
    }
}

impl From<Table> for TableRecord {
    fn from(table: Table) -> Self {
        Self {
            columns: table.columns(),
            index: table.index,
            time_normalized: table.time_normalized,
        }
    }
}

impl TryFrom<TableRecord> for Table {
    type Error = ValidationError;

    fn try_from(record: TableRecord) -> Result<Self, Self::Error> {
        let mut table = Self::new(record.columns)?;
        table.index = record.index;
        table.time_normalized = record.time_normalized;
        Ok(table)
    }
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, ValidationError> {
        let mut seen = HashSet::with_capacity(columns.len());
        let expected = columns.first().map(Column::len).unwrap_or_default();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ValidationError::DuplicateColumn {
                    column: column.name.clone(),
                });
            }
            if column.len() != expected {
                return Err(ValidationError::RaggedTable {
                    column: column.name.clone(),
                    expected,
                    actual: column.len(),
                });
            }
        }

        let frame = DataFrame::new(columns.iter().map(Column::to_series).collect())
            .map_err(|err| ValidationError::InvalidTable {
                reason: err.to_string(),
            })?;
        Ok(Self::from_frame(frame))
    }

    pub fn empty() -> Self {
        Self::from_frame(DataFrame::empty())
    }

    /// Wraps a frame with a range index.
    pub fn from_frame(frame: DataFrame) -> Self {
        Self {
            frame,
            index: Index::Range,
            time_normalized: false,
        }
    }

    /// Builds a table from row-major data.
    pub fn from_rows<N, S>(names: N, rows: Vec<Vec<Cell>>) -> Result<Self, ValidationError>
    where
        N: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect::<Vec<String>>();
        let mut buffers = vec![Vec::with_capacity(rows.len()); names.len()];
        for row in rows {
            if row.len() != names.len() {
                return Err(ValidationError::RaggedTable {
                    column: String::from("<row>"),
                    expected: names.len(),
                    actual: row.len(),
                });
            }
            for (buffer, cell) in buffers.iter_mut().zip(row) {
                buffer.push(cell);
            }
        }

        Self::new(
            names
                .into_iter()
                .zip(buffers)
                .map(|(name, values)| Column::new(name, values))
                .collect(),
        )
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Swaps in a frame with the same rows, keeping labels and the
    /// normalization flag.
    pub fn with_frame(self, frame: DataFrame) -> Self {
        Self {
            frame,
            index: self.index,
            time_normalized: self.time_normalized,
        }
    }

    pub fn columns(&self) -> Vec<Column> {
        self.frame
            .get_columns()
            .iter()
            .map(Column::from_series)
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<Column> {
        self.frame.column(name).ok().map(Column::from_series)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.column(name).is_ok()
    }

    pub fn dtype(&self, name: &str) -> Option<DataType> {
        self.frame
            .column(name)
            .ok()
            .map(|series| DataType::of(series.dtype()))
    }

    pub fn dtypes(&self) -> Vec<DataType> {
        self.frame
            .get_columns()
            .iter()
            .map(|series| DataType::of(series.dtype()))
            .collect()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.frame.get_column_names()
    }

    pub fn row_count(&self) -> usize {
        match &self.index {
            Index::Labels { values } if self.frame.width() == 0 => values.len(),
            _ => self.frame.height(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Row label at `position`.
    pub fn label(&self, position: usize) -> Cell {
        self.index.label(position)
    }

    pub fn row(&self, position: usize) -> Vec<Cell> {
        let offset = i64::try_from(position).unwrap_or(i64::MAX);
        self.frame
            .get_columns()
            .iter()
            .filter_map(|series| cells(&series.slice(offset, 1)).into_iter().next())
            .collect()
    }

    pub fn is_time_normalized(&self) -> bool {
        self.time_normalized
    }

    pub fn mark_time_normalized(&mut self) {
        self.time_normalized = true;
    }

    /// Contiguous window of rows. Keeps a range index when there is one.
    pub fn slice(&self, offset: usize, limit: Option<usize>) -> Self {
        let start = offset.min(self.row_count());
        let end = limit
            .map(|limit| start.saturating_add(limit).min(self.row_count()))
            .unwrap_or(self.row_count());
        let index = match &self.index {
            Index::Range => Index::Range,
            Index::Labels { values } => Index::Labels {
                values: values[start.min(values.len())..end.min(values.len())].to_vec(),
            },
        };

        Self {
            frame: self
                .frame
                .slice(i64::try_from(start).unwrap_or(i64::MAX), end - start),
            index,
            time_normalized: self.time_normalized,
        }
    }

    /// Rows at `positions`, in that order, carrying their original labels along.
    pub fn take(&self, positions: &[usize]) -> PolarsResult<Self> {
        let indices = IdxCa::from_vec(
            "",
            positions
                .iter()
                .map(|position| *position as IdxSize)
                .collect(),
        );
        let frame = self.frame.take(&indices)?;
        let is_identity = self.index.is_range()
            && positions.len() == self.row_count()
            && positions.iter().enumerate().all(|(i, p)| i == *p);
        let index = if is_identity {
            Index::Range
        } else {
            Index::Labels {
                values: positions
                    .iter()
                    .map(|position| self.index.label(*position))
                    .collect(),
            }
        };

        Ok(Self {
            frame,
            index,
            time_normalized: self.time_normalized,
        })
    }

    /// Stable sort by `(column, ascending)` keys with nulls last. Rows keep
    /// their labels.
    pub fn sort_by(&self, keys: &[(&str, bool)]) -> PolarsResult<Self> {
        if keys.is_empty() || self.frame.width() == 0 {
            return Ok(self.clone());
        }

        let by = keys.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        let options = SortMultipleOptions::default()
            .with_order_descending_multi(keys.iter().map(|(_, ascending)| !ascending))
            .with_nulls_last(true)
            .with_maintain_order(true);
        let sorted = self
            .frame
            .with_row_index(ROW_POSITION, None)?
            .sort(by, options)?;
        let positions = sorted
            .column(ROW_POSITION)?
            .idx()?
            .into_no_null_iter()
            .map(|position| position as usize)
            .collect::<Vec<_>>();
        self.take(&positions)
    }

    /// Forgets row labels.
    pub fn reset_index(mut self) -> Self {
        self.index = Index::Range;
        self
    }

    /// Keeps the named columns in the given order; unknown and repeated names
    /// are ignored.
    pub fn project(&self, names: &[&str]) -> PolarsResult<Self> {
        let mut seen = HashSet::with_capacity(names.len());
        let names = names
            .iter()
            .copied()
            .filter(|name| self.has_column(name) && seen.insert(*name))
            .collect::<Vec<_>>();
        Ok(Self {
            frame: self.frame.select(names)?,
            index: self.index.clone(),
            time_normalized: self.time_normalized,
        })
    }

    /// Replaces the column of the same name in place, or appends it.
    pub fn put_column(&mut self, column: Column) -> Result<(), ValidationError> {
        if self.frame.width() > 0 && column.len() != self.frame.height() {
            let actual = column.len();
            return Err(ValidationError::RaggedTable {
                column: column.name,
                expected: self.frame.height(),
                actual,
            });
        }
        self.put_series(column.to_series())
    }

    /// Same as [`Table::put_column`] for a polars column.
    pub fn put_series(&mut self, series: Series) -> Result<(), ValidationError> {
        self.frame
            .with_column(series)
            .map(|_| ())
            .map_err(|err| ValidationError::InvalidTable {
                reason: err.to_string(),
            })
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }
}
