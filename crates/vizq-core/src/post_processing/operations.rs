use polars::prelude::{col, DataType as PolarsType, Expr, IntoLazy, RollingOptionsFixedWindow};
use serde_json::{Map, Value};

use crate::{CoreError, DataType, Table, ValidationError};

const OVERFLOW_CHECK: &str = "__cum_overflow_";

fn invalid(operation: &str, reason: impl Into<String>) -> CoreError {
    ValidationError::InvalidPostProcessingOptions {
        operation: operation.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// Reads an option that is either a single string or an array of strings.
fn string_list(operation: &str, options: &Map<String, Value>, key: &str) -> Result<Vec<String>, CoreError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(value)) => Ok(vec![value.clone()]),
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| {
                value
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| invalid(operation, format!("`{key}` must hold strings")))
            })
            .collect(),
        Some(_) => Err(invalid(operation, format!("`{key}` must be a string or a list"))),
    }
}

/// `columns` as `{source: target}` or as a list transformed in place.
fn column_mapping(operation: &str, options: &Map<String, Value>) -> Result<Vec<(String, String)>, CoreError> {
    match options.get("columns") {
        Some(Value::Object(mapping)) => mapping
            .iter()
            .map(|(source, target)| {
                target
                    .as_str()
                    .map(|target| (source.clone(), target.to_owned()))
                    .ok_or_else(|| invalid(operation, "`columns` targets must be strings"))
            })
            .collect(),
        Some(_) => Ok(string_list(operation, options, "columns")?
            .into_iter()
            .map(|name| (name.clone(), name))
            .collect()),
        None => Err(invalid(operation, "`columns` is required")),
    }
}

fn require_column(operation: &str, table: &Table, name: &str) -> Result<DataType, CoreError> {
    table
        .dtype(name)
        .ok_or_else(|| invalid(operation, format!("column '{name}' does not exist")))
}

fn require_numeric(operation: &str, table: &Table, name: &str) -> Result<DataType, CoreError> {
    let dtype = require_column(operation, table, name)?;
    if !dtype.is_numeric() {
        return Err(invalid(operation, format!("column '{name}' is not numeric")));
    }
    Ok(dtype)
}

/// Keeps, drops and renames columns.
///
/// Options: `columns` (ordered list to keep), `exclude`, `rename` (`{old: new}`).
pub fn select(table: Table, options: &Map<String, Value>) -> Result<Table, CoreError> {
    const OP: &str = "select";
    let keep = string_list(OP, options, "columns")?;
    let exclude = string_list(OP, options, "exclude")?;

    for name in keep.iter().chain(exclude.iter()) {
        require_column(OP, &table, name)?;
    }

    let names = if keep.is_empty() {
        table
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>()
    } else {
        keep
    };
    let names = names
        .iter()
        .filter(|name| !exclude.contains(name))
        .map(String::as_str)
        .collect::<Vec<_>>();
    let selected = table.project(&names)?;

    let renames = match options.get("rename") {
        None | Some(Value::Null) => return Ok(selected),
        Some(Value::Object(renames)) => renames,
        Some(_) => return Err(invalid(OP, "`rename` must be an object")),
    };

    let mut frame = selected.frame().clone();
    for (from, to) in renames {
        let to = to
            .as_str()
            .ok_or_else(|| invalid(OP, "`rename` targets must be strings"))?;
        if from != to && frame.column(to).is_ok() {
            return Err(ValidationError::DuplicateColumn {
                column: to.to_owned(),
            }
            .into());
        }
        if frame.column(from).is_err() {
            return Err(invalid(OP, format!("column '{from}' does not exist")));
        }
        frame.rename(from, to)?;
    }

    Ok(selected.with_frame(frame))
}

/// Stable sort by one or more columns. Rows keep their labels, nulls go last.
///
/// Options: `by` (column or list), `ascending` (bool or list matching `by`).
pub fn sort(table: Table, options: &Map<String, Value>) -> Result<Table, CoreError> {
    const OP: &str = "sort";
    let by = string_list(OP, options, "by")?;
    if by.is_empty() {
        return Err(invalid(OP, "`by` is required"));
    }

    let ascending = match options.get("ascending") {
        None | Some(Value::Null) => vec![true; by.len()],
        Some(Value::Bool(value)) => vec![*value; by.len()],
        Some(Value::Array(values)) if values.len() == by.len() => values
            .iter()
            .map(|value| {
                value
                    .as_bool()
                    .ok_or_else(|| invalid(OP, "`ascending` must hold booleans"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid(OP, "`ascending` must be a bool or match `by`")),
    };

    for name in &by {
        require_column(OP, &table, name)?;
    }

    let keys = by
        .iter()
        .map(String::as_str)
        .zip(ascending)
        .collect::<Vec<_>>();
    Ok(table.sort_by(&keys)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollingType {
    Sum,
    Mean,
    Min,
    Max,
    Std,
}

impl RollingType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(Self::Sum),
            "mean" => Some(Self::Mean),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "std" => Some(Self::Std),
            _ => None,
        }
    }

    fn expr(self, input: Expr, options: RollingOptionsFixedWindow) -> Expr {
        match self {
            Self::Sum => input.rolling_sum(options),
            Self::Mean => input.rolling_mean(options),
            Self::Min => input.rolling_min(options),
            Self::Max => input.rolling_max(options),
            Self::Std => input.rolling_std(options),
        }
    }
}

fn usize_option(operation: &str, options: &Map<String, Value>, key: &str) -> Result<Option<usize>, CoreError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|value| usize::try_from(value).ok())
            .map(Some)
            .ok_or_else(|| invalid(operation, format!("`{key}` must be a non-negative integer"))),
    }
}

/// Trailing-window aggregate over float values.
///
/// Options: `columns`, `rolling_type` (sum/mean/min/max/std), `window` (>= 1),
/// `min_periods` (non-null values required, defaults to `window`).
pub fn rolling(table: Table, options: &Map<String, Value>) -> Result<Table, CoreError> {
    const OP: &str = "rolling";
    let columns = column_mapping(OP, options)?;
    let rolling_type = options
        .get("rolling_type")
        .and_then(Value::as_str)
        .and_then(RollingType::parse)
        .ok_or_else(|| invalid(OP, "`rolling_type` must be one of sum, mean, min, max, std"))?;
    let window = usize_option(OP, options, "window")?
        .filter(|window| *window > 0)
        .ok_or_else(|| invalid(OP, "`window` must be at least 1"))?;
    let min_periods = usize_option(OP, options, "min_periods")?
        .unwrap_or(window)
        .max(1);
    if min_periods > window {
        return Err(invalid(OP, "`min_periods` must not exceed `window`"));
    }

    let window_options = RollingOptionsFixedWindow {
        window_size: window,
        min_periods,
        ..Default::default()
    };
    let mut exprs = Vec::with_capacity(columns.len());
    for (source, target) in &columns {
        require_numeric(OP, &table, source)?;
        let input = col(source).cast(PolarsType::Float64);
        exprs.push(rolling_type.expr(input, window_options.clone()).alias(target));
    }

    let frame = table.frame().clone().lazy().with_columns(exprs).collect()?;
    Ok(table.with_frame(frame))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CumOperator {
    Sum,
    Prod,
    Min,
    Max,
}

impl CumOperator {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(Self::Sum),
            "prod" => Some(Self::Prod),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    fn expr(self, input: Expr) -> Expr {
        match self {
            Self::Sum => input.cum_sum(false),
            Self::Prod => input.cum_prod(false),
            Self::Min => input.cum_min(false),
            Self::Max => input.cum_max(false),
        }
    }

    const fn can_overflow(self) -> bool {
        matches!(self, Self::Sum | Self::Prod)
    }
}

/// Cumulative aggregate. Nulls stay null and do not reset the running value.
/// Integer columns stay integers and fail on overflow.
///
/// Options: `columns`, `operator` (sum/prod/min/max).
pub fn cum(table: Table, options: &Map<String, Value>) -> Result<Table, CoreError> {
    const OP: &str = "cum";
    let columns = column_mapping(OP, options)?;
    let operator = options
        .get("operator")
        .and_then(Value::as_str)
        .and_then(CumOperator::parse)
        .ok_or_else(|| invalid(OP, "`operator` must be one of sum, prod, min, max"))?;

    let mut exprs = Vec::with_capacity(columns.len());
    let mut overflow_checks = Vec::new();
    for (position, (source, target)) in columns.iter().enumerate() {
        let dtype = require_numeric(OP, &table, source)?;
        exprs.push(operator.expr(col(source)).alias(target));
        if dtype == DataType::Int64 && operator.can_overflow() {
            let check = format!("{OVERFLOW_CHECK}{position}");
            exprs.push(operator.expr(col(source).cast(PolarsType::Float64)).alias(&check));
            overflow_checks.push(check);
        }
    }

    let mut frame = table.frame().clone().lazy().with_columns(exprs).collect()?;
    for check in &overflow_checks {
        let bound = frame.drop_in_place(check)?;
        let overflowed = bound
            .f64()?
            .into_iter()
            .flatten()
            .any(|value| value.abs() >= i64::MAX as f64);
        if overflowed {
            return Err(invalid(OP, "integer overflow"));
        }
    }

    Ok(table.with_frame(frame))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Cell, Column, Index};

    fn options(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn sales() -> Table {
        Table::from_rows(
            ["region", "sales"],
            vec![
                vec![Cell::from("east"), Cell::Int(3)],
                vec![Cell::from("west"), Cell::Int(1)],
                vec![Cell::from("north"), Cell::Null],
                vec![Cell::from("south"), Cell::Int(2)],
            ],
        )
        .expect("table")
    }

    #[test]
    fn select_keeps_order_and_renames() {
        let table = select(
            sales(),
            &options(json!({"columns": ["sales", "region"], "rename": {"sales": "total"}})),
        )
        .expect("select");
        assert_eq!(table.column_names(), vec!["total", "region"]);
    }

    #[test]
    fn select_rejects_unknown_columns() {
        let err = select(sales(), &options(json!({"exclude": ["missing"]}))).expect_err("must fail");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn sort_descending_puts_nulls_last_and_keeps_labels() {
        let table = sort(sales(), &options(json!({"by": "sales", "ascending": false}))).expect("sort");
        assert_eq!(
            table.column("sales").expect("sales").values,
            vec![Cell::Int(3), Cell::Int(2), Cell::Int(1), Cell::Null]
        );
        assert_eq!(
            table.index(),
            &Index::Labels {
                values: vec![Cell::Int(0), Cell::Int(3), Cell::Int(1), Cell::Int(2)]
            }
        );
    }

    #[test]
    fn rolling_sum_honours_min_periods() {
        let table = rolling(
            sales(),
            &options(json!({
                "columns": {"sales": "sales_rolling"},
                "rolling_type": "sum",
                "window": 2,
                "min_periods": 1
            })),
        )
        .expect("rolling");
        assert_eq!(
            table.column("sales_rolling").expect("rolled").values,
            vec![
                Cell::Float(3.0),
                Cell::Float(4.0),
                Cell::Float(1.0),
                Cell::Float(2.0)
            ]
        );
    }

    #[test]
    fn rolling_requires_full_window_by_default() {
        let table = rolling(
            sales(),
            &options(json!({"columns": ["sales"], "rolling_type": "mean", "window": 2})),
        )
        .expect("rolling");
        assert_eq!(
            table.column("sales").expect("sales").values,
            vec![Cell::Null, Cell::Float(2.0), Cell::Null, Cell::Null]
        );
    }

    #[test]
    fn cum_sum_skips_nulls_without_resetting() {
        let table = cum(
            sales(),
            &options(json!({"columns": {"sales": "running"}, "operator": "sum"})),
        )
        .expect("cum");
        assert_eq!(
            table.column("running").expect("running").values,
            vec![Cell::Int(3), Cell::Int(4), Cell::Null, Cell::Int(6)]
        );
    }

    #[test]
    fn cum_on_integer_column_stays_integer() {
        let table = Table::new(vec![Column::new("n", vec![Cell::Int(2), Cell::Int(3)])]).expect("table");
        let table = cum(table, &options(json!({"columns": ["n"], "operator": "prod"}))).expect("cum");
        assert_eq!(
            table.column("n").expect("n").values,
            vec![Cell::Int(2), Cell::Int(6)]
        );
    }

    #[test]
    fn cum_rejects_integer_overflow() {
        let table = Table::new(vec![Column::new("n", vec![Cell::Int(i64::MAX / 2), Cell::Int(4)])])
            .expect("table");
        let err = cum(table, &options(json!({"columns": ["n"], "operator": "prod"}))).expect_err("overflow");
        assert!(err.to_string().contains("integer overflow"));
    }

    #[test]
    fn rolling_rejects_text_columns() {
        let err = rolling(
            sales(),
            &options(json!({"columns": ["region"], "rolling_type": "sum", "window": 2})),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("not numeric"));
    }

    #[test]
    fn rolling_rejects_min_periods_above_window() {
        let err = rolling(
            sales(),
            &options(json!({"columns": ["sales"], "rolling_type": "max", "window": 2, "min_periods": 3})),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("min_periods"));
    }
}
