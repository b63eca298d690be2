//! Lowering of a [`QueryObject`] into a select plan that datasources execute,
//! either in memory or as SQL.

use std::fmt::Write as _;

use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    Cell, FilterOperator, Metric, QueryFilter, QueryObject, TimeBounds, ValidationError,
    DTTM_ALIAS,
};
use crate::query_object::AdhocExpression;

/// Aggregate functions understood by every datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "COUNT_DISTINCT" => Some(Self::CountDistinct),
            "SUM" => Some(Self::Sum),
            "AVG" | "MEAN" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }

    /// Parses `AGG(column)` or `COUNT(*)`.
    pub fn parse_call(expression: &str) -> Option<(Self, Option<String>)> {
        let expression = expression.trim();
        let open = expression.find('(')?;
        let inner = expression.strip_suffix(')')?.get(open + 1..)?.trim();
        let name = &expression[..open];

        if let Some(column) = inner
            .strip_prefix("DISTINCT ")
            .or_else(|| inner.strip_prefix("distinct "))
        {
            return (name.trim().eq_ignore_ascii_case("COUNT"))
                .then(|| (Self::CountDistinct, Some(unquote(column.trim()))));
        }

        let aggregate = Self::parse(name)?;
        match inner {
            "*" if aggregate == Self::Count => Some((aggregate, None)),
            "" | "*" => None,
            column => Some((aggregate, Some(unquote(column)))),
        }
    }

    pub fn to_sql(self, column: Option<&str>) -> String {
        let column = column.map(quote_identifier).unwrap_or_else(|| String::from("*"));
        match self {
            Self::Count => format!("COUNT({column})"),
            Self::CountDistinct => format!("COUNT(DISTINCT {column})"),
            Self::Sum => format!("SUM({column})"),
            Self::Avg => format!("AVG({column})"),
            Self::Min => format!("MIN({column})"),
            Self::Max => format!("MAX({column})"),
        }
    }

    /// Folds the non-null values of a group.
    pub fn evaluate(self, values: &[&Cell]) -> Cell {
        let present = values.iter().filter(|cell| !cell.is_null());
        match self {
            Self::Count => Cell::Int(present.count() as i64),
            Self::CountDistinct => {
                let mut distinct: Vec<&Cell> = Vec::new();
                for cell in present {
                    if !distinct.iter().any(|seen| *seen == *cell) {
                        distinct.push(*cell);
                    }
                }
                Cell::Int(distinct.len() as i64)
            }
            Self::Min => present
                .min_by(|left, right| left.total_cmp(right))
                .map(|cell| (*cell).clone())
                .unwrap_or(Cell::Null),
            Self::Max => present
                .max_by(|left, right| left.total_cmp(right))
                .map(|cell| (*cell).clone())
                .unwrap_or(Cell::Null),
            Self::Sum => {
                let cells = present.collect::<Vec<_>>();
                if cells.is_empty() {
                    return Cell::Null;
                }
                if cells.iter().all(|cell| matches!(cell, Cell::Int(_))) {
                    let total = cells.iter().try_fold(0_i64, |acc, cell| match cell {
                        Cell::Int(value) => acc.checked_add(*value),
                        _ => None,
                    });
                    if let Some(total) = total {
                        return Cell::Int(total);
                    }
                }
                Cell::float(cells.iter().filter_map(|cell| cell.as_f64()).sum())
            }
            Self::Avg => {
                let numbers = present.filter_map(|cell| cell.as_f64()).collect::<Vec<_>>();
                if numbers.is_empty() {
                    Cell::Null
                } else {
                    Cell::float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
        }
    }
}

/// How one metric column is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricExpression {
    Aggregate {
        aggregate: Aggregate,
        column: Option<String>,
    },
    /// Free-form SQL; only SQL datasources can compute it.
    Sql(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMetric {
    pub label: String,
    pub expression: MetricExpression,
}

impl PlannedMetric {
    pub fn to_sql(&self) -> String {
        match &self.expression {
            MetricExpression::Aggregate { aggregate, column } => aggregate.to_sql(column.as_deref()),
            MetricExpression::Sql(expression) => expression.clone(),
        }
    }
}

/// Datasource-independent form of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Source column emitted as `__timestamp`.
    pub time_column: Option<String>,
    /// Column the time range applies to.
    pub granularity: Option<String>,
    pub bounds: Option<TimeBounds>,
    pub dimensions: Vec<String>,
    pub metrics: Vec<PlannedMetric>,
    pub filters: Vec<QueryFilter>,
    /// Output column and ascending flag.
    pub order: Vec<(String, bool)>,
    pub row_limit: Option<usize>,
    pub row_offset: usize,
}

impl QueryPlan {
    /// `saved_metrics` maps metric names to their SQL expression.
    pub fn build(query: &QueryObject, saved_metrics: &IndexMap<String, String>) -> Result<Self, ValidationError> {
        let metrics = query
            .metrics
            .iter()
            .map(|metric| plan_metric(metric, saved_metrics))
            .collect::<Result<Vec<_>, _>>()?;

        for filter in &query.filters {
            check_filter(filter)?;
        }

        let time_column = query
            .granularity
            .clone()
            .filter(|_| query.is_timeseries);

        let order = if !query.orderby.is_empty() {
            query.orderby.clone()
        } else if time_column.is_some() {
            vec![(DTTM_ALIAS.to_owned(), true)]
        } else if let Some(first) = metrics.first() {
            vec![(first.label.clone(), !query.order_desc)]
        } else {
            Vec::new()
        };

        Ok(Self {
            time_column,
            granularity: query.granularity.clone(),
            bounds: query.time_bounds()?,
            dimensions: query.dimension_columns(),
            metrics,
            filters: query.filters.clone(),
            order,
            row_limit: query.row_limit,
            row_offset: query.row_offset,
        })
    }

    /// Drops filters on columns outside `columns`; callers report those as
    /// rejected filters.
    pub fn retain_filters_on(mut self, columns: &[String]) -> Self {
        self.filters.retain(|filter| columns.contains(&filter.col));
        self
    }

    pub fn is_aggregate(&self) -> bool {
        !self.metrics.is_empty()
    }

    /// Output column names in order.
    pub fn output_columns(&self) -> Vec<String> {
        self.time_column
            .iter()
            .map(|_| DTTM_ALIAS.to_owned())
            .chain(self.dimensions.iter().cloned())
            .chain(self.metrics.iter().map(|metric| metric.label.clone()))
            .collect()
    }

    /// Renders the plan as a single SELECT statement. `from` is inserted as
    /// is: a quoted table name or a parenthesized subquery with an alias.
    pub fn to_sql(&self, from: &str) -> String {
        let mut select = Vec::new();
        if let Some(time_column) = &self.time_column {
            select.push(format!(
                "{} AS {}",
                quote_identifier(time_column),
                quote_identifier(DTTM_ALIAS)
            ));
        }
        select.extend(self.dimensions.iter().map(|name| quote_identifier(name)));
        select.extend(
            self.metrics
                .iter()
                .map(|metric| format!("{} AS {}", metric.to_sql(), quote_identifier(&metric.label))),
        );
        if select.is_empty() {
            select.push(String::from("*"));
        }

        let mut sql = format!("SELECT {}\nFROM {from}", select.join(", "));

        let mut predicates = Vec::new();
        if let (Some(column), Some(bounds)) = (&self.granularity, &self.bounds) {
            if let Some(since) = bounds.since {
                predicates.push(format!(
                    "{} >= '{}'",
                    quote_identifier(column),
                    since.format_naive()
                ));
            }
            if let Some(until) = bounds.until {
                predicates.push(format!(
                    "{} < '{}'",
                    quote_identifier(column),
                    until.format_naive()
                ));
            }
        }
        predicates.extend(self.filters.iter().map(filter_to_sql));
        if !predicates.is_empty() {
            let _ = write!(sql, "\nWHERE {}", predicates.join("\n  AND "));
        }

        if self.is_aggregate() {
            let groups = self
                .time_column
                .iter()
                .chain(self.dimensions.iter())
                .map(|name| quote_identifier(name))
                .collect::<Vec<_>>();
            if !groups.is_empty() {
                let _ = write!(sql, "\nGROUP BY {}", groups.join(", "));
            }
        }

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, ascending)| {
                    format!(
                        "{} {}",
                        quote_identifier(column),
                        if *ascending { "ASC" } else { "DESC" }
                    )
                })
                .collect::<Vec<_>>();
            let _ = write!(sql, "\nORDER BY {}", order.join(", "));
        }
        if let Some(limit) = self.row_limit {
            let _ = write!(sql, "\nLIMIT {limit}");
        }
        if self.row_offset > 0 {
            let _ = write!(sql, "\nOFFSET {}", self.row_offset);
        }
        sql
    }
}

fn plan_metric(metric: &Metric, saved_metrics: &IndexMap<String, String>) -> Result<PlannedMetric, ValidationError> {
    let label = metric.label();
    let expression = match metric {
        Metric::Saved(name) => match saved_metrics.get(name) {
            Some(expression) => Aggregate::parse_call(expression)
                .map(|(aggregate, column)| MetricExpression::Aggregate { aggregate, column })
                .unwrap_or_else(|| MetricExpression::Sql(expression.clone())),
            None => {
                return Err(ValidationError::InvalidMetric {
                    label,
                    reason: String::from("no saved metric with this name"),
                })
            }
        },
        Metric::Adhoc(adhoc) => match &adhoc.expression {
            AdhocExpression::Simple { column, aggregate } => MetricExpression::Aggregate {
                aggregate: Aggregate::parse(aggregate).ok_or_else(|| ValidationError::InvalidMetric {
                    label: label.clone(),
                    reason: format!("unknown aggregate '{aggregate}'"),
                })?,
                column: Some(column.column_name.clone()),
            },
            AdhocExpression::Sql { sql_expression } => MetricExpression::Sql(sql_expression.clone()),
        },
    };
    Ok(PlannedMetric { label, expression })
}

fn check_filter(filter: &QueryFilter) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidFilter {
        column: filter.col.clone(),
        reason: reason.to_owned(),
    };
    match filter.op {
        FilterOperator::In | FilterOperator::NotIn if !filter.val.is_array() => {
            Err(invalid("expected a list of values"))
        }
        FilterOperator::IsNull | FilterOperator::IsNotNull => Ok(()),
        FilterOperator::In | FilterOperator::NotIn => Ok(()),
        _ if filter.val.is_array() || filter.val.is_object() => Err(invalid("expected a single value")),
        _ => Ok(()),
    }
}

/// Whether `cell` satisfies `filter`. Nulls only match the null checks.
pub fn filter_matches(filter: &QueryFilter, cell: &Cell) -> bool {
    use std::cmp::Ordering;

    let compare = |value: &Value| {
        let other = Cell::from_json(value);
        (!cell.is_null() && !other.is_null()).then(|| cell.total_cmp(&other))
    };
    let members = || filter.val.as_array().map(Vec::as_slice).unwrap_or_default();

    match filter.op {
        FilterOperator::IsNull => cell.is_null(),
        FilterOperator::IsNotNull => !cell.is_null(),
        FilterOperator::Equals => compare(&filter.val) == Some(Ordering::Equal),
        FilterOperator::NotEquals => matches!(compare(&filter.val), Some(ordering) if ordering != Ordering::Equal),
        FilterOperator::GreaterThan => compare(&filter.val) == Some(Ordering::Greater),
        FilterOperator::LessThan => compare(&filter.val) == Some(Ordering::Less),
        FilterOperator::GreaterThanOrEquals => {
            matches!(compare(&filter.val), Some(Ordering::Greater | Ordering::Equal))
        }
        FilterOperator::LessThanOrEquals => {
            matches!(compare(&filter.val), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::In => members()
            .iter()
            .any(|value| compare(value) == Some(Ordering::Equal)),
        FilterOperator::NotIn => {
            !cell.is_null()
                && members()
                    .iter()
                    .all(|value| compare(value) != Some(Ordering::Equal))
        }
    }
}

fn filter_to_sql(filter: &QueryFilter) -> String {
    let column = quote_identifier(&filter.col);
    let list = || {
        filter
            .val
            .as_array()
            .map(|values| values.iter().map(literal).collect::<Vec<_>>().join(", "))
            .unwrap_or_default()
    };
    match filter.op {
        FilterOperator::IsNull => format!("{column} IS NULL"),
        FilterOperator::IsNotNull => format!("{column} IS NOT NULL"),
        FilterOperator::In => format!("{column} IN ({})", list()),
        FilterOperator::NotIn => format!("{column} NOT IN ({})", list()),
        FilterOperator::Equals => format!("{column} = {}", literal(&filter.val)),
        FilterOperator::NotEquals => format!("{column} <> {}", literal(&filter.val)),
        FilterOperator::GreaterThan => format!("{column} > {}", literal(&filter.val)),
        FilterOperator::LessThan => format!("{column} < {}", literal(&filter.val)),
        FilterOperator::GreaterThanOrEquals => format!("{column} >= {}", literal(&filter.val)),
        FilterOperator::LessThanOrEquals => format!("{column} <= {}", literal(&filter.val)),
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn unquote(name: &str) -> String {
    name.strip_prefix('"')
        .and_then(|name| name.strip_suffix('"'))
        .map(|name| name.replace("\"\"", "\""))
        .unwrap_or_else(|| name.to_owned())
}

/// SQL literal for a JSON scalar.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => String::from("NULL"),
        Value::Bool(true) => String::from("TRUE"),
        Value::Bool(false) => String::from("FALSE"),
        Value::Number(number) => number.to_string(),
        Value::String(text) => format!("'{}'", text.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}
