//! Renders tables into the requested result encoding.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::{CoreError, ResultFormat, Table};

/// One row as an ordered mapping of column name to value.
pub type Record = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FormattedData {
    Records(Vec<Record>),
    Text(String),
}

impl FormattedData {
    pub fn into_value(self) -> Value {
        match self {
            Self::Records(records) => Value::Array(
                records
                    .into_iter()
                    .map(|record| Value::Object(record.into_iter().collect()))
                    .collect(),
            ),
            Self::Text(text) => Value::String(text),
        }
    }
}

pub fn format_table(table: &Table, format: ResultFormat, delimiter: char) -> Result<FormattedData, CoreError> {
    match format {
        ResultFormat::Json => Ok(FormattedData::Records(to_records(table))),
        ResultFormat::Csv => to_csv(table, delimiter).map(FormattedData::Text),
    }
}

pub fn to_records(table: &Table) -> Vec<Record> {
    let columns = table.columns();
    (0..table.row_count())
        .map(|position| {
            columns
                .iter()
                .map(|column| {
                    let value = column
                        .values
                        .get(position)
                        .map(|cell| cell.to_json())
                        .unwrap_or(Value::Null);
                    (column.name.clone(), value)
                })
                .collect()
        })
        .collect()
}

/// Delimited text with a header row. The row index is written as the first,
/// unnamed column only when it is not a plain range.
pub fn to_csv(table: &Table, delimiter: char) -> Result<String, CoreError> {
    let include_index = !table.index().is_range();
    let delimiter = u8::try_from(delimiter).unwrap_or(b',');
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    let columns = table.columns();
    if columns.is_empty() && !include_index {
        return Ok(String::new());
    }

    let mut header = Vec::with_capacity(columns.len() + 1);
    if include_index {
        header.push(String::new());
    }
    header.extend(columns.iter().map(|column| column.name.clone()));
    writer.write_record(&header)?;

    for position in 0..table.row_count() {
        let mut record = Vec::with_capacity(header.len());
        if include_index {
            record.push(table.label(position).to_string());
        }
        record.extend(columns.iter().map(|column| {
            column
                .values
                .get(position)
                .map(ToString::to_string)
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(String::from_utf8(bytes)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Cell, UtcDateTime};

    fn table() -> Table {
        Table::from_rows(
            ["__timestamp", "region", "sales"],
            vec![
                vec![
                    Cell::Timestamp(UtcDateTime::parse("2024-01-01T00:00:00Z").expect("ts")),
                    Cell::from("east"),
                    Cell::float(1.5),
                ],
                vec![Cell::Null, Cell::from("west, north"), Cell::Int(2)],
            ],
        )
        .expect("table")
    }

    #[test]
    fn records_keep_column_order_and_use_epoch_millis() {
        let records = to_records(&table());
        assert_eq!(
            records[0].keys().cloned().collect::<Vec<_>>(),
            vec!["__timestamp", "region", "sales"]
        );
        assert_eq!(records[0]["__timestamp"], json!(1_704_067_200_000_i64));
        assert_eq!(records[1]["__timestamp"], Value::Null);
    }

    #[test]
    fn csv_without_index_for_range_tables() {
        let csv = to_csv(&table(), ',').expect("csv");
        assert_eq!(
            csv,
            "__timestamp,region,sales\n2024-01-01 00:00:00,east,1.5\n,\"west, north\",2.0\n"
        );
    }

    #[test]
    fn csv_includes_index_after_reordering() {
        let reordered = table().take(&[1, 0]).expect("take");
        let csv = to_csv(&reordered, ';').expect("csv");
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(";__timestamp;region;sales"));
        assert_eq!(lines.next(), Some("1;;west, north;2.0"));
    }
}
