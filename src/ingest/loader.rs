//! CSV loading
//!
//! Maps CSV columns onto a table's schema: the `time` column becomes the
//! timestamp, declared tags become tags and declared fields are parsed as
//! numbers. Columns the table does not declare are ignored. Rows that fail to
//! parse are counted and reported instead of aborting the load.

use crate::storage::{BatchReport, Hypertable, TableConfig, TIME_COLUMN};
use crate::storage::{Event, StorageError};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io::Read;
use std::path::Path;

/// Errors kept in a report before the rest are summarised
const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Rows parsed from a CSV source
#[derive(Debug, Default)]
pub struct ParsedCsv {
    pub events: Vec<Event>,
    pub rows_read: usize,
    pub rows_failed: usize,
    pub errors: Vec<String>,
}

/// Outcome of loading a CSV into a table
#[derive(Debug)]
pub struct LoadReport {
    pub rows_read: usize,
    /// Rows that could not be parsed
    pub rows_failed: usize,
    pub errors: Vec<String>,
    /// What the table did with the parsed rows
    pub batch: BatchReport,
}

/// Parse a timestamp as RFC 3339, a common datetime layout, or epoch millis
pub fn parse_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc).timestamp_millis());
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    value.parse::<i64>().ok()
}

enum Column {
    Time,
    Tag(String),
    Field(String),
    Ignored,
}

/// Parse CSV rows against a table schema
pub fn parse_csv<R: Read>(reader: R, schema: &TableConfig) -> Result<ParsedCsv, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns: Vec<Column> = reader
        .headers()?
        .iter()
        .map(|h| {
            if h.eq_ignore_ascii_case(TIME_COLUMN) {
                Column::Time
            } else if schema.tags.iter().any(|t| t == h) {
                Column::Tag(h.to_string())
            } else if schema.fields.iter().any(|f| f == h) {
                Column::Field(h.to_string())
            } else {
                Column::Ignored
            }
        })
        .collect();
    if !columns.iter().any(|c| matches!(c, Column::Time)) {
        return Err(IngestError::MissingColumn(TIME_COLUMN.to_string()));
    }

    let mut parsed = ParsedCsv::default();
    for (line, record) in reader.records().enumerate() {
        // Header is line 1
        let line = line + 2;
        parsed.rows_read += 1;

        let record = match record {
            Ok(r) => r,
            Err(e) => {
                parsed.fail(format!("Line {}: {}", line, e));
                continue;
            }
        };

        match parse_record(&record, &columns) {
            Ok(event) => parsed.events.push(event),
            Err(e) => parsed.fail(format!("Line {}: {}", line, e)),
        }
    }

    if parsed.errors.len() > MAX_REPORTED_ERRORS {
        let total = parsed.errors.len();
        parsed.errors.truncate(MAX_REPORTED_ERRORS);
        parsed
            .errors
            .push(format!("... and {} more errors", total - MAX_REPORTED_ERRORS));
    }
    Ok(parsed)
}

impl ParsedCsv {
    fn fail(&mut self, error: String) {
        self.rows_failed += 1;
        self.errors.push(error);
    }
}

fn parse_record(record: &csv::StringRecord, columns: &[Column]) -> Result<Event, String> {
    let mut timestamp = None;
    let mut event = Event::new(0);

    for (column, value) in columns.iter().zip(record.iter()) {
        match column {
            Column::Time => {
                timestamp = Some(
                    parse_timestamp(value).ok_or_else(|| format!("invalid timestamp '{}'", value))?,
                );
            }
            Column::Tag(name) if !value.is_empty() => {
                event = event.tag(name.as_str(), value);
            }
            Column::Field(name) if !value.is_empty() => {
                let number = value
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}' in {}", value, name))?;
                event = event.field(name.as_str(), number);
            }
            _ => {}
        }
    }

    event.timestamp = timestamp.ok_or("missing timestamp")?;
    Ok(event)
}

/// Parse a CSV file and bulk-load it into the table
pub fn load_csv(table: &Hypertable, path: &Path) -> Result<LoadReport, IngestError> {
    let file = std::fs::File::open(path).map_err(StorageError::from)?;
    let parsed = parse_csv(file, table.config())?;
    if parsed.rows_failed > 0 {
        tracing::warn!(
            path = %path.display(),
            failed = parsed.rows_failed,
            "Skipped unparseable CSV rows"
        );
    }

    let batch = table.bulk_load(parsed.events)?;
    Ok(LoadReport {
        rows_read: parsed.rows_read,
        rows_failed: parsed.rows_failed,
        errors: parsed.errors,
        batch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ScanFilter, TimeRange};
    use tempfile::tempdir;

    fn schema() -> TableConfig {
        TableConfig::new("sensor_data")
            .tags(["equipment_id", "status"])
            .fields(["temperature", "vibration"])
    }

    #[test]
    fn test_parse_timestamps() {
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("2024-01-01 00:00:00"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("2024-01-01 01:00:00+0100"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("1704067200000"), Some(1_704_067_200_000));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_parse_maps_columns_by_schema() {
        let data = "\
time,equipment_id,temperature,vibration,status,operator
2024-01-01 00:00:00,MOTOR_001,61.5,4.25,normal,alice
2024-01-01 00:02:00,PUMP_001,,9.5,warning,bob
not-a-time,PUMP_001,50.0,9.5,normal,bob
2024-01-01 00:04:00,PUMP_001,hot,9.5,normal,bob
";
        let parsed = parse_csv(data.as_bytes(), &schema()).unwrap();
        assert_eq!(parsed.rows_read, 4);
        assert_eq!(parsed.rows_failed, 2);
        assert_eq!(parsed.errors.len(), 2);
        assert!(parsed.errors[0].starts_with("Line 4"));

        let first = &parsed.events[0];
        assert_eq!(first.timestamp, 1_704_067_200_000);
        assert_eq!(first.tags.get("equipment_id").map(String::as_str), Some("MOTOR_001"));
        assert_eq!(first.numeric("temperature"), Some(61.5));
        assert!(first.tags.get("operator").is_none());

        // Empty values are missing, not zero
        assert_eq!(parsed.events[1].numeric("temperature"), None);
    }

    #[test]
    fn test_missing_time_column() {
        let data = "equipment_id,temperature\nMOTOR_001,60.0\n";
        assert!(matches!(
            parse_csv(data.as_bytes(), &schema()),
            Err(IngestError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_load_csv_into_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sensor_data.csv");
        std::fs::write(
            &path,
            "time,equipment_id,temperature,vibration,status\n\
             2024-01-01 00:00:00,MOTOR_001,61.5,4.25,normal\n\
             2024-01-01 00:02:00,MOTOR_001,62.0,4.5,normal\n",
        )
        .unwrap();

        let table = Hypertable::open(dir.path().join("data"), schema()).unwrap();
        let report = load_csv(&table, &path).unwrap();
        assert_eq!(report.rows_read, 2);
        assert_eq!(report.batch.inserted, 2);
        assert_eq!(table.scan(&TimeRange::all(), &ScanFilter::new()).unwrap().len(), 2);
    }
}
