//! Measurement table written once at shutdown.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::gauge::SensorStatus;

const HEADER: [&str; 4] = [
    "absolute_timestamp",
    "minutes_since_start",
    "pressure",
    "status",
];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write record: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRow {
    pub absolute_timestamp: DateTime<Utc>,
    pub minutes_since_start: f64,
    pub pressure: f64,
    pub status: SensorStatus,
}

/// `2025_01_15-09_30_00_<identity>.csv`
pub fn record_file_name(started: DateTime<Local>, identity: &str) -> String {
    format!("{}_{}.csv", started.format("%Y_%m_%d-%H_%M_%S"), identity)
}

/// CSV with a header row, even when there are no rows.
pub fn write_csv<W: Write>(writer: W, rows: &[MeasurementRow]) -> Result<(), RecordError> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record(HEADER)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn save(
    dir: &Path,
    started: DateTime<Local>,
    identity: &str,
    rows: &[MeasurementRow],
) -> Result<PathBuf, RecordError> {
    let path = dir.join(record_file_name(started, identity));
    let file = File::create(&path).map_err(|source| RecordError::Create {
        path: path.clone(),
        source,
    })?;
    write_csv(file, rows)?;
    Ok(path)
}
