//! Where the PV simulator writes its combined power records.
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, info};

pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";
pub const HEADER: [&str; 4] = ["timestamp", "meter_kw", "pv_kw", "sum_kw"];

/// Meter consumption and PV production at one point in time, in kilowatts.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub timestamp: DateTime<Local>,
    pub meter_kw: f64,
    pub pv_kw: f64,
}

impl ResultRecord {
    /// Meter power is truncated to whole watts before conversion, PV power is converted as is.
    pub fn from_watts(timestamp: DateTime<Local>, meter_power: f64, pv_power: f64) -> Self {
        Self {
            timestamp,
            meter_kw: meter_power.trunc() / 1000.0,
            pv_kw: pv_power / 1000.0,
        }
    }

    pub fn sum_kw(&self) -> f64 {
        self.meter_kw + self.pv_kw
    }

    pub fn to_row(&self) -> [String; 4] {
        [
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            format!("{:.2}", self.meter_kw),
            format!("{:.2}", self.pv_kw),
            format!("{:.2}", self.sum_kw()),
        ]
    }
}

pub trait ResultSink: Send {
    fn write(&mut self, record: &ResultRecord) -> Result<()>;
}

/// Appends records to a CSV file, one line per record, flushed as it goes.
pub struct CsvFileSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvFileSink {
    /// Opens `path` for appending, creating it and its parent directories when missing. A new or
    /// empty file gets the header line first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open results file {}", path.display()))?;
        let is_empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if is_empty {
            writer.write_record(HEADER)?;
            writer.flush()?;
            debug!(path = %path.display(), "wrote results header");
        }

        info!(path = %path.display(), "appending results");
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvFileSink {
    fn write(&mut self, record: &ResultRecord) -> Result<()> {
        self.writer.write_record(record.to_row())?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<ResultRecord>,
}

impl ResultSink for MemorySink {
    fn write(&mut self, record: &ResultRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2023, 6, 21, 12, 0, 5).unwrap()
    }

    #[test]
    fn converts_watts_and_formats_two_decimals() {
        let record = ResultRecord::from_watts(noon(), 1234.9, 3250.0);
        assert_eq!(record.meter_kw, 1.234);
        assert_eq!(record.pv_kw, 3.25);
        assert_eq!(
            record.to_row(),
            [
                "21.06.2023 12:00:05".to_string(),
                "1.23".to_string(),
                "3.25".to_string(),
                "4.48".to_string(),
            ]
        );
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.csv");

        let mut sink = CsvFileSink::open(&path).unwrap();
        assert_eq!(sink.path(), path);
        sink.write(&ResultRecord::from_watts(noon(), 100.0, 0.0))
            .unwrap();
        drop(sink);

        let mut sink = CsvFileSink::open(&path).unwrap();
        sink.write(&ResultRecord::from_watts(noon(), 9000.0, 250.0))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "timestamp,meter_kw,pv_kw,sum_kw\n\
             21.06.2023 12:00:05,0.10,0.00,0.10\n\
             21.06.2023 12:00:05,9.00,0.25,9.25\n"
        );
    }
}
