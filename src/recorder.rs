//! In-memory record of a session's telemetry, exported as one table per
//! sample kind.

use crate::telemetry::{SampleKind, TelemetrySample};
use polars::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const TIMESTAMP_COLUMN_NAME: &str = "timestamp";
const SOURCE_COLUMN_NAME: &str = "source";
const EVENT_COLUMN_NAME: &str = "event";

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("DataFrame error: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    samples: BTreeMap<SampleKind, Vec<TelemetrySample>>,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: TelemetrySample) {
        self.samples.entry(sample.kind).or_default().push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kinds(&self) -> impl Iterator<Item = SampleKind> + '_ {
        self.samples.keys().copied()
    }

    /// Samples of `kind` as rows: timestamp, source, the scan event for
    /// scan samples, then one column per data channel seen. Channels a
    /// sample does not carry are null.
    pub fn to_dataframe(&self, kind: SampleKind) -> Result<DataFrame, PolarsError> {
        let samples = self.samples.get(&kind).map_or(&[][..], Vec::as_slice);

        let timestamps: Vec<f64> = samples.iter().map(|s| s.timestamp).collect();
        let sources: Vec<&str> = samples.iter().map(|s| s.source.as_str()).collect();
        let mut columns: Vec<Column> = vec![
            Series::new(TIMESTAMP_COLUMN_NAME.into(), timestamps).into(),
            Series::new(SOURCE_COLUMN_NAME.into(), sources).into(),
        ];

        if kind == SampleKind::Scan {
            let events: Vec<Option<&str>> = samples
                .iter()
                .map(|s| s.event.map(|event| event.as_str()))
                .collect();
            columns.push(Series::new(EVENT_COLUMN_NAME.into(), events).into());
        }

        let channels: BTreeSet<&str> = samples
            .iter()
            .flat_map(|s| s.data.keys().map(String::as_str))
            .collect();
        for channel in channels {
            let values: Vec<Option<f64>> = samples
                .iter()
                .map(|s| s.data.get(channel).copied())
                .collect();
            columns.push(Series::new(channel.into(), values).into());
        }

        DataFrame::new(columns)
    }

    pub fn write_csv<W: Write>(&self, kind: SampleKind, writer: &mut W) -> Result<(), RecorderError> {
        let mut df = self.to_dataframe(kind)?;
        CsvWriter::new(writer).include_header(true).finish(&mut df)?;
        Ok(())
    }

    /// Write `<prefix>_<kind>.csv` into `dir` for every kind recorded.
    pub fn write_csv_files(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, RecorderError> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for kind in self.kinds() {
            let path = dir.join(format!("{prefix}_{kind}.csv"));
            let mut file = File::create(&path)?;
            self.write_csv(kind, &mut file)?;
            log::info!("Wrote {} {kind} samples to {}", self.samples[&kind].len(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

impl Extend<TelemetrySample> for TelemetryRecorder {
    fn extend<T: IntoIterator<Item = TelemetrySample>>(&mut self, iter: T) {
        for sample in iter {
            self.record(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Reading;
    use crate::telemetry::ScanEvent;

    fn recorder() -> TelemetryRecorder {
        let mut recorder = TelemetryRecorder::new();
        recorder.extend([
            TelemetrySample::from_reading("ntc", Reading::new(SampleKind::Temp).with("dut", 21.0)),
            TelemetrySample::from_reading(
                "ntc",
                Reading::new(SampleKind::Temp).with("dut", 21.5).with("box", 30.0),
            ),
            TelemetrySample::scan(
                "scan",
                ScanEvent::RowStart,
                BTreeMap::from([("row".to_string(), 0.0)]),
            ),
        ]);
        recorder
    }

    #[test]
    fn test_one_table_per_kind() {
        let recorder = recorder();
        assert_eq!(recorder.len(), 3);
        assert_eq!(
            recorder.kinds().collect::<Vec<_>>(),
            vec![SampleKind::Temp, SampleKind::Scan]
        );

        let temp = recorder.to_dataframe(SampleKind::Temp).unwrap();
        assert_eq!(temp.height(), 2);
        assert_eq!(
            temp.get_column_names_str(),
            vec!["timestamp", "source", "box", "dut"]
        );
        assert_eq!(temp.column("box").unwrap().null_count(), 1);

        let scan = recorder.to_dataframe(SampleKind::Scan).unwrap();
        assert_eq!(scan.column("event").unwrap().str().unwrap().get(0), Some("row_start"));

        let empty = recorder.to_dataframe(SampleKind::RadMonitor).unwrap();
        assert_eq!(empty.height(), 0);
    }

    #[test]
    fn test_csv_export() {
        let recorder = recorder();
        let mut csv = Vec::new();
        recorder.write_csv(SampleKind::Temp, &mut csv).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("timestamp,source,box,dut"));
        assert_eq!(csv.lines().count(), 3);
    }

    #[test]
    fn test_csv_files() {
        let dir = std::env::temp_dir().join(format!("irrad-recorder-{}", std::process::id()));
        let written = recorder().write_csv_files(&dir, "run").unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|path| path.exists()));
        assert!(written[0].ends_with("run_temp.csv"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
