//! Samples flowing from acquisition loops and the scan controller to the
//! outside world.
//!
//! Producers share one channel. Samples from different sources interleave in
//! arrival order; use [`TelemetrySample::timestamp`] for temporal ordering.

use crate::device::Reading;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type TelemetrySender = Sender<TelemetrySample>;
pub type TelemetryReceiver = Receiver<TelemetrySample>;

pub fn channel() -> (TelemetrySender, TelemetryReceiver) {
    crossbeam_channel::unbounded()
}

/// Seconds since the Unix epoch.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Raw,
    Temp,
    RadMonitor,
    Scan,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Temp => "temp",
            Self::RadMonitor => "rad_monitor",
            Self::Scan => "scan",
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `scan` sample reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanEvent {
    #[serde(rename = "scan_init")]
    Init,
    RowStart,
    RowStop,
    RowAbort,
    Paused,
    Resumed,
    #[serde(rename = "scan_finished")]
    Finished,
    #[serde(rename = "scan_stopped")]
    Stopped,
}

impl ScanEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "scan_init",
            Self::RowStart => "row_start",
            Self::RowStop => "row_stop",
            Self::RowAbort => "row_abort",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Finished => "scan_finished",
            Self::Stopped => "scan_stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub timestamp: f64,
    pub source: String,
    pub kind: SampleKind,
    pub data: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<ScanEvent>,
}

impl TelemetrySample {
    /// Timestamp a reading taken from `source` now.
    pub fn from_reading(source: impl Into<String>, reading: Reading) -> Self {
        Self {
            timestamp: timestamp(),
            source: source.into(),
            kind: reading.kind,
            data: reading.data,
            event: None,
        }
    }

    pub fn scan(source: impl Into<String>, event: ScanEvent, data: BTreeMap<String, f64>) -> Self {
        Self {
            timestamp: timestamp(),
            source: source.into(),
            kind: SampleKind::Scan,
            data,
            event: Some(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_json_shape() {
        let reading = Reading::new(SampleKind::Temp).with("dut", 21.5);
        let sample = TelemetrySample::from_reading("ntc", reading);
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["kind"], "temp");
        assert_eq!(json["source"], "ntc");
        assert_eq!(json["data"]["dut"], 21.5);
        assert!(json.get("event").is_none());

        let scan = TelemetrySample::scan("stage", ScanEvent::RowStart, BTreeMap::new());
        let json = serde_json::to_value(&scan).unwrap();
        assert_eq!(json["kind"], "scan");
        assert_eq!(json["event"], "row_start");
    }

    #[test]
    fn test_timestamps_are_wall_clock_seconds() {
        let t = timestamp();
        assert!(t > 1.6e9);
        assert!(timestamp() >= t);
    }
}
