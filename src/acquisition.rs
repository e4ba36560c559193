//! Periodic readout of one data source into the telemetry stream.

use crate::device::DataSource;
use crate::telemetry::{TelemetrySample, TelemetrySender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the loop sleeps before looking at the stop signal again.
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub samples: u64,
    pub failures: u64,
}

/// Reads a [`DataSource`] every `interval` until the shared `running` flag
/// is cleared. A failed read is logged and skipped.
pub struct AcquisitionLoop {
    source: String,
    handle: Option<JoinHandle<AcquisitionStats>>,
}

impl AcquisitionLoop {
    pub fn spawn(
        source: Arc<dyn DataSource>,
        interval: Duration,
        telemetry: TelemetrySender,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let name = source.source().to_string();
        let handle = thread::Builder::new()
            .name(format!("{name}-daq"))
            .spawn(move || run(source.as_ref(), interval, &telemetry, &running))?;
        log::info!("{name}: acquisition every {interval:?}");
        Ok(Self {
            source: name,
            handle: Some(handle),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the loop to exit; the stop signal must already be set.
    pub fn join(mut self) -> AcquisitionStats {
        self.join_inner()
    }

    fn join_inner(&mut self) -> AcquisitionStats {
        let Some(handle) = self.handle.take() else {
            return AcquisitionStats::default();
        };
        handle.join().unwrap_or_else(|_| {
            log::error!("{}: acquisition thread panicked", self.source);
            AcquisitionStats::default()
        })
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::warn!("{}: acquisition loop dropped without join", self.source);
        }
    }
}

fn run(
    source: &dyn DataSource,
    interval: Duration,
    telemetry: &TelemetrySender,
    running: &AtomicBool,
) -> AcquisitionStats {
    let mut stats = AcquisitionStats::default();

    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        {
            #[cfg(feature = "cpu-profiling")]
            let _span = tracy_client::span!("acquisition iteration");

            match source.acquire() {
                Ok(reading) => {
                    let sample = TelemetrySample::from_reading(source.source(), reading);
                    if telemetry.send(sample).is_err() {
                        log::warn!("{}: telemetry channel closed, stopping", source.source());
                        break;
                    }
                    stats.samples += 1;
                }
                Err(e) => {
                    stats.failures += 1;
                    log::warn!("{}: read failed, skipping: {e}", source.source());
                }
            }
        }

        while running.load(Ordering::Acquire) {
            let elapsed = started.elapsed();
            if elapsed >= interval {
                break;
            }
            thread::sleep((interval - elapsed).min(STOP_POLL));
        }
    }

    log::debug!(
        "{}: acquisition stopped after {} samples, {} failed reads",
        source.source(),
        stats.samples,
        stats.failures
    );
    stats
}
