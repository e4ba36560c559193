//! Arduino frequency counter reading out a radiation monitor.
//!
//! The monitor converts its signal into pulses whose frequency is
//! proportional to the dose rate.

use super::arduino;
use crate::command_proxy::CommandProxy;
use crate::command_router::{arg, CommandError};
use crate::device::{write_and_confirm, DataSource, DeviceError, ErrorTable, FrameIo, Instrument, Reading};
use crate::serial_transport::Frame;
use crate::telemetry::SampleKind;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FreqCounterSettings {
    /// Counting window in milliseconds, programmed at start-up if set.
    pub gate_interval: Option<u32>,
    /// Dose rate per Hz of counted frequency.
    pub calibration: f64,
}

impl Default for FreqCounterSettings {
    fn default() -> Self {
        Self {
            gate_interval: None,
            calibration: 1.0,
        }
    }
}

pub struct FreqCounter<I: FrameIo = CommandProxy> {
    name: String,
    io: I,
    calibration: f64,
    link_timeout: Mutex<Duration>,
}

impl<I: FrameIo> FreqCounter<I> {
    const GATE_INTERVAL: &'static str = "G";
    const COUNTS: &'static str = "C";
    const FREQUENCY: &'static str = "F";
    const RESTART: &'static str = "R";

    const ERRORS: ErrorTable = ErrorTable::new(&[], &[arduino::SERIAL_ERROR]);

    pub const VERBS: &'static [&'static str] = &[
        "get_gate_interval",
        "set_gate_interval",
        "get_counts",
        "get_frequency",
        "get_dose_rate",
        "restart",
    ];

    /// `link_timeout` is the read timeout the link was opened with.
    pub fn new(
        name: impl Into<String>,
        io: I,
        settings: &FreqCounterSettings,
        link_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            io,
            calibration: settings.calibration,
            link_timeout: Mutex::new(link_timeout),
        }
    }

    pub fn init(&self, settings: &FreqCounterSettings) -> Result<(), DeviceError> {
        match settings.gate_interval {
            Some(gate_interval) => self.set_gate_interval(gate_interval),
            None => {
                let gate_interval = self.gate_interval()?;
                log::info!("{}: gate interval {gate_interval} ms", self.name);
                Ok(())
            }
        }
    }

    pub fn gate_interval(&self) -> Result<u32, DeviceError> {
        self.query(Self::GATE_INTERVAL)
    }

    /// Counting window in milliseconds. Replies only come once per window,
    /// so the link timeout is raised to 1.5 windows if it is shorter.
    pub fn set_gate_interval(&self, gate_interval: u32) -> Result<(), DeviceError> {
        let gate = Duration::from_millis(u64::from(gate_interval));
        {
            let mut timeout = self.link_timeout.lock().unwrap_or_else(PoisonError::into_inner);
            if *timeout <= gate {
                let raised = gate.mul_f64(1.5);
                self.io.set_timeout(raised)?;
                log::info!("{}: link timeout raised to {raised:?}", self.name);
                *timeout = raised;
            }
        }

        write_and_confirm(
            &self.io,
            &Self::ERRORS,
            &self.name,
            Frame::new(Self::GATE_INTERVAL.to_lowercase()).arg(gate_interval),
            Frame::new(Self::GATE_INTERVAL),
            |reply| reply.trim().parse::<u32>().is_ok_and(|value| value == gate_interval),
        )?;
        Ok(())
    }

    /// Pulses counted in the last gate interval.
    pub fn counts(&self) -> Result<u64, DeviceError> {
        self.query(Self::COUNTS)
    }

    /// Pulse frequency in Hz over the last gate interval.
    pub fn frequency(&self) -> Result<f64, DeviceError> {
        self.query(Self::FREQUENCY)
    }

    pub fn dose_rate(&self) -> Result<f64, DeviceError> {
        Ok(self.frequency()? * self.calibration)
    }

    /// Restart counting with a fresh gate interval.
    pub fn restart(&self) -> Result<(), DeviceError> {
        self.io.write(Frame::new(Self::RESTART))
    }

    fn query<T: std::str::FromStr>(&self, command: &str) -> Result<T, DeviceError> {
        let request = Frame::new(command);
        let reply = self.io.query(request.clone())?;
        Self::ERRORS.parse(&self.name, &request, &reply)
    }
}

impl<I: FrameIo> DataSource for FreqCounter<I> {
    fn source(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> Result<Reading, DeviceError> {
        let frequency = self.frequency()?;
        Ok(Reading::new(SampleKind::RadMonitor)
            .with("frequency", frequency)
            .with("dose_rate", frequency * self.calibration))
    }
}

impl<I: FrameIo + 'static> Instrument for FreqCounter<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        let value = match verb {
            "get_gate_interval" => json!(self.gate_interval()?),
            "set_gate_interval" => {
                self.set_gate_interval(arg(payload, "gate_interval")?)?;
                Value::Null
            }
            "get_counts" => json!(self.counts()?),
            "get_frequency" => json!(self.frequency()?),
            "get_dose_rate" => json!(self.dose_rate()?),
            "restart" => {
                self.restart()?;
                Value::Null
            }
            _ => {
                return Err(CommandError::UnknownCommand {
                    target: self.name.clone(),
                    verb: verb.to_string(),
                })
            }
        };
        Ok(value)
    }

    fn data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }

    fn shutdown(&self) {
        self.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::ScriptedIo;
    use crate::device::ErrorKind;

    fn counter(replies: impl IntoIterator<Item = &'static str>) -> FreqCounter<ScriptedIo> {
        let settings = FreqCounterSettings {
            calibration: 0.5,
            ..FreqCounterSettings::default()
        };
        FreqCounter::new("rad", ScriptedIo::new(replies), &settings, Duration::from_secs(1))
    }

    #[test]
    fn test_acquire_reports_dose_rate() {
        let rad = counter(["1200"]);
        let reading = rad.acquire().unwrap();
        assert_eq!(reading.kind, SampleKind::RadMonitor);
        assert_eq!(reading.data.get("frequency"), Some(&1200.0));
        assert_eq!(reading.data.get("dose_rate"), Some(&600.0));
    }

    #[test]
    fn test_long_gate_raises_link_timeout() {
        let rad = counter(["500", "2000"]);
        rad.set_gate_interval(500).unwrap();
        assert_eq!(*rad.io.timeout.lock().unwrap(), None);

        rad.set_gate_interval(2000).unwrap();
        assert_eq!(*rad.io.timeout.lock().unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(
            rad.io.sent(),
            vec![
                Frame::new("g").arg(500),
                Frame::new("G"),
                Frame::new("g").arg(2000),
                Frame::new("G"),
            ]
        );
    }

    #[test]
    fn test_unconfirmed_gate_is_rejected() {
        let rad = counter(["100"]);
        let err = rad.set_gate_interval(200).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
    }

    #[test]
    fn test_garbage_reply_is_protocol_error() {
        let rad = counter(["12abc", "error"]);
        assert_eq!(rad.counts().unwrap_err().kind(), ErrorKind::ProtocolError);
        assert_eq!(rad.frequency().unwrap_err().kind(), ErrorKind::CommandRejected);
    }
}
