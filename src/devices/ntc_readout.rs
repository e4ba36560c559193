//! Arduino NTC thermistor readout.
//!
//! A `T` frame lists analog pins; the firmware answers one line per pin, in
//! order, with a temperature in °C or `999` for a pin it does not have.

use super::arduino;
use crate::command_proxy::CommandProxy;
use crate::command_router::{arg, opt_arg, CommandError};
use crate::device::{DataSource, DeviceError, ErrorTable, FrameIo, Instrument, Reading};
use crate::serial_transport::Frame;
use crate::telemetry::SampleKind;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NtcReadoutSettings {
    /// Channel name to analog pin.
    pub channels: BTreeMap<String, u8>,
    /// Calibrated range of the thermistors in °C.
    pub limits: (f64, f64),
    /// Readings averaged by the firmware per temperature.
    pub n_samples: Option<u32>,
    /// Milliseconds the firmware waits between two commands.
    pub delay: Option<u32>,
}

impl Default for NtcReadoutSettings {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            limits: (-55.0, 125.0),
            n_samples: None,
            delay: None,
        }
    }
}

pub struct NtcReadout<I: FrameIo = CommandProxy> {
    name: String,
    io: I,
    channels: BTreeMap<String, u8>,
    limits: (f64, f64),
}

impl<I: FrameIo> NtcReadout<I> {
    const TEMP: &'static str = "T";
    const DELAY: &'static str = "D";
    const SAMPLES: &'static str = "S";

    const INVALID_PIN: &'static str = "999";
    /// Queried to check the link; no board has this many pins.
    const CHECK_PIN: u8 = 100;

    const ERRORS: ErrorTable = ErrorTable::new(
        &[],
        &[(Self::INVALID_PIN, "Invalid NTC pin"), arduino::SERIAL_ERROR],
    );

    pub const VERBS: &'static [&'static str] =
        &["get_temp", "set_n_samples", "set_delay", "check_connection"];

    pub fn new(name: impl Into<String>, io: I, settings: &NtcReadoutSettings) -> Self {
        Self {
            name: name.into(),
            io,
            channels: settings.channels.clone(),
            limits: settings.limits,
        }
    }

    /// Verify the link and apply the optional firmware settings.
    pub fn init(&self, settings: &NtcReadoutSettings) -> Result<(), DeviceError> {
        self.check_connection()?;
        if let Some(n_samples) = settings.n_samples {
            self.set_n_samples(n_samples)?;
        }
        if let Some(delay) = settings.delay {
            self.set_delay(delay)?;
        }
        Ok(())
    }

    /// Read a pin that cannot exist; only a live firmware answers `999`.
    pub fn check_connection(&self) -> Result<(), DeviceError> {
        let reply = self.io.query(Frame::new(Self::TEMP).arg(Self::CHECK_PIN))?;
        if reply == Self::INVALID_PIN {
            log::debug!("{}: connection established", self.name);
            Ok(())
        } else {
            Err(DeviceError::unavailable(
                &self.name,
                format!("unexpected reply '{reply}' to connection check"),
            ))
        }
    }

    /// Temperatures of `pins` in °C. Pins the firmware rejects are logged
    /// and left out.
    pub fn temperatures(&self, pins: &[u8]) -> Result<BTreeMap<u8, f64>, DeviceError> {
        Ok(self
            .read_pins(pins)?
            .into_iter()
            .filter_map(|(pin, result)| result.ok().map(|temp| (pin, temp)))
            .collect())
    }

    fn read_pins(&self, pins: &[u8]) -> Result<Vec<(u8, Result<f64, DeviceError>)>, DeviceError> {
        if pins.is_empty() {
            return Ok(Vec::new());
        }
        let request = Frame::new(Self::TEMP).args(pins);
        let replies = self.io.exchange(request.clone(), pins.len())?;

        Ok(pins
            .iter()
            .zip(replies)
            .map(|(&pin, reply)| {
                let result = Self::ERRORS.parse::<f64>(&self.name, &request, &reply);
                if let Ok(temp) = result {
                    let (min, max) = self.limits;
                    if !(min..=max).contains(&temp) {
                        log::warn!(
                            "{}: NTC {pin} reads {temp} °C, outside calibration range [{min}, {max}] °C. \
                             Is the thermistor connected correctly?",
                            self.name
                        );
                    }
                }
                (pin, result)
            })
            .collect())
    }

    /// Number of readings the firmware averages per temperature.
    pub fn set_n_samples(&self, n_samples: u32) -> Result<(), DeviceError> {
        self.set_echoed(Self::SAMPLES, n_samples)
    }

    /// Delay between consecutive commands in milliseconds.
    pub fn set_delay(&self, delay: u32) -> Result<(), DeviceError> {
        self.set_echoed(Self::DELAY, delay)
    }

    fn set_echoed(&self, command: &str, value: u32) -> Result<(), DeviceError> {
        let request = Frame::new(command).arg(value);
        let reply = self.io.query(request.clone())?;
        let applied: u32 = Self::ERRORS.parse(&self.name, &request, &reply)?;
        if applied != value {
            return Err(DeviceError::rejected(
                &self.name,
                format!("'{request}' applied {applied} instead of {value}"),
            ));
        }
        log::debug!("{}: '{request}' applied", self.name);
        Ok(())
    }
}

impl<I: FrameIo> DataSource for NtcReadout<I> {
    fn source(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> Result<Reading, DeviceError> {
        let pins: Vec<u8> = self.channels.values().copied().collect();
        let results = self.read_pins(&pins)?;

        // Replies come back in request order, one per channel.
        let mut reading = Reading::new(SampleKind::Temp);
        let mut first_error = None;
        for (channel, (_, result)) in self.channels.keys().zip(results) {
            match result {
                Ok(temp) => reading = reading.with(channel.clone(), temp),
                Err(e) => {
                    log::error!("{}: {channel}: {e}", self.name);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if reading.data.is_empty() => Err(e),
            _ => Ok(reading),
        }
    }
}

impl<I: FrameIo + 'static> Instrument for NtcReadout<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        match verb {
            "get_temp" => {
                let pins: Vec<u8> = match opt_arg(payload, "pins")? {
                    Some(pins) => pins,
                    None => self.channels.values().copied().collect(),
                };
                Ok(json!(self.temperatures(&pins)?))
            }
            "set_n_samples" => {
                self.set_n_samples(arg(payload, "n_samples")?)?;
                Ok(Value::Null)
            }
            "set_delay" => {
                self.set_delay(arg(payload, "delay")?)?;
                Ok(Value::Null)
            }
            "check_connection" => {
                self.check_connection()?;
                Ok(json!(true))
            }
            _ => Err(CommandError::UnknownCommand {
                target: self.name.clone(),
                verb: verb.to_string(),
            }),
        }
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

    fn settings() -> NtcReadoutSettings {
        NtcReadoutSettings {
            channels: BTreeMap::from([("dut".to_string(), 0), ("box".to_string(), 3)]),
            ..NtcReadoutSettings::default()
        }
    }

    fn readout(replies: impl IntoIterator<Item = &'static str>) -> NtcReadout<ScriptedIo> {
        NtcReadout::new("ntc", ScriptedIo::new(replies), &settings())
    }

    #[test]
    fn test_connection_check_expects_invalid_pin() {
        let ntc = readout(["999", "21.0"]);
        ntc.check_connection().unwrap();
        let err = ntc.check_connection().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(ntc.io.sent()[0], Frame::new("T").arg(100));
    }

    #[test]
    fn test_acquire_reads_all_channels_in_one_exchange() {
        // Channels go out in name order: box on pin 3, then dut on pin 0.
        let ntc = readout(["24.5", "31.25"]);
        let reading = ntc.acquire().unwrap();
        assert_eq!(reading.kind, SampleKind::Temp);
        assert_eq!(reading.data.get("box"), Some(&24.5));
        assert_eq!(reading.data.get("dut"), Some(&31.25));
        assert_eq!(ntc.io.sent(), vec![Frame::new("T").args([3, 0])]);
    }

    #[test]
    fn test_channels_sharing_a_pin_each_get_their_reply() {
        let shared = NtcReadoutSettings {
            channels: BTreeMap::from([("inlet".to_string(), 2), ("outlet".to_string(), 2)]),
            ..NtcReadoutSettings::default()
        };
        let ntc = NtcReadout::new("ntc", ScriptedIo::new(["18.0", "18.5"]), &shared);
        let reading = ntc.acquire().unwrap();
        assert_eq!(reading.data.get("inlet"), Some(&18.0));
        assert_eq!(reading.data.get("outlet"), Some(&18.5));
        assert_eq!(ntc.io.sent(), vec![Frame::new("T").args([2, 2])]);
    }

    #[test]
    fn test_invalid_pin_is_skipped() {
        let ntc = readout(["24.5", "999"]);
        let reading = ntc.acquire().unwrap();
        assert_eq!(reading.data.len(), 1);

        let ntc = readout(["error", "999"]);
        let err = ntc.acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
    }

    #[test]
    fn test_out_of_calibration_is_still_reported() {
        let ntc = readout(["-80.0", "20"]);
        let temps = ntc.temperatures(&[0, 3]).unwrap();
        assert_eq!(temps.get(&0), Some(&-80.0));
    }

    #[test]
    fn test_settings_are_checked_against_echo() {
        let ntc = readout(["16", "5", "error"]);
        ntc.set_n_samples(16).unwrap();
        assert_eq!(ntc.set_delay(10).unwrap_err().kind(), ErrorKind::CommandRejected);
        assert_eq!(ntc.set_delay(10).unwrap_err().kind(), ErrorKind::CommandRejected);
    }

    #[test]
    fn test_timeout_surfaces_from_acquire() {
        let ntc = readout(["24.5"]);
        let err = ntc.acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportTimeout);
    }

    #[test]
    fn test_get_temp_verb() {
        let ntc = readout(["22.0"]);
        let reply = ntc.execute("get_temp", &json!({"pins": [5]})).unwrap();
        assert_eq!(reply, json!({"5": 22.0}));
    }
}
