//! iseg high-voltage supply biasing the radiation monitor.
//!
//! The supply echoes every command before answering and only applies a new
//! set point once it is confirmed with `G1`.

use crate::command_proxy::CommandProxy;
use crate::command_router::{arg, CommandError};
use crate::device::{check_range, set_and_confirm, DeviceError, ErrorTable, FrameIo, Instrument};
use crate::serial_transport::{Frame, FramingConfig};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IsegHvSettings {
    /// Highest voltage a set command may request, in V.
    pub max_voltage: f64,
    /// Operating voltage applied by `hv_on`.
    pub high_voltage: Option<f64>,
}

impl Default for IsegHvSettings {
    fn default() -> Self {
        Self {
            max_voltage: IsegHv::<CommandProxy>::V_MAX,
            high_voltage: None,
        }
    }
}

pub struct IsegHv<I: FrameIo = CommandProxy> {
    name: String,
    io: I,
    max_voltage: f64,
    high_voltage: Option<f64>,
}

impl<I: FrameIo> IsegHv<I> {
    pub const BAUD_RATE: u32 = 9600;
    /// Rating of the supply in V.
    pub const V_MAX: f64 = 600.0;

    const GET_VOLTAGE: &'static str = "U1";
    const DELAY: &'static str = "W";
    const CONFIRM: &'static str = "G1";
    const STATUS_PREFIX: &'static str = "S1=";

    const ERRORS: ErrorTable = ErrorTable::new(&[], &[("????", "Command rejected")]);

    pub const VERBS: &'static [&'static str] = &[
        "set_voltage",
        "get_voltage",
        "set_delay",
        "get_delay",
        "hv_on",
        "hv_off",
    ];

    /// Commands are sent verbatim, so there is no field delimiter.
    pub fn framing() -> FramingConfig {
        FramingConfig::new("", "\r\n").with_echo(true)
    }

    /// `max_voltage` is capped at the supply's rating.
    pub fn new(name: impl Into<String>, io: I, settings: &IsegHvSettings) -> Self {
        Self {
            name: name.into(),
            io,
            max_voltage: settings.max_voltage.min(Self::V_MAX),
            high_voltage: settings.high_voltage,
        }
    }

    pub fn init(&self) -> Result<(), DeviceError> {
        let voltage = self.voltage()?;
        log::info!("{}: output at {voltage} V", self.name);
        Ok(())
    }

    pub fn voltage(&self) -> Result<f64, DeviceError> {
        self.query(Frame::new(Self::GET_VOLTAGE))
    }

    pub fn set_voltage(&self, voltage: f64) -> Result<(), DeviceError> {
        check_range(&self.name, "voltage", voltage, 0.0, self.max_voltage)?;
        self.set(Frame::new(format!("D1={voltage}")))?;
        log::info!("{}: voltage set to {voltage} V", self.name);
        Ok(())
    }

    /// Ramp delay in s/V.
    pub fn delay(&self) -> Result<f64, DeviceError> {
        self.query(Frame::new(Self::DELAY))
    }

    pub fn set_delay(&self, delay: u32) -> Result<(), DeviceError> {
        self.set(Frame::new(format!("{}={delay}", Self::DELAY)))
    }

    pub fn hv_on(&self) -> Result<(), DeviceError> {
        let voltage = self.high_voltage.ok_or_else(|| {
            DeviceError::rejected(&self.name, "no operating voltage configured")
        })?;
        self.set_voltage(voltage)
    }

    pub fn hv_off(&self) -> Result<(), DeviceError> {
        self.set_voltage(0.0)
    }

    fn set(&self, frame: Frame) -> Result<(), DeviceError> {
        set_and_confirm(
            &self.io,
            &Self::ERRORS,
            &self.name,
            frame,
            Frame::new(Self::CONFIRM),
            |status| status.starts_with(Self::STATUS_PREFIX),
        )?;
        Ok(())
    }

    fn query(&self, request: Frame) -> Result<f64, DeviceError> {
        let reply = self.io.query(request.clone())?;
        Self::ERRORS.parse(&self.name, &request, &reply)
    }
}

impl<I: FrameIo + 'static> Instrument for IsegHv<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        match verb {
            "set_voltage" => self.set_voltage(arg(payload, "voltage")?)?,
            "get_voltage" => return Ok(json!(self.voltage()?)),
            "set_delay" => self.set_delay(arg(payload, "delay")?)?,
            "get_delay" => return Ok(json!(self.delay()?)),
            "hv_on" => self.hv_on()?,
            "hv_off" => self.hv_off()?,
            _ => {
                return Err(CommandError::UnknownCommand {
                    target: self.name.clone(),
                    verb: verb.to_string(),
                })
            }
        }
        Ok(Value::Null)
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
    use crate::serial_transport::FramedTransport;
    use crate::sim_link::SimLink;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn supply(replies: impl IntoIterator<Item = &'static str>) -> IsegHv<ScriptedIo> {
        let settings = IsegHvSettings {
            high_voltage: Some(500.0),
            ..IsegHvSettings::default()
        };
        IsegHv::new("hv", ScriptedIo::new(replies), &settings)
    }

    #[test]
    fn test_voltage_above_limit_sends_nothing() {
        let hv = supply([]);
        let err = hv.set_voltage(600.5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert!(hv.set_voltage(-1.0).is_err());
        assert!(hv.io.sent().is_empty());
    }

    #[test]
    fn test_configured_limit_cannot_exceed_rating() {
        let settings = IsegHvSettings {
            max_voltage: 1000.0,
            high_voltage: None,
        };
        let hv = IsegHv::new("hv", ScriptedIo::new([]), &settings);
        assert_eq!(hv.set_voltage(700.0).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(hv.hv_on().unwrap_err().kind(), ErrorKind::CommandRejected);
    }

    #[test]
    fn test_set_is_confirmed() {
        let hv = supply(["", "S1=ON", "", "????"]);
        hv.hv_on().unwrap();
        assert_eq!(
            hv.io.sent(),
            vec![Frame::new("D1=500"), Frame::new("G1")]
        );

        let err = hv.hv_off().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
    }

    #[test]
    fn test_rejected_set_skips_confirmation() {
        let hv = supply(["????"]);
        assert_eq!(hv.set_delay(3).unwrap_err().kind(), ErrorKind::CommandRejected);
        assert_eq!(hv.io.sent(), vec![Frame::new("W=3")]);
    }

    #[test]
    fn test_echo_and_crlf_over_the_wire() {
        let framing = IsegHv::<CommandProxy>::framing();
        let voltage = Arc::new(Mutex::new(0.0_f64));
        let pending = Arc::new(Mutex::new(None::<f64>));
        let (link, handle) = SimLink::with_responder(&framing, {
            let voltage = voltage.clone();
            move |line| {
                let reply = if let Some(value) = line.strip_prefix("D1=") {
                    *pending.lock().unwrap() = value.parse().ok();
                    String::new()
                } else if line == "G1" {
                    match pending.lock().unwrap().take() {
                        Some(value) => {
                            *voltage.lock().unwrap() = value;
                            "S1=ON".to_string()
                        }
                        None => "????".to_string(),
                    }
                } else if line == "U1" {
                    format!("{:+}", *voltage.lock().unwrap())
                } else {
                    "????".to_string()
                };
                vec![line.to_string(), reply]
            }
        });
        let transport = FramedTransport::new(Box::new(link), framing, Duration::from_millis(200));
        let proxy = CommandProxy::spawn("hv", transport, None).unwrap();
        let hv = IsegHv::new("hv", proxy, &IsegHvSettings::default());

        hv.set_voltage(250.0).unwrap();
        assert_eq!(hv.voltage().unwrap(), 250.0);
        assert_eq!(*voltage.lock().unwrap(), 250.0);
        assert_eq!(hv.execute("set_delay", &json!(2)).unwrap_err().kind(), ErrorKind::CommandRejected);
        hv.shutdown();

        assert_eq!(handle.frames(), vec!["D1=250", "G1", "U1", "W=2"]);
        assert!(handle.written().ends_with(b"W=2\r\n"));
    }
}
