//! Arduino GPIO switch with a dead man's switch.
//!
//! Unless the firmware is pinged within its ping timeout it drives every pin
//! back to its default state. Pinging is left to the
//! [`CommandProxy`] keep-alive built from [`GpioSwitch::keep_alive`].
//!
//! Lowercase command letters set, uppercase ones query.

use super::arduino;
use crate::command_proxy::{CommandProxy, KeepAlive};
use crate::command_router::{arg, CommandError};
use crate::device::{protocol_error, write_and_confirm, DeviceError, ErrorTable, FrameIo, Instrument};
use crate::serial_transport::Frame;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Pin number to level (`true` = high).
pub type PinState = BTreeMap<u8, bool>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GpioSwitchSettings {
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Seconds without a ping before the firmware resets the pins.
    pub ping_timeout: u32,
    pub default_state: Option<PinState>,
}

impl Default for GpioSwitchSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: 5,
            default_state: None,
        }
    }
}

pub struct GpioSwitch<I: FrameIo = CommandProxy> {
    name: String,
    io: I,
}

impl<I: FrameIo> GpioSwitch<I> {
    const PING: &'static str = "P";
    const PING_TIMEOUT: &'static str = "T";
    const GPIO: &'static str = "G";
    const RESET: &'static str = "R";
    const STATE: &'static str = "I";
    const DEFAULT: &'static str = "X";

    const ERRORS: ErrorTable = ErrorTable::new(&[], &[arduino::SERIAL_ERROR]);

    pub const VERBS: &'static [&'static str] = &[
        "set_pin",
        "unset_pin",
        "is_set",
        "get_state",
        "set_state",
        "get_default",
        "set_default",
        "reset",
        "get_ping_timeout",
        "set_ping_timeout",
    ];

    pub fn keep_alive(interval: Duration) -> KeepAlive {
        KeepAlive::new(Frame::new(Self::PING), interval)
    }

    pub fn new(name: impl Into<String>, io: I) -> Self {
        Self {
            name: name.into(),
            io,
        }
    }

    /// Program the ping timeout and, if given, the default pin state.
    pub fn init(&self, settings: &GpioSwitchSettings) -> Result<(), DeviceError> {
        self.set_ping_timeout(settings.ping_timeout)?;
        if let Some(state) = &settings.default_state {
            self.set_default_state(state)?;
        }
        log::info!(
            "{}: ping timeout {} s, pinging every {:?}",
            self.name,
            settings.ping_timeout,
            settings.ping_interval
        );
        Ok(())
    }

    pub fn is_pin_set(&self, pin: u8) -> Result<bool, DeviceError> {
        let request = Frame::new(Self::GPIO).arg(pin);
        let reply = self.io.query(request.clone())?;
        match Self::ERRORS.parse::<u8>(&self.name, &request, &reply)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(protocol_error(&self.name, &request, &reply)),
        }
    }

    pub fn set_pin(&self, pin: u8) -> Result<(), DeviceError> {
        self.write_pin(pin, true)
    }

    pub fn unset_pin(&self, pin: u8) -> Result<(), DeviceError> {
        self.write_pin(pin, false)
    }

    fn write_pin(&self, pin: u8, high: bool) -> Result<(), DeviceError> {
        log::debug!("{}: pin {pin} {}", self.name, if high { "high" } else { "low" });
        self.io
            .write(Frame::new(Self::GPIO.to_lowercase()).arg(pin).arg(u8::from(high)))
    }

    pub fn gpio_state(&self) -> Result<PinState, DeviceError> {
        self.query_state(Self::STATE)
    }

    pub fn set_gpio_state(&self, state: &PinState) -> Result<(), DeviceError> {
        self.io
            .write(Frame::new(Self::STATE.to_lowercase()).arg(encode_state(state)))
    }

    pub fn default_state(&self) -> Result<PinState, DeviceError> {
        self.query_state(Self::DEFAULT)
    }

    pub fn set_default_state(&self, state: &PinState) -> Result<(), DeviceError> {
        self.io
            .write(Frame::new(Self::DEFAULT.to_lowercase()).arg(encode_state(state)))
    }

    /// Drive all pins to their default state.
    pub fn reset(&self) -> Result<(), DeviceError> {
        log::info!("{}: resetting pins to default state", self.name);
        self.io.write(Frame::new(Self::RESET))
    }

    pub fn ping_timeout(&self) -> Result<u32, DeviceError> {
        let request = Frame::new(Self::PING_TIMEOUT);
        let reply = self.io.query(request.clone())?;
        Self::ERRORS.parse(&self.name, &request, &reply)
    }

    pub fn set_ping_timeout(&self, seconds: u32) -> Result<(), DeviceError> {
        write_and_confirm(
            &self.io,
            &Self::ERRORS,
            &self.name,
            Frame::new(Self::PING_TIMEOUT.to_lowercase()).arg(seconds),
            Frame::new(Self::PING_TIMEOUT),
            |reply| reply.trim().parse::<u32>().is_ok_and(|value| value == seconds),
        )?;
        Ok(())
    }

    fn query_state(&self, command: &str) -> Result<PinState, DeviceError> {
        let request = Frame::new(command);
        let reply = self.io.query(request.clone())?;
        let reply = Self::ERRORS.check(&self.name, &request, &reply)?;
        decode_state(reply).ok_or_else(|| protocol_error(&self.name, &request, reply))
    }
}

/// `{0: high, 3: low}` is sent as `0-1;3-0`.
fn encode_state(state: &PinState) -> String {
    state
        .iter()
        .map(|(pin, high)| format!("{pin}-{}", u8::from(*high)))
        .collect::<Vec<_>>()
        .join(";")
}

fn decode_state(reply: &str) -> Option<PinState> {
    reply
        .split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (pin, level) = pair.split_once('-')?;
            let high = match level.trim() {
                "0" => false,
                "1" => true,
                _ => return None,
            };
            Some((pin.trim().parse().ok()?, high))
        })
        .collect()
}

impl<I: FrameIo + 'static> Instrument for GpioSwitch<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        match verb {
            "set_pin" => self.set_pin(arg(payload, "pin")?)?,
            "unset_pin" => self.unset_pin(arg(payload, "pin")?)?,
            "is_set" => return Ok(json!(self.is_pin_set(arg(payload, "pin")?)?)),
            "get_state" => return Ok(json!(self.gpio_state()?)),
            "set_state" => self.set_gpio_state(&arg(payload, "state")?)?,
            "get_default" => return Ok(json!(self.default_state()?)),
            "set_default" => self.set_default_state(&arg(payload, "state")?)?,
            "reset" => self.reset()?,
            "get_ping_timeout" => return Ok(json!(self.ping_timeout()?)),
            "set_ping_timeout" => self.set_ping_timeout(arg(payload, "timeout")?)?,
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
