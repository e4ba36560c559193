//! Building blocks shared by every instrument driver.
//!
//! Drivers talk to their hardware through the [`FrameIo`] capability set and
//! validate each reply against an [`ErrorTable`] before treating it as data.
//! The orchestrator sees them only through [`Instrument`], optionally
//! narrowed to a [`DataSource`] (polled by an acquisition loop) or a
//! [`RasterStage`] (driven by the scan controller).

use crate::command_router::CommandError;
use crate::scan_controller::RasterStage;
use crate::serial_transport::{Frame, TransportError};
use crate::telemetry::SampleKind;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Failure classes every reply to an operator carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    TransportTimeout,
    ProtocolError,
    CommandRejected,
    OutOfRange,
    DeviceUnavailable,
    UnknownCommand,
    InvalidScanGeometry,
    InvalidPayload,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportTimeout => "TransportTimeout",
            Self::ProtocolError => "ProtocolError",
            Self::CommandRejected => "CommandRejected",
            Self::OutOfRange => "OutOfRange",
            Self::DeviceUnavailable => "DeviceUnavailable",
            Self::UnknownCommand => "UnknownCommand",
            Self::InvalidScanGeometry => "InvalidScanGeometry",
            Self::InvalidPayload => "InvalidPayload",
            Self::Io => "Io",
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{device}: unrecognised reply '{reply}' to '{request}'")]
    Protocol {
        device: String,
        request: String,
        reply: String,
    },

    #[error("{device}: command rejected: {reason}")]
    CommandRejected { device: String, reason: String },

    #[error("{device}: {quantity} {value} outside of allowed range [{min}, {max}]")]
    OutOfRange {
        device: String,
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Device {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("Command queue of {device} is shut down")]
    ProxyClosed { device: String },
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Timeout { .. }) => ErrorKind::TransportTimeout,
            Self::Transport(TransportError::EchoMismatch { .. } | TransportError::Utf8(_))
            | Self::Protocol { .. } => ErrorKind::ProtocolError,
            Self::Transport(_) => ErrorKind::Io,
            Self::CommandRejected { .. } => ErrorKind::CommandRejected,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::Unavailable { .. } | Self::ProxyClosed { .. } => ErrorKind::DeviceUnavailable,
        }
    }

    pub(crate) fn unavailable(device: &str, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn rejected(device: &str, reason: impl fmt::Display) -> Self {
        Self::CommandRejected {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Capability set every driver is written against.
///
/// Implementations must be callable from several threads at once and keep
/// each call's frames together on the wire.
pub trait FrameIo: Send + Sync {
    /// Queue a frame; does not wait for it to be sent.
    fn write(&self, frame: Frame) -> Result<(), DeviceError>;

    /// Next reply from the device.
    fn read(&self) -> Result<String, DeviceError>;

    fn query(&self, frame: Frame) -> Result<String, DeviceError>;

    /// Write one frame and collect `replies` answers without another
    /// caller's frames in between.
    fn exchange(&self, frame: Frame, replies: usize) -> Result<Vec<String>, DeviceError>;

    /// Change how long reads wait for a terminated reply.
    fn set_timeout(&self, timeout: Duration) -> Result<(), DeviceError>;

    /// Stop background work and release the link.
    fn shutdown(&self) {}
}

/// Reply codes a device family uses to report success or failure.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTable {
    successes: &'static [&'static str],
    failures: &'static [(&'static str, &'static str)],
}

impl ErrorTable {
    pub const fn new(
        successes: &'static [&'static str],
        failures: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            successes,
            failures,
        }
    }

    pub fn failure(&self, reply: &str) -> Option<&'static str> {
        self.failures
            .iter()
            .find(|(code, _)| *code == reply)
            .map(|(_, reason)| *reason)
    }

    pub fn is_success(&self, reply: &str) -> bool {
        self.successes.contains(&reply)
    }

    /// Pass a data reply through unless it is a known failure code.
    pub fn check<'a>(
        &self,
        device: &str,
        request: &Frame,
        reply: &'a str,
    ) -> Result<&'a str, DeviceError> {
        match self.failure(reply) {
            Some(reason) => {
                log::error!("{device}: {reason} in reply to '{request}'");
                Err(DeviceError::rejected(device, reason))
            }
            None => Ok(reply),
        }
    }

    /// A status reply must be one of the known success codes.
    pub fn expect_success(
        &self,
        device: &str,
        request: &Frame,
        reply: &str,
    ) -> Result<(), DeviceError> {
        self.check(device, request, reply)?;
        if self.is_success(reply) {
            Ok(())
        } else {
            Err(protocol_error(device, request, reply))
        }
    }

    /// Check a reply and parse it as a value.
    pub fn parse<T: FromStr>(
        &self,
        device: &str,
        request: &Frame,
        reply: &str,
    ) -> Result<T, DeviceError> {
        self.check(device, request, reply)?
            .trim()
            .parse()
            .map_err(|_| protocol_error(device, request, reply))
    }
}

pub(crate) fn protocol_error(device: &str, request: &Frame, reply: &str) -> DeviceError {
    DeviceError::Protocol {
        device: device.to_string(),
        request: request.to_string(),
        reply: reply.to_string(),
    }
}

/// Reject `value` before anything is sent if it lies outside `[min, max]`.
pub fn check_range(
    device: &str,
    quantity: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), DeviceError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(DeviceError::OutOfRange {
            device: device.to_string(),
            quantity,
            value,
            min,
            max,
        })
    }
}

/// Two-phase set: send `set`, then `confirm`, and accept the operation only
/// if neither reply is a failure code and `accept` approves the confirmation.
pub fn set_and_confirm<I, F>(
    io: &I,
    table: &ErrorTable,
    device: &str,
    set: Frame,
    confirm: Frame,
    accept: F,
) -> Result<String, DeviceError>
where
    I: FrameIo + ?Sized,
    F: FnOnce(&str) -> bool,
{
    let reply = io.query(set.clone())?;
    table.check(device, &set, &reply)?;
    confirm_phase(io, table, device, &set, confirm, accept)
}

/// Like [`set_and_confirm`] for devices that do not answer the set frame.
pub fn write_and_confirm<I, F>(
    io: &I,
    table: &ErrorTable,
    device: &str,
    set: Frame,
    confirm: Frame,
    accept: F,
) -> Result<String, DeviceError>
where
    I: FrameIo + ?Sized,
    F: FnOnce(&str) -> bool,
{
    io.write(set.clone())?;
    confirm_phase(io, table, device, &set, confirm, accept)
}

fn confirm_phase<I, F>(
    io: &I,
    table: &ErrorTable,
    device: &str,
    set: &Frame,
    confirm: Frame,
    accept: F,
) -> Result<String, DeviceError>
where
    I: FrameIo + ?Sized,
    F: FnOnce(&str) -> bool,
{
    let confirmation = io.query(confirm.clone())?;
    table.check(device, &confirm, &confirmation)?;
    if !accept(&confirmation) {
        log::error!("{device}: '{confirm}' answered '{confirmation}' after '{set}'");
        return Err(DeviceError::rejected(
            device,
            format!("'{set}' not confirmed, device reports '{confirmation}'"),
        ));
    }
    log::debug!("{device}: '{set}' confirmed");
    Ok(confirmation)
}

/// One observation of a polled device, before it is timestamped.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SampleKind,
    pub data: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(kind: SampleKind) -> Self {
        Self {
            kind,
            data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, channel: impl Into<String>, value: f64) -> Self {
        self.data.insert(channel.into(), value);
        self
    }
}

/// A device an acquisition loop polls.
pub trait DataSource: Send + Sync {
    fn source(&self) -> &str;

    fn acquire(&self) -> Result<Reading, DeviceError>;
}

/// A driver as the orchestrator sees it: a named command target.
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    /// Verbs [`execute`](Self::execute) understands.
    fn verbs(&self) -> &'static [&'static str];

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError>;

    fn data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        None
    }

    fn raster_stage(self: Arc<Self>) -> Option<Arc<dyn RasterStage>> {
        None
    }

    fn shutdown(&self);
}
