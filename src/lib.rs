//! # irrad-daq
//!
//! Device communication and data acquisition for an irradiation test setup.
//!
//! Instruments hang off serial links speaking line-oriented ASCII protocols.
//! Each link is owned by one worker thread ([`CommandProxy`]) that
//! serialises every request to the device. Drivers for the individual
//! instruments sit on top, periodic readouts run as [`AcquisitionLoop`]s and
//! raster scans of a motor stage are run by the [`ScanController`]. Operator
//! commands reach all of them through a [`CommandRouter`].
//!
//! ## Features
//!
//! - **Framed serial transport**: configurable delimiter, terminators and
//!   echo handling on top of `serialport`
//! - **One owner per link**: request/reply pairs never interleave, keep-alive
//!   pings are sent while the link is idle
//! - **Drivers**: GPIO switch, NTC temperature readout, frequency counter,
//!   high-voltage supply and a two axis ASCII motor stage
//! - **Telemetry**: timestamped samples on a `crossbeam-channel`, recorded
//!   into `polars` DataFrames and exported as CSV
//! - **Failure isolation**: a device that fails to initialise is left out
//!   and the rest of the session runs
//!
//! ## Examples
//!
//! ### Starting a session
//!
//! ```rust,no_run
//! use irrad_daq::{Command, Daq, DaqConfig, DeviceConfig, DeviceSettings, LinkConfig};
//! use irrad_daq::devices::IsegHvSettings;
//! use serde_json::json;
//!
//! let config = DaqConfig::default().with_device(DeviceConfig::new(
//!     "hv",
//!     LinkConfig::new("/dev/ttyUSB0", 9600),
//!     DeviceSettings::IsegHv(IsegHvSettings::default()),
//! ));
//! let daq = Daq::start(&config)?;
//!
//! let reply = daq.handle(&Command::new("hv", "set_voltage", json!({"voltage": 100.0})));
//! println!("{}", serde_json::to_string(&reply)?);
//!
//! for sample in daq.telemetry().try_iter() {
//!     println!("{} {} {:?}", sample.timestamp, sample.source, sample.data);
//! }
//! daq.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Routing commands
//!
//! ```rust
//! use irrad_daq::command_router::{arg, Command, CommandRouter};
//! use serde_json::json;
//!
//! let mut router = CommandRouter::new();
//! router.register("pump", "set_rate", |payload| {
//!     let rate: f64 = arg(payload, "rate")?;
//!     Ok(json!(rate))
//! });
//!
//! let reply = router.dispatch(&Command::new("pump", "set_rate", json!({"rate": 2.5})));
//! assert!(reply.is_ok());
//!
//! let reply = router.dispatch(&Command::new("pump", "drain", json!(null)));
//! assert_eq!(reply.error_kind(), Some("UnknownCommand"));
//! ```

pub mod acquisition;
pub mod command_proxy;
pub mod command_router;
pub mod config;
pub mod connector;
pub mod daq;
pub mod device;
pub mod devices;
pub mod recorder;
pub mod scan_controller;
pub mod serial_transport;
pub mod telemetry;

#[cfg(test)]
mod sim_link;

// Re-export the main types for convenience
pub use serial_transport::{
    Frame, FramedTransport, FramingConfig, Link, LinkConfig, TransportError,
};

pub use command_proxy::{CommandProxy, KeepAlive};

pub use device::{DataSource, DeviceError, ErrorKind, FrameIo, Instrument, Reading};

pub use command_router::{Command, CommandError, CommandRouter, Reply, ReplyStatus};

pub use config::{DaqConfig, DeviceConfig, DeviceSettings, ServerConfig};

pub use connector::{Connector, SerialDevice};

pub use scan_controller::{
    Axis, RasterStage, ScanController, ScanError, ScanParameters, ScanRequest, ScanState,
};

pub use telemetry::{SampleKind, ScanEvent, TelemetryReceiver, TelemetrySample};

pub use acquisition::{AcquisitionLoop, AcquisitionStats};

pub use recorder::{RecorderError, TelemetryRecorder};

pub use daq::{Daq, DaqBuilder, DaqError};
