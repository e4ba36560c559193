//! Drivers for the instruments of an irradiation setup.
//!
//! Each driver is generic over the [`FrameIo`](crate::device::FrameIo) it
//! talks through and defaults to a [`CommandProxy`](crate::command_proxy::CommandProxy).

pub mod freq_counter;
pub mod gpio_switch;
pub mod iseg_hv;
pub mod ntc_readout;
pub mod zaber_stage;

pub use freq_counter::{FreqCounter, FreqCounterSettings};
pub use gpio_switch::{GpioSwitch, GpioSwitchSettings, PinState};
pub use iseg_hv::{IsegHv, IsegHvSettings};
pub use ntc_readout::{NtcReadout, NtcReadoutSettings};
pub use zaber_stage::{ZaberStage, ZaberStageSettings};

/// Serial conventions shared by the Arduino based instruments.
pub mod arduino {
    use crate::serial_transport::FramingConfig;
    use std::time::Duration;

    pub const BAUD_RATE: u32 = 115_200;

    /// Opening the port resets the board, which then needs this long to boot.
    pub const SETTLE_TIME: Duration = Duration::from_secs(1);

    /// Reply the firmware sends when it could not parse a frame.
    pub const SERIAL_ERROR: (&str, &str) = ("error", "Serial transmission error");

    pub fn framing() -> FramingConfig {
        FramingConfig::new(":", "\n")
    }
}
