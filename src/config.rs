//! Static set-up of a DAQ session, loaded once at start-up.
//!
//! The structs are plain data. Overrides go through the consuming `with_*`
//! methods and yield a new value.

use crate::devices::{
    arduino, FreqCounterSettings, GpioSwitchSettings, IsegHv, IsegHvSettings, NtcReadoutSettings,
    ZaberStage, ZaberStageSettings,
};
use crate::serial_transport::{FramingConfig, LinkConfig};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DaqConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DaqConfig {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            devices: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Session name, reported by `daq.status` and used to name recordings.
    pub name: String,
    /// Stage device driving scans; defaults to the first stage configured.
    pub scan_stage: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "irrad".to_string(),
            scan_stage: None,
        }
    }
}

/// One instrument on its own serial link.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub link: LinkConfig,
    /// Overrides the framing of the device family.
    #[serde(default)]
    pub framing: Option<FramingConfig>,
    /// How often an acquisition loop reads the device, if it produces data.
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    /// Wait after opening the port before talking to the device.
    #[serde(default, with = "humantime_serde")]
    pub settle_time: Option<Duration>,
    pub settings: DeviceSettings,
}

impl DeviceConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(name: impl Into<String>, link: LinkConfig, settings: DeviceSettings) -> Self {
        Self {
            name: name.into(),
            link,
            framing: None,
            poll_interval: None,
            settle_time: None,
            settings,
        }
    }

    #[must_use]
    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = Some(framing);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    #[must_use]
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = Some(settle_time);
        self
    }

    pub fn framing(&self) -> FramingConfig {
        self.framing
            .clone()
            .unwrap_or_else(|| self.settings.default_framing())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(Self::DEFAULT_POLL_INTERVAL)
    }

    pub fn settle_time(&self) -> Duration {
        self.settle_time
            .unwrap_or_else(|| self.settings.default_settle_time())
    }
}

/// Instrument type and its specific parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceSettings {
    GpioSwitch(GpioSwitchSettings),
    NtcReadout(NtcReadoutSettings),
    FreqCounter(FreqCounterSettings),
    IsegHv(IsegHvSettings),
    ZaberStage(ZaberStageSettings),
}

impl DeviceSettings {
    pub fn default_framing(&self) -> FramingConfig {
        match self {
            Self::GpioSwitch(_) | Self::NtcReadout(_) | Self::FreqCounter(_) => arduino::framing(),
            Self::IsegHv(_) => IsegHv::<crate::command_proxy::CommandProxy>::framing(),
            Self::ZaberStage(_) => ZaberStage::<crate::command_proxy::CommandProxy>::framing(),
        }
    }

    pub fn default_settle_time(&self) -> Duration {
        match self {
            Self::GpioSwitch(_) | Self::NtcReadout(_) | Self::FreqCounter(_) => {
                arduino::SETTLE_TIME
            }
            Self::IsegHv(_) | Self::ZaberStage(_) => Duration::ZERO,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GpioSwitch(_) => "gpio_switch",
            Self::NtcReadout(_) => "ntc_readout",
            Self::FreqCounter(_) => "freq_counter",
            Self::IsegHv(_) => "iseg_hv",
            Self::ZaberStage(_) => "zaber_stage",
        }
    }
}
