//! Turns device configuration into running instruments.

use crate::command_proxy::CommandProxy;
use crate::config::{DeviceConfig, DeviceSettings};
use crate::device::{DeviceError, Instrument};
use crate::devices::{FreqCounter, GpioSwitch, IsegHv, NtcReadout, ZaberStage};
use crate::serial_transport::{FramedTransport, TransportError};
use serialport::SerialPortType;
use std::sync::Arc;
use std::thread;

/// A serial port present on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDevice {
    pub port: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl SerialDevice {
    pub fn is_usb(&self) -> bool {
        self.vendor_id.is_some()
    }

    pub fn description(&self) -> String {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => format!(
                "{} [{vid:04x}:{pid:04x}] {}",
                self.port,
                self.product.as_deref().unwrap_or("unknown product")
            ),
            _ => self.port.clone(),
        }
    }
}

pub struct Connector;

impl Connector {
    /// Serial ports the OS reports, USB ones with their identification.
    pub fn available_ports() -> Result<Vec<SerialDevice>, TransportError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => SerialDevice {
                    port: info.port_name,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                },
                _ => SerialDevice {
                    port: info.port_name,
                    vendor_id: None,
                    product_id: None,
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                },
            })
            .collect())
    }

    /// Open, initialise and return the device. Any failure on the way is
    /// reported as [`DeviceError::Unavailable`].
    pub fn connect(config: &DeviceConfig) -> Result<Arc<dyn Instrument>, DeviceError> {
        let transport = Self::open_transport(config)
            .map_err(|e| DeviceError::unavailable(&config.name, e))?;
        Self::build(config, transport)
    }

    /// Open the port and give the device its settle time.
    pub fn open_transport(config: &DeviceConfig) -> Result<FramedTransport, TransportError> {
        log::info!(
            "{}: opening {} ({})",
            config.name,
            config.link.port,
            config.settings.type_name()
        );
        let mut transport = FramedTransport::open(&config.link, config.framing())?;

        let settle_time = config.settle_time();
        if !settle_time.is_zero() {
            log::debug!("{}: waiting {settle_time:?} for device to settle", config.name);
            thread::sleep(settle_time);
            transport.reset_buffers()?;
        }
        Ok(transport)
    }

    /// Start the driver for `config` on an open transport and run its
    /// initialisation.
    pub fn build(
        config: &DeviceConfig,
        transport: FramedTransport,
    ) -> Result<Arc<dyn Instrument>, DeviceError> {
        Self::instantiate(config, transport).map_err(|e| match e {
            DeviceError::Unavailable { .. } => e,
            other => DeviceError::unavailable(&config.name, other),
        })
    }

    fn instantiate(
        config: &DeviceConfig,
        transport: FramedTransport,
    ) -> Result<Arc<dyn Instrument>, DeviceError> {
        let name = config.name.as_str();
        let link_timeout = transport.timeout();

        let instrument: Arc<dyn Instrument> = match &config.settings {
            DeviceSettings::GpioSwitch(settings) => {
                let keep_alive = GpioSwitch::<CommandProxy>::keep_alive(settings.ping_interval);
                let proxy = CommandProxy::spawn(name, transport, Some(keep_alive))?;
                let switch = GpioSwitch::new(name, proxy);
                switch.init(settings)?;
                Arc::new(switch)
            }
            DeviceSettings::NtcReadout(settings) => {
                let ntc = NtcReadout::new(name, CommandProxy::spawn(name, transport, None)?, settings);
                ntc.init(settings)?;
                Arc::new(ntc)
            }
            DeviceSettings::FreqCounter(settings) => {
                let proxy = CommandProxy::spawn(name, transport, None)?;
                let counter = FreqCounter::new(name, proxy, settings, link_timeout);
                counter.init(settings)?;
                Arc::new(counter)
            }
            DeviceSettings::IsegHv(settings) => {
                let hv = IsegHv::new(name, CommandProxy::spawn(name, transport, None)?, settings);
                hv.init()?;
                Arc::new(hv)
            }
            DeviceSettings::ZaberStage(settings) => {
                let stage =
                    ZaberStage::new(name, CommandProxy::spawn(name, transport, None)?, settings);
                stage.init()?;
                Arc::new(stage)
            }
        };

        log::info!("{name}: initialised");
        Ok(instrument)
    }
}
