//! Wires configured instruments, their acquisition loops and the scan
//! controller behind one command router.

use crate::acquisition::{AcquisitionLoop, AcquisitionStats};
use crate::command_router::{Command, CommandRouter, Reply};
use crate::config::{DaqConfig, DeviceConfig, ServerConfig};
use crate::connector::Connector;
use crate::device::Instrument;
use crate::scan_controller::{RasterStage, ScanController};
use crate::telemetry::{self, TelemetryReceiver, TelemetrySender};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Router target of the orchestrator itself.
pub const DAQ_TARGET: &str = "daq";
/// Router target and telemetry source of the scan controller.
pub const SCAN_TARGET: &str = "scan";

#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    #[error("Failed to start acquisition for '{source_name}': {error}")]
    Spawn {
        source_name: String,
        #[source]
        error: std::io::Error,
    },
}

/// Collects instruments before the session starts. Devices that fail to
/// connect are logged and left out; the rest of the session carries on.
pub struct DaqBuilder {
    server: ServerConfig,
    instruments: Vec<(Arc<dyn Instrument>, Duration)>,
    unavailable: Vec<String>,
}

impl DaqBuilder {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            instruments: Vec::new(),
            unavailable: Vec::new(),
        }
    }

    /// Connect every configured device.
    pub fn from_config(config: &DaqConfig) -> Self {
        config
            .devices
            .iter()
            .fold(Self::new(config.server.clone()), Self::connect)
    }

    #[must_use]
    pub fn connect(mut self, device: &DeviceConfig) -> Self {
        match Connector::connect(device) {
            Ok(instrument) => self.instruments.push((instrument, device.poll_interval())),
            Err(e) => {
                log::error!("{}: not available, continuing without it: {e}", device.name);
                self.unavailable.push(device.name.clone());
            }
        }
        self
    }

    /// Add an instrument that is already running.
    #[must_use]
    pub fn with_instrument(mut self, instrument: Arc<dyn Instrument>, poll_interval: Duration) -> Self {
        self.instruments.push((instrument, poll_interval));
        self
    }

    pub fn start(self) -> Result<Daq, DaqError> {
        let Self {
            server,
            instruments,
            unavailable,
        } = self;
        let (telemetry_tx, telemetry_rx) = telemetry::channel();
        let running = Arc::new(AtomicBool::new(true));

        let mut daq = Daq {
            name: server.name.clone(),
            router: CommandRouter::new(),
            instruments: Vec::new(),
            scan: None,
            loops: Vec::new(),
            running,
            telemetry: telemetry_rx,
            unavailable,
        };

        for (instrument, poll_interval) in instruments {
            daq.router.register_instrument(instrument.clone());
            if let Some(source) = instrument.clone().data_source() {
                let acquisition = AcquisitionLoop::spawn(
                    source,
                    poll_interval,
                    telemetry_tx.clone(),
                    daq.running.clone(),
                )
                .map_err(|error| DaqError::Spawn {
                    source_name: instrument.name().to_string(),
                    error,
                })?;
                daq.loops.push(acquisition);
            }
            daq.instruments.push(instrument);
        }

        if let Some(stage) = select_stage(&server, &daq.instruments) {
            let scan = Arc::new(ScanController::new(SCAN_TARGET, stage, telemetry_tx.clone()));
            daq.router.register_instrument(scan.clone());
            daq.scan = Some(scan);
        }

        daq.register_server_target(telemetry_tx);
        log::info!(
            "{}: started with {} instruments, {} acquisition loops, scan {}",
            daq.name,
            daq.instruments.len(),
            daq.loops.len(),
            if daq.scan.is_some() { "available" } else { "unavailable" }
        );
        Ok(daq)
    }
}

fn select_stage(
    server: &ServerConfig,
    instruments: &[Arc<dyn Instrument>],
) -> Option<Arc<dyn RasterStage>> {
    match &server.scan_stage {
        Some(name) => {
            let stage = instruments
                .iter()
                .find(|instrument| instrument.name() == name)
                .and_then(|instrument| instrument.clone().raster_stage());
            if stage.is_none() {
                log::warn!("Scan stage '{name}' is not a connected stage, scanning disabled");
            }
            stage
        }
        None => instruments
            .iter()
            .find_map(|instrument| instrument.clone().raster_stage()),
    }
}

/// A running session.
pub struct Daq {
    name: String,
    router: CommandRouter,
    instruments: Vec<Arc<dyn Instrument>>,
    scan: Option<Arc<ScanController>>,
    loops: Vec<AcquisitionLoop>,
    running: Arc<AtomicBool>,
    telemetry: TelemetryReceiver,
    unavailable: Vec<String>,
}

impl Daq {
    /// Connect the configured devices and start acquiring.
    pub fn start(config: &DaqConfig) -> Result<Self, DaqError> {
        DaqBuilder::from_config(config).start()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self, command: &Command) -> Reply {
        self.router.dispatch(command)
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn telemetry(&self) -> &TelemetryReceiver {
        &self.telemetry
    }

    pub fn scan(&self) -> Option<&ScanController> {
        self.scan.as_deref()
    }

    /// Devices configured but not connected.
    pub fn unavailable(&self) -> &[String] {
        &self.unavailable
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the scan, the acquisition loops and every instrument. Returns
    /// the acquisition statistics per data source.
    pub fn shutdown(mut self) -> BTreeMap<String, AcquisitionStats> {
        self.stop_all()
    }

    fn stop_all(&mut self) -> BTreeMap<String, AcquisitionStats> {
        if let Some(scan) = self.scan.take() {
            scan.shutdown();
        }
        self.running.store(false, Ordering::Release);

        let stats = self
            .loops
            .drain(..)
            .map(|acquisition| (acquisition.source().to_string(), acquisition.join()))
            .collect();

        for instrument in self.instruments.drain(..) {
            log::debug!("{}: shutting down", instrument.name());
            instrument.shutdown();
        }
        log::info!("{}: shut down", self.name);
        stats
    }

    fn register_server_target(&mut self, telemetry_tx: TelemetrySender) {
        let mut table = self.router.table();
        table.insert(
            DAQ_TARGET.to_string(),
            vec!["devices".to_string(), "status".to_string()],
        );
        self.router
            .register(DAQ_TARGET, "devices", move |_| Ok(json!(table)));

        let name = self.name.clone();
        let running = self.running.clone();
        let devices: Vec<String> = self
            .instruments
            .iter()
            .map(|instrument| instrument.name().to_string())
            .collect();
        let unavailable = self.unavailable.clone();
        let scan = self.scan.clone();
        self.router.register(DAQ_TARGET, "status", move |_| {
            Ok(json!({
                "name": name,
                "running": running.load(Ordering::Acquire),
                "devices": devices,
                "unavailable": unavailable,
                "scan": scan.as_ref().map(|scan| scan.status()),
                "telemetry_backlog": telemetry_tx.len(),
            }))
        });
    }
}

impl Drop for Daq {
    fn drop(&mut self) {
        if !self.loops.is_empty() || !self.instruments.is_empty() || self.scan.is_some() {
            self.stop_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_router::CommandError;
    use crate::config::DeviceSettings;
    use crate::device::ErrorKind;
    use crate::devices::NtcReadoutSettings;
    use crate::scan_controller::tests::SimStage;
    use crate::scan_controller::ScanState;
    use crate::serial_transport::{FramedTransport, LinkConfig};
    use crate::sim_link::SimLink;
    use crate::telemetry::{SampleKind, ScanEvent};
    use serde_json::Value;

    struct StageInstrument(Arc<SimStage>);

    impl Instrument for StageInstrument {
        fn name(&self) -> &str {
            "stage"
        }

        fn verbs(&self) -> &'static [&'static str] {
            &["position"]
        }

        fn execute(&self, _verb: &str, _payload: &Value) -> Result<Value, CommandError> {
            Ok(json!(*self.0.positions.lock().unwrap()))
        }

        fn raster_stage(self: Arc<Self>) -> Option<Arc<dyn RasterStage>> {
            Some(self.0.clone())
        }

        fn shutdown(&self) {}
    }

    fn ntc() -> Arc<dyn Instrument> {
        let config = DeviceConfig::new(
            "ntc",
            LinkConfig::new("sim", 115_200),
            DeviceSettings::NtcReadout(NtcReadoutSettings {
                channels: BTreeMap::from([("dut".to_string(), 0)]),
                ..NtcReadoutSettings::default()
            }),
        );
        let (link, _handle) = SimLink::with_responder(&config.framing(), |line| match line {
            "T:100:" => vec!["999".to_string()],
            "T:0:" => vec!["24.0".to_string()],
            _ => Vec::new(),
        });
        let transport =
            FramedTransport::new(Box::new(link), config.framing(), Duration::from_millis(100));
        Connector::build(&config, transport).unwrap()
    }

    fn stage() -> Arc<dyn Instrument> {
        Arc::new(StageInstrument(Arc::new(SimStage::new(
            20.0,
            Duration::from_millis(1),
        ))))
    }

    #[test]
    fn test_session_routes_and_acquires() {
        let daq = DaqBuilder::new(ServerConfig::default())
            .with_instrument(ntc(), Duration::from_millis(10))
            .with_instrument(stage(), Duration::from_secs(1))
            .start()
            .unwrap();

        let sample = daq.telemetry().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(sample.source, "ntc");
        assert_eq!(sample.kind, SampleKind::Temp);
        assert_eq!(sample.data["dut"], 24.0);

        let reply = daq.handle(&Command::new(DAQ_TARGET, "devices", Value::Null));
        assert!(reply.is_ok());
        let targets: Vec<&String> = reply.payload.as_object().unwrap().keys().collect();
        assert_eq!(targets, vec!["daq", "ntc", "scan", "stage"]);

        let reply = daq.handle(&Command::new("stage", "position", Value::Null));
        assert_eq!(reply.payload, json!([0, 0]));

        let reply = daq.handle(&Command::new("pump", "on", Value::Null));
        assert_eq!(reply.error_kind(), Some("UnknownCommand"));

        let stats = daq.shutdown();
        assert!(stats["ntc"].samples >= 1);
    }

    #[test]
    fn test_scan_through_router() {
        let daq = DaqBuilder::new(ServerConfig::default())
            .with_instrument(stage(), Duration::from_secs(1))
            .start()
            .unwrap();

        let reply = daq.handle(&Command::new(
            SCAN_TARGET,
            "prepare",
            json!({"start": [1.0, 1.0], "row_length": 2.0, "rows": 2, "pitch": 0.5, "speed": 10.0, "passes": 1}),
        ));
        assert!(reply.is_ok(), "{reply:?}");
        assert!(daq.handle(&Command::new(SCAN_TARGET, "start", Value::Null)).is_ok());

        let events: Vec<ScanEvent> = daq
            .telemetry()
            .iter()
            .filter_map(|sample| sample.event)
            .take_while(|event| *event != ScanEvent::Finished)
            .collect();
        assert_eq!(events.first(), Some(&ScanEvent::Init));
        assert_eq!(
            events.iter().filter(|event| **event == ScanEvent::RowStop).count(),
            2
        );

        let scan = daq.scan().unwrap();
        scan.wait();
        assert_eq!(scan.state(), ScanState::Finished);
        daq.shutdown();
    }

    #[test]
    fn test_unavailable_device_is_skipped() {
        let missing = DeviceConfig::new(
            "ntc",
            LinkConfig::new("/dev/does-not-exist-irrad", 115_200),
            DeviceSettings::NtcReadout(NtcReadoutSettings::default()),
        );
        let daq = DaqBuilder::new(ServerConfig::default())
            .connect(&missing)
            .start()
            .unwrap();

        assert_eq!(daq.unavailable(), ["ntc".to_string()]);
        assert!(daq.scan().is_none());

        let reply = daq.handle(&Command::new("ntc", "get_temp", Value::Null));
        assert_eq!(reply.error_kind(), Some("UnknownCommand"));
        let reply = daq.handle(&Command::new(SCAN_TARGET, "start", Value::Null));
        assert_eq!(reply.error_kind(), Some(ErrorKind::UnknownCommand.as_str()));

        let status = daq.handle(&Command::new(DAQ_TARGET, "status", Value::Null));
        assert_eq!(status.payload["unavailable"], json!(["ntc"]));
        assert_eq!(status.payload["scan"], Value::Null);
        assert_eq!(status.payload["running"], json!(true));
    }

    #[test]
    fn test_named_scan_stage_must_be_a_stage() {
        let server = ServerConfig {
            scan_stage: Some("ntc".to_string()),
            ..ServerConfig::default()
        };
        let daq = DaqBuilder::new(server)
            .with_instrument(ntc(), Duration::from_secs(60))
            .with_instrument(stage(), Duration::from_secs(1))
            .start()
            .unwrap();
        assert!(daq.scan().is_none());
        assert!(!daq.router().contains(SCAN_TARGET, "start"));
        daq.shutdown();
    }
}
