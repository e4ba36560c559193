//! Two-axis motor stage speaking the Zaber ASCII protocol.
//!
//! Requests look like `/1 2 move rel 2000`, replies like
//! `@01 2 OK BUSY -- 0`: device, axis, flag (`OK` or `RJ`), status, warning
//! and data. Moves return once the axis reports `IDLE` again.

use crate::command_proxy::CommandProxy;
use crate::command_router::{arg, opt_arg, CommandError};
use crate::device::{check_range, DeviceError, FrameIo, Instrument};
use crate::scan_controller::{Axis, RasterStage};
use crate::serial_transport::{Frame, FramingConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ZaberStageSettings {
    /// Device address on the daisy chain.
    pub device: u8,
    /// Axis numbers driving X and Y.
    pub axes: [u8; 2],
    /// Length of one microstep in mm.
    pub microstep: f64,
    /// Travel of each axis in mm.
    pub travel: f64,
    /// Longest a single move may take.
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
}

impl Default for ZaberStageSettings {
    fn default() -> Self {
        Self {
            device: 1,
            axes: [1, 2],
            microstep: 0.496_093_75e-3,
            travel: 300.0,
            move_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AsciiReply {
    axis: u8,
    accepted: bool,
    busy: bool,
    data: String,
}

impl AsciiReply {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.strip_prefix('@')?.split_whitespace();
        let _device: u8 = words.next()?.parse().ok()?;
        let axis = words.next()?.parse().ok()?;
        let accepted = match words.next()? {
            "OK" => true,
            "RJ" => false,
            _ => return None,
        };
        let busy = match words.next()? {
            "BUSY" => true,
            "IDLE" => false,
            _ => return None,
        };
        let _warning = words.next()?;
        Some(Self {
            axis,
            accepted,
            busy,
            data: words.collect::<Vec<_>>().join(" "),
        })
    }
}

pub struct ZaberStage<I: FrameIo = CommandProxy> {
    name: String,
    io: I,
    device: u8,
    axes: [u8; 2],
    microstep: f64,
    travel: i64,
    move_timeout: Duration,
}

impl<I: FrameIo> ZaberStage<I> {
    pub const BAUD_RATE: u32 = 115_200;

    /// Native speed unit is microsteps per 1.6384 s.
    const SPEED_UNIT: f64 = 1.6384;
    /// Max speed in native units per unit of resolution.
    const MAX_SPEED_PER_RESOLUTION: i64 = 16_384;

    pub const VERBS: &'static [&'static str] = &[
        "position",
        "move_rel",
        "move_abs",
        "set_speed",
        "get_speed",
        "stop",
        "home",
    ];

    pub fn framing() -> FramingConfig {
        FramingConfig::new(" ", "\n").with_read_terminator("\r\n")
    }

    pub fn new(name: impl Into<String>, io: I, settings: &ZaberStageSettings) -> Self {
        Self {
            name: name.into(),
            io,
            device: settings.device,
            axes: settings.axes,
            microstep: settings.microstep,
            travel: (settings.travel / settings.microstep).round() as i64,
            move_timeout: settings.move_timeout,
        }
    }

    /// Query both axes once so a dead link fails at start-up.
    pub fn init(&self) -> Result<(), DeviceError> {
        for axis in Axis::ALL {
            let position = self.position(axis)?;
            log::info!(
                "{}: {axis:?} axis at {:.3} mm",
                self.name,
                self.to_mm(axis, position)
            );
        }
        Ok(())
    }

    fn command(&self, axis: Axis, words: &str) -> Result<AsciiReply, DeviceError> {
        let request = Frame::new(format!("/{}", self.device))
            .arg(self.axes[axis.index()])
            .args(words.split_whitespace());
        let line = self.io.query(request.clone())?;
        let reply = AsciiReply::parse(&line)
            .filter(|reply| reply.axis == self.axes[axis.index()])
            .ok_or_else(|| crate::device::protocol_error(&self.name, &request, &line))?;

        if !reply.accepted {
            log::error!("{}: '{request}' rejected: {}", self.name, reply.data);
            return Err(DeviceError::rejected(
                &self.name,
                format!("'{request}' rejected: {}", reply.data),
            ));
        }
        Ok(reply)
    }

    fn get<T: std::str::FromStr>(&self, axis: Axis, setting: &str) -> Result<T, DeviceError> {
        let reply = self.command(axis, &format!("get {setting}"))?;
        reply.data.parse().map_err(|_| DeviceError::Protocol {
            device: self.name.clone(),
            request: format!("get {setting}"),
            reply: reply.data.clone(),
        })
    }

    fn wait_until_idle(&self, axis: Axis) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.move_timeout;
        loop {
            if !self.command(axis, "")?.busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Protocol {
                    device: self.name.clone(),
                    request: format!("{axis:?} move"),
                    reply: format!("still busy after {:?}", self.move_timeout),
                });
            }
            thread::sleep(IDLE_POLL);
        }
    }

    fn check_target(&self, axis: Axis, target: i64) -> Result<(), DeviceError> {
        check_range(
            &self.name,
            "position",
            self.to_mm(axis, target),
            0.0,
            self.to_mm(axis, self.travel),
        )
    }

    /// Maximum speed in mm/s used by moves.
    pub fn speed(&self, axis: Axis) -> Result<f64, DeviceError> {
        let native: i64 = self.get(axis, "maxspeed")?;
        Ok(native as f64 * self.microstep / Self::SPEED_UNIT)
    }

    pub fn stop(&self, axis: Axis) -> Result<(), DeviceError> {
        log::warn!("{}: stopping {axis:?} axis", self.name);
        self.command(axis, "stop")?;
        Ok(())
    }

    pub fn home(&self, axis: Axis) -> Result<(), DeviceError> {
        self.command(axis, "home")?;
        self.wait_until_idle(axis)
    }

    fn axis_payload(payload: &Value) -> Result<Option<Axis>, CommandError> {
        opt_arg(payload, "axis")
    }
}

impl<I: FrameIo> RasterStage for ZaberStage<I> {
    fn step_mm(&self, _axis: Axis) -> f64 {
        self.microstep
    }

    fn travel(&self, _axis: Axis) -> i64 {
        self.travel
    }

    fn position(&self, axis: Axis) -> Result<i64, DeviceError> {
        self.get(axis, "pos")
    }

    fn move_abs(&self, axis: Axis, position: i64) -> Result<(), DeviceError> {
        self.check_target(axis, position)?;
        self.command(axis, &format!("move abs {position}"))?;
        self.wait_until_idle(axis)
    }

    fn move_rel(&self, axis: Axis, distance: i64) -> Result<(), DeviceError> {
        let target = self.position(axis)? + distance;
        self.check_target(axis, target)?;
        self.command(axis, &format!("move rel {distance}"))?;
        self.wait_until_idle(axis)
    }

    fn set_speed(&self, axis: Axis, mm_per_s: f64) -> Result<(), DeviceError> {
        let resolution: i64 = self.get(axis, "resolution")?;
        let max = resolution * Self::MAX_SPEED_PER_RESOLUTION;
        let native = (mm_per_s * Self::SPEED_UNIT / self.microstep).round() as i64;
        let mm_per_native = self.microstep / Self::SPEED_UNIT;
        check_range(
            &self.name,
            "speed",
            mm_per_s,
            mm_per_native,
            max as f64 * mm_per_native,
        )?;
        self.command(axis, &format!("set maxspeed {native}"))?;
        Ok(())
    }
}

impl<I: FrameIo + 'static> Instrument for ZaberStage<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        match verb {
            "position" => {
                let mut positions = serde_json::Map::new();
                for axis in Axis::ALL {
                    let mm = self.to_mm(axis, self.position(axis)?);
                    positions.insert(format!("{axis:?}").to_lowercase(), json!(mm));
                }
                return Ok(Value::Object(positions));
            }
            "move_rel" => {
                let axis = arg(payload, "axis")?;
                let distance = self.to_native(axis, arg(payload, "distance")?);
                self.move_rel(axis, distance)?;
            }
            "move_abs" => {
                let axis = arg(payload, "axis")?;
                let position = self.to_native(axis, arg(payload, "position")?);
                self.move_abs(axis, position)?;
            }
            "set_speed" => self.set_speed(arg(payload, "axis")?, arg(payload, "speed")?)?,
            "get_speed" => return Ok(json!(self.speed(arg(payload, "axis")?)?)),
            "stop" => match Self::axis_payload(payload)? {
                Some(axis) => self.stop(axis)?,
                None => {
                    for axis in Axis::ALL {
                        self.stop(axis)?;
                    }
                }
            },
            "home" => match Self::axis_payload(payload)? {
                Some(axis) => self.home(axis)?,
                None => {
                    for axis in Axis::ALL {
                        self.home(axis)?;
                    }
                }
            },
            _ => {
                return Err(CommandError::UnknownCommand {
                    target: self.name.clone(),
                    verb: verb.to_string(),
                })
            }
        }
        Ok(Value::Null)
    }

    fn raster_stage(self: Arc<Self>) -> Option<Arc<dyn RasterStage>> {
        Some(self)
    }

    fn shutdown(&self) {
        self.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ErrorKind;
    use crate::serial_transport::FramedTransport;
    use crate::sim_link::{SimHandle, SimLink};
    use std::sync::Mutex;

    /// Device 1 with two axes; each move reports BUSY once before IDLE.
    fn simulated_stage() -> (ZaberStage, SimHandle) {
        let framing = ZaberStage::<CommandProxy>::framing();
        let positions = Mutex::new([0_i64; 3]);
        let busy = Mutex::new([false; 3]);
        let (link, handle) = SimLink::with_responder(&framing, move |line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            let Some(axis) = words.get(1).and_then(|a| a.parse::<usize>().ok()).filter(|a| (1..=2).contains(a)) else {
                return vec!["@01 0 RJ IDLE -- BADAXIS".to_string()];
            };
            let mut positions = positions.lock().unwrap();
            let mut busy = busy.lock().unwrap();
            let status = |busy: bool| if busy { "BUSY" } else { "IDLE" };
            let reply = match words[2..] {
                [] => {
                    let was_busy = busy[axis];
                    busy[axis] = false;
                    format!("@01 {axis} OK {} -- 0", status(was_busy))
                }
                ["get", "pos"] => format!("@01 {axis} OK IDLE -- {}", positions[axis]),
                ["get", "resolution"] => format!("@01 {axis} OK IDLE -- 64"),
                ["get", "maxspeed"] => format!("@01 {axis} OK IDLE -- 153600"),
                ["set", "maxspeed", _] | ["stop"] => format!("@01 {axis} OK IDLE -- 0"),
                ["home"] => {
                    positions[axis] = 0;
                    busy[axis] = true;
                    format!("@01 {axis} OK BUSY -- 0")
                }
                ["move", mode, value] => {
                    let value: i64 = value.parse().unwrap_or(0);
                    positions[axis] = if mode == "abs" { value } else { positions[axis] + value };
                    busy[axis] = true;
                    format!("@01 {axis} OK BUSY -- 0")
                }
                _ => format!("@01 {axis} RJ IDLE -- BADCOMMAND"),
            };
            vec![reply]
        });
        let transport = FramedTransport::new(Box::new(link), framing, Duration::from_millis(200));
        let proxy = CommandProxy::spawn("stage", transport, None).unwrap();
        let settings = ZaberStageSettings {
            microstep: 0.001,
            travel: 20.0,
            ..ZaberStageSettings::default()
        };
        (ZaberStage::new("stage", proxy, &settings), handle)
    }

    #[test]
    fn test_reply_parsing() {
        let reply = AsciiReply::parse("@01 2 OK BUSY -- 1234").unwrap();
        assert_eq!(reply.axis, 2);
        assert!(reply.accepted && reply.busy);
        assert_eq!(reply.data, "1234");

        let reply = AsciiReply::parse("@01 1 RJ IDLE WR BADDATA").unwrap();
        assert!(!reply.accepted);
        assert_eq!(reply.data, "BADDATA");

        assert!(AsciiReply::parse("#01 1 hello").is_none());
        assert!(AsciiReply::parse("@01 1 OK").is_none());
    }

    #[test]
    fn test_moves_wait_until_idle() {
        let (stage, handle) = simulated_stage();
        stage.move_abs(Axis::X, 5000).unwrap();
        stage.move_rel(Axis::Y, 1500).unwrap();
        assert_eq!(stage.position(Axis::X).unwrap(), 5000);
        assert_eq!(stage.position(Axis::Y).unwrap(), 1500);
        stage.shutdown();

        assert_eq!(handle.count("/1 1 move abs 5000 "), 1);
        assert!(handle.count("/1 1 ") >= 2);
        assert!(handle.count("/1 2 ") >= 2);
    }

    #[test]
    fn test_moves_beyond_travel_are_refused() {
        let (stage, handle) = simulated_stage();
        let err = stage.move_abs(Axis::X, 20_001).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        let err = stage.move_rel(Axis::Y, -1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        stage.shutdown();
        assert!(handle.frames().iter().all(|frame| !frame.contains("move")));
    }

    #[test]
    fn test_speed_conversion() {
        let (stage, handle) = simulated_stage();
        let speed = stage.speed(Axis::X).unwrap();
        assert!((speed - 93.75).abs() < 1e-9);

        stage.set_speed(Axis::X, 0.610_351_562_5).unwrap();
        assert_eq!(stage.set_speed(Axis::X, 1.0e6).unwrap_err().kind(), ErrorKind::OutOfRange);
        stage.shutdown();
        assert_eq!(handle.count("/1 1 set maxspeed 1000 "), 1);
    }

    #[test]
    fn test_verbs_use_millimetres() {
        let (stage, _handle) = simulated_stage();
        stage
            .execute("move_abs", &json!({"axis": "x", "position": 2.5}))
            .unwrap();
        stage.execute("home", &json!({"axis": "y"})).unwrap();
        let position = stage.execute("position", &Value::Null).unwrap();
        assert!((position["x"].as_f64().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(position["y"], json!(0.0));

        let err = stage.execute("move_abs", &json!({"axis": "z", "position": 1})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
        stage.shutdown();
    }

    #[test]
    fn test_rejected_command() {
        let (stage, _handle) = simulated_stage();
        assert!(stage.execute("stop", &json!({"axis": "x"})).is_ok());
        let err = stage.command(Axis::X, "warp 9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
        stage.shutdown();
    }
}
