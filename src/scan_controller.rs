//! Raster scans of a device under test through the beam.
//!
//! The stage sweeps rows along X, stepping along Y between rows, in a
//! serpentine pattern. Passes over the whole area repeat until the configured
//! pass count is reached, [`ScanController::finish`] is called (the current
//! pass completes first) or [`ScanController::stop`] aborts after the row in
//! flight. While the `no_beam` signal is set no new row is started.
//!
//! Every row emits a `row_start` sample followed by either `row_stop` or
//! `row_abort`.

use crate::command_router::{arg, CommandError};
use crate::device::{DeviceError, ErrorKind, Instrument};
use crate::telemetry::{ScanEvent, TelemetrySample, TelemetrySender};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const BEAM_POLL: Duration = Duration::from_millis(10);
/// Speed of both axes on the way back to the pre-scan position, in mm/s.
const RETURN_SPEED: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub const ALL: [Self; 2] = [Self::X, Self::Y];

    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
        }
    }
}

/// Two-axis stage the scan drives. Positions are in native motor steps and
/// moves block until the axis is at rest.
pub trait RasterStage: Send + Sync {
    /// Length of one native step in millimetres.
    fn step_mm(&self, axis: Axis) -> f64;

    /// Usable travel in native steps, starting at 0.
    fn travel(&self, axis: Axis) -> i64;

    fn position(&self, axis: Axis) -> Result<i64, DeviceError>;

    fn move_abs(&self, axis: Axis, position: i64) -> Result<(), DeviceError>;

    fn move_rel(&self, axis: Axis, distance: i64) -> Result<(), DeviceError>;

    fn set_speed(&self, axis: Axis, mm_per_s: f64) -> Result<(), DeviceError>;

    fn to_native(&self, axis: Axis, mm: f64) -> i64 {
        (mm / self.step_mm(axis)).round() as i64
    }

    fn to_mm(&self, axis: Axis, steps: i64) -> f64 {
        steps as f64 * self.step_mm(axis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Preparing,
    Running,
    Paused,
    Stopping,
    Finished,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Invalid scan geometry: {0}")]
    InvalidGeometry(String),

    #[error("Cannot {action} while scan is {state}")]
    InvalidState { state: ScanState, action: &'static str },

    #[error("No scan prepared")]
    NotPrepared,

    #[error("Stage error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to spawn scan thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidGeometry(_) => ErrorKind::InvalidScanGeometry,
            Self::InvalidState { .. } | Self::NotPrepared => ErrorKind::CommandRejected,
            Self::Device(e) => e.kind(),
            Self::Spawn(_) => ErrorKind::Io,
        }
    }
}

/// What the operator asks for, in millimetres.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScanRequest {
    /// Absolute stage position of the first row's starting point.
    pub start: [f64; 2],
    /// Length of one row along X.
    pub row_length: f64,
    pub rows: u32,
    /// Distance between rows along Y.
    pub pitch: f64,
    /// Sweep speed along X in mm/s.
    pub speed: f64,
    /// Complete passes over the area; `None` repeats until finished or stopped.
    #[serde(default)]
    pub passes: Option<u32>,
}

/// Native-unit scan geometry, fixed once prepared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanParameters {
    /// Stage position when the scan was prepared; returned to afterwards.
    pub origin: [i64; 2],
    pub start: [i64; 2],
    /// Y position of every row.
    pub rows: Vec<i64>,
    pub pitch: f64,
    /// X travel of one row.
    pub row_steps: i64,
    pub speed: f64,
    pub passes: Option<u32>,
}

impl ScanParameters {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    fn compute(
        request: &ScanRequest,
        stage: &dyn RasterStage,
        origin: [i64; 2],
    ) -> Result<Self, ScanError> {
        let invalid = |msg: String| Err(ScanError::InvalidGeometry(msg));

        let numbers = [
            request.start[0],
            request.start[1],
            request.row_length,
            request.pitch,
            request.speed,
        ];
        if numbers.iter().any(|n| !n.is_finite()) {
            return invalid("non-finite scan parameter".to_string());
        }
        if request.rows == 0 {
            return invalid("scan needs at least one row".to_string());
        }
        if request.pitch <= 0.0 || request.row_length <= 0.0 || request.speed <= 0.0 {
            return invalid("row length, pitch and speed must be positive".to_string());
        }
        if request.passes == Some(0) {
            return invalid("pass count must be at least 1".to_string());
        }

        let x_start = stage.to_native(Axis::X, request.start[0]);
        let row_steps = stage.to_native(Axis::X, request.row_length);
        let x_end = x_start + row_steps;
        if x_start < 0 || x_end > stage.travel(Axis::X) {
            return invalid(format!(
                "rows span X {:.3}..{:.3} mm, stage travel is {:.3} mm",
                request.start[0],
                request.start[0] + request.row_length,
                stage.to_mm(Axis::X, stage.travel(Axis::X)),
            ));
        }

        let row_y = |row: u32| {
            stage.to_native(
                Axis::Y,
                f64::from(row).mul_add(request.pitch, request.start[1]),
            )
        };
        let y_start = row_y(0);
        let y_last = row_y(request.rows - 1);
        if y_start < 0 || y_last > stage.travel(Axis::Y) {
            return invalid(format!(
                "{} rows at {:.3} mm pitch reach Y {:.3} mm, stage travel is {:.3} mm",
                request.rows,
                request.pitch,
                stage.to_mm(Axis::Y, y_last),
                stage.to_mm(Axis::Y, stage.travel(Axis::Y)),
            ));
        }
        let rows = (0..request.rows).map(row_y).collect();

        Ok(Self {
            origin,
            start: [x_start, y_start],
            rows,
            pitch: request.pitch,
            row_steps,
            speed: request.speed,
            passes: request.passes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub pass: u32,
    pub row: Option<usize>,
    pub no_beam: bool,
}

enum Outcome {
    Completed,
    FinishRequested,
    Stopped,
}

struct Progress {
    pass: u32,
    row: Option<usize>,
}

struct Shared {
    source: String,
    stage: Arc<dyn RasterStage>,
    telemetry: TelemetrySender,
    state: Mutex<ScanState>,
    params: Mutex<Option<ScanParameters>>,
    progress: Mutex<Progress>,
    no_beam: AtomicBool,
    stop: AtomicBool,
    finish: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ScanController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanController {
    pub const VERBS: &'static [&'static str] = &[
        "prepare", "start", "scan_row", "stop", "finish", "no_beam", "status", "parameters",
    ];

    /// `source` names the scan in telemetry and is its command target.
    pub fn new(
        source: impl Into<String>,
        stage: Arc<dyn RasterStage>,
        telemetry: TelemetrySender,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source: source.into(),
                stage,
                telemetry,
                state: Mutex::new(ScanState::Idle),
                params: Mutex::new(None),
                progress: Mutex::new(Progress { pass: 0, row: None }),
                no_beam: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                finish: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScanState {
        *lock(&self.shared.state)
    }

    pub fn status(&self) -> ScanStatus {
        let state = self.state();
        let progress = lock(&self.shared.progress);
        ScanStatus {
            state,
            pass: progress.pass,
            row: progress.row,
            no_beam: self.no_beam(),
        }
    }

    pub fn parameters(&self) -> Option<ScanParameters> {
        lock(&self.shared.params).clone()
    }

    /// Validate `request` against the stage and store the resulting geometry.
    pub fn prepare(&self, request: &ScanRequest) -> Result<ScanParameters, ScanError> {
        {
            let mut state = lock(&self.shared.state);
            if !matches!(*state, ScanState::Idle | ScanState::Finished) {
                return Err(ScanError::InvalidState {
                    state: *state,
                    action: "prepare",
                });
            }
            *state = ScanState::Preparing;
        }

        let stage = self.shared.stage.as_ref();
        let result = Axis::ALL
            .iter()
            .map(|&axis| stage.position(axis))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ScanError::from)
            .and_then(|origin| ScanParameters::compute(request, stage, [origin[0], origin[1]]));

        if let Ok(params) = &result {
            log::info!(
                "{}: prepared {} rows of {} steps",
                self.shared.source,
                params.n_rows(),
                params.row_steps
            );
            *lock(&self.shared.params) = Some(params.clone());
        }
        *lock(&self.shared.state) = ScanState::Idle;
        result
    }

    /// Start the prepared raster in a background thread.
    pub fn start(&self) -> Result<(), ScanError> {
        self.launch(None)
    }

    /// Scan a single row of the prepared raster.
    pub fn scan_row(&self, row: usize) -> Result<(), ScanError> {
        self.launch(Some(row))
    }

    fn launch(&self, single_row: Option<usize>) -> Result<(), ScanError> {
        let mut worker = lock(&self.worker);
        let params = {
            let mut state = lock(&self.shared.state);
            if !matches!(*state, ScanState::Idle | ScanState::Finished) {
                return Err(ScanError::InvalidState {
                    state: *state,
                    action: "start",
                });
            }
            let mut params = lock(&self.shared.params)
                .clone()
                .ok_or(ScanError::NotPrepared)?;
            if let Some(row) = single_row {
                if row >= params.n_rows() {
                    return Err(ScanError::InvalidGeometry(format!(
                        "row {row} not in 0..{}",
                        params.n_rows()
                    )));
                }
                params.rows = vec![params.rows[row]];
                params.passes = Some(1);
            }

            // Flags are reset before `stop`/`finish` can observe `Running`.
            self.shared.stop.store(false, Ordering::Release);
            self.shared.finish.store(false, Ordering::Release);
            *lock(&self.shared.progress) = Progress { pass: 0, row: None };
            *state = ScanState::Running;
            params
        };

        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-scan", self.shared.source))
            .spawn(move || shared.run(&params, single_row));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                *lock(&self.shared.state) = ScanState::Idle;
                Err(e.into())
            }
        }
    }

    /// Abort after the row in flight and return to idle.
    pub fn stop(&self) -> Result<(), ScanError> {
        let mut state = lock(&self.shared.state);
        match *state {
            ScanState::Running | ScanState::Paused => {
                *state = ScanState::Stopping;
                self.shared.stop.store(true, Ordering::Release);
                log::warn!("{}: scan stop requested", self.shared.source);
                Ok(())
            }
            other => Err(ScanError::InvalidState {
                state: other,
                action: "stop",
            }),
        }
    }

    /// Complete the current pass, then end in `finished`.
    pub fn finish(&self) -> Result<(), ScanError> {
        let state = lock(&self.shared.state);
        match *state {
            ScanState::Running | ScanState::Paused => {
                self.shared.finish.store(true, Ordering::Release);
                log::info!("{}: scan finish requested", self.shared.source);
                Ok(())
            }
            other => Err(ScanError::InvalidState {
                state: other,
                action: "finish",
            }),
        }
    }

    /// External beam signal; settable in any state.
    pub fn set_no_beam(&self, no_beam: bool) {
        let previous = self.shared.no_beam.swap(no_beam, Ordering::AcqRel);
        if previous != no_beam {
            log::info!(
                "{}: beam {}",
                self.shared.source,
                if no_beam { "lost" } else { "back" }
            );
        }
    }

    pub fn no_beam(&self) -> bool {
        self.shared.no_beam.load(Ordering::Acquire)
    }

    /// Block until the scan thread, if any, has terminated.
    pub fn wait(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}: scan thread panicked", self.shared.source);
                *lock(&self.shared.state) = ScanState::Idle;
            }
        }
    }
}

impl Instrument for ScanController {
    fn name(&self) -> &str {
        &self.shared.source
    }

    fn verbs(&self) -> &'static [&'static str] {
        Self::VERBS
    }

    fn execute(&self, verb: &str, payload: &Value) -> Result<Value, CommandError> {
        match verb {
            "prepare" => {
                let request: ScanRequest = serde_json::from_value(payload.clone())
                    .map_err(|e| CommandError::InvalidPayload(e.to_string()))?;
                Ok(json!(self.prepare(&request)?))
            }
            "start" => {
                self.start()?;
                Ok(json!(self.status()))
            }
            "scan_row" => {
                self.scan_row(arg(payload, "row")?)?;
                Ok(json!(self.status()))
            }
            "stop" => {
                self.stop()?;
                Ok(json!(self.status()))
            }
            "finish" => {
                self.finish()?;
                Ok(json!(self.status()))
            }
            "no_beam" => {
                self.set_no_beam(arg(payload, "no_beam")?);
                Ok(json!(self.status()))
            }
            "status" => Ok(json!(self.status())),
            "parameters" => Ok(json!(self.parameters())),
            _ => Err(CommandError::UnknownCommand {
                target: self.shared.source.clone(),
                verb: verb.to_string(),
            }),
        }
    }

    fn shutdown(&self) {
        if self.stop().is_ok() {
            log::info!("{}: stopping scan for shutdown", self.shared.source);
        }
        self.wait();
    }
}

impl Shared {
    fn run(&self, params: &ScanParameters, single_row: Option<usize>) {
        let span = tracing::info_span!("scan", source = %self.source, rows = params.n_rows());
        let _enter = span.enter();

        let outcome = self.execute(params, single_row);
        self.return_to_origin(params);

        let (state, event, requested) = match outcome {
            Ok(Outcome::Completed) => (ScanState::Finished, ScanEvent::Finished, 0.0),
            Ok(Outcome::FinishRequested) => (ScanState::Finished, ScanEvent::Finished, 1.0),
            Ok(Outcome::Stopped) => (ScanState::Idle, ScanEvent::Stopped, 0.0),
            Err(e) => {
                log::error!("{}: scan aborted: {e}", self.source);
                (ScanState::Idle, ScanEvent::Stopped, 0.0)
            }
        };
        let mut data = self.positions();
        if event == ScanEvent::Finished {
            data.insert("requested".to_string(), requested);
        }
        self.emit(event, data);

        lock(&self.progress).row = None;
        *lock(&self.state) = state;
        log::info!("{}: scan {state}", self.source);
    }

    fn execute(
        &self,
        params: &ScanParameters,
        single_row: Option<usize>,
    ) -> Result<Outcome, ScanError> {
        let row_length = self.stage.to_mm(Axis::X, params.row_steps);
        self.emit(
            ScanEvent::Init,
            BTreeMap::from([
                ("n_rows".to_string(), params.n_rows() as f64),
                ("pitch".to_string(), params.pitch),
                ("row_length".to_string(), row_length),
                ("speed".to_string(), params.speed),
            ]),
        );

        self.stage.move_abs(Axis::X, params.start[0])?;
        self.stage.move_abs(Axis::Y, params.rows[0])?;
        self.stage.set_speed(Axis::X, params.speed)?;

        let n_rows = params.n_rows();
        let mut swept: u64 = 0;
        let mut pass: u32 = 0;
        loop {
            if params.passes.is_some_and(|passes| pass >= passes) {
                return Ok(Outcome::Completed);
            }
            lock(&self.progress).pass = pass;

            let order: Box<dyn Iterator<Item = usize>> = if pass % 2 == 0 {
                Box::new(0..n_rows)
            } else {
                Box::new((0..n_rows).rev())
            };
            for index in order {
                let row = single_row.unwrap_or(index);
                if self.stop.load(Ordering::Acquire) || !self.wait_for_beam(pass, row) {
                    return Ok(Outcome::Stopped);
                }
                let direction = if swept % 2 == 0 { 1 } else { -1 };
                self.scan_row(params, pass, index, row, direction)?;
                swept += 1;
            }

            pass += 1;
            if self.finish.load(Ordering::Acquire) {
                return Ok(Outcome::FinishRequested);
            }
        }
    }

    /// Block while there is no beam. Returns `false` if stopped meanwhile.
    fn wait_for_beam(&self, pass: u32, row: usize) -> bool {
        if !self.no_beam.load(Ordering::Acquire) {
            return true;
        }

        self.transition(ScanState::Running, ScanState::Paused);
        self.emit(ScanEvent::Paused, Self::row_data(pass, row));
        log::warn!(
            "{}: no beam before row {row} of pass {pass}, waiting",
            self.source
        );

        while self.no_beam.load(Ordering::Acquire) {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            thread::sleep(BEAM_POLL);
        }

        self.transition(ScanState::Paused, ScanState::Running);
        self.emit(ScanEvent::Resumed, Self::row_data(pass, row));
        !self.stop.load(Ordering::Acquire)
    }

    fn scan_row(
        &self,
        params: &ScanParameters,
        pass: u32,
        index: usize,
        row: usize,
        direction: i64,
    ) -> Result<(), ScanError> {
        self.stage.move_abs(Axis::Y, params.rows[index])?;
        lock(&self.progress).row = Some(row);

        let mut data = Self::row_data(pass, row);
        data.extend(self.positions());
        self.emit(ScanEvent::RowStart, data);

        if let Err(e) = self.stage.move_rel(Axis::X, direction * params.row_steps) {
            self.emit(ScanEvent::RowAbort, Self::row_data(pass, row));
            return Err(e.into());
        }

        let mut data = Self::row_data(pass, row);
        data.extend(self.positions());
        self.emit(ScanEvent::RowStop, data);
        Ok(())
    }

    fn return_to_origin(&self, params: &ScanParameters) {
        for axis in Axis::ALL {
            if let Err(e) = self.stage.set_speed(axis, RETURN_SPEED) {
                log::warn!("{}: resetting {axis:?} speed failed: {e}", self.source);
            }
        }
        // Y first so the way back does not cross the device under test.
        for axis in [Axis::Y, Axis::X] {
            if let Err(e) = self.stage.move_abs(axis, params.origin[axis.index()]) {
                log::error!("{}: returning {axis:?} to origin failed: {e}", self.source);
            }
        }
    }

    fn transition(&self, from: ScanState, to: ScanState) {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
        }
    }

    fn row_data(pass: u32, row: usize) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("pass".to_string(), f64::from(pass)),
            ("row".to_string(), row as f64),
        ])
    }

    fn positions(&self) -> BTreeMap<String, f64> {
        let mut data = BTreeMap::new();
        for (axis, key) in [(Axis::X, "x"), (Axis::Y, "y")] {
            match self.stage.position(axis) {
                Ok(steps) => {
                    data.insert(key.to_string(), self.stage.to_mm(axis, steps));
                }
                Err(e) => log::warn!("{}: reading {axis:?} position failed: {e}", self.source),
            }
        }
        data
    }

    fn emit(&self, event: ScanEvent, data: BTreeMap<String, f64>) {
        let sample = TelemetrySample::scan(self.source.clone(), event, data);
        if self.telemetry.send(sample).is_err() {
            log::debug!("{}: telemetry channel closed", self.source);
        }
    }
}
