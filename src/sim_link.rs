//! In-memory stand-in for a serial device, used by the unit tests.

use crate::serial_transport::{FramingConfig, Link};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct SimState {
    written: Vec<u8>,
    pending: Vec<u8>,
    frames: Vec<String>,
    rx: VecDeque<u8>,
    write_terminator: String,
    read_terminator: String,
    responder: Responder,
}

/// Simulated device end of a link. Every complete frame written to it is
/// handed to a responder whose replies become readable.
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
}

/// Inspection handle that stays with the test after the link is moved away.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl SimLink {
    pub fn with_responder<F>(framing: &FramingConfig, responder: F) -> (Self, SimHandle)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(SimState {
            written: Vec::new(),
            pending: Vec::new(),
            frames: Vec::new(),
            rx: VecDeque::new(),
            write_terminator: framing.write_terminator.clone(),
            read_terminator: framing.read_terminator.clone(),
            responder: Box::new(responder),
        }));
        (
            Self {
                state: state.clone(),
            },
            SimHandle { state },
        )
    }

    /// Device that answers every frame with the frame itself.
    pub fn echo(framing: &FramingConfig) -> (Self, SimHandle) {
        Self::with_responder(framing, |line| vec![line.to_string()])
    }

    /// Device that never answers.
    pub fn silent(framing: &FramingConfig) -> (Self, SimHandle) {
        Self::with_responder(framing, |_| Vec::new())
    }
}

impl SimHandle {
    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Complete frames received so far, terminators stripped.
    pub fn frames(&self) -> Vec<String> {
        lock(&self.state).frames.clone()
    }

    pub fn count(&self, frame: &str) -> usize {
        lock(&self.state)
            .frames
            .iter()
            .filter(|f| f.as_str() == frame)
            .count()
    }

    /// Make raw bytes readable without a preceding request.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes);
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = lock(&self.state);
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        thread::sleep(Duration::from_millis(1));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        state.written.extend_from_slice(buf);
        state.pending.extend_from_slice(buf);

        let terminator = state.write_terminator.clone().into_bytes();
        while let Some(end) = state
            .pending
            .windows(terminator.len())
            .position(|window| window == terminator.as_slice())
        {
            let line: Vec<u8> = state.pending.drain(..end + terminator.len()).collect();
            let line = String::from_utf8_lossy(&line[..end]).into_owned();
            let replies = (state.responder)(&line);
            state.frames.push(line);
            let read_terminator = state.read_terminator.clone();
            for reply in replies {
                state.rx.extend(reply.into_bytes());
                state.rx.extend(read_terminator.as_bytes());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for SimLink {
    fn clear(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.rx.clear();
        state.pending.clear();
        Ok(())
    }
}
