//! Serialised, thread-safe access to one [`FramedTransport`] with an
//! optional keep-alive for devices guarded by a firmware watchdog.
//!
//! Every call is queued as an envelope and executed in FIFO order by a single
//! worker thread that owns the transport. Before draining the queue, each
//! worker iteration checks whether a keep-alive ping is due and sends it
//! directly, on a fixed-rate schedule. A ping can only go out between
//! envelopes, so the cadence holds while individual hardware round-trips
//! stay well below the ping interval; nothing enforces that.
//!
//! A device that misses its pings reverts to its own safe state. That is the
//! intended fail-safe and is not reported as a communication error.

use crate::device::{DeviceError, FrameIo};
use crate::serial_transport::{Frame, FramedTransport, TransportError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_POLL_PERIOD: Duration = Duration::from_millis(10);
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Ping frame and the cadence it must be sent at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub frame: Frame,
    pub interval: Duration,
}

impl KeepAlive {
    pub fn new(frame: Frame, interval: Duration) -> Self {
        Self { frame, interval }
    }

    fn poll_period(&self) -> Duration {
        (self.interval / 10).clamp(MIN_POLL_PERIOD, MAX_POLL_PERIOD)
    }
}

type ReplySlot<T> = Sender<Result<T, TransportError>>;

enum Envelope {
    Write(Frame),
    Read(ReplySlot<String>),
    Query(Frame, ReplySlot<String>),
    Exchange(Frame, usize, ReplySlot<Vec<String>>),
    SetTimeout(Duration, ReplySlot<()>),
}

pub struct CommandProxy {
    name: String,
    queue: Sender<Envelope>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<FramedTransport>>>,
}

impl CommandProxy {
    /// Move `transport` into a freshly spawned worker.
    pub fn spawn(
        name: impl Into<String>,
        transport: FramedTransport,
        keep_alive: Option<KeepAlive>,
    ) -> Result<Self, DeviceError> {
        let name = name.into();
        let (queue, commands) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            name: name.clone(),
            poll: keep_alive
                .as_ref()
                .map_or(MAX_POLL_PERIOD, KeepAlive::poll_period),
            transport,
            keep_alive,
            commands,
            stop: stop.clone(),
            next_ping: None,
        };
        let handle = thread::Builder::new()
            .name(format!("{name}-proxy"))
            .spawn(move || worker.run())
            .map_err(TransportError::from)?;

        Ok(Self {
            name,
            queue,
            stop,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn closed(&self) -> DeviceError {
        DeviceError::ProxyClosed {
            device: self.name.clone(),
        }
    }

    fn submit<T>(
        &self,
        envelope: impl FnOnce(ReplySlot<T>) -> Envelope,
    ) -> Result<T, DeviceError> {
        let (slot, result) = bounded(1);
        self.queue
            .send(envelope(slot))
            .map_err(|_| self.closed())?;
        let reply = result.recv().map_err(|_| self.closed())?;
        Ok(reply?)
    }

    /// Stop the worker after its in-flight envelope, join it and close the
    /// link. Envelopes still queued fail with [`DeviceError::ProxyClosed`].
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            match handle.join() {
                Ok(transport) => {
                    drop(transport);
                    log::debug!("{}: link closed", self.name);
                }
                Err(_) => log::error!("{}: command worker panicked", self.name),
            }
        }
    }
}

impl FrameIo for CommandProxy {
    fn write(&self, frame: Frame) -> Result<(), DeviceError> {
        self.queue
            .send(Envelope::Write(frame))
            .map_err(|_| self.closed())
    }

    fn read(&self) -> Result<String, DeviceError> {
        self.submit(Envelope::Read)
    }

    fn query(&self, frame: Frame) -> Result<String, DeviceError> {
        self.submit(|slot| Envelope::Query(frame, slot))
    }

    fn exchange(&self, frame: Frame, replies: usize) -> Result<Vec<String>, DeviceError> {
        self.submit(|slot| Envelope::Exchange(frame, replies, slot))
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.submit(|slot| Envelope::SetTimeout(timeout, slot))
    }

    fn shutdown(&self) {
        Self::shutdown(self);
    }
}

impl Drop for CommandProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    name: String,
    transport: FramedTransport,
    keep_alive: Option<KeepAlive>,
    commands: Receiver<Envelope>,
    stop: Arc<AtomicBool>,
    next_ping: Option<Instant>,
    poll: Duration,
}

impl Worker {
    fn run(mut self) -> FramedTransport {
        log::debug!("{}: command worker started", self.name);
        let mut pending = VecDeque::new();

        while !self.stop.load(Ordering::Acquire) {
            #[cfg(feature = "cpu-profiling")]
            let _span = tracy_client::span!("command proxy iteration");

            self.ping_if_due();

            pending.extend(self.commands.try_iter());
            while let Some(envelope) = pending.pop_front() {
                self.execute(envelope);
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
            }

            match self.commands.recv_timeout(self.idle_wait()) {
                Ok(envelope) => pending.push_back(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            log::warn!(
                "{}: dropping {} queued commands on shutdown",
                self.name,
                pending.len()
            );
        }
        log::debug!("{}: command worker stopped", self.name);
        self.transport
    }

    /// Pings run on a fixed schedule from the first one. Slots missed
    /// behind a long command are skipped rather than sent in a burst.
    fn ping_if_due(&mut self) {
        let Some(keep_alive) = &self.keep_alive else {
            return;
        };
        let now = Instant::now();
        if self.next_ping.is_some_and(|next| now < next) {
            return;
        }

        if let Err(e) = self.transport.write(&keep_alive.frame) {
            log::warn!("{}: keep-alive ping failed: {e}", self.name);
        }

        let mut next = self.next_ping.unwrap_or(now) + keep_alive.interval;
        while next <= now {
            next += keep_alive.interval;
        }
        self.next_ping = Some(next);
    }

    fn idle_wait(&self) -> Duration {
        self.next_ping.map_or(self.poll, |next| {
            next.saturating_duration_since(Instant::now()).min(self.poll)
        })
    }

    fn execute(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Write(frame) => {
                if let Err(e) = self.transport.write(&frame) {
                    log::error!("{}: writing '{frame}' failed: {e}", self.name);
                }
            }
            Envelope::Read(slot) => {
                let _ = slot.send(self.transport.read());
            }
            Envelope::Query(frame, slot) => {
                let _ = slot.send(self.transport.query(&frame));
            }
            Envelope::Exchange(frame, replies, slot) => {
                let result = self
                    .transport
                    .write(&frame)
                    .and_then(|()| (0..replies).map(|_| self.transport.read()).collect());
                let _ = slot.send(result);
            }
            Envelope::SetTimeout(timeout, slot) => {
                log::debug!("{}: link timeout set to {timeout:?}", self.name);
                self.transport.set_timeout(timeout);
                let _ = slot.send(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ErrorKind;
    use crate::serial_transport::FramingConfig;
    use crate::sim_link::{SimHandle, SimLink};

    fn echo_proxy(keep_alive: Option<KeepAlive>) -> (CommandProxy, SimHandle) {
        let framing = FramingConfig::default();
        let (link, handle) = SimLink::echo(&framing);
        let transport =
            FramedTransport::new(Box::new(link), framing, Duration::from_millis(200));
        let proxy = CommandProxy::spawn("echo", transport, keep_alive).unwrap();
        (proxy, handle)
    }

    #[test]
    fn test_query_round_trip() {
        let (proxy, _handle) = echo_proxy(None);
        let reply = proxy.query(Frame::new("T").arg(3)).unwrap();
        assert_eq!(reply, "T:3:");
    }

    #[test]
    fn test_concurrent_callers_each_get_their_own_reply_in_order() {
        let (proxy, handle) = echo_proxy(None);
        let proxy = Arc::new(proxy);
        const CALLERS: usize = 8;
        const CALLS: usize = 25;

        let threads: Vec<_> = (0..CALLERS)
            .map(|caller| {
                let proxy = proxy.clone();
                thread::spawn(move || {
                    for call in 0..CALLS {
                        let frame = Frame::new("Q").arg(caller).arg(call);
                        let reply = proxy.query(frame).unwrap();
                        assert_eq!(reply, format!("Q:{caller}:{call}:"));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let frames = handle.frames();
        assert_eq!(frames.len(), CALLERS * CALLS);
        for caller in 0..CALLERS {
            let prefix = format!("Q:{caller}:");
            let calls: Vec<usize> = frames
                .iter()
                .filter_map(|f| f.strip_prefix(&prefix))
                .map(|rest| rest.trim_end_matches(':').parse().unwrap())
                .collect();
            assert_eq!(calls, (0..CALLS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_keep_alive_cadence_while_idle() {
        let interval = Duration::from_millis(20);
        let started = Instant::now();
        let (proxy, handle) = echo_proxy(Some(KeepAlive::new(Frame::new("P"), interval)));

        thread::sleep(interval * 150);
        proxy.shutdown();
        let elapsed = started.elapsed();

        let pings = handle.count("P:");
        let expected = (elapsed.as_millis() / interval.as_millis()) as usize;
        assert!(
            pings + 1 >= expected && pings <= expected + 1,
            "{pings} pings in {elapsed:?}"
        );
    }

    #[test]
    fn test_pings_continue_under_command_load() {
        let interval = Duration::from_millis(50);
        let (proxy, handle) = echo_proxy(Some(KeepAlive::new(Frame::new("P"), interval)));

        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(500) {
            proxy.query(Frame::new("F")).unwrap();
        }
        proxy.shutdown();

        assert!(handle.count("P:") >= 8);
        assert!(handle.count("F:") > 0);
    }

    #[test]
    fn test_failure_is_isolated_to_its_caller() {
        let framing = FramingConfig::default();
        let (link, _handle) = SimLink::with_responder(&framing, |line| {
            if line.starts_with("MUTE") {
                Vec::new()
            } else {
                vec![line.to_string()]
            }
        });
        let transport =
            FramedTransport::new(Box::new(link), framing, Duration::from_millis(50));
        let proxy = CommandProxy::spawn("flaky", transport, None).unwrap();

        let err = proxy.query(Frame::new("MUTE")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportTimeout);
        assert_eq!(proxy.query(Frame::new("A")).unwrap(), "A:");
    }

    #[test]
    fn test_exchange_collects_all_replies() {
        let framing = FramingConfig::default();
        let (link, _handle) = SimLink::with_responder(&framing, |line| {
            line.trim_end_matches(':')
                .split(':')
                .skip(1)
                .map(|pin| format!("2{pin}.5"))
                .collect()
        });
        let transport =
            FramedTransport::new(Box::new(link), framing, Duration::from_millis(100));
        let proxy = CommandProxy::spawn("ntc", transport, None).unwrap();

        let replies = proxy.exchange(Frame::new("T").args([0, 1, 2]), 3).unwrap();
        assert_eq!(replies, vec!["20.5", "21.5", "22.5"]);
    }

    #[test]
    fn test_calls_after_shutdown_fail_cleanly() {
        let (proxy, _handle) = echo_proxy(None);
        proxy.shutdown();
        assert!(!proxy.is_running());
        let err = proxy.query(Frame::new("T")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert!(proxy.write(Frame::new("T")).is_err());
        proxy.shutdown();
    }
}
