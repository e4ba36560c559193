use serde::Deserialize;
use serialport::SerialPort;
use std::fmt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Per-read timeout of the underlying serial port. Frame deadlines are
/// enforced on top of this by [`FramedTransport::read`].
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Byte-oriented connection a [`FramedTransport`] exclusively owns.
pub trait Link: Read + Write + Send {
    /// Discard everything buffered in both directions.
    fn clear(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for Box<dyn SerialPort> {
    fn clear(&mut self) -> io::Result<()> {
        SerialPort::clear(&**self, serialport::ClearBuffer::All)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout: no {terminator:?} terminator within {timeout:?}, got '{partial}'")]
    Timeout {
        terminator: String,
        timeout: Duration,
        partial: String,
    },

    #[error("Echo mismatch: sent '{sent}' but device echoed '{echoed}'")]
    EchoMismatch { sent: String, echoed: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Physical parameters of a serial link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkConfig {
    pub port: String,
    #[serde(default = "LinkConfig::default_baud_rate")]
    pub baud_rate: u32,
    /// Maximum time to wait for a terminated reply.
    #[serde(default = "LinkConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl LinkConfig {
    pub const DEFAULT_BAUD_RATE: u32 = 9600;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    fn default_baud_rate() -> u32 {
        Self::DEFAULT_BAUD_RATE
    }

    fn default_timeout() -> Duration {
        Self::DEFAULT_TIMEOUT
    }

    /// Open the serial port described by this configuration.
    pub fn open(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        log::debug!("Opening {} at {} baud", self.port, self.baud_rate);
        let serial = serialport::new(&self.port, self.baud_rate)
            .timeout(PORT_POLL_TIMEOUT)
            .open()?;
        Ok(serial)
    }
}

/// How fields are delimited and frames terminated on one link.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub delimiter: String,
    pub write_terminator: String,
    pub read_terminator: String,
    /// The device echoes every frame it receives before answering.
    pub echo: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self::new(":", "\n")
    }
}

impl FramingConfig {
    pub fn new(delimiter: impl Into<String>, terminator: impl Into<String>) -> Self {
        let terminator = terminator.into();
        Self {
            delimiter: delimiter.into(),
            write_terminator: terminator.clone(),
            read_terminator: terminator,
            echo: false,
        }
    }

    pub fn with_read_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.read_terminator = terminator.into();
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

/// One unit of serial communication: an ordered list of fields.
///
/// Fields must not contain the delimiter or terminator of the link they are
/// sent over; drivers are responsible for sanitising what they put in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    fields: Vec<String>,
}

impl Frame {
    pub fn new(command: impl fmt::Display) -> Self {
        Self {
            fields: vec![command.to_string()],
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.fields.push(value.to_string());
        self
    }

    #[must_use]
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        self.fields
            .extend(values.into_iter().map(|value| value.to_string()));
        self
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Delimited payload without the terminator.
    pub fn payload(&self, framing: &FramingConfig) -> String {
        let mut payload = self.fields.join(&framing.delimiter);
        payload.push_str(&framing.delimiter);
        payload
    }

    /// Bytes as they go on the wire.
    pub fn encode(&self, framing: &FramingConfig) -> Vec<u8> {
        let mut bytes = self.payload(framing).into_bytes();
        bytes.extend_from_slice(framing.write_terminator.as_bytes());
        bytes
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(" "))
    }
}

impl<S: Into<String>> FromIterator<S> for Frame {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Terminator-delimited write/read/query over an exclusively owned [`Link`].
///
/// Not safe for concurrent use; share it through a
/// [`CommandProxy`](crate::command_proxy::CommandProxy).
pub struct FramedTransport {
    link: Box<dyn Link>,
    framing: FramingConfig,
    timeout: Duration,
}

impl FramedTransport {
    /// Open the serial port described by `link`.
    pub fn open(link: &LinkConfig, framing: FramingConfig) -> Result<Self, TransportError> {
        let serial = link.open()?;
        let mut transport = Self::new(Box::new(serial), framing, link.timeout);
        transport.link.clear()?;
        Ok(transport)
    }

    pub fn new(link: Box<dyn Link>, framing: FramingConfig, timeout: Duration) -> Self {
        Self {
            link,
            framing,
            timeout,
        }
    }

    pub fn framing(&self) -> &FramingConfig {
        &self.framing
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Drop whatever is buffered on the link, e.g. after a device reboot.
    pub fn reset_buffers(&mut self) -> Result<(), TransportError> {
        self.link.clear()?;
        Ok(())
    }

    /// Send one frame. Echoing devices have their echo consumed and checked.
    pub fn write(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode(&self.framing);
        self.link.write_all(&bytes)?;
        self.link.flush()?;
        log::trace!("-> {:?}", String::from_utf8_lossy(&bytes));

        if self.framing.echo {
            let sent = frame.payload(&self.framing);
            let echoed = self.read_line()?;
            if echoed != sent {
                return Err(TransportError::EchoMismatch { sent, echoed });
            }
        }
        Ok(())
    }

    /// Block until a full reply arrives and return it without its terminator.
    pub fn read(&mut self) -> Result<String, TransportError> {
        let line = self.read_line()?;
        log::trace!("<- {line:?}");
        Ok(line)
    }

    pub fn query(&mut self, frame: &Frame) -> Result<String, TransportError> {
        self.write(frame)?;
        self.read()
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let terminator = self.framing.read_terminator.as_bytes();
        let mut response = Vec::new();
        let started = Instant::now();

        loop {
            let mut byte = [0u8; 1];
            match self.link.read(&mut byte) {
                Ok(1) => {
                    response.push(byte[0]);
                    if !terminator.is_empty() && response.ends_with(terminator) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= self.timeout {
                return Err(TransportError::Timeout {
                    terminator: self.framing.read_terminator.clone(),
                    timeout: self.timeout,
                    partial: String::from_utf8_lossy(&response).into_owned(),
                });
            }
        }

        response.truncate(response.len() - terminator.len());
        let line = String::from_utf8(response)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
