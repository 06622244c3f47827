//! Line-oriented byte transports underneath a [`DeviceLink`](crate::link::DeviceLink).
//!
//! Instruments speak newline-terminated ASCII either over a serial port or over a TCP socket. A
//! [`Transport`] hides which one: it writes a command line and reads one reply line with a timeout.
//! [`SimulatedTransport`] stands in for real hardware in tests and in the demo binary.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tracing::trace;

use labsched_backend::{SchedulerError, TaskError};

/// Normalises a user-supplied channel address.
///
/// Bare serial port numbers become `COM<n>` (`"3"` and `"com3"` both give `"COM3"`), device paths
/// like `/dev/ttyUSB0` and `host:port` network addresses are kept as they are. Anything else is a
/// configuration error.
pub fn normalize_channel(address: &str) -> Result<String, SchedulerError> {
    let re = Regex::new(
        r"^(?:(?i:com)?(?P<com>\d+)|(?P<dev>/dev/tty[\w.-]+)|(?P<net>[\w.-]+:\d{1,5}))$",
    )
    .map_err(|e| SchedulerError::Config(e.to_string()))?;
    let address = address.trim();
    let caps = re.captures(address).ok_or_else(|| {
        SchedulerError::Config(format!("unrecognised channel address {:?}", address))
    })?;
    Ok(match caps.name("com") {
        Some(port) => format!("COM{}", port.as_str()),
        None => address.to_string(),
    })
}

pub trait Transport: Send {
    fn write_line(&mut self, line: &str) -> Result<(), TaskError>;

    /// Reads one reply line without its terminator; `Ok(None)` if nothing arrived within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TaskError>;
}

pub struct TcpTransport {
    address: String,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    /// Opens a connection to a network instrument at `address` (`host:port`).
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, TaskError> {
        let addr = address
            .to_socket_addrs()
            .map_err(|e| io_error(address, e))?
            .next()
            .ok_or_else(|| TaskError::Device(format!("{}: address did not resolve", address)))?;
        let writer = TcpStream::connect_timeout(&addr, timeout).map_err(|e| io_error(address, e))?;
        writer.set_nodelay(true).map_err(|e| io_error(address, e))?;
        let reader = BufReader::new(writer.try_clone().map_err(|e| io_error(address, e))?);
        Ok(Self {
            address: address.to_string(),
            writer,
            reader,
        })
    }
}

impl Transport for TcpTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TaskError> {
        trace!(address = %self.address, line, "tcp write");
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| io_error(&self.address, e))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TaskError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| io_error(&self.address, e))?;
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(TaskError::Device(format!(
                "{}: connection closed by instrument",
                self.address
            ))),
            Ok(_) => {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                trace!(address = %self.address, line = %line, "tcp read");
                Ok(Some(line))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(io_error(&self.address, e)),
        }
    }
}

fn io_error(address: &str, e: io::Error) -> TaskError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TaskError::CommunicationTimeout {
            channel: address.to_string(),
            attempts: 1,
        },
        _ => TaskError::Device(format!("{}: {}", address, e)),
    }
}

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// An instrument simulated in-process.
///
/// Every written line is recorded and handed to the responder; its answer (if any) becomes the next
/// line to read. With a latency above the read timeout the reply is "late" and the read times out.
pub struct SimulatedTransport {
    responder: Responder,
    latency: Duration,
    replies: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl SimulatedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency: Duration::ZERO,
            replies: VecDeque::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers each command from a fixed table; unknown commands get `ERR unknown command`.
    pub fn scripted(replies: HashMap<String, String>) -> Self {
        Self::new(move |line| {
            Some(
                replies
                    .get(line)
                    .cloned()
                    .unwrap_or_else(|| "ERR unknown command".to_string()),
            )
        })
    }

    /// An instrument that never answers.
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared log of every line written so far.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

impl Transport for SimulatedTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TaskError> {
        self.sent.lock().push(line.to_string());
        if let Some(reply) = (self.responder)(line) {
            self.replies.push_back(reply);
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TaskError> {
        if self.latency > timeout {
            thread::sleep(timeout);
            // The late reply is lost, as with a serial buffer flushed before the next command
            self.replies.pop_front();
            return Ok(None);
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        Ok(self.replies.pop_front())
    }
}
