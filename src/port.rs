use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::SerialConfig;
use crate::frame::{RawFrame, printable};

/// Granularity of a single blocking read; `recv_until` enforces the overall deadline.
const READ_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("open {port}: {reason}")]
    Connection { port: String, reason: String },
    #[error("serial write: {0}")]
    Write(#[source] io::Error),
    #[error("serial read: {0}")]
    Read(#[source] io::Error),
    #[error("no terminator within {0:?}")]
    Timeout(Duration),
    #[error("stream closed mid-frame after {} byte(s)", .0.bytes.len())]
    Framing(RawFrame),
    #[error("port is closed")]
    Closed,
    #[error("enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
}

/// Byte-level link to the controller. One request in flight, one owner.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn recv_until(&mut self, terminator: &[u8], timeout: Duration)
    -> Result<RawFrame, TransportError>;
    /// Drop whatever arrived but was not read, e.g. a reply that came in
    /// after its read timed out.
    fn discard_input(&mut self) -> Result<(), TransportError>;
    /// Release the link. Safe to call more than once.
    fn close(&mut self);
}

pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open the port 8N1 without flow control at the configured baud rate.
    pub fn open(cfg: &SerialConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&cfg.port, cfg.baud)
            .timeout(READ_SLICE.min(cfg.timeout()))
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|e| TransportError::Connection {
                port: cfg.port.clone(),
                reason: e.to_string(),
            })?;
        info!(target: "port", "opened {} at {} baud", cfg.port, cfg.baud);
        Ok(Self::from_port(&cfg.port, port))
    }

    /// Wrap a port that is already open and configured.
    pub fn from_port(name: &str, port: Box<dyn SerialPort>) -> Self {
        Self {
            name: name.to_string(),
            port: Some(port),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        trace!(target: "tx", "{}", printable(bytes));
        port.write_all(bytes).map_err(TransportError::Write)?;
        port.flush().map_err(TransportError::Write)
    }

    fn recv_until(
        &mut self,
        terminator: &[u8],
        timeout: Duration,
    ) -> Result<RawFrame, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let frame = read_frame(&mut **port, terminator, timeout)?;
        trace!(target: "rx", "{}", printable(&frame.bytes));
        Ok(frame)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        if let Ok(n) = port.bytes_to_read()
            && n > 0
        {
            debug!(target: "rx", "discarding {} stale byte(s)", n);
        }
        port.clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Read(e.into()))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(target: "port", "closed {}", self.name);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read byte by byte until `terminator`, which is stripped from the frame.
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    terminator: &[u8],
    timeout: Duration,
) -> Result<RawFrame, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            debug!(target: "rx", "timeout with {} byte(s) pending", buf.len());
            return Err(TransportError::Timeout(timeout));
        }
        match reader.read(&mut byte) {
            Ok(0) => return Err(TransportError::Framing(RawFrame::partial(buf))),
            Ok(_) => {
                buf.push(byte[0]);
                if !terminator.is_empty() && buf.ends_with(terminator) {
                    buf.truncate(buf.len() - terminator.len());
                    return Ok(RawFrame::terminated(buf));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(TransportError::Read(e)),
        }
    }
}

/// Names of serial ports visible to the OS.
pub fn list_ports() -> Result<Vec<String>, TransportError> {
    port_names(serialport::available_ports())
}

fn port_names(
    found: serialport::Result<Vec<serialport::SerialPortInfo>>,
) -> Result<Vec<String>, TransportError> {
    let mut names: Vec<String> = found
        .map_err(TransportError::Enumerate)?
        .into_iter()
        .map(|p| p.port_name)
        .collect();
    names.sort();
    Ok(names)
}
