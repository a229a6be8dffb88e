//! Command handshake: command → ACK/NAK → ENQ → payload.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::command::{Command, Mnemonic};
use super::error::ProtocolError;
use super::parser::{Acknowledgment, PayloadError, parse_ack};
use crate::config::SerialConfig;
use crate::frame::{CRLF, ENQ, RawFrame, build_frame, printable};
use crate::port::{Transport, TransportError};

/// One completed round trip: the payload text exactly as received and the
/// value the caller's parser produced from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub payload: String,
    pub value: T,
}

pub struct ProtocolEngine<T: Transport> {
    transport: T,
    timeout: Duration,
    max_retries: u32,
}

impl<T: Transport> ProtocolEngine<T> {
    pub fn new(transport: T, cfg: &SerialConfig) -> Self {
        Self {
            transport,
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Run the handshake for `cmd`, retrying the whole sequence on NAK,
    /// timeout or a malformed reply. `deadline` is checked between attempts
    /// only, never in the middle of a read.
    pub fn transact<V, F>(
        &mut self,
        cmd: &Command,
        deadline: Option<Instant>,
        parse: F,
    ) -> Result<Response<V>, ProtocolError>
    where
        F: Fn(&str) -> Result<V, PayloadError>,
    {
        let mut attempt = 1;
        loop {
            let err = match self.attempt(cmd, &parse) {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt > self.max_retries {
                return Err(err);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(ProtocolError::DeadlineExceeded {
                    mnemonic: cmd.mnemonic(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!(
                target: "proto",
                "{} attempt {}/{} failed: {}",
                cmd.mnemonic(),
                attempt,
                self.max_retries + 1,
                err
            );
            attempt += 1;
        }
    }

    fn attempt<V, F>(&mut self, cmd: &Command, parse: &F) -> Result<Response<V>, ProtocolError>
    where
        F: Fn(&str) -> Result<V, PayloadError>,
    {
        let mnemonic = cmd.mnemonic();

        // A reply that outlived an earlier read must not be taken for this one.
        self.transport.discard_input()?;

        // Idle -> AwaitAck
        let out = build_frame(cmd);
        debug!(target: "tx", "{}", printable(&out));
        self.transport.send(&out)?;

        let line = self.recv(mnemonic)?;
        match parse_ack(&line.bytes).map_err(|source| ProtocolError::Malformed { mnemonic, source })? {
            Acknowledgment::Ack => {}
            Acknowledgment::Nak(code) => return Err(ProtocolError::Nak { mnemonic, code }),
        }

        // RequestData -> AwaitPayload
        self.transport.send(&[ENQ])?;
        let frame = self.recv(mnemonic)?;
        let payload = frame.text();
        debug!(target: "rx", "{} -> {}", mnemonic, printable(payload.as_bytes()));
        let value =
            parse(&payload).map_err(|source| ProtocolError::Malformed { mnemonic, source })?;
        Ok(Response { payload, value })
    }

    fn recv(&mut self, mnemonic: Mnemonic) -> Result<RawFrame, ProtocolError> {
        self.transport
            .recv_until(CRLF, self.timeout)
            .map_err(|e| match e {
                TransportError::Timeout(timeout) => ProtocolError::Timeout { mnemonic, timeout },
                other => ProtocolError::Transport(other),
            })
    }
}
