//! Scripted transport double shared by the unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::frame::{ACK, ENQ, NAK, RawFrame};
use crate::port::{Transport, TransportError};

enum Reply {
    Line(Vec<u8>),
    Silence,
}

/// Plays back device replies in order and captures every byte written.
/// An exhausted script behaves like a silent device.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: VecDeque<Reply>,
    pub(crate) sent: Vec<Vec<u8>>,
    pub(crate) closed: u32,
    pub(crate) discards: u32,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn line(mut self, bytes: &[u8]) -> Self {
        self.replies.push_back(Reply::Line(bytes.to_vec()));
        self
    }

    pub(crate) fn silence(mut self) -> Self {
        self.replies.push_back(Reply::Silence);
        self
    }

    /// ACK followed by the payload the device hands over after ENQ.
    pub(crate) fn exchange(self, payload: &str) -> Self {
        self.line(&[ACK]).line(payload.as_bytes())
    }

    pub(crate) fn nak(self, code: &str) -> Self {
        let mut line = vec![NAK];
        line.extend_from_slice(code.as_bytes());
        self.line(&line)
    }

    /// All written bytes, concatenated.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.sent.concat()
    }

    /// Written chunks that were commands rather than ENQ.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.sent
            .iter()
            .filter(|s| s.as_slice() != [ENQ])
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    pub(crate) fn enq_count(&self) -> usize {
        self.sent.iter().filter(|s| s.as_slice() == [ENQ]).count()
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed > 0 {
            return Err(TransportError::Closed);
        }
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn recv_until(
        &mut self,
        _terminator: &[u8],
        timeout: Duration,
    ) -> Result<RawFrame, TransportError> {
        if self.closed > 0 {
            return Err(TransportError::Closed);
        }
        match self.replies.pop_front() {
            Some(Reply::Line(bytes)) => Ok(RawFrame::terminated(bytes)),
            Some(Reply::Silence) | None => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Scripted replies model what the device sends next, so nothing is dropped.
    fn discard_input(&mut self) -> Result<(), TransportError> {
        if self.closed > 0 {
            return Err(TransportError::Closed);
        }
        self.discards += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.closed += 1;
    }
}
