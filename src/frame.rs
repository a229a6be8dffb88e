use std::fmt::Write as _;

use crate::proto::command::Command;

// ---- Control bytes ----
pub const ETX: u8 = 0x03;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;

/// Terminator for commands and replies.
pub const CRLF: &[u8] = &[CR, LF];

/// Bytes read off the wire up to (not including) a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub terminated: bool,
}

impl RawFrame {
    pub fn terminated(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            terminated: true,
        }
    }

    pub fn partial(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            terminated: false,
        }
    }

    /// Payload text with a trailing ETX removed, if the device sent one.
    pub fn text(&self) -> String {
        let end = match self.bytes.last() {
            Some(&ETX) => self.bytes.len() - 1,
            _ => self.bytes.len(),
        };
        String::from_utf8_lossy(&self.bytes[..end]).into_owned()
    }
}

/// Encode a command as it goes on the wire, CR LF included.
pub fn build_frame(cmd: &Command) -> Vec<u8> {
    let line = cmd.encode();
    let mut out = Vec::with_capacity(line.len() + CRLF.len());
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(CRLF);
    out
}

/// Render bytes for log lines, naming the control characters.
pub fn printable(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            ETX => s.push_str("<ETX>"),
            ENQ => s.push_str("<ENQ>"),
            ACK => s.push_str("<ACK>"),
            NAK => s.push_str("<NAK>"),
            CR => s.push_str("<CR>"),
            LF => s.push_str("<LF>"),
            0x20..=0x7E => s.push(b as char),
            _ => {
                let _ = write!(s, "<{:02X}>", b);
            }
        }
    }
    s
}
