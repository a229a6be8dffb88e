//! Protocol errors

use std::time::Duration;

use thiserror::Error;

use super::command::Mnemonic;
use super::parser::{DeviceError, PayloadError};
use crate::port::TransportError;

/// Errors surfaced by the handshake once local retries are spent.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{mnemonic} rejected by device: {code}")]
    Nak { mnemonic: Mnemonic, code: DeviceError },

    #[error("{mnemonic}: no reply within {timeout:?}")]
    Timeout { mnemonic: Mnemonic, timeout: Duration },

    #[error("{mnemonic}: malformed reply: {source}")]
    Malformed {
        mnemonic: Mnemonic,
        #[source]
        source: PayloadError,
    },

    #[error("{mnemonic}: deadline passed after {attempts} attempt(s); last failure: {last}")]
    DeadlineExceeded {
        mnemonic: Mnemonic,
        attempts: u32,
        last: Box<ProtocolError>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether the whole command sequence may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Nak { .. }
                | ProtocolError::Timeout { .. }
                | ProtocolError::Malformed { .. }
        )
    }

    /// Device error code from the last NAK, if that was the failure.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            ProtocolError::Nak { code, .. } => Some(code),
            ProtocolError::DeadlineExceeded { last, .. } => last.device_error(),
            _ => None,
        }
    }
}
