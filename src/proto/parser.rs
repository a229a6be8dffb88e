// src/proto/parser.rs
use std::fmt;

use thiserror::Error;

use crate::frame::{ACK, ETX, NAK, printable};

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("expected ACK or NAK, got \"{}\"", printable(.0))]
    UnexpectedAck(Vec<u8>),
    #[error("expected {expected} field(s), got {got} in {payload:?}")]
    FieldCount {
        expected: usize,
        got: usize,
        payload: String,
    },
    #[error("field {index} is not a number: {value:?}")]
    NotNumeric { index: usize, value: String },
    #[error("unknown {what} code: {value:?}")]
    UnknownCode { what: &'static str, value: String },
}

/// Error reported by the controller in the text following a NAK.
///
/// The controller answers with a four digit flag word `ABCD`:
/// `A` controller error, `B` no hardware, `C` inadmissible parameter,
/// `D` syntax error. More than one flag may be set at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    Controller,
    NoHardware,
    InadmissibleParameter,
    Syntax,
    /// Several flags set, in flag order.
    Combined(Vec<DeviceError>),
    Unspecified,
    Unrecognized(String),
}

const FLAG_ORDER: [DeviceError; 4] = [
    DeviceError::Controller,
    DeviceError::NoHardware,
    DeviceError::InadmissibleParameter,
    DeviceError::Syntax,
];

impl DeviceError {
    pub fn decode(text: &str) -> Self {
        let t = text.trim_matches(|c: char| c.is_whitespace() || c == ETX as char);
        if t.is_empty() {
            return DeviceError::Unspecified;
        }
        if t.len() != 4 || !t.bytes().all(|b| b == b'0' || b == b'1') {
            return DeviceError::Unrecognized(t.to_string());
        }
        let mut set: Vec<DeviceError> = t
            .bytes()
            .zip(FLAG_ORDER)
            .filter(|(b, _)| *b == b'1')
            .map(|(_, flag)| flag)
            .collect();
        match set.len() {
            0 => DeviceError::Unspecified,
            1 => set.remove(0),
            _ => DeviceError::Combined(set),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Controller => f.write_str("controller error"),
            DeviceError::NoHardware => f.write_str("no hardware"),
            DeviceError::InadmissibleParameter => f.write_str("inadmissible parameter"),
            DeviceError::Syntax => f.write_str("syntax error"),
            DeviceError::Combined(flags) => {
                for (i, flag) in flags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" + ")?;
                    }
                    write!(f, "{flag}")?;
                }
                Ok(())
            }
            DeviceError::Unspecified => f.write_str("unspecified error"),
            DeviceError::Unrecognized(t) => write!(f, "unrecognized error {t:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    Ack,
    Nak(DeviceError),
}

/// Decode the line the controller sends right after a command.
pub fn parse_ack(line: &[u8]) -> Result<Acknowledgment, PayloadError> {
    match line.split_first() {
        Some((&ACK, [])) => Ok(Acknowledgment::Ack),
        Some((&NAK, rest)) => Ok(Acknowledgment::Nak(DeviceError::decode(
            &String::from_utf8_lossy(rest),
        ))),
        _ => Err(PayloadError::UnexpectedAck(line.to_vec())),
    }
}

/* ---------- payload helpers ---------- */

/// Split a comma separated payload, requiring exactly `expected` fields.
pub fn fields(payload: &str, expected: usize) -> Result<Vec<&str>, PayloadError> {
    let parts: Vec<&str> = payload.split(',').map(str::trim).collect();
    if parts.len() != expected || parts.iter().any(|p| p.is_empty()) {
        return Err(PayloadError::FieldCount {
            expected,
            got: parts.iter().filter(|p| !p.is_empty()).count(),
            payload: payload.to_string(),
        });
    }
    Ok(parts)
}

pub fn number(field: &str, index: usize) -> Result<f64, PayloadError> {
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PayloadError::NotNumeric {
            index,
            value: field.to_string(),
        })
}

pub fn code(field: &str, what: &'static str) -> Result<u8, PayloadError> {
    field.parse::<u8>().map_err(|_| PayloadError::UnknownCode {
        what,
        value: field.to_string(),
    })
}

/* ---------- tests ---------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ack_and_nak() {
        assert_eq!(parse_ack(&[ACK]).unwrap(), Acknowledgment::Ack);
        assert_eq!(
            parse_ack(b"\x150001").unwrap(),
            Acknowledgment::Nak(DeviceError::Syntax)
        );
        assert_eq!(
            parse_ack(&[NAK]).unwrap(),
            Acknowledgment::Nak(DeviceError::Unspecified)
        );
        assert!(matches!(
            parse_ack(b"0,1.0"),
            Err(PayloadError::UnexpectedAck(_))
        ));
        assert!(parse_ack(&[]).is_err());
    }

    #[test]
    fn decodes_device_error_flags() {
        assert_eq!(DeviceError::decode("1000"), DeviceError::Controller);
        assert_eq!(DeviceError::decode("0100"), DeviceError::NoHardware);
        assert_eq!(DeviceError::decode("0010"), DeviceError::InadmissibleParameter);
        assert_eq!(DeviceError::decode("0001\x03"), DeviceError::Syntax);
        assert_eq!(DeviceError::decode("0000"), DeviceError::Unspecified);
        assert_eq!(
            DeviceError::decode("1001"),
            DeviceError::Combined(vec![DeviceError::Controller, DeviceError::Syntax])
        );
        assert_eq!(
            DeviceError::decode("0111").to_string(),
            "no hardware + inadmissible parameter + syntax error"
        );
        assert_eq!(
            DeviceError::decode("ERR"),
            DeviceError::Unrecognized("ERR".into())
        );
    }

    #[test]
    fn field_helpers() {
        assert_eq!(fields("0, +1.0E-03", 2).unwrap(), vec!["0", "+1.0E-03"]);
        assert!(matches!(
            fields("0", 2),
            Err(PayloadError::FieldCount {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(fields("1,", 2).is_err());
        assert_eq!(number("+1.234E-03", 1).unwrap(), 0.001234);
        assert!(number("abc", 1).is_err());
        assert!(number("NaN", 1).is_err());
        assert_eq!(code("3", "status").unwrap(), 3);
        assert!(code("-1", "status").is_err());
    }
}
