//! Typed operations on the two-channel gauge controller.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GaugeDefaults, SerialConfig};
use crate::port::Transport;
use crate::proto::command::{Command, Mnemonic};
use crate::proto::engine::{ProtocolEngine, Response};
use crate::proto::error::ProtocolError;
use crate::proto::parser::{PayloadError, code, fields, number};

/// Accepted calibration factor range, inclusive.
pub const CAL_MIN: f64 = 0.10;
pub const CAL_MAX: f64 = 10.0;

/// The device rounds calibration factors to three decimals.
const CAL_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum GaugeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("calibration factor {value} for channel {channel} outside {}..={}", CAL_MIN, CAL_MAX)]
    CalibrationRange { channel: Channel, value: f64 },
    #[error("invalid {what}: {value}")]
    Validation { what: &'static str, value: String },
    #[error("channel {channel} calibration reads back {actual}, expected {expected}")]
    NotConfirmed {
        channel: Channel,
        expected: f64,
        actual: f64,
    },
}

impl GaugeError {
    fn invalid(what: &'static str, value: impl fmt::Display) -> Self {
        GaugeError::Validation {
            what,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::One, Channel::Two];

    pub fn index(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }

    fn pressure_mnemonic(self) -> Mnemonic {
        match self {
            Channel::One => Mnemonic::Pr1,
            Channel::Two => Mnemonic::Pr2,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = GaugeError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(GaugeError::invalid("channel", other)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index() + 1)
    }
}

/// Enumerated settings and states the controller reports as small integers.
pub trait DeviceCode: Sized + Copy {
    const WHAT: &'static str;
    fn from_code(code: u8) -> Option<Self>;
    fn code(self) -> u8;

    fn parse_field(field: &str) -> Result<Self, PayloadError> {
        let n = code(field, Self::WHAT)?;
        Self::from_code(n).ok_or_else(|| PayloadError::UnknownCode {
            what: Self::WHAT,
            value: field.to_string(),
        })
    }

    fn validate(n: u8) -> Result<Self, GaugeError> {
        Self::from_code(n).ok_or_else(|| GaugeError::invalid(Self::WHAT, n))
    }
}

macro_rules! device_code {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident = $code:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        pub enum $name {
            $($variant),+
        }

        impl DeviceCode for $name {
            const WHAT: &'static str = $what;

            fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $($name::$variant => $label),+
                })
            }
        }
    };
}

device_code!(
    /// State reported with every pressure reading. Data, not an error.
    SensorStatus, "sensor status" {
        Ok = 0 => "ok",
        Underrange = 1 => "underrange",
        Overrange = 2 => "overrange",
        SensorError = 3 => "sensor error",
        SensorOff = 4 => "sensor off",
        NoSensor = 5 => "no sensor",
        IdError = 6 => "identification error",
    }
);

device_code!(
    Unit, "unit" {
        Mbar = 0 => "mbar",
        Torr = 1 => "Torr",
        Pascal = 2 => "Pa",
    }
);

device_code!(
    FilterLevel, "filter level" {
        Fast = 0 => "fast",
        Medium = 1 => "medium",
        Slow = 2 => "slow",
    }
);

device_code!(
    Resolution, "display resolution" {
        Two = 2 => "2 digits",
        Three = 3 => "3 digits",
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub pressure: f64,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFactor {
    channel: Channel,
    value: f64,
}

impl CalibrationFactor {
    pub fn new(channel: Channel, value: f64) -> Result<Self, GaugeError> {
        if !value.is_finite() || !(CAL_MIN..=CAL_MAX).contains(&value) {
            return Err(GaugeError::CalibrationRange { channel, value });
        }
        Ok(Self { channel, value })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Last settings the device confirmed. `None` until read or written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeConfig {
    pub unit: Option<Unit>,
    pub filter: Option<[FilterLevel; 2]>,
    pub resolution: Option<Resolution>,
    pub calibration: Option<[f64; 2]>,
}

/* ---------- payload parsers ---------- */

fn parse_reading(payload: &str) -> Result<Reading, PayloadError> {
    let f = fields(payload, 2)?;
    Ok(Reading {
        status: SensorStatus::parse_field(f[0])?,
        pressure: number(f[1], 1)?,
    })
}

fn parse_identity(payload: &str) -> Result<[String; 2], PayloadError> {
    let f = fields(payload, 2)?;
    Ok([f[0].to_string(), f[1].to_string()])
}

fn parse_calibration(payload: &str) -> Result<[f64; 2], PayloadError> {
    let f = fields(payload, 2)?;
    Ok([number(f[0], 0)?, number(f[1], 1)?])
}

fn parse_single<C: DeviceCode>(payload: &str) -> Result<C, PayloadError> {
    C::parse_field(fields(payload, 1)?[0])
}

fn parse_pair<C: DeviceCode>(payload: &str) -> Result<[C; 2], PayloadError> {
    let f = fields(payload, 2)?;
    Ok([C::parse_field(f[0])?, C::parse_field(f[1])?])
}

/* ---------- controller ---------- */

pub struct GaugeController<T: Transport> {
    engine: ProtocolEngine<T>,
    config: GaugeConfig,
    op_timeout: Option<Duration>,
}

impl<T: Transport> GaugeController<T> {
    pub fn new(transport: T, cfg: &SerialConfig) -> Self {
        Self {
            engine: ProtocolEngine::new(transport, cfg),
            config: GaugeConfig::default(),
            op_timeout: cfg.op_timeout(),
        }
    }

    pub fn config(&self) -> &GaugeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.engine.transport()
    }

    pub fn close(&mut self) {
        self.engine.close();
    }

    fn transact<V>(
        &mut self,
        cmd: Command,
        parse: impl Fn(&str) -> Result<V, PayloadError>,
    ) -> Result<Response<V>, GaugeError> {
        let deadline = self.op_timeout.map(|t| Instant::now() + t);
        Ok(self.engine.transact(&cmd, deadline, parse)?)
    }

    // ---- Measurement ----

    /// Pressure and sensor status. Underrange, overrange and the sensor
    /// fault states come back as `Ok` with the status set.
    pub fn read_pressure(&mut self, channel: Channel) -> Result<Response<Reading>, GaugeError> {
        self.transact(Command::query(channel.pressure_mnemonic()), parse_reading)
    }

    /// Sensor type connected to each channel.
    pub fn gauge_identity(&mut self) -> Result<[String; 2], GaugeError> {
        Ok(self.transact(Command::query(Mnemonic::Tid), parse_identity)?.value)
    }

    // ---- Calibration ----

    pub fn get_calibration(&mut self) -> Result<[f64; 2], GaugeError> {
        let pair = self
            .transact(Command::query(Mnemonic::Cal), parse_calibration)?
            .value;
        self.config.calibration = Some(pair);
        Ok(pair)
    }

    pub fn get_calibration_for(&mut self, channel: Channel) -> Result<f64, GaugeError> {
        Ok(self.get_calibration()?[channel.index()])
    }

    /// Range-checked locally; nothing is sent for an out of range value.
    /// The other channel keeps its current factor. Reads back to confirm.
    pub fn set_calibration(
        &mut self,
        channel: Channel,
        value: f64,
    ) -> Result<CalibrationFactor, GaugeError> {
        let factor = CalibrationFactor::new(channel, value)?;
        let mut pair = match self.config.calibration {
            Some(pair) => pair,
            None => self.get_calibration()?,
        };
        pair[channel.index()] = factor.value();

        let cmd = Command::with_args(Mnemonic::Cal, pair.iter().map(|v| format!("{v:.3}")));
        let echoed = self.transact(cmd, parse_calibration)?;
        debug!(target: "gauge", "CAL echoed {}", echoed.payload);

        let actual = self.get_calibration()?[channel.index()];
        if (actual - factor.value()).abs() > CAL_TOLERANCE {
            return Err(GaugeError::NotConfirmed {
                channel,
                expected: factor.value(),
                actual,
            });
        }
        info!(target: "gauge", "channel {} calibration factor {:.3}", channel, actual);
        Ok(factor)
    }

    // ---- Settings ----

    pub fn get_unit(&mut self) -> Result<Unit, GaugeError> {
        let unit = self
            .transact(Command::query(Mnemonic::Uni), parse_single::<Unit>)?
            .value;
        self.config.unit = Some(unit);
        Ok(unit)
    }

    pub fn set_unit(&mut self, code: u8) -> Result<Unit, GaugeError> {
        let unit = Unit::validate(code)?;
        let echoed = self
            .transact(
                Command::with_args(Mnemonic::Uni, [unit.code().to_string()]),
                parse_single::<Unit>,
            )?
            .value;
        self.config.unit = Some(echoed);
        info!(target: "gauge", "pressure unit {}", echoed);
        Ok(echoed)
    }

    pub fn get_filter(&mut self) -> Result<[FilterLevel; 2], GaugeError> {
        let levels = self
            .transact(Command::query(Mnemonic::Fil), parse_pair::<FilterLevel>)?
            .value;
        self.config.filter = Some(levels);
        Ok(levels)
    }

    /// Same filter level on both channels.
    pub fn set_filter(&mut self, code: u8) -> Result<[FilterLevel; 2], GaugeError> {
        let level = FilterLevel::validate(code)?;
        let arg = level.code().to_string();
        let echoed = self
            .transact(
                Command::with_args(Mnemonic::Fil, [arg.clone(), arg]),
                parse_pair::<FilterLevel>,
            )?
            .value;
        self.config.filter = Some(echoed);
        info!(target: "gauge", "filter {} / {}", echoed[0], echoed[1]);
        Ok(echoed)
    }

    pub fn get_resolution(&mut self) -> Result<Resolution, GaugeError> {
        let res = self
            .transact(Command::query(Mnemonic::Dcd), parse_single::<Resolution>)?
            .value;
        self.config.resolution = Some(res);
        Ok(res)
    }

    pub fn set_resolution(&mut self, digits: u8) -> Result<Resolution, GaugeError> {
        let res = Resolution::validate(digits)?;
        let echoed = self
            .transact(
                Command::with_args(Mnemonic::Dcd, [res.code().to_string()]),
                parse_single::<Resolution>,
            )?
            .value;
        self.config.resolution = Some(echoed);
        info!(target: "gauge", "display resolution {}", echoed);
        Ok(echoed)
    }

    /// Push startup settings. Every value is validated before anything is sent.
    pub fn initialize(&mut self, defaults: &GaugeDefaults) -> Result<(), GaugeError> {
        FilterLevel::validate(defaults.filter)?;
        Resolution::validate(defaults.resolution)?;
        if let Some(unit) = defaults.unit {
            Unit::validate(unit)?;
        }
        if let Some(cal) = defaults.calibration {
            for ch in Channel::BOTH {
                CalibrationFactor::new(ch, cal[ch.index()])?;
            }
        }

        self.set_filter(defaults.filter)?;
        if let Some(cal) = defaults.calibration {
            for ch in Channel::BOTH {
                self.set_calibration(ch, cal[ch.index()])?;
            }
        }
        self.set_resolution(defaults.resolution)?;
        if let Some(unit) = defaults.unit {
            self.set_unit(unit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn gauge(t: ScriptedTransport) -> GaugeController<ScriptedTransport> {
        GaugeController::new(t, &SerialConfig::default())
    }

    #[test]
    fn reads_pressure_with_status() {
        let mut g = gauge(ScriptedTransport::new().exchange("0,+1.234E-03"));
        let resp = g.read_pressure(Channel::One).unwrap();
        assert_eq!(resp.payload, "0,+1.234E-03");
        assert_eq!(resp.value.pressure, 0.001234);
        assert_eq!(resp.value.status, SensorStatus::Ok);
        assert_eq!(g.transport().written(), b"PR1\r\n\x05".to_vec());
    }

    #[test]
    fn abnormal_status_is_data() {
        let t = ScriptedTransport::new()
            .exchange("2,+1.000E+04")
            .exchange("5,+0.000E+00");
        let mut g = gauge(t);
        let over = g.read_pressure(Channel::Two).unwrap().value;
        assert_eq!(over.status, SensorStatus::Overrange);
        assert_eq!(over.pressure, 1.0e4);
        let none = g.read_pressure(Channel::Two).unwrap().value;
        assert_eq!(none.status, SensorStatus::NoSensor);
        assert_eq!(g.transport().commands(), vec!["PR2\r\n", "PR2\r\n"]);
    }

    #[test]
    fn unknown_status_code_is_malformed() {
        let t = ScriptedTransport::new()
            .exchange("9,+1.0E+00")
            .exchange("9,+1.0E+00")
            .exchange("9,+1.0E+00")
            .exchange("9,+1.0E+00");
        let err = gauge(t).read_pressure(Channel::One).unwrap_err();
        assert!(matches!(
            err,
            GaugeError::Protocol(ProtocolError::Malformed {
                source: PayloadError::UnknownCode { .. },
                ..
            })
        ));
    }

    #[test]
    fn identity_per_channel() {
        let mut g = gauge(ScriptedTransport::new().exchange("TPR,noSen"));
        assert_eq!(g.gauge_identity().unwrap(), ["TPR".to_string(), "noSen".to_string()]);
    }

    #[test]
    fn out_of_range_calibration_sends_nothing() {
        let mut g = gauge(ScriptedTransport::new().exchange("1.000,1.000"));
        for bad in [0.0, 0.05, 10.5, -1.0, f64::NAN] {
            let err = g.set_calibration(Channel::One, bad).unwrap_err();
            assert!(matches!(err, GaugeError::CalibrationRange { .. }));
        }
        assert!(g.transport().written().is_empty());
        assert_eq!(g.config().calibration, None);
    }

    #[test]
    fn set_calibration_preserves_other_channel_and_confirms() {
        let t = ScriptedTransport::new()
            .exchange("1.000,0.800")
            .exchange("1.500,0.800")
            .exchange("1.500,0.800");
        let mut g = gauge(t);
        let f = g.set_calibration(Channel::One, 1.5).unwrap();
        assert_eq!(f.value(), 1.5);
        assert_eq!(f.channel(), Channel::One);
        assert_eq!(
            g.transport().commands(),
            vec!["CAL\r\n", "CAL,1.500,0.800\r\n", "CAL\r\n"]
        );
        assert_eq!(g.config().calibration, Some([1.5, 0.8]));
    }

    #[test]
    fn set_calibration_reports_unconfirmed_write() {
        let t = ScriptedTransport::new()
            .exchange("1.000,1.000")
            .exchange("1.000,1.000")
            .exchange("1.000,1.000");
        let err = gauge(t).set_calibration(Channel::Two, 2.0).unwrap_err();
        assert!(matches!(
            err,
            GaugeError::NotConfirmed {
                channel: Channel::Two,
                ..
            }
        ));
    }

    #[test]
    fn repeated_calibration_reads_agree() {
        let t = ScriptedTransport::new()
            .exchange("1.250,1.000")
            .exchange("1.250,1.000");
        let mut g = gauge(t);
        let first = g.get_calibration_for(Channel::One).unwrap();
        let second = g.get_calibration_for(Channel::One).unwrap();
        assert_eq!(first, 1.25);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_settings_fail_locally() {
        let mut g = gauge(ScriptedTransport::new());
        assert!(matches!(
            g.set_unit(3),
            Err(GaugeError::Validation { what: "unit", .. })
        ));
        assert!(matches!(
            g.set_filter(5),
            Err(GaugeError::Validation { .. })
        ));
        assert!(matches!(
            g.set_resolution(4),
            Err(GaugeError::Validation { .. })
        ));
        assert!(Channel::try_from(3).is_err());
        assert!(g.transport().sent.is_empty());
        assert_eq!(g.config(), &GaugeConfig::default());
    }

    #[test]
    fn settings_update_mirror_from_device_echo() {
        let t = ScriptedTransport::new()
            .exchange("1")
            .exchange("2,2")
            .exchange("3");
        let mut g = gauge(t);
        assert_eq!(g.set_unit(1).unwrap(), Unit::Torr);
        assert_eq!(g.set_filter(2).unwrap(), [FilterLevel::Slow; 2]);
        assert_eq!(g.set_resolution(3).unwrap(), Resolution::Three);
        assert_eq!(
            g.transport().commands(),
            vec!["UNI,1\r\n", "FIL,2,2\r\n", "DCD,3\r\n"]
        );
        assert_eq!(
            g.config(),
            &GaugeConfig {
                unit: Some(Unit::Torr),
                filter: Some([FilterLevel::Slow; 2]),
                resolution: Some(Resolution::Three),
                calibration: None,
            }
        );
    }

    #[test]
    fn rejected_setting_leaves_mirror_untouched() {
        let t = ScriptedTransport::new()
            .nak("0010")
            .nak("0010")
            .nak("0010")
            .nak("0010");
        let mut g = gauge(t);
        assert!(g.set_unit(2).is_err());
        assert_eq!(g.config().unit, None);
    }

    #[test]
    fn initialize_applies_defaults_in_order() {
        let t = ScriptedTransport::new()
            .exchange("1,1")
            .exchange("1.000,1.000")
            .exchange("1.000,1.000")
            .exchange("1.000,1.000")
            .exchange("1.000,1.000")
            .exchange("1.000,1.000")
            .exchange("3");
        let mut g = gauge(t);
        g.initialize(&GaugeDefaults::default()).unwrap();
        assert_eq!(
            g.transport().commands(),
            vec![
                "FIL,1,1\r\n",
                "CAL\r\n",
                "CAL,1.000,1.000\r\n",
                "CAL\r\n",
                "CAL,1.000,1.000\r\n",
                "CAL\r\n",
                "DCD,3\r\n",
            ]
        );
    }

    #[test]
    fn initialize_validates_before_sending() {
        let mut g = gauge(ScriptedTransport::new());
        let defaults = GaugeDefaults {
            calibration: Some([1.0, 42.0]),
            ..GaugeDefaults::default()
        };
        assert!(matches!(
            g.initialize(&defaults),
            Err(GaugeError::CalibrationRange { .. })
        ));
        assert!(g.transport().sent.is_empty());
    }
}
