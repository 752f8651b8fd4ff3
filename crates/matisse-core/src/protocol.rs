//! Matisse command vocabulary.
//!
//! Protocol Overview:
//! - Format: ASCII request/response, one exchange in flight at a time
//! - Query: `"<SUBSYSTEM>:<PARAMETER>?"` -> `"<SUBSYSTEM>:<PARAMETER> <value>"`
//! - Set: `"<SUBSYSTEM>:<PARAMETER> <value>"` -> acknowledgement
//! - Failure: any response beginning with `!ERROR`; the code is then read
//!   with `ERROR:CODE?`
//!
//! Actuator identifiers in this module own their command mnemonics so the
//! rest of the workspace never spells a command string by hand.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every error response.
pub const ERROR_SENTINEL: &str = "!ERROR";

/// Clears latent error state on the instrument.
pub const ERROR_CLEAR: &str = "ERROR:CLEAR";

/// Reads the code of the most recent error.
pub const ERROR_CODE_QUERY: &str = "ERROR:CODE?";

/// Birefringent filter position expressed as a wavelength in nm.
pub const BIFI_WAVELENGTH: &str = "MOTBI:WL";

/// Fast piezo lock indicator.
pub const FAST_PIEZO_LOCK: &str = "FPZT:LOCK";

/// Laser output power measured by the internal diode.
pub const DIODE_POWER: &str = "DPOW:DC";

/// Thin etalon reflex signal.
pub const THIN_ETALON_REFLEX: &str = "TE:DC";

/// Build a query string (`"MOTBI:WL"` -> `"MOTBI:WL?"`).
pub fn query(parameter: &str) -> String {
    format!("{}?", parameter)
}

/// Build a set command (`"SPZT:NOW", 0.35` -> `"SPZT:NOW 0.35"`).
pub fn set(parameter: &str, value: impl fmt::Display) -> String {
    format!("{} {}", parameter, value)
}

/// Whether a response carries the error sentinel.
pub fn is_error_response(response: &str) -> bool {
    response.trim_start().starts_with(ERROR_SENTINEL)
}

/// Extract the value field from a `"<SUB>:<PARAM> <value>"` response.
///
/// Responses without a parameter echo are returned whole, so both
/// `"MOTBI:WL 780.5"` and `"780.5"` yield `"780.5"`.
pub fn response_value(response: &str) -> &str {
    let trimmed = response.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((_, value)) => value.trim(),
        None => trimmed,
    }
}

/// Parse the value field of a response as `f64`.
pub fn parse_f64(response: &str) -> Option<f64> {
    response_value(response).parse().ok()
}

/// Parse the value field of a response as an integer motor position.
///
/// The instrument reports motor positions as integers but some firmware
/// revisions format them as `"12000.000"`.
pub fn parse_i64(response: &str) -> Option<i64> {
    let value = response_value(response);
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && v.is_finite())
            .map(|v| v as i64)
    })
}

/// Parse a boolean status field (`TRUE`/`FALSE`, `RUN`/`STOP`, `1`/`0`).
pub fn parse_bool(response: &str) -> Option<bool> {
    match response_value(response).to_ascii_uppercase().as_str() {
        "TRUE" | "RUN" | "1" | "ON" => Some(true),
        "FALSE" | "STOP" | "0" | "OFF" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Actuator identifiers
// =============================================================================

/// One of the four independent feedback loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLoop {
    /// Slow piezo (cavity length, large range)
    SlowPiezo,
    /// Thin etalon (motor-driven servo)
    ThinEtalon,
    /// Piezo etalon (dithered thick etalon)
    PiezoEtalon,
    /// Fast piezo (reference cavity lock)
    FastPiezo,
}

impl ControlLoop {
    /// All loops in the order they are engaged.
    pub const ALL: [ControlLoop; 4] = [
        ControlLoop::SlowPiezo,
        ControlLoop::ThinEtalon,
        ControlLoop::PiezoEtalon,
        ControlLoop::FastPiezo,
    ];

    /// Control status parameter for this loop.
    pub fn status_parameter(self) -> &'static str {
        match self {
            ControlLoop::SlowPiezo => "SPZT:CNTRSTA",
            ControlLoop::ThinEtalon => "TE:CNTRSTA",
            ControlLoop::PiezoEtalon => "PZETL:CNTRSTA",
            ControlLoop::FastPiezo => "FPZT:CNTRSTA",
        }
    }

    /// Command switching the loop on or off.
    pub fn command(self, enabled: bool) -> String {
        set(self.status_parameter(), if enabled { "RUN" } else { "STOP" })
    }

    /// Human-readable name used in log messages.
    pub fn label(self) -> &'static str {
        match self {
            ControlLoop::SlowPiezo => "slow piezo",
            ControlLoop::ThinEtalon => "thin etalon",
            ControlLoop::PiezoEtalon => "piezo etalon",
            ControlLoop::FastPiezo => "fast piezo",
        }
    }
}

impl fmt::Display for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stepper motors positioned in absolute integer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Motor {
    /// Birefringent filter motor
    BirefringentFilter,
    /// Thin etalon motor
    ThinEtalon,
}

impl Motor {
    /// Position parameter for this motor.
    pub fn position_parameter(self) -> &'static str {
        match self {
            Motor::BirefringentFilter => "MOTBI:POS",
            Motor::ThinEtalon => "MOTTE:POS",
        }
    }

    /// Human-readable name used in log messages.
    pub fn label(self) -> &'static str {
        match self {
            Motor::BirefringentFilter => "BiFi motor",
            Motor::ThinEtalon => "thin etalon motor",
        }
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Piezo-type actuators positioned with a floating point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Piezo {
    /// Piezo etalon baseline
    PiezoEtalon,
    /// Slow piezo position
    SlowPiezo,
    /// Reference cell position
    RefCell,
}

impl Piezo {
    /// Every piezo whose travel is checked for limits, in correction order.
    pub const ALL: [Piezo; 3] = [Piezo::PiezoEtalon, Piezo::SlowPiezo, Piezo::RefCell];

    /// Position parameter for this actuator.
    pub fn position_parameter(self) -> &'static str {
        match self {
            Piezo::PiezoEtalon => "PZETL:BASE",
            Piezo::SlowPiezo => "SPZT:NOW",
            Piezo::RefCell => "SCAN:NOW",
        }
    }

    /// Human-readable name used in log messages.
    pub fn label(self) -> &'static str {
        match self {
            Piezo::PiezoEtalon => "piezo etalon",
            Piezo::SlowPiezo => "slow piezo",
            Piezo::RefCell => "reference cell",
        }
    }
}

impl fmt::Display for Piezo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse tuning sweep kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Birefringent filter sweep
    BirefringentFilter,
    /// Thin etalon sweep
    ThinEtalon,
}

impl ScanKind {
    /// Motor swept by this scan.
    pub fn motor(self) -> Motor {
        match self {
            ScanKind::BirefringentFilter => Motor::BirefringentFilter,
            ScanKind::ThinEtalon => Motor::ThinEtalon,
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanKind::BirefringentFilter => f.write_str("birefringent filter scan"),
            ScanKind::ThinEtalon => f.write_str("thin etalon scan"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builders() {
        assert_eq!(query(BIFI_WAVELENGTH), "MOTBI:WL?");
        assert_eq!(set(Piezo::SlowPiezo.position_parameter(), 0.35), "SPZT:NOW 0.35");
        assert_eq!(ControlLoop::FastPiezo.command(true), "FPZT:CNTRSTA RUN");
        assert_eq!(ControlLoop::ThinEtalon.command(false), "TE:CNTRSTA STOP");
    }

    #[test]
    fn test_error_sentinel_detection() {
        assert!(is_error_response("!ERROR"));
        assert!(is_error_response("  !ERROR 12"));
        assert!(!is_error_response("MOTBI:WL 780.0"));
    }

    #[test]
    fn test_parse_numeric_responses() {
        let test_cases = vec![
            ("MOTBI:WL 780.125", 780.125),
            ("SPZT:NOW 0.35\n", 0.35),
            ("  -0.5 ", -0.5),
        ];

        for (input, expected) in test_cases {
            assert_eq!(parse_f64(input), Some(expected), "Failed to parse: {}", input);
        }
        assert_eq!(parse_f64("MOTBI:WL abc"), None);
    }

    #[test]
    fn test_parse_motor_positions() {
        assert_eq!(parse_i64("MOTBI:POS 120000"), Some(120_000));
        assert_eq!(parse_i64("MOTTE:POS 1500.000"), Some(1500));
        assert_eq!(parse_i64("MOTTE:POS 1500.5"), None);
    }

    #[test]
    fn test_parse_status_flags() {
        assert_eq!(parse_bool("FPZT:LOCK TRUE"), Some(true));
        assert_eq!(parse_bool("FPZT:LOCK false"), Some(false));
        assert_eq!(parse_bool("SPZT:CNTRSTA RUN"), Some(true));
        assert_eq!(parse_bool("SPZT:CNTRSTA STOP"), Some(false));
        assert_eq!(parse_bool("SPZT:CNTRSTA MAYBE"), None);
    }

    #[test]
    fn test_scan_motor_mapping() {
        assert_eq!(ScanKind::BirefringentFilter.motor(), Motor::BirefringentFilter);
        assert_eq!(ScanKind::ThinEtalon.motor().position_parameter(), "MOTTE:POS");
    }
}
