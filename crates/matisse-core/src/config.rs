//! Configuration management for the Matisse controller.
//!
//! Settings are layered with `figment`:
//!
//! 1. Library defaults (`Serialized::defaults(Settings::default())`)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `MATISSE_`, using `__` to reach
//!    nested keys (`MATISSE_LOCK__TIMEOUT=45s`)
//!
//! Durations are written in humantime form (`"1s"`, `"250ms"`).
//!
//! ## Example
//!
//! ```toml
//! log_level = "debug"
//!
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [lock]
//! timeout = "45s"
//!
//! [scans.bifi]
//! range = 400
//! step = 4
//! ```
//!
//! After extraction, [`Settings::validate`] rejects values that parse but make
//! no physical sense (empty travel windows, sweeps larger than their step
//! budget, ...). The controller refuses to start on invalid settings.

use crate::error::{MatisseError, MatisseResult};
use crate::limits;
use crate::protocol::Piezo;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Logging verbosity ("error", "warn", "info", "debug", "trace").
    pub log_level: String,
    /// Physical link settings.
    pub connection: ConnectionSettings,
    /// Lock acquisition supervisor settings.
    pub lock: LockSettings,
    /// Actuator travel windows used for limit detection.
    pub limits: ActuatorLimits,
    /// Target wavelength validation.
    pub wavelength: WavelengthSettings,
    /// Coarse tuning sweeps.
    pub scans: ScanSettings,
    /// Automatic stabilization watchdog.
    pub stabilization: StabilizationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection: ConnectionSettings::default(),
            lock: LockSettings::default(),
            limits: ActuatorLimits::default(),
            wavelength: WavelengthSettings::default(),
            scans: ScanSettings::default(),
            stabilization: StabilizationSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> MatisseResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(MatisseError::Configuration(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading settings from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("MATISSE_").split("__"));

        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that deserialization cannot express.
    pub fn validate(&self) -> MatisseResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "log_level '{}' must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }
        if self.connection.baud_rate == 0 {
            return invalid("connection.baud_rate must be positive");
        }
        if self.connection.timeout.is_zero() {
            return invalid("connection.timeout must be positive");
        }
        self.lock.validate()?;
        self.limits.validate()?;
        self.wavelength.validate()?;
        self.scans.bifi.sweep.validate("scans.bifi")?;
        self.scans.thin_etalon.sweep.validate("scans.thin_etalon")?;
        if !(self.scans.bifi.peak_fraction > 0.0 && self.scans.bifi.peak_fraction <= 1.0) {
            return invalid("scans.bifi.peak_fraction must be in (0, 1]");
        }
        if self.stabilization.check_interval.is_zero() {
            return invalid("stabilization.check_interval must be positive");
        }
        if self.stabilization.lock_timeout.is_zero() {
            return invalid("stabilization.lock_timeout must be positive");
        }
        Ok(())
    }
}

fn invalid<T>(message: impl Into<String>) -> MatisseResult<T> {
    Err(MatisseError::Configuration(message.into()))
}

/// Physical link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout for one command/response exchange.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout: limits::EXCHANGE_TIMEOUT,
        }
    }
}

/// Lock acquisition supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockSettings {
    /// Time allowed to acquire a lock before giving up.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Status polling cadence.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Positions applied by the automatic correction.
    pub correction: CorrectionPositions,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: limits::DEFAULT_LOCK_TIMEOUT,
            poll_interval: limits::LOCK_POLL_INTERVAL,
            correction: CorrectionPositions::default(),
        }
    }
}

impl LockSettings {
    fn validate(&self) -> MatisseResult<()> {
        if self.timeout.is_zero() {
            return invalid("lock.timeout must be positive");
        }
        if self.poll_interval.is_zero() {
            return invalid("lock.poll_interval must be positive");
        }
        Ok(())
    }
}

/// Conservative mid-range positions used to walk saturated actuators back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrectionPositions {
    /// Piezo etalon baseline.
    pub piezo_etalon: f64,
    /// Slow piezo position.
    pub slow_piezo: f64,
    /// Reference cell position.
    pub refcell: f64,
}

impl Default for CorrectionPositions {
    fn default() -> Self {
        Self {
            piezo_etalon: limits::PIEZO_ETALON_CORRECTION_POS,
            slow_piezo: limits::SLOW_PIEZO_CORRECTION_POS,
            refcell: limits::REFCELL_CORRECTION_POS,
        }
    }
}

impl CorrectionPositions {
    /// Correction target for one actuator.
    pub fn position(&self, piezo: Piezo) -> f64 {
        match piezo {
            Piezo::PiezoEtalon => self.piezo_etalon,
            Piezo::SlowPiezo => self.slow_piezo,
            Piezo::RefCell => self.refcell,
        }
    }
}

/// Closed travel interval of one actuator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TravelWindow {
    /// Lowest reachable position.
    pub lower: f64,
    /// Highest reachable position.
    pub upper: f64,
}

impl From<(f64, f64)> for TravelWindow {
    fn from((lower, upper): (f64, f64)) -> Self {
        Self { lower, upper }
    }
}

/// Travel windows for every actuator checked by the limit status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActuatorLimits {
    /// Distance from either end that already counts as "at the limit".
    pub margin: f64,
    /// Piezo etalon baseline travel.
    pub piezo_etalon: TravelWindow,
    /// Slow piezo travel.
    pub slow_piezo: TravelWindow,
    /// Reference cell travel.
    pub refcell: TravelWindow,
}

impl Default for ActuatorLimits {
    fn default() -> Self {
        Self {
            margin: limits::LIMIT_MARGIN,
            piezo_etalon: limits::PIEZO_ETALON_TRAVEL.into(),
            slow_piezo: limits::SLOW_PIEZO_TRAVEL.into(),
            refcell: limits::REFCELL_TRAVEL.into(),
        }
    }
}

impl ActuatorLimits {
    /// Travel window of one actuator.
    pub fn window(&self, piezo: Piezo) -> TravelWindow {
        match piezo {
            Piezo::PiezoEtalon => self.piezo_etalon,
            Piezo::SlowPiezo => self.slow_piezo,
            Piezo::RefCell => self.refcell,
        }
    }

    /// Whether `position` is within `margin` of (or beyond) either end.
    pub fn is_at_limit(&self, piezo: Piezo, position: f64) -> bool {
        let window = self.window(piezo);
        !(window.lower + self.margin < position && position < window.upper - self.margin)
    }

    fn validate(&self) -> MatisseResult<()> {
        if self.margin < 0.0 {
            return invalid("limits.margin must not be negative");
        }
        for piezo in Piezo::ALL {
            let window = self.window(piezo);
            if window.upper - window.lower <= 2.0 * self.margin {
                return invalid(format!(
                    "limits: {} travel [{}, {}] is narrower than twice the margin",
                    piezo, window.lower, window.upper
                ));
            }
        }
        Ok(())
    }
}

/// Target wavelength validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WavelengthSettings {
    /// Lowest accepted target (nm).
    pub min_nm: f64,
    /// Highest accepted target (nm).
    pub max_nm: f64,
    /// Changes at least this large (nm) require explicit confirmation.
    pub confirm_threshold_nm: f64,
}

impl Default for WavelengthSettings {
    fn default() -> Self {
        Self {
            min_nm: limits::MIN_WAVELENGTH_NM,
            max_nm: limits::MAX_WAVELENGTH_NM,
            confirm_threshold_nm: limits::CONFIRM_WAVELENGTH_CHANGE_THRESHOLD_NM,
        }
    }
}

impl WavelengthSettings {
    /// Whether a target lies within the accepted range.
    pub fn contains(&self, wavelength_nm: f64) -> bool {
        (self.min_nm..=self.max_nm).contains(&wavelength_nm)
    }

    fn validate(&self) -> MatisseResult<()> {
        if !(self.min_nm > 0.0 && self.min_nm < self.max_nm) {
            return invalid("wavelength: min_nm must be positive and below max_nm");
        }
        if self.confirm_threshold_nm <= 0.0 {
            return invalid("wavelength.confirm_threshold_nm must be positive");
        }
        Ok(())
    }
}

/// Parameters shared by both coarse sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepSettings {
    /// Half-width of the sweep around the starting position (motor steps).
    pub range: i64,
    /// Distance between samples (motor steps).
    pub step: i64,
    /// Wait after each move before sampling.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Two consecutive readings closer than this count as stable.
    pub stability_tolerance: f64,
    /// Readings attempted per sample before the scan fails.
    pub max_reading_attempts: u32,
    /// Upper bound on the number of sweep positions.
    pub max_steps: usize,
}

impl SweepSettings {
    /// Number of positions visited by one sweep.
    pub fn step_count(&self) -> usize {
        if self.step <= 0 {
            return 0;
        }
        usize::try_from(2 * self.range / self.step + 1).unwrap_or(usize::MAX)
    }

    fn validate(&self, section: &str) -> MatisseResult<()> {
        if self.range <= 0 || self.step <= 0 {
            return invalid(format!("{section}: range and step must be positive"));
        }
        if self.max_reading_attempts < 2 {
            return invalid(format!("{section}: max_reading_attempts must be at least 2"));
        }
        if self.stability_tolerance < 0.0 {
            return invalid(format!("{section}: stability_tolerance must not be negative"));
        }
        if self.step_count() > self.max_steps {
            return invalid(format!(
                "{section}: sweep needs {} steps but max_steps is {}",
                self.step_count(),
                self.max_steps
            ));
        }
        Ok(())
    }
}

/// Birefringent filter sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BifiScanSettings {
    /// Common sweep parameters.
    #[serde(flatten)]
    pub sweep: SweepSettings,
    /// Local power maxima below this fraction of the global maximum are ignored.
    pub peak_fraction: f64,
}

impl Default for BifiScanSettings {
    fn default() -> Self {
        Self {
            sweep: SweepSettings {
                range: 400,
                step: 4,
                settle: Duration::from_millis(20),
                stability_tolerance: 0.02,
                max_reading_attempts: 5,
                max_steps: 500,
            },
            peak_fraction: 0.5,
        }
    }
}

/// Thin etalon sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThinEtalonScanSettings {
    /// Common sweep parameters.
    #[serde(flatten)]
    pub sweep: SweepSettings,
    /// Steps added to the reflex minimum to park on its flank.
    pub offset: i64,
}

impl Default for ThinEtalonScanSettings {
    fn default() -> Self {
        Self {
            sweep: SweepSettings {
                range: 2000,
                step: 10,
                settle: Duration::from_millis(20),
                stability_tolerance: 0.02,
                max_reading_attempts: 5,
                max_steps: 1000,
            },
            offset: -50,
        }
    }
}

/// Both coarse sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScanSettings {
    /// Birefringent filter sweep.
    pub bifi: BifiScanSettings,
    /// Thin etalon sweep.
    pub thin_etalon: ThinEtalonScanSettings,
}

/// Automatic stabilization watchdog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StabilizationSettings {
    /// Interval between lock checks.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Timeout for lock attempts started by the watchdog.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for StabilizationSettings {
    fn default() -> Self {
        Self {
            check_interval: limits::STABILIZATION_CHECK_INTERVAL,
            lock_timeout: limits::DEFAULT_LOCK_TIMEOUT,
        }
    }
}
