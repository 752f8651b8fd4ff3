//! Shared constants for lock supervision and actuator travel.
//!
//! These are the library defaults; every one of them can be overridden via
//! [`Settings`](crate::config::Settings).

use std::time::Duration;

// =============================================================================
// Timing
// =============================================================================

/// Cadence of the lock supervisor's status polling (1 second).
///
/// Bounds the latency of detecting a saturated actuator without
/// busy-polling the instrument link.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default window for acquiring a lock (30 seconds).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-exchange timeout on a physical transport (5 seconds).
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for background operations to wind down on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between lock checks while automatic stabilization is on.
pub const STABILIZATION_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Wavelength
// =============================================================================

/// Requested changes at least this large (nm) need explicit confirmation.
pub const CONFIRM_WAVELENGTH_CHANGE_THRESHOLD_NM: f64 = 10.0;

/// Lower end of the accepted target wavelength range (nm).
pub const MIN_WAVELENGTH_NM: f64 = 690.0;

/// Upper end of the accepted target wavelength range (nm).
pub const MAX_WAVELENGTH_NM: f64 = 1050.0;

// =============================================================================
// Automatic correction targets
// =============================================================================

/// Piezo etalon baseline after an automatic correction.
pub const PIEZO_ETALON_CORRECTION_POS: f64 = 0.0;

/// Slow piezo position after an automatic correction.
pub const SLOW_PIEZO_CORRECTION_POS: f64 = 0.35;

/// Reference cell position after an automatic correction.
pub const REFCELL_CORRECTION_POS: f64 = 0.35;

// =============================================================================
// Actuator travel
// =============================================================================

/// Distance from either end of travel at which an actuator counts as
/// having reached its limit.
pub const LIMIT_MARGIN: f64 = 0.05;

/// Piezo etalon baseline travel.
pub const PIEZO_ETALON_TRAVEL: (f64, f64) = (-1.0, 1.0);

/// Slow piezo travel.
pub const SLOW_PIEZO_TRAVEL: (f64, f64) = (0.0, 0.7);

/// Reference cell travel.
pub const REFCELL_TRAVEL: (f64, f64) = (0.0, 0.7);
