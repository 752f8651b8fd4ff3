//! Controller façade.
//!
//! [`Matisse`] owns the instrument link and every component built on it.
//! All components share the one serialized link, so lock supervision, scans
//! and set operations may run concurrently without interleaving exchanges.

use crate::control_loops::{ControlLoopRegistry, ControlLoopState};
use crate::positioning::{Positioner, TargetWavelength};
use crate::scan::{ScanReport, Scanner};
use crate::stabilization::Stabilizer;
use crate::supervisor::{
    query_limits, LimitStatus, LockControl, LockHandle, LockOutcome, LockPhase, LockSupervisor,
};
use crate::tasks::{Operation, OperationTracker};
use matisse_core::limits::SHUTDOWN_TIMEOUT;
use matisse_core::protocol::FAST_PIEZO_LOCK;
use matisse_core::{
    ControlLoop, InstrumentLink, MatisseError, MatisseResult, Motor, Piezo, ScanKind, Settings,
    Transport,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Point-in-time view of the instrument and controller state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// BiFi position as a wavelength (nm)
    pub bifi_wavelength_nm: f64,
    /// Last confirmed target wavelength (nm)
    pub target_wavelength_nm: Option<f64>,
    /// BiFi motor position
    pub bifi_motor: i64,
    /// Thin etalon motor position
    pub thin_etalon_motor: i64,
    /// Piezo etalon baseline
    pub piezo_etalon: f64,
    /// Slow piezo position
    pub slow_piezo: f64,
    /// Reference cell position
    pub refcell: f64,
    /// Fast piezo lock indicator
    pub locked: bool,
    /// Actuators at a limit
    pub limits: LimitStatus,
    /// Cached loop state
    pub loops: ControlLoopState,
    /// Phase of the latest lock attempt
    pub lock_phase: Option<LockPhase>,
}

/// Result of a full tuning procedure.
#[derive(Debug)]
pub struct TuneReport {
    /// Birefringent filter sweep
    pub bifi: ScanReport,
    /// Thin etalon sweep
    pub thin_etalon: ScanReport,
    /// Lock attempt started afterwards, if requested
    pub lock: Option<LockHandle>,
}

/// Matisse laser controller.
#[derive(Debug)]
pub struct Matisse {
    link: InstrumentLink,
    settings: Settings,
    registry: ControlLoopRegistry,
    lock: LockControl,
    positioner: Positioner,
    scanner: Scanner,
    stabilizer: Stabilizer,
    operations: OperationTracker,
}

impl Matisse {
    /// Connect to the instrument.
    ///
    /// Clears latent instrument errors and reads the current loop state.
    /// Any failure is reported as [`MatisseError::LinkUnavailable`]; no
    /// partially initialized controller is returned.
    #[instrument(skip_all, err)]
    pub async fn connect(transport: Box<dyn Transport>, settings: Settings) -> MatisseResult<Self> {
        settings.validate()?;
        let link = InstrumentLink::open(transport).await?;

        let registry = ControlLoopRegistry::new(link.clone());
        registry
            .refresh()
            .await
            .map_err(|e| MatisseError::LinkUnavailable(e.to_string()))?;

        let supervisor = LockSupervisor::new(
            link.clone(),
            registry.clone(),
            settings.lock.clone(),
            settings.limits.clone(),
        );
        let lock = LockControl::new(supervisor, registry.clone());
        let target = TargetWavelength::default();
        let positioner = Positioner::new(
            link.clone(),
            target.clone(),
            settings.wavelength.clone(),
            settings.limits.clone(),
        );
        let scanner = Scanner::new(link.clone(), target, settings.scans.clone());
        let stabilizer = Stabilizer::new(
            link.clone(),
            registry.clone(),
            lock.clone(),
            settings.stabilization.clone(),
        );

        Ok(Self {
            link,
            settings,
            registry,
            lock,
            positioner,
            scanner,
            stabilizer,
            operations: OperationTracker::new(),
        })
    }

    /// Shared instrument link.
    pub fn link(&self) -> &InstrumentLink {
        &self.link
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Tracker of background operations.
    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    // =========================================================================
    // Control loops
    // =========================================================================

    /// Switch one control loop.
    pub async fn set_loop(&self, control_loop: ControlLoop, enabled: bool) -> MatisseResult<()> {
        self.registry.set_loop(control_loop, enabled).await
    }

    /// Cached state of one loop.
    pub fn get_loop(&self, control_loop: ControlLoop) -> bool {
        self.registry.get_loop(control_loop)
    }

    /// Cached state of every loop.
    pub fn loop_state(&self) -> ControlLoopState {
        self.registry.snapshot()
    }

    // =========================================================================
    // Lock acquisition
    // =========================================================================

    /// Start a lock attempt. `None` uses the configured timeout.
    pub fn start_laser_lock_correction(
        &self,
        timeout: Option<Duration>,
    ) -> MatisseResult<LockHandle> {
        self.lock.start(timeout.unwrap_or(self.settings.lock.timeout))
    }

    /// Stop the current lock attempt and disable every control loop.
    pub async fn stop_laser_lock_correction(&self) -> MatisseResult<Option<LockOutcome>> {
        self.lock.stop().await
    }

    /// Whether a lock attempt is running.
    pub fn is_lock_correction_active(&self) -> bool {
        self.lock.is_active()
    }

    /// Phase of the latest lock attempt.
    pub fn lock_phase(&self) -> Option<LockPhase> {
        self.lock.phase()
    }

    /// Query the fast piezo lock indicator.
    pub async fn fast_piezo_locked(&self) -> MatisseResult<bool> {
        self.link.read_bool(FAST_PIEZO_LOCK).await
    }

    /// Freshly polled limit status.
    pub async fn limit_status(&self) -> MatisseResult<LimitStatus> {
        query_limits(&self.link, &self.settings.limits).await
    }

    /// Whether any actuator sits at a limit.
    pub async fn is_any_limit_reached(&self) -> MatisseResult<bool> {
        Ok(self.limit_status().await?.any())
    }

    // =========================================================================
    // Wavelength and positions
    // =========================================================================

    /// Tune to `wavelength_nm` and record it as the target.
    pub async fn set_wavelength(&self, wavelength_nm: f64) -> MatisseResult<()> {
        self.positioner.set_wavelength(wavelength_nm).await
    }

    /// Run [`set_wavelength`](Self::set_wavelength) in the background.
    pub fn spawn_set_wavelength(&self, wavelength_nm: f64) -> Operation<()> {
        let positioner = self.positioner.clone();
        self.operations
            .spawn(format!("set wavelength {} nm", wavelength_nm), async move {
                positioner.set_wavelength(wavelength_nm).await
            })
    }

    /// Last confirmed target wavelength.
    pub fn target_wavelength(&self) -> Option<f64> {
        self.positioner.target_wavelength()
    }

    /// Whether moving to `requested_nm` needs operator confirmation.
    pub async fn needs_confirmation(&self, requested_nm: f64) -> MatisseResult<bool> {
        self.positioner.needs_confirmation(requested_nm).await
    }

    /// BiFi position as a wavelength (nm).
    pub async fn bifi_wavelength(&self) -> MatisseResult<f64> {
        self.positioner.bifi_wavelength().await
    }

    /// Move the BiFi to an approximate wavelength without changing the target.
    pub async fn set_bifi_wavelength(&self, wavelength_nm: f64) -> MatisseResult<()> {
        self.positioner.set_bifi_wavelength(wavelength_nm).await
    }

    /// Move a stepper motor.
    pub async fn set_motor_position(&self, motor: Motor, position: i64) -> MatisseResult<()> {
        self.positioner.set_motor_position(motor, position).await
    }

    /// Read a stepper motor position.
    pub async fn motor_position(&self, motor: Motor) -> MatisseResult<i64> {
        self.positioner.motor_position(motor).await
    }

    /// Move a piezo.
    pub async fn set_piezo_position(&self, piezo: Piezo, position: f64) -> MatisseResult<()> {
        self.positioner.set_piezo_position(piezo, position).await
    }

    /// Read a piezo position.
    pub async fn piezo_position(&self, piezo: Piezo) -> MatisseResult<f64> {
        self.positioner.piezo_position(piezo).await
    }

    // =========================================================================
    // Coarse tuning
    // =========================================================================

    /// Run the birefringent filter sweep.
    pub async fn birefringent_filter_scan(&self) -> MatisseResult<ScanReport> {
        self.scanner.birefringent_filter_scan().await
    }

    /// Run the thin etalon sweep.
    pub async fn thin_etalon_scan(&self) -> MatisseResult<ScanReport> {
        self.scanner.thin_etalon_scan().await
    }

    /// Start a sweep in the background.
    ///
    /// Fails immediately with [`MatisseError::ScanInProgress`] if a sweep of
    /// the same kind is running.
    pub fn start_scan(&self, kind: ScanKind) -> MatisseResult<Operation<ScanReport>> {
        let claim = self.scanner.claim(kind)?;
        let scanner = self.scanner.clone();
        Ok(self
            .operations
            .spawn(kind.to_string(), async move { scanner.run_claimed(claim).await }))
    }

    /// Full tuning procedure: stop locking, set the wavelength, run both
    /// sweeps and optionally start a new lock attempt.
    #[instrument(skip(self), err)]
    pub async fn tune_to_wavelength(
        &self,
        wavelength_nm: f64,
        relock: bool,
    ) -> MatisseResult<TuneReport> {
        self.positioner.check_wavelength(wavelength_nm)?;
        info!("Tuning to {} nm", wavelength_nm);

        self.stabilizer.stabilize_off();
        self.lock.stop().await?;
        self.positioner.set_wavelength(wavelength_nm).await?;
        let bifi = self.scanner.birefringent_filter_scan().await?;
        let thin_etalon = self.scanner.thin_etalon_scan().await?;

        let lock = if relock {
            Some(self.start_laser_lock_correction(None)?)
        } else {
            None
        };
        Ok(TuneReport {
            bifi,
            thin_etalon,
            lock,
        })
    }

    // =========================================================================
    // Stabilization
    // =========================================================================

    /// Enable automatic stabilization. Idempotent.
    pub fn stabilize_on(&self) -> bool {
        self.stabilizer.stabilize_on()
    }

    /// Disable automatic stabilization. Idempotent.
    pub fn stabilize_off(&self) -> bool {
        self.stabilizer.stabilize_off()
    }

    /// Whether automatic stabilization runs.
    pub fn is_stabilizing(&self) -> bool {
        self.stabilizer.is_active()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Read a full status snapshot.
    pub async fn status(&self) -> MatisseResult<StatusSnapshot> {
        Ok(StatusSnapshot {
            bifi_wavelength_nm: self.positioner.bifi_wavelength().await?,
            target_wavelength_nm: self.positioner.target_wavelength(),
            bifi_motor: self.positioner.motor_position(Motor::BirefringentFilter).await?,
            thin_etalon_motor: self.positioner.motor_position(Motor::ThinEtalon).await?,
            piezo_etalon: self.positioner.piezo_position(Piezo::PiezoEtalon).await?,
            slow_piezo: self.positioner.piezo_position(Piezo::SlowPiezo).await?,
            refcell: self.positioner.piezo_position(Piezo::RefCell).await?,
            locked: self.fast_piezo_locked().await?,
            limits: self.limit_status().await?,
            loops: self.registry.snapshot(),
            lock_phase: self.lock.phase(),
        })
    }

    /// Cancel running sweeps, wait for them to put their motors back, then
    /// abort whatever background work is left.
    pub async fn stop_operations(&self) {
        self.scanner.cancel_all();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.scanner.wait_idle())
            .await
            .is_err()
        {
            warn!("Scans did not wind down within {:?}", SHUTDOWN_TIMEOUT);
        }
        self.operations.shutdown(SHUTDOWN_TIMEOUT).await;
    }

    /// Stop stabilization and lock correction, disable the loops and stop
    /// outstanding background operations.
    ///
    /// Every step is attempted; the first error is returned.
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> MatisseResult<()> {
        info!("Shutting down Matisse controller");
        self.stabilizer.stabilize_off();
        let stopped = self.lock.stop().await;
        if let Err(e) = &stopped {
            warn!(error = %e, "Failed to stop lock correction cleanly");
        }
        self.stop_operations().await;
        stopped.map(|_| ())
    }
}
