//! Lock acquisition supervisor.
//!
//! A lock attempt engages all four control loops and then polls the
//! instrument once per poll interval until something ends it:
//!
//! ```text
//!  Starting ──engage──▶ Polling ──FPZT:LOCK TRUE──▶ Locked (monitoring)
//!                          │                          │
//!                          ├─ limit, never locked ──▶ LimitBeforeLock
//!                          ├─ timer fired ──────────▶ TimedOut
//!                          └─ stop requested ───────▶ Cancelled
//!                                                     │
//!                              limit after lock lost ─┴▶ LimitAfterLockLost
//!                              stop requested ────────▶ Locked { corrections }
//! ```
//!
//! Once locked, the attempt keeps monitoring: whenever the lock and a limit
//! are seen together, the automatic correction walks the piezos back to
//! mid-travel. The timeout only applies until the first lock.
//!
//! Stop requests (from the timer or the caller) land in a single-slot watch
//! channel. The first reason written wins, the slot is inspected before every
//! instrument query, and the wait between polls wakes as soon as a reason
//! arrives.

use crate::activation::ControlLoopsOn;
use crate::control_loops::ControlLoopRegistry;
use matisse_core::config::{ActuatorLimits, CorrectionPositions, LockSettings};
use matisse_core::protocol::{self, FAST_PIEZO_LOCK};
use matisse_core::{InstrumentLink, MatisseError, MatisseResult, Piezo};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Single-slot stop signal shared by the caller, the timer and the attempt.
type StopSlot = Arc<watch::Sender<Option<StopReason>>>;

/// Why a lock attempt was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The lock timer expired before a lock was seen.
    Timeout,
    /// The caller requested the stop.
    Cancelled,
}

/// Terminal result of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOutcome {
    /// A lock was achieved. `corrections` counts automatic corrections.
    Locked {
        /// Number of automatic corrections applied while locked
        corrections: u32,
    },
    /// No lock within the timeout. Loops stay engaged.
    TimedOut,
    /// An actuator saturated before any lock. Loops are disabled.
    LimitBeforeLock,
    /// Stopped by the caller before any lock.
    Cancelled,
    /// The lock was lost and an actuator is saturated. Loops are disabled.
    LimitAfterLockLost,
}

impl LockOutcome {
    /// Whether the attempt achieved a lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, LockOutcome::Locked { .. })
    }

    fn disables_loops(&self) -> bool {
        matches!(
            self,
            LockOutcome::LimitBeforeLock | LockOutcome::LimitAfterLockLost
        )
    }
}

/// Observable phase of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    /// Claim taken, loops being engaged.
    Starting,
    /// Waiting for the fast piezo to report a lock.
    Polling,
    /// Locked and monitoring for limits.
    Locked,
    /// Attempt over.
    Finished(LockOutcome),
    /// Attempt ended with an error, returned from [`LockHandle::wait`].
    Failed,
}

impl LockPhase {
    /// Whether the attempt has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockPhase::Finished(_) | LockPhase::Failed)
    }
}

/// Which actuators sit at (or within the margin of) an end of travel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    /// Piezo etalon baseline at a limit
    pub piezo_etalon: bool,
    /// Slow piezo at a limit
    pub slow_piezo: bool,
    /// Reference cell at a limit
    pub refcell: bool,
}

impl LimitStatus {
    /// Whether any actuator is at a limit.
    pub fn any(&self) -> bool {
        self.piezo_etalon || self.slow_piezo || self.refcell
    }

    /// Actuators at a limit.
    pub fn at_limit(&self) -> Vec<Piezo> {
        Piezo::ALL
            .into_iter()
            .filter(|piezo| self.get(*piezo))
            .collect()
    }

    /// Flag for one actuator.
    pub fn get(&self, piezo: Piezo) -> bool {
        match piezo {
            Piezo::PiezoEtalon => self.piezo_etalon,
            Piezo::SlowPiezo => self.slow_piezo,
            Piezo::RefCell => self.refcell,
        }
    }

    fn set(&mut self, piezo: Piezo, at_limit: bool) {
        match piezo {
            Piezo::PiezoEtalon => self.piezo_etalon = at_limit,
            Piezo::SlowPiezo => self.slow_piezo = at_limit,
            Piezo::RefCell => self.refcell = at_limit,
        }
    }
}

/// Poll the three piezo positions and compare them with their travel windows.
///
/// Always queries the instrument; nothing is cached.
pub async fn query_limits(
    link: &InstrumentLink,
    limits: &ActuatorLimits,
) -> MatisseResult<LimitStatus> {
    let mut session = link.session().await;
    let mut status = LimitStatus::default();
    for piezo in Piezo::ALL {
        let position = session.read_f64(piezo.position_parameter()).await?;
        status.set(piezo, limits.is_at_limit(piezo, position));
    }
    Ok(status)
}

/// Move piezo etalon, slow piezo and reference cell back to their correction
/// positions, in that order. Each command is issued once and not verified.
pub async fn apply_correction(
    link: &InstrumentLink,
    positions: &CorrectionPositions,
) -> MatisseResult<()> {
    let mut session = link.session().await;
    for piezo in Piezo::ALL {
        let command = protocol::set(piezo.position_parameter(), positions.position(piezo));
        session.command(&command).await?;
    }
    Ok(())
}

/// Starts lock attempts.
#[derive(Debug, Clone)]
pub struct LockSupervisor {
    link: InstrumentLink,
    registry: ControlLoopRegistry,
    settings: LockSettings,
    limits: ActuatorLimits,
}

impl LockSupervisor {
    /// Create a supervisor.
    pub fn new(
        link: InstrumentLink,
        registry: ControlLoopRegistry,
        settings: LockSettings,
        limits: ActuatorLimits,
    ) -> Self {
        Self {
            link,
            registry,
            settings,
            limits,
        }
    }

    /// Start a lock attempt with the given timeout.
    ///
    /// The loop claim is taken before this returns, so a concurrent request
    /// fails immediately with [`MatisseError::LockAttemptActive`]. Must be
    /// called within a tokio runtime.
    pub fn start(&self, timeout: Duration) -> MatisseResult<LockHandle> {
        let guard = ControlLoopsOn::claim(&self.registry)?;
        let (stop_tx, stop_rx) = watch::channel(None);
        let stop_tx = Arc::new(stop_tx);
        let (phase_tx, phase_rx) = watch::channel(LockPhase::Starting);

        let attempt = LockAttempt {
            link: self.link.clone(),
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            limits: self.limits.clone(),
            timeout,
            stop_tx: stop_tx.clone(),
            stop_rx,
            phase_tx,
        };
        let task = tokio::spawn(attempt.run(guard));

        Ok(LockHandle {
            stopper: LockStopper {
                stop: stop_tx,
                phase: phase_rx,
            },
            task,
        })
    }
}

/// Requests a stop and observes the phase of a running attempt.
#[derive(Debug, Clone)]
pub struct LockStopper {
    stop: StopSlot,
    phase: watch::Receiver<LockPhase>,
}

impl LockStopper {
    /// Ask the attempt to stop. Has no effect if a reason is already set.
    pub fn stop(&self) {
        request_stop(&self.stop, StopReason::Cancelled);
    }

    /// Latest published phase.
    pub fn phase(&self) -> LockPhase {
        *self.phase.borrow()
    }

    /// Wait until the attempt finishes.
    ///
    /// Returns the outcome, or `None` if the attempt ended with an error.
    pub async fn finished(&self) -> Option<LockOutcome> {
        let mut phase = self.phase.clone();
        let finished = phase
            .wait_for(LockPhase::is_terminal)
            .await
            .ok()
            .map(|p| *p);
        match finished {
            Some(LockPhase::Finished(outcome)) => Some(outcome),
            _ => None,
        }
    }
}

/// Handle to a running lock attempt.
#[derive(Debug)]
pub struct LockHandle {
    stopper: LockStopper,
    task: JoinHandle<MatisseResult<LockOutcome>>,
}

impl LockHandle {
    /// Ask the attempt to stop.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Latest published phase.
    pub fn phase(&self) -> LockPhase {
        self.stopper.phase()
    }

    /// Subscribe to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<LockPhase> {
        self.stopper.phase.clone()
    }

    /// Cloneable stop/observe handle.
    pub fn stopper(&self) -> LockStopper {
        self.stopper.clone()
    }

    /// Whether the attempt task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome.
    ///
    /// Link errors inside the attempt are returned here.
    pub async fn wait(self) -> MatisseResult<LockOutcome> {
        self.task
            .await
            .map_err(|e| MatisseError::TaskFailed(format!("lock attempt: {}", e)))?
    }
}

fn request_stop(stop: &watch::Sender<Option<StopReason>>, reason: StopReason) {
    stop.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(reason);
            true
        } else {
            false
        }
    });
}

/// One-shot timer writing [`StopReason::Timeout`] into the stop slot.
/// Cancelled explicitly or on drop.
struct LockTimer(Option<JoinHandle<()>>);

impl LockTimer {
    fn arm(timeout: Duration, stop: StopSlot) -> Self {
        Self(Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            request_stop(&stop, StopReason::Timeout);
        })))
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for LockTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct LockAttempt {
    link: InstrumentLink,
    registry: ControlLoopRegistry,
    settings: LockSettings,
    limits: ActuatorLimits,
    timeout: Duration,
    stop_tx: StopSlot,
    stop_rx: watch::Receiver<Option<StopReason>>,
    phase_tx: watch::Sender<LockPhase>,
}

impl LockAttempt {
    #[instrument(name = "lock_attempt", skip_all, fields(timeout = ?self.timeout))]
    async fn run(mut self, guard: ControlLoopsOn) -> MatisseResult<LockOutcome> {
        let result = self.supervise(&guard).await;

        let result = match result {
            Ok(outcome) => {
                if outcome.disables_loops() {
                    info!("Stopping control loops.");
                    self.registry.set_all(false).await.map(|()| outcome)
                } else {
                    Ok(outcome)
                }
            }
            Err(e) => {
                warn!(error = %e, "Lock attempt failed; disabling control loops");
                if let Err(disable_err) = self.registry.set_all(false).await {
                    warn!(error = %disable_err, "Failed to disable control loops");
                }
                Err(e)
            }
        };

        // The claim is free before the terminal phase is published.
        drop(guard);
        match &result {
            Ok(outcome) => {
                info!(?outcome, "Lock attempt finished");
                self.phase_tx.send_replace(LockPhase::Finished(*outcome));
            }
            Err(_) => {
                self.phase_tx.send_replace(LockPhase::Failed);
            }
        }
        result
    }

    async fn supervise(&mut self, guard: &ControlLoopsOn) -> MatisseResult<LockOutcome> {
        info!(before = ?guard.snapshot(), "Engaging control loops.");
        guard.engage().await?;
        let mut timer = LockTimer::arm(self.timeout, self.stop_tx.clone());
        self.phase_tx.send_replace(LockPhase::Polling);
        info!("Waiting for the fast piezo to lock.");

        let mut lock_achieved = false;
        let mut currently_locked = false;
        let mut corrections = 0u32;

        loop {
            let stop = *self.stop_rx.borrow_and_update();
            if let Some(reason) = stop {
                timer.cancel();
                return Ok(match reason {
                    StopReason::Timeout => {
                        warn!("Laser did not lock within {:?}.", self.timeout);
                        LockOutcome::TimedOut
                    }
                    StopReason::Cancelled if lock_achieved => LockOutcome::Locked { corrections },
                    StopReason::Cancelled => LockOutcome::Cancelled,
                });
            }

            let locked = self.link.read_bool(FAST_PIEZO_LOCK).await?;
            if locked {
                if !currently_locked {
                    timer.cancel();
                    info!("Laser locked.");
                    self.phase_tx.send_replace(LockPhase::Locked);
                }
                lock_achieved = true;
                currently_locked = true;

                let limits = query_limits(&self.link, &self.limits).await?;
                if limits.any() {
                    warn!(
                        at_limit = ?limits.at_limit(),
                        "A component has hit a limit while the laser is locked. \
                         Attempting automatic corrections."
                    );
                    apply_correction(&self.link, &self.settings.correction).await?;
                    corrections += 1;
                }
            } else {
                if currently_locked {
                    warn!("Laser lost its lock.");
                    self.phase_tx.send_replace(LockPhase::Polling);
                }
                currently_locked = false;

                let limits = query_limits(&self.link, &self.limits).await?;
                if limits.any() {
                    timer.cancel();
                    if lock_achieved {
                        warn!(
                            at_limit = ?limits.at_limit(),
                            "A component has hit a limit after the lock was lost."
                        );
                        return Ok(LockOutcome::LimitAfterLockLost);
                    }
                    warn!(
                        at_limit = ?limits.at_limit(),
                        "A component has hit a limit before the laser could lock."
                    );
                    return Ok(LockOutcome::LimitBeforeLock);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.stop_rx.changed() => {}
            }
        }
    }
}

/// Owner of the single current lock attempt.
///
/// Keeps a [`LockStopper`] for the latest attempt so it can be stopped by
/// anyone holding the controller, while the [`LockHandle`] goes to the
/// caller that started it.
#[derive(Debug, Clone)]
pub struct LockControl {
    supervisor: LockSupervisor,
    registry: ControlLoopRegistry,
    current: Arc<Mutex<Option<LockStopper>>>,
}

impl LockControl {
    /// Create a lock controller.
    pub fn new(supervisor: LockSupervisor, registry: ControlLoopRegistry) -> Self {
        Self {
            supervisor,
            registry,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a lock attempt, failing fast if one is active.
    pub fn start(&self, timeout: Duration) -> MatisseResult<LockHandle> {
        let handle = self.supervisor.start(timeout)?;
        *self.current.lock() = Some(handle.stopper());
        Ok(handle)
    }

    /// Whether an attempt currently holds the loops.
    pub fn is_active(&self) -> bool {
        self.registry.is_claimed()
    }

    /// Phase of the latest attempt, if any was started.
    pub fn phase(&self) -> Option<LockPhase> {
        self.current.lock().as_ref().map(LockStopper::phase)
    }

    /// Stop the current attempt (if any), wait for it to end, and disable
    /// every control loop.
    ///
    /// Returns the outcome of the stopped attempt.
    pub async fn stop(&self) -> MatisseResult<Option<LockOutcome>> {
        let stopper = self.current.lock().take();
        let outcome = match stopper {
            Some(stopper) => {
                stopper.stop();
                stopper.finished().await
            }
            None => None,
        };
        info!("Stopping control loops.");
        self.registry.set_all(false).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matisse_core::ControlLoop;
    use matisse_driver_mock::SimulatedMatisse;
    use tracing_test::traced_test;

    fn supervisor(sim: &SimulatedMatisse) -> (LockSupervisor, ControlLoopRegistry) {
        let link = InstrumentLink::new(sim.transport());
        let registry = ControlLoopRegistry::new(link.clone());
        let supervisor = LockSupervisor::new(
            link,
            registry.clone(),
            LockSettings::default(),
            ActuatorLimits::default(),
        );
        (supervisor, registry)
    }

    #[test]
    fn outcome_loop_policy() {
        assert!(LockOutcome::LimitBeforeLock.disables_loops());
        assert!(LockOutcome::LimitAfterLockLost.disables_loops());
        assert!(!LockOutcome::TimedOut.disables_loops());
        assert!(!LockOutcome::Locked { corrections: 0 }.disables_loops());
        assert!(LockOutcome::Locked { corrections: 2 }.is_locked());
    }

    #[test]
    fn first_stop_reason_wins() {
        let (tx, rx) = watch::channel(None);
        request_stop(&tx, StopReason::Timeout);
        request_stop(&tx, StopReason::Cancelled);
        assert_eq!(*rx.borrow(), Some(StopReason::Timeout));
    }

    #[tokio::test]
    async fn limits_are_polled_fresh() {
        let sim = SimulatedMatisse::new();
        let link = InstrumentLink::new(sim.transport());
        let limits = ActuatorLimits::default();

        assert!(!query_limits(&link, &limits).await.unwrap().any());
        sim.set_piezo(Piezo::RefCell, 0.01);
        let status = query_limits(&link, &limits).await.unwrap();
        assert_eq!(status.at_limit(), vec![Piezo::RefCell]);
        assert_eq!(sim.commands_matching("SCAN:NOW?").len(), 2);
    }

    #[tokio::test]
    async fn correction_order_is_fixed() {
        let sim = SimulatedMatisse::new();
        let link = InstrumentLink::new(sim.transport());
        apply_correction(&link, &CorrectionPositions::default())
            .await
            .unwrap();
        assert_eq!(
            sim.commands(),
            vec![
                "PZETL:BASE 0".to_string(),
                "SPZT:NOW 0.35".to_string(),
                "SCAN:NOW 0.35".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_fails_fast() {
        let sim = SimulatedMatisse::new();
        let (supervisor, _registry) = supervisor(&sim);

        let handle = supervisor.start(Duration::from_secs(5)).unwrap();
        let err = supervisor.start(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MatisseError::LockAttemptActive));

        handle.stop();
        assert_eq!(handle.wait().await.unwrap(), LockOutcome::Cancelled);
        assert!(supervisor.start(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn claim_is_free_when_finish_is_observed() {
        let sim = SimulatedMatisse::new();
        let (supervisor, _registry) = supervisor(&sim);

        for _ in 0..20 {
            let handle = supervisor.start(Duration::from_secs(30)).unwrap();
            let stopper = handle.stopper();
            stopper.stop();
            assert_eq!(stopper.finished().await, Some(LockOutcome::Cancelled));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_publishes_terminal_phase() {
        let sim = SimulatedMatisse::new();
        sim.fail_on("FPZT:LOCK?", "timeout");
        let (supervisor, registry) = supervisor(&sim);

        let handle = supervisor.start(Duration::from_secs(30)).unwrap();
        let stopper = handle.stopper();
        assert_eq!(stopper.finished().await, None);
        assert_eq!(stopper.phase(), LockPhase::Failed);
        assert!(handle.wait().await.is_err());
        assert!(!registry.is_claimed());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn attempt_logs_loop_state_before_engaging() {
        let sim = SimulatedMatisse::new();
        let (supervisor, _registry) = supervisor(&sim);

        let handle = supervisor.start(Duration::from_secs(30)).unwrap();
        handle.stop();
        handle.wait().await.unwrap();

        assert!(logs_contain("Engaging control loops."));
        assert!(logs_contain("fast_piezo: false"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_attempt_before_next_query() {
        let sim = SimulatedMatisse::new();
        let (supervisor, registry) = supervisor(&sim);

        let handle = supervisor.start(Duration::from_secs(30)).unwrap();
        let mut phase = handle.subscribe();
        phase.wait_for(|p| *p == LockPhase::Polling).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let queries_before = sim.commands_matching("FPZT:LOCK?").len();
        handle.stop();
        assert_eq!(handle.wait().await.unwrap(), LockOutcome::Cancelled);
        assert_eq!(sim.commands_matching("FPZT:LOCK?").len(), queries_before);
        assert!(!registry.is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_control_stop_disables_loops() {
        let sim = SimulatedMatisse::new();
        sim.lock_after(Duration::from_secs(1));
        let (supervisor, registry) = supervisor(&sim);
        let control = LockControl::new(supervisor, registry.clone());

        let handle = control.start(Duration::from_secs(30)).unwrap();
        handle
            .subscribe()
            .wait_for(|p| *p == LockPhase::Locked)
            .await
            .unwrap();

        let outcome = control.stop().await.unwrap();
        assert_eq!(outcome, Some(LockOutcome::Locked { corrections: 0 }));
        assert!(!registry.snapshot().fast_piezo);
        assert!(!sim.loop_running(ControlLoop::FastPiezo));
        assert!(!control.is_active());
    }
}
