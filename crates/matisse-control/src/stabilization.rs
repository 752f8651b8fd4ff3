//! Automatic stabilization watchdog.
//!
//! While enabled, the watchdog checks the fast piezo lock at a fixed interval
//! and starts a new lock attempt whenever the laser is unlocked and no
//! attempt is already running.

use crate::control_loops::ControlLoopRegistry;
use crate::supervisor::LockControl;
use matisse_core::config::StabilizationSettings;
use matisse_core::protocol::FAST_PIEZO_LOCK;
use matisse_core::{InstrumentLink, MatisseError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Starts and stops the stabilization watchdog.
#[derive(Debug, Clone)]
pub struct Stabilizer {
    link: InstrumentLink,
    registry: ControlLoopRegistry,
    lock: LockControl,
    settings: StabilizationSettings,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Stabilizer {
    /// Create a stabilizer.
    pub fn new(
        link: InstrumentLink,
        registry: ControlLoopRegistry,
        lock: LockControl,
        settings: StabilizationSettings,
    ) -> Self {
        Self {
            link,
            registry,
            lock,
            settings,
            watchdog: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the watchdog. Returns `false` if it was already running.
    pub fn stabilize_on(&self) -> bool {
        let mut watchdog = self.watchdog.lock();
        if watchdog.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        info!("Starting automatic stabilization.");
        *watchdog = Some(tokio::spawn(watch_lock(
            self.link.clone(),
            self.lock.clone(),
            self.settings.clone(),
        )));
        self.registry.set_auto_stabilize(true);
        true
    }

    /// Stop the watchdog. Returns `false` if it was not running.
    ///
    /// A lock attempt started by the watchdog keeps running.
    pub fn stabilize_off(&self) -> bool {
        let handle = self.watchdog.lock().take();
        self.registry.set_auto_stabilize(false);
        match handle {
            Some(handle) => {
                info!("Stopping automatic stabilization.");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether the watchdog runs.
    pub fn is_active(&self) -> bool {
        self.watchdog
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

async fn watch_lock(link: InstrumentLink, lock: LockControl, settings: StabilizationSettings) {
    let mut ticker = tokio::time::interval(settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if lock.is_active() {
            continue;
        }
        match link.read_bool(FAST_PIEZO_LOCK).await {
            Ok(true) => debug!("Laser still locked"),
            Ok(false) => {
                info!("Laser is unlocked; starting a lock attempt.");
                match lock.start(settings.lock_timeout) {
                    Ok(_handle) => {}
                    Err(MatisseError::LockAttemptActive) => {}
                    Err(e) => warn!(error = %e, "Could not start lock attempt"),
                }
            }
            Err(e) => warn!(error = %e, "Stabilization check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{LockPhase, LockSupervisor};
    use matisse_core::config::{ActuatorLimits, LockSettings};
    use matisse_core::ControlLoop;
    use matisse_driver_mock::SimulatedMatisse;
    use std::time::Duration;

    fn stabilizer(sim: &SimulatedMatisse) -> (Stabilizer, LockControl, ControlLoopRegistry) {
        let link = InstrumentLink::new(sim.transport());
        let registry = ControlLoopRegistry::new(link.clone());
        let supervisor = LockSupervisor::new(
            link.clone(),
            registry.clone(),
            LockSettings::default(),
            ActuatorLimits::default(),
        );
        let lock = LockControl::new(supervisor, registry.clone());
        let stabilizer = Stabilizer::new(
            link,
            registry.clone(),
            lock.clone(),
            StabilizationSettings::default(),
        );
        (stabilizer, lock, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn unlocked_laser_gets_a_lock_attempt() {
        let sim = SimulatedMatisse::new();
        sim.lock_when_engaged(Duration::from_secs(2));
        let (stabilizer, lock, registry) = stabilizer(&sim);

        assert!(stabilizer.stabilize_on());
        assert!(!stabilizer.stabilize_on());
        assert!(registry.auto_stabilize());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lock.is_active());
        assert_eq!(lock.phase(), Some(LockPhase::Locked));
        assert!(sim.loop_running(ControlLoop::FastPiezo));

        assert!(stabilizer.stabilize_off());
        assert!(!stabilizer.stabilize_off());
        assert!(!registry.auto_stabilize());
        assert!(!stabilizer.is_active());
        // the attempt started by the watchdog is left running
        assert!(lock.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn locked_laser_is_left_alone() {
        let sim = SimulatedMatisse::new();
        sim.lock_after(Duration::ZERO);
        let (stabilizer, lock, registry) = stabilizer(&sim);
        registry.set_loop(ControlLoop::FastPiezo, true).await.unwrap();

        stabilizer.stabilize_on();
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(!lock.is_active());
        assert_eq!(lock.phase(), None);
        assert_eq!(sim.commands_matching("FPZT:LOCK?").len(), 3);
        stabilizer.stabilize_off();
    }
}
