//! Cached on/off state of the four feedback loops.
//!
//! The cache mirrors the most recently *confirmed* instrument state: a flag
//! changes only after the instrument acknowledges the `CNTRSTA` command, and
//! the update happens while the link session that received the
//! acknowledgement is still held.

use matisse_core::{ControlLoop, InstrumentLink, MatisseResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

/// Confirmed state of every loop plus the automatic stabilization flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlLoopState {
    /// Slow piezo loop engaged
    pub slow_piezo: bool,
    /// Thin etalon loop engaged
    pub thin_etalon: bool,
    /// Piezo etalon loop engaged
    pub piezo_etalon: bool,
    /// Fast piezo loop engaged
    pub fast_piezo: bool,
    /// Automatic stabilization watchdog running
    pub auto_stabilize: bool,
}

impl ControlLoopState {
    /// Flag for one loop.
    pub fn get(&self, control_loop: ControlLoop) -> bool {
        match control_loop {
            ControlLoop::SlowPiezo => self.slow_piezo,
            ControlLoop::ThinEtalon => self.thin_etalon,
            ControlLoop::PiezoEtalon => self.piezo_etalon,
            ControlLoop::FastPiezo => self.fast_piezo,
        }
    }

    fn set(&mut self, control_loop: ControlLoop, enabled: bool) {
        let flag = match control_loop {
            ControlLoop::SlowPiezo => &mut self.slow_piezo,
            ControlLoop::ThinEtalon => &mut self.thin_etalon,
            ControlLoop::PiezoEtalon => &mut self.piezo_etalon,
            ControlLoop::FastPiezo => &mut self.fast_piezo,
        };
        *flag = enabled;
    }

    /// Whether all four loops are engaged.
    pub fn all_enabled(&self) -> bool {
        ControlLoop::ALL.iter().all(|l| self.get(*l))
    }
}

/// Registry of loop state shared by every controller component.
///
/// Also carries the single lock-attempt claim used by
/// [`ControlLoopsOn`](crate::activation::ControlLoopsOn).
#[derive(Debug, Clone)]
pub struct ControlLoopRegistry {
    link: InstrumentLink,
    state: Arc<RwLock<ControlLoopState>>,
    claimed: Arc<AtomicBool>,
}

impl ControlLoopRegistry {
    /// Create a registry with every loop assumed off.
    pub fn new(link: InstrumentLink) -> Self {
        Self {
            link,
            state: Arc::new(RwLock::new(ControlLoopState::default())),
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch one loop on or off.
    ///
    /// The command is always sent, even when the cached flag already matches.
    /// On rejection the cached flag is left untouched.
    #[instrument(skip(self), err)]
    pub async fn set_loop(&self, control_loop: ControlLoop, enabled: bool) -> MatisseResult<()> {
        let verb = if enabled { "Locking" } else { "Unlocking" };
        info!("{} {}.", verb, control_loop);

        let mut session = self.link.session().await;
        session.command(&control_loop.command(enabled)).await?;
        self.state.write().set(control_loop, enabled);
        Ok(())
    }

    /// Cached flag for one loop.
    pub fn get_loop(&self, control_loop: ControlLoop) -> bool {
        self.state.read().get(control_loop)
    }

    /// Switch every loop in the fixed order slow piezo, thin etalon, piezo
    /// etalon, fast piezo. Stops at the first failure.
    pub async fn set_all(&self, enabled: bool) -> MatisseResult<()> {
        for control_loop in ControlLoop::ALL {
            self.set_loop(control_loop, enabled).await?;
        }
        Ok(())
    }

    /// Read every loop's status from the instrument into the cache.
    pub async fn refresh(&self) -> MatisseResult<ControlLoopState> {
        let mut session = self.link.session().await;
        for control_loop in ControlLoop::ALL {
            let running = session.read_bool(control_loop.status_parameter()).await?;
            self.state.write().set(control_loop, running);
        }
        Ok(self.snapshot())
    }

    /// Copy of the cached state.
    pub fn snapshot(&self) -> ControlLoopState {
        *self.state.read()
    }

    /// Record whether automatic stabilization runs.
    pub fn set_auto_stabilize(&self, enabled: bool) {
        self.state.write().auto_stabilize = enabled;
    }

    /// Whether automatic stabilization runs.
    pub fn auto_stabilize(&self) -> bool {
        self.state.read().auto_stabilize
    }

    /// Whether a lock attempt currently holds the loops.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matisse_driver_mock::SimulatedMatisse;
    use tracing_test::traced_test;

    fn registry() -> (ControlLoopRegistry, SimulatedMatisse) {
        let sim = SimulatedMatisse::new();
        let link = InstrumentLink::new(sim.transport());
        (ControlLoopRegistry::new(link), sim)
    }

    #[tokio::test]
    async fn set_loop_updates_cache_after_ack() {
        let (registry, sim) = registry();
        registry.set_loop(ControlLoop::SlowPiezo, true).await.unwrap();

        assert!(registry.get_loop(ControlLoop::SlowPiezo));
        assert!(sim.loop_running(ControlLoop::SlowPiezo));
        assert_eq!(sim.commands(), vec!["SPZT:CNTRSTA RUN".to_string()]);
    }

    #[tokio::test]
    async fn repeated_set_reissues_command() {
        let (registry, sim) = registry();
        registry.set_loop(ControlLoop::FastPiezo, true).await.unwrap();
        registry.set_loop(ControlLoop::FastPiezo, true).await.unwrap();

        assert!(registry.get_loop(ControlLoop::FastPiezo));
        assert_eq!(sim.commands_matching("FPZT:CNTRSTA").len(), 2);
    }

    #[tokio::test]
    async fn rejected_command_leaves_cache_unchanged() {
        let (registry, sim) = registry();
        sim.reject("TE:CNTRSTA", "ERROR:CODE 9 - interlock");

        let err = registry.set_loop(ControlLoop::ThinEtalon, true).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("interlock"));
        assert!(!registry.get_loop(ControlLoop::ThinEtalon));
    }

    #[tokio::test]
    async fn set_all_uses_fixed_order() {
        let (registry, sim) = registry();
        registry.set_all(true).await.unwrap();

        assert!(registry.snapshot().all_enabled());
        assert_eq!(
            sim.commands(),
            vec![
                "SPZT:CNTRSTA RUN".to_string(),
                "TE:CNTRSTA RUN".to_string(),
                "PZETL:CNTRSTA RUN".to_string(),
                "FPZT:CNTRSTA RUN".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn refresh_reads_instrument_state() {
        let (registry, sim) = registry();
        let link = InstrumentLink::new(sim.transport());
        link.command("PZETL:CNTRSTA RUN").await.unwrap();

        let state = registry.refresh().await.unwrap();
        assert!(state.piezo_etalon);
        assert!(!state.slow_piezo);
    }

    #[test]
    fn claim_is_exclusive() {
        let (registry, _sim) = registry();
        assert!(registry.try_claim());
        assert!(!registry.try_claim());
        registry.release_claim();
        assert!(registry.try_claim());
    }

    #[tokio::test]
    #[traced_test]
    async fn toggles_are_logged() {
        let (registry, _sim) = registry();
        registry.set_loop(ControlLoop::SlowPiezo, true).await.unwrap();
        registry.set_loop(ControlLoop::SlowPiezo, false).await.unwrap();

        assert!(logs_contain("Locking slow piezo."));
        assert!(logs_contain("Unlocking slow piezo."));
    }
}
