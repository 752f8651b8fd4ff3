//! Scoped activation of all control loops for one lock attempt.

use crate::control_loops::{ControlLoopRegistry, ControlLoopState};
use matisse_core::{MatisseError, MatisseResult};
use tracing::debug;

/// Exclusive claim on the control loops for the duration of a lock attempt.
///
/// Only one guard exists at a time. The claim is released when the guard is
/// dropped, whichever way the attempt ends (normal return, error, panic or
/// task abort). Loops are *not* restored to the snapshot on release; the
/// lock supervisor decides the final loop configuration.
#[derive(Debug)]
pub struct ControlLoopsOn {
    registry: ControlLoopRegistry,
    snapshot: ControlLoopState,
}

impl ControlLoopsOn {
    /// Claim the loops, failing fast when another attempt holds them.
    pub fn claim(registry: &ControlLoopRegistry) -> MatisseResult<Self> {
        if !registry.try_claim() {
            return Err(MatisseError::LockAttemptActive);
        }
        Ok(Self {
            registry: registry.clone(),
            snapshot: registry.snapshot(),
        })
    }

    /// Loop state at the time of the claim.
    pub fn snapshot(&self) -> ControlLoopState {
        self.snapshot
    }

    /// Force-enable all four loops.
    pub async fn engage(&self) -> MatisseResult<()> {
        self.registry.set_all(true).await
    }
}

impl Drop for ControlLoopsOn {
    fn drop(&mut self) {
        debug!("Releasing control loop claim");
        self.registry.release_claim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matisse_core::{ControlLoop, InstrumentLink};
    use matisse_driver_mock::SimulatedMatisse;

    fn registry() -> (ControlLoopRegistry, SimulatedMatisse) {
        let sim = SimulatedMatisse::new();
        (ControlLoopRegistry::new(InstrumentLink::new(sim.transport())), sim)
    }

    #[tokio::test]
    async fn engage_enables_every_loop() {
        let (registry, sim) = registry();
        registry.set_loop(ControlLoop::ThinEtalon, true).await.unwrap();

        let guard = ControlLoopsOn::claim(&registry).unwrap();
        assert!(guard.snapshot().thin_etalon);
        assert!(!guard.snapshot().fast_piezo);

        guard.engage().await.unwrap();
        assert!(registry.snapshot().all_enabled());
        assert!(sim.loop_running(ControlLoop::FastPiezo));
    }

    #[test]
    fn second_claim_fails_fast() {
        let (registry, _sim) = registry();
        let _guard = ControlLoopsOn::claim(&registry).unwrap();

        let err = ControlLoopsOn::claim(&registry).unwrap_err();
        assert!(matches!(err, MatisseError::LockAttemptActive));
    }

    #[tokio::test]
    async fn drop_releases_without_restoring() {
        let (registry, _sim) = registry();
        {
            let guard = ControlLoopsOn::claim(&registry).unwrap();
            guard.engage().await.unwrap();
            assert!(registry.is_claimed());
        }
        assert!(!registry.is_claimed());
        assert!(registry.snapshot().all_enabled());
    }

    #[tokio::test]
    async fn failed_engage_still_releases() {
        let (registry, sim) = registry();
        sim.reject("PZETL:CNTRSTA", "ERROR:CODE 5");

        let result = async {
            let guard = ControlLoopsOn::claim(&registry)?;
            guard.engage().await
        }
        .await;

        assert!(result.unwrap_err().is_rejection());
        assert!(!registry.is_claimed());
    }

    #[tokio::test]
    async fn aborted_task_releases_claim() {
        let (registry, sim) = registry();
        sim.set_response_delay(std::time::Duration::from_secs(60));

        let guard = ControlLoopsOn::claim(&registry).unwrap();
        let task = tokio::spawn(async move {
            guard.engage().await.unwrap();
        });
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        assert!(!registry.is_claimed());
    }
}
