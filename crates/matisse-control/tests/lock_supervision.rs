//! Lock acquisition scenarios against the simulated instrument.
//!
//! All tests run on a paused clock; the simulator expresses lock and limit
//! events as offsets from the start of the test.

mod common;

use common::{all_loops_running, all_loops_stopped, connect, correction_commands};
use matisse_control::{LockOutcome, LockPhase};
use matisse_core::{ControlLoop, MatisseError, Piezo};
use matisse_driver_mock::SimulatedMatisse;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Terminal outcomes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn never_locking_times_out_with_loops_engaged() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;

    let start = Instant::now();
    let handle = matisse
        .start_laser_lock_correction(Some(Duration::from_secs(5)))
        .unwrap();
    let outcome = handle.wait().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, LockOutcome::TimedOut);
    assert!(elapsed >= Duration::from_secs(5), "ended early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(6), "ended late: {elapsed:?}");
    assert!(all_loops_running(&sim));
    assert!(matisse.loop_state().all_enabled());
    assert!(correction_commands(&sim).is_empty());
    assert!(!matisse.is_lock_correction_active());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_honored_within_one_poll_interval() {
    for secs in [1, 2, 7, 12] {
        let sim = SimulatedMatisse::new();
        let matisse = connect(&sim).await;
        let timeout = Duration::from_secs(secs);

        let start = Instant::now();
        let handle = matisse.start_laser_lock_correction(Some(timeout)).unwrap();
        assert_eq!(handle.wait().await.unwrap(), LockOutcome::TimedOut);

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "timeout {secs}s ended after {elapsed:?}");
        assert!(
            elapsed <= timeout + Duration::from_secs(1),
            "timeout {secs}s ended after {elapsed:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn lock_without_limits_sends_no_corrections() {
    let sim = SimulatedMatisse::new();
    sim.lock_after(Duration::from_secs(3));
    let matisse = connect(&sim).await;

    let start = Instant::now();
    let handle = matisse.start_laser_lock_correction(None).unwrap();
    handle
        .subscribe()
        .wait_for(|p| *p == LockPhase::Locked)
        .await
        .unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(3));

    // keeps monitoring past the original timeout window
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(!handle.is_finished());
    assert_eq!(handle.phase(), LockPhase::Locked);

    let outcome = matisse.stop_laser_lock_correction().await.unwrap();
    assert_eq!(outcome, Some(LockOutcome::Locked { corrections: 0 }));
    assert_eq!(
        handle.wait().await.unwrap(),
        LockOutcome::Locked { corrections: 0 }
    );
    assert!(correction_commands(&sim).is_empty());
    assert!(all_loops_stopped(&sim));
}

#[tokio::test(start_paused = true)]
async fn limit_while_locked_triggers_one_correction() {
    let sim = SimulatedMatisse::new();
    sim.lock_after(Duration::from_secs(3));
    sim.schedule(Duration::from_secs(4), "SPZT:NOW", 0.69);
    let matisse = connect(&sim).await;

    let handle = matisse.start_laser_lock_correction(None).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(
        correction_commands(&sim),
        vec![
            "PZETL:BASE 0".to_string(),
            "SPZT:NOW 0.35".to_string(),
            "SCAN:NOW 0.35".to_string(),
        ]
    );
    assert_eq!(sim.piezo(Piezo::SlowPiezo), 0.35);
    assert!(all_loops_running(&sim));

    handle.stop();
    assert_eq!(
        handle.wait().await.unwrap(),
        LockOutcome::Locked { corrections: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn limit_before_lock_ends_early_and_disables_loops() {
    let sim = SimulatedMatisse::new();
    sim.schedule(Duration::from_secs(2), "SCAN:NOW", 0.68);
    let matisse = connect(&sim).await;

    let start = Instant::now();
    let handle = matisse.start_laser_lock_correction(None).unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome, LockOutcome::LimitBeforeLock);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert!(all_loops_stopped(&sim));
    assert!(!matisse.loop_state().fast_piezo);
    assert!(correction_commands(&sim).is_empty());
    assert_eq!(
        matisse.lock_phase(),
        Some(LockPhase::Finished(LockOutcome::LimitBeforeLock))
    );
}

#[tokio::test(start_paused = true)]
async fn limit_after_lock_lost_disables_loops() {
    let sim = SimulatedMatisse::new();
    sim.lock_after(Duration::from_secs(1));
    sim.lose_lock_after(Duration::from_secs(3));
    sim.schedule(Duration::from_secs(4), "PZETL:BASE", -0.98);
    let matisse = connect(&sim).await;

    let start = Instant::now();
    let handle = matisse.start_laser_lock_correction(None).unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome, LockOutcome::LimitAfterLockLost);
    assert_eq!(start.elapsed(), Duration::from_secs(4));
    assert!(all_loops_stopped(&sim));
    assert!(correction_commands(&sim).is_empty());
}

// =============================================================================
// Cancellation and exclusivity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stop_before_lock_cancels_and_disables_loops() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;

    let handle = matisse.start_laser_lock_correction(None).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matisse.is_lock_correction_active());
    assert_eq!(handle.phase(), LockPhase::Polling);

    let outcome = matisse.stop_laser_lock_correction().await.unwrap();
    assert_eq!(outcome, Some(LockOutcome::Cancelled));
    assert!(!matisse.is_lock_correction_active());
    assert!(all_loops_stopped(&sim));

    let polls = sim.commands_matching("FPZT:LOCK?").len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sim.commands_matching("FPZT:LOCK?").len(), polls);
}

#[tokio::test(start_paused = true)]
async fn stop_without_attempt_still_disables_loops() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;
    matisse.set_loop(ControlLoop::ThinEtalon, true).await.unwrap();

    assert_eq!(matisse.stop_laser_lock_correction().await.unwrap(), None);
    assert!(all_loops_stopped(&sim));
    assert!(!matisse.get_loop(ControlLoop::ThinEtalon));
}

#[tokio::test(start_paused = true)]
async fn concurrent_start_fails_fast() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;

    let _first = matisse.start_laser_lock_correction(None).unwrap();
    let err = matisse.start_laser_lock_correction(None).unwrap_err();
    assert!(matches!(err, MatisseError::LockAttemptActive));

    matisse.stop_laser_lock_correction().await.unwrap();
    let again = matisse
        .start_laser_lock_correction(Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(again.wait().await.unwrap(), LockOutcome::TimedOut);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn transport_failure_aborts_attempt_with_loops_off() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;
    sim.fail_on("SCAN:NOW?", "serial cable unplugged");

    let handle = matisse.start_laser_lock_correction(None).unwrap();
    let err = handle.wait().await.unwrap_err();

    match err {
        MatisseError::Communication { command, message } => {
            assert_eq!(command, "SCAN:NOW?");
            assert!(message.contains("serial cable unplugged"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(all_loops_stopped(&sim));
    assert!(!matisse.is_lock_correction_active());
    assert_eq!(matisse.lock_phase(), Some(LockPhase::Failed));
    assert_eq!(matisse.stop_laser_lock_correction().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn rejected_engage_leaves_loop_flag_unset() {
    let sim = SimulatedMatisse::new();
    let matisse = connect(&sim).await;
    sim.reject("FPZT:CNTRSTA RUN", "ERROR:CODE 9 - interlock open");

    let handle = matisse.start_laser_lock_correction(None).unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(err.is_rejection());
    assert!(err.to_string().contains("interlock open"));
    assert!(!matisse.get_loop(ControlLoop::FastPiezo));
    assert!(all_loops_stopped(&sim));
}

// =============================================================================
// Automatic stabilization
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stabilization_relocks_after_lock_loss() {
    let sim = SimulatedMatisse::new();
    sim.lock_when_engaged(Duration::from_secs(2));
    let matisse = connect(&sim).await;

    assert!(matisse.stabilize_on());
    assert!(matisse.loop_state().auto_stabilize);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(matisse.lock_phase(), Some(LockPhase::Locked));

    // an operator stop drops the lock; the next check starts a fresh attempt
    matisse.stop_laser_lock_correction().await.unwrap();
    assert!(!matisse.is_lock_correction_active());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(matisse.is_lock_correction_active());

    assert!(matisse.stabilize_off());
    assert!(!matisse.is_stabilizing());
    matisse.shutdown().await.unwrap();
    assert!(all_loops_stopped(&sim));
}
