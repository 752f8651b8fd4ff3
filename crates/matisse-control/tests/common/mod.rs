//! Shared helpers for controller integration tests.
//!
//! Every test drives a [`SimulatedMatisse`] on a paused tokio clock, so the
//! timings asserted here are exact.

#![allow(dead_code)] // Not every helper is used by every test file

use matisse_control::Matisse;
use matisse_core::{ControlLoop, Settings};
use matisse_driver_mock::SimulatedMatisse;

/// Connect a controller to `sim` with default settings and clear the
/// command log of the connection handshake.
pub async fn connect(sim: &SimulatedMatisse) -> Matisse {
    connect_with(sim, Settings::default()).await
}

/// Connect with explicit settings.
pub async fn connect_with(sim: &SimulatedMatisse, settings: Settings) -> Matisse {
    let matisse = Matisse::connect(sim.transport(), settings)
        .await
        .expect("simulated Matisse should connect");
    sim.clear_log();
    matisse
}

/// Whether the simulator has every loop switched on.
pub fn all_loops_running(sim: &SimulatedMatisse) -> bool {
    ControlLoop::ALL.into_iter().all(|l| sim.loop_running(l))
}

/// Whether the simulator has every loop switched off.
pub fn all_loops_stopped(sim: &SimulatedMatisse) -> bool {
    ControlLoop::ALL.into_iter().all(|l| !sim.loop_running(l))
}

/// Commands that move a piezo (the automatic correction writes).
pub fn correction_commands(sim: &SimulatedMatisse) -> Vec<String> {
    sim.commands()
        .into_iter()
        .filter(|c| {
            !c.ends_with('?')
                && (c.starts_with("PZETL:BASE ")
                    || c.starts_with("SPZT:NOW ")
                    || c.starts_with("SCAN:NOW "))
        })
        .collect()
}
