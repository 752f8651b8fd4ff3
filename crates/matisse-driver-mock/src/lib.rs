//! Simulated Matisse laser for testing and offline operation.
//!
//! [`SimulatedMatisse`] implements [`matisse_core::Transport`] and answers
//! the same ASCII command set as the real controller. All simulated timing
//! uses `tokio::time`, so tests can run on a paused clock.
//!
//! # Behavior
//!
//! - Loops switch with `<PREFIX>:CNTRSTA RUN|STOP`
//! - `FPZT:LOCK?` reports `TRUE` once a scripted lock time has passed and the
//!   fast piezo loop runs
//! - Motor moves are instantaneous; `MOTBI:WL` moves the BiFi motor through
//!   the [`OpticsModel`]
//! - `DPOW:DC?` and `TE:DC?` follow Gaussian peak/dip models with optional
//!   seeded noise or deterministic drift
//! - Invalid commands answer `!ERROR` and leave a code for `ERROR:CODE?`
//!
//! ```rust,ignore
//! use matisse_driver_mock::SimulatedMatisse;
//! use matisse_core::InstrumentLink;
//!
//! let sim = SimulatedMatisse::new();
//! sim.lock_after(Duration::from_secs(3));
//! let link = InstrumentLink::open(sim.transport()).await?;
//! ```

mod optics;
mod simulator;

pub use optics::{OpticsModel, PowerPeak};
pub use simulator::SimulatedMatisse;
