//! `matisse-control`
//!
//! Control layer for the Matisse ring laser: feedback loop switching, lock
//! acquisition with automatic piezo correction, wavelength and actuator
//! positioning, coarse tuning sweeps and automatic stabilization.
//!
//! Everything talks to the instrument through one shared
//! [`InstrumentLink`](matisse_core::InstrumentLink), so concurrent
//! operations never interleave their exchanges.
//!
//! ## Key Types
//!
//! - [`Matisse`]: façade owning every component
//! - [`LockSupervisor`] / [`LockHandle`]: one lock attempt at a time
//! - [`ControlLoopRegistry`]: confirmed on/off state of the four loops
//! - [`Scanner`]: birefringent filter and thin etalon sweeps
//! - [`OperationTracker`]: background operations, aborted on shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use matisse_control::Matisse;
//! use matisse_core::{MatisseResult, Settings, Transport};
//! # async fn example(transport: Box<dyn Transport>) -> MatisseResult<()> {
//! let matisse = Matisse::connect(transport, Settings::default()).await?;
//! let handle = matisse.start_laser_lock_correction(None)?;
//! let outcome = handle.wait().await?;
//! println!("lock attempt finished: {outcome:?}");
//! matisse.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod control_loops;
pub mod matisse;
pub mod positioning;
pub mod scan;
pub mod stabilization;
pub mod supervisor;
pub mod tasks;

pub use activation::ControlLoopsOn;
pub use control_loops::{ControlLoopRegistry, ControlLoopState};
pub use matisse::{Matisse, StatusSnapshot, TuneReport};
pub use positioning::{requires_confirmation, Positioner, TargetWavelength};
pub use scan::{ScanClaim, ScanReport, Scanner};
pub use stabilization::Stabilizer;
pub use supervisor::{
    apply_correction, query_limits, LimitStatus, LockControl, LockHandle, LockOutcome, LockPhase,
    LockStopper, LockSupervisor, StopReason,
};
pub use tasks::{Operation, OperationTracker};
