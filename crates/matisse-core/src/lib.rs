//! `matisse-core`
//!
//! Core types for controlling a Matisse tunable ring laser over its ASCII
//! command link.
//!
//! This crate provides the building blocks shared by the drivers and the
//! control layer: the serialized instrument link, the command vocabulary, the
//! error type and the layered configuration.
//!
//! ## Layers
//!
//! - **Transport**: byte-level exchange of one command and one response
//!   (serial port, in-memory simulator)
//! - **InstrumentLink**: serialized access with error sentinel handling
//! - **Control** (in `matisse-control`): loops, lock supervision, scans
//!
//! ## Key Types
//!
//! - [`InstrumentLink`]: shared handle owning the transport
//! - [`ControlLoop`], [`Motor`], [`Piezo`]: actuators and their mnemonics
//! - [`MatisseError`]: single error type for every operation
//! - [`Settings`]: figment-backed configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use matisse_core::{InstrumentLink, MatisseResult, Transport};
//! # async fn example(transport: Box<dyn Transport>) -> MatisseResult<()> {
//! let link = InstrumentLink::open(transport).await?;
//! let wavelength = link.read_f64(matisse_core::protocol::BIFI_WAVELENGTH).await?;
//! println!("BiFi at {wavelength} nm");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod limits;
pub mod link;
pub mod protocol;

pub use config::Settings;
pub use error::{MatisseError, MatisseResult};
pub use link::{InstrumentLink, LinkSession, Transport};
pub use protocol::{ControlLoop, Motor, Piezo, ScanKind};
