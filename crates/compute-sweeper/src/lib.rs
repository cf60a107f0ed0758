//! compute-sweeper — timer-driven maintenance for the control plane.
//!
//! Two independent loops, each stopped by a shared shutdown signal:
//!
//! - [`PurgeSweeper`] physically removes tombstones (resources whose
//!   finalizer was removed) once they are older than the grace period,
//!   bounded per sweep, raising each collection's compaction floor.
//! - [`DeactivationSweeper`] asks a [`DeactivationFeed`] which accounts
//!   were deactivated by billing and requests deletion of their instances.
//!
//! Failures are logged and retried on the next tick; they never reach API
//! callers.

pub mod deactivation;
pub mod purge;

pub use deactivation::{
    DeactivatedAccount, DeactivationFeed, DeactivationSweeper, FileDeactivationFeed,
};
pub use purge::PurgeSweeper;
