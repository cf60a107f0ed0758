//! compute-core — shared vocabulary for the compute control plane.
//!
//! Holds the pieces every other crate agrees on: the TOML configuration
//! model, identifier and label validation, and the closed enums that are
//! exchanged as strings on the wire.

pub mod config;
pub mod types;
pub mod validate;

pub use config::ControlPlaneConfig;
pub use types::*;
pub use validate::{ValidationError, ValidationResult};
