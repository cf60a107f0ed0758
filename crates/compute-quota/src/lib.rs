//! compute-quota — per-tenant quota evaluation.
//!
//! Services ask a [`QuotaEvaluator`] for the limit of a [`QuotaResource`]
//! in a cloud account and compare it against the current count plus the
//! requested batch. Where the limit comes from is decided by the injected
//! [`QuotaSource`]:
//!
//! - **`StaticMap`**: account-tier defaults, then system defaults
//! - **`PerAccountOverride`**: explicit per-account limits first, then the static map
//! - **`External`**: a remote quota service, falling back to the override table
//!
//! A limit that no layer defines is zero.

pub mod evaluator;
pub mod source;

use thiserror::Error;

pub use evaluator::{QuotaDecision, QuotaEvaluator};
pub use source::{ExternalQuota, OverrideTable, QuotaResource, QuotaService, QuotaSource, QuotaTable};

/// Errors raised while resolving a limit.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota lookup failed: {0}")]
    Lookup(String),
}

pub type QuotaResult<T> = Result<T, QuotaError>;
