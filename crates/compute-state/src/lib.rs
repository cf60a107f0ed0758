//! compute-state — the resource store for the compute control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for instances, load balancers, vnets and SSH public keys.
//!
//! # Architecture
//!
//! Each resource kind has its own table keyed by
//! `{cloud_account_id}/{resource_id}`. Values are JSON [`StoredRow`]s
//! produced by the [`row`] transform: promoted columns (name, labels,
//! deletion timestamp) next to a document holding the rest.
//!
//! A single global sequence assigns resource versions. Every mutation runs
//! inside one redb write transaction ([`WriteTxn`]), so compare-and-swap on
//! the resource version and the unique name index are both enforced
//! atomically. After commit, the transaction's changes are published on a
//! broadcast feed in version order for the watch engine.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod changes;
pub mod error;
pub mod row;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use changes::{ChangeEvent, ChangeType};
pub use error::{StateError, StateResult};
pub use row::{Flattened, StoredRow, flatten, from_row};
pub use store::StateStore;
pub use txn::WriteTxn;
pub use types::*;
