//! compute-watch — delta streams over the compute resource store.
//!
//! Two stream shapes are served:
//!
//! - [`SnapshotStream`]: every live resource as `Updated`, then exactly one
//!   trailing `Bookmark` carrying the version the snapshot was read at.
//! - [`WatchStream`]: every change strictly after a caller-supplied
//!   resource version, interleaved with periodic bookmarks.
//!
//! Each watch runs on its own task that feeds a bounded queue. Writers
//! never wait on watchers: the store publishes on a broadcast channel and a
//! watcher that falls behind it is disconnected with
//! [`WatchError::TooOldResourceVersion`]. Dropping a [`WatchStream`] aborts
//! its task.
//!
//! [`NdjsonStream`] turns either stream into newline-delimited JSON bytes
//! for HTTP bodies.

pub mod delta;
pub mod error;
pub mod ndjson;
pub mod snapshot;
pub mod watch;

pub use delta::Delta;
pub use error::{WatchError, WatchResult};
pub use ndjson::NdjsonStream;
pub use snapshot::SnapshotStream;
pub use watch::{WatchEngine, WatchRequest, WatchStream};
