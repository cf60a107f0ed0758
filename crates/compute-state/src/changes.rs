//! Change events published after each committed write transaction.

use std::sync::Arc;

use crate::error::StateResult;
use crate::row::StoredRow;
use crate::types::{Resource, ResourceKind};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Created, or its spec/status/metadata changed.
    Updated,
    /// Finalizer removed; the row is now a tombstone.
    Deleted,
}

/// A committed change to one row.
///
/// Events are broadcast in strictly increasing `resource_version` order.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub change: ChangeType,
    pub row: Arc<StoredRow>,
}

impl ChangeEvent {
    pub(crate) fn from_row(kind: ResourceKind, row: StoredRow) -> Self {
        let change = if row.is_live() {
            ChangeType::Updated
        } else {
            ChangeType::Deleted
        };
        Self {
            kind,
            change,
            row: Arc::new(row),
        }
    }

    pub fn resource_version(&self) -> u64 {
        self.row.resource_version
    }

    pub fn cloud_account_id(&self) -> &str {
        &self.row.cloud_account_id
    }

    pub fn decode<R: Resource>(&self) -> StateResult<R> {
        self.row.decode()
    }
}
