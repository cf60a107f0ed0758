//! The unit delivered on every stream.

use serde::{Deserialize, Serialize};

use compute_core::DeltaKind;
use compute_state::{ChangeEvent, ChangeType, Resource};

use crate::error::WatchResult;

/// One message on a snapshot or watch stream.
///
/// `Updated` carries the resource as of `resource_version`. `Deleted`
/// carries the resource as it was when its finalizer was removed.
/// `Bookmark` carries no object, only a cursor that a later watch can
/// resume strictly after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta<R> {
    #[serde(rename = "type")]
    pub kind: DeltaKind,
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<R>,
}

impl<R: Resource> Delta<R> {
    pub fn updated(object: R) -> Self {
        Self {
            kind: DeltaKind::Updated,
            resource_version: object.metadata().resource_version,
            object: Some(object),
        }
    }

    pub fn bookmark(resource_version: u64) -> Self {
        Self {
            kind: DeltaKind::Bookmark,
            resource_version,
            object: None,
        }
    }

    pub(crate) fn from_event(event: &ChangeEvent) -> WatchResult<Self> {
        let kind = match event.change {
            ChangeType::Updated => DeltaKind::Updated,
            ChangeType::Deleted => DeltaKind::Deleted,
        };
        let object: R = event.decode()?;
        Ok(Self {
            kind,
            resource_version: event.resource_version(),
            object: Some(object),
        })
    }

    /// Apply `f` to the carried object, if any.
    pub fn map_object(mut self, f: impl FnOnce(R) -> R) -> Self {
        self.object = self.object.map(f);
        self
    }
}
