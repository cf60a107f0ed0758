//! Search-as-stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use compute_state::Resource;

use crate::delta::Delta;
use crate::error::WatchResult;

/// A one-shot stream of every live resource followed by one bookmark.
///
/// The bookmark is emitted even when the collection is empty, so the
/// stream never ends without a resumable cursor.
pub struct SnapshotStream<R> {
    items: VecDeque<Delta<R>>,
}

impl<R: Resource> SnapshotStream<R> {
    /// Build from resources read at `resource_version`.
    pub fn new(resources: Vec<R>, resource_version: u64) -> Self {
        let mut items: VecDeque<Delta<R>> = resources.into_iter().map(Delta::updated).collect();
        items.push_back(Delta::bookmark(resource_version));
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<R: Resource> Stream for SnapshotStream<R> {
    type Item = WatchResult<Delta<R>>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().items.pop_front().map(Ok))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items.len(), Some(self.items.len()))
    }
}

impl<R> Unpin for SnapshotStream<R> {}
