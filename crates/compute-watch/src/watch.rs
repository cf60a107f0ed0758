//! Resumable watches.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use compute_core::config::WatchConfig;
use compute_state::{ChangeEvent, Resource, StateStore};

use crate::delta::Delta;
use crate::error::{WatchError, WatchResult};
use crate::snapshot::SnapshotStream;

/// Where a watch starts and what it covers.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    /// Deliver changes strictly after this version. Zero replays every
    /// row still held by the store.
    pub resource_version: u64,
    /// Restrict to one cloud account. `None` watches every account.
    pub cloud_account_id: Option<String>,
}

impl WatchRequest {
    fn matches(&self, event: &ChangeEvent) -> bool {
        self.cloud_account_id
            .as_deref()
            .is_none_or(|account| account == event.cloud_account_id())
    }
}

/// Serves snapshot and watch streams from one store.
#[derive(Clone)]
pub struct WatchEngine {
    store: StateStore,
    buffer: usize,
    bookmark_interval: Duration,
}

impl WatchEngine {
    pub fn new(store: StateStore, config: &WatchConfig) -> Self {
        Self {
            store,
            buffer: config.buffer.max(1),
            bookmark_interval: config.bookmark_interval(),
        }
    }

    pub fn with_bookmark_interval(mut self, interval: Duration) -> Self {
        self.bookmark_interval = interval;
        self
    }

    /// Every live resource of `R` in the account (or all accounts) as
    /// `Updated`, then a bookmark at the snapshot's version.
    pub fn search_stream<R: Resource>(
        &self,
        cloud_account_id: Option<&str>,
    ) -> WatchResult<SnapshotStream<R>> {
        let (items, version) = self.store.snapshot::<R>(cloud_account_id)?;
        Ok(SnapshotStream::new(items, version))
    }

    /// Start a watch on `R` strictly after `request.resource_version`.
    ///
    /// Fails up front when the requested version is ahead of the store or
    /// older than the last purge of `R`. Must be called inside a tokio
    /// runtime; the watch is served by a spawned task.
    pub fn watch<R: Resource>(&self, request: WatchRequest) -> WatchResult<WatchStream<R>> {
        let kind = R::KIND;
        // Subscribe before scanning so nothing committed in between is lost.
        let feed = self.store.subscribe();
        let (backlog, scanned) = self.store.changes_since(kind, request.resource_version)?;

        if request.resource_version > scanned {
            return Err(WatchError::FutureResourceVersion {
                requested: request.resource_version,
                current: scanned,
            });
        }
        let floor = self.store.compacted_through(kind)?;
        if request.resource_version < floor {
            return Err(WatchError::TooOldResourceVersion {
                resource_version: request.resource_version,
            });
        }

        let backlog: Vec<ChangeEvent> = backlog
            .into_iter()
            .filter(|event| request.matches(event))
            .collect();
        debug!(
            %kind,
            from = request.resource_version,
            backlog = backlog.len(),
            account = request.cloud_account_id.as_deref().unwrap_or("*"),
            "watch started"
        );

        let (tx, rx) = mpsc::channel(self.buffer);
        let watcher = Watcher::<R> {
            request,
            feed,
            seen: scanned,
            bookmark_interval: self.bookmark_interval,
            out: tx,
            _resource: PhantomData,
        };
        let task = tokio::spawn(watcher.run(backlog));
        Ok(WatchStream { rx, task })
    }
}

/// State of one watch, owned by its task.
struct Watcher<R> {
    request: WatchRequest,
    feed: broadcast::Receiver<ChangeEvent>,
    /// Highest global version this watcher has accounted for. Bookmarks
    /// carry this value.
    seen: u64,
    bookmark_interval: Duration,
    out: mpsc::Sender<WatchResult<Delta<R>>>,
    _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Watcher<R> {
    async fn run(mut self, backlog: Vec<ChangeEvent>) {
        for event in &backlog {
            if !self.deliver(event).await {
                return;
            }
        }

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.bookmark_interval,
            self.bookmark_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.out.closed() => {
                    debug!(kind = %R::KIND, "watcher closed");
                    return;
                }
                _ = ticker.tick() => {
                    if self.out.send(Ok(Delta::bookmark(self.seen))).await.is_err() {
                        return;
                    }
                }
                received = self.feed.recv() => match received {
                    Ok(event) => {
                        let version = event.resource_version();
                        if version <= self.seen {
                            continue;
                        }
                        self.seen = version;
                        if event.kind == R::KIND
                            && self.request.matches(&event)
                            && !self.deliver(&event).await
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind = %R::KIND, skipped, seen = self.seen, "watcher lagged, disconnecting");
                        let _ = self
                            .out
                            .send(Err(WatchError::TooOldResourceVersion {
                                resource_version: self.seen,
                            }))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Send one event. Returns false once the stream should end.
    async fn deliver(&mut self, event: &ChangeEvent) -> bool {
        match Delta::from_event(event) {
            Ok(delta) => self.out.send(Ok(delta)).await.is_ok(),
            Err(e) => {
                let _ = self.out.send(Err(e)).await;
                false
            }
        }
    }
}

/// A live watch. Dropping it stops the serving task.
pub struct WatchStream<R> {
    rx: mpsc::Receiver<WatchResult<Delta<R>>>,
    task: JoinHandle<()>,
}

impl<R> WatchStream<R> {
    /// Receive the next delta, or `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<WatchResult<Delta<R>>> {
        self.rx.recv().await
    }
}

impl<R> Stream for WatchStream<R> {
    type Item = WatchResult<Delta<R>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<R> Unpin for WatchStream<R> {}

impl<R> Drop for WatchStream<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use compute_core::DeltaKind;
    use compute_state::{ResourceKind, ResourceMetadata, ResourceRef, VNet, VNetSpec};

    use super::*;

    const ACCOUNT: &str = "123456789012";

    fn vnet(name: &str) -> VNet {
        VNet {
            metadata: ResourceMetadata::new(ACCOUNT, name, &format!("id-{name}")),
            spec: VNetSpec {
                region: "us-dev-1".into(),
                availability_zone: "us-dev-1a".into(),
                prefix_length: 24,
            },
        }
    }

    fn put(store: &StateStore, name: &str) -> u64 {
        store
            .write(|txn| txn.insert(vnet(name)))
            .map(|v: VNet| v.metadata.resource_version)
            .unwrap()
    }

    fn engine(store: &StateStore) -> WatchEngine {
        WatchEngine::new(store.clone(), &WatchConfig::default())
    }

    // ── Snapshot ───────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_snapshot_still_has_one_bookmark() {
        let store = StateStore::open_in_memory().unwrap();
        let items: Vec<_> = engine(&store).search_stream::<VNet>(Some(ACCOUNT)).unwrap().collect().await;
        assert_eq!(items.len(), 1);
        let bookmark = items[0].as_ref().unwrap();
        assert_eq!(bookmark.kind, DeltaKind::Bookmark);
        assert!(bookmark.object.is_none());
    }

    #[tokio::test]
    async fn snapshot_ends_with_bookmark_at_read_version() {
        let store = StateStore::open_in_memory().unwrap();
        put(&store, "a");
        let last = put(&store, "b");

        let items: Vec<_> = engine(&store)
            .search_stream::<VNet>(Some(ACCOUNT))
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        let kinds: Vec<_> = items.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, [DeltaKind::Updated, DeltaKind::Updated, DeltaKind::Bookmark]);
        assert_eq!(items[2].resource_version, last);
    }

    // ── Watch ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn live_changes_are_delivered_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        let start = store.current_version().unwrap();
        let mut watch = engine(&store)
            .watch::<VNet>(WatchRequest {
                resource_version: start,
                cloud_account_id: Some(ACCOUNT.into()),
            })
            .unwrap();

        let v1 = put(&store, "a");
        let v2 = put(&store, "b");

        let first = watch.next().await.unwrap().unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!((first.kind, first.resource_version), (DeltaKind::Updated, v1));
        assert_eq!((second.kind, second.resource_version), (DeltaKind::Updated, v2));
    }

    #[tokio::test]
    async fn backlog_is_strictly_after_requested_version() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = put(&store, "a");
        let v2 = put(&store, "b");

        let mut watch = engine(&store)
            .watch::<VNet>(WatchRequest {
                resource_version: v1,
                cloud_account_id: None,
            })
            .unwrap();
        let delta = watch.next().await.unwrap().unwrap();
        assert_eq!(delta.resource_version, v2);
        assert_eq!(delta.object.unwrap().metadata.name, "b");
    }

    #[tokio::test]
    async fn finalize_is_delivered_as_deleted() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = put(&store, "a");
        let mut watch = engine(&store)
            .watch::<VNet>(WatchRequest {
                resource_version: v1,
                cloud_account_id: None,
            })
            .unwrap();

        store
            .write(|txn| txn.finalize::<VNet>(ACCOUNT, "id-a"))
            .unwrap();

        let delta = watch.next().await.unwrap().unwrap();
        assert_eq!(delta.kind, DeltaKind::Deleted);
        assert_eq!(delta.resource_version, v1 + 1);
    }

    #[tokio::test]
    async fn other_accounts_are_filtered() {
        let store = StateStore::open_in_memory().unwrap();
        let mut watch = engine(&store)
            .watch::<VNet>(WatchRequest {
                resource_version: 0,
                cloud_account_id: Some("999999999999".into()),
            })
            .unwrap();
        put(&store, "a");

        let next = tokio::time::timeout(Duration::from_millis(50), watch.next()).await;
        assert!(next.is_err(), "no delta expected for another account");
    }

    #[tokio::test]
    async fn future_version_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v = put(&store, "a");
        let err = engine(&store)
            .watch::<VNet>(WatchRequest {
                resource_version: v + 10,
                cloud_account_id: None,
            })
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::FutureResourceVersion { .. }));
    }

    #[tokio::test]
    async fn version_below_compaction_floor_is_too_old() {
        let store = StateStore::open_in_memory().unwrap();
        put(&store, "a");
        store
            .write(|txn| txn.finalize::<VNet>(ACCOUNT, "id-a"))
            .unwrap();
        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.purge_finalized(ResourceKind::Vnet, cutoff, 10).unwrap(), 1);

        let err = engine(&store)
            .watch::<VNet>(WatchRequest::default())
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::TooOldResourceVersion { resource_version: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watch_emits_bookmarks() {
        let store = StateStore::open_in_memory().unwrap();
        let v = put(&store, "a");
        let mut watch = engine(&store)
            .with_bookmark_interval(Duration::from_secs(5))
            .watch::<VNet>(WatchRequest {
                resource_version: v,
                cloud_account_id: None,
            })
            .unwrap();

        let bookmark = watch.next().await.unwrap().unwrap();
        assert_eq!(bookmark.kind, DeltaKind::Bookmark);
        assert_eq!(bookmark.resource_version, v);
    }

    #[tokio::test]
    async fn lagging_watcher_is_disconnected() {
        let store = StateStore::open_in_memory().unwrap().with_change_buffer(2);
        let config = WatchConfig {
            buffer: 1,
            bookmark_interval_secs: 3600,
        };
        let mut watch = WatchEngine::new(store.clone(), &config)
            .watch::<VNet>(WatchRequest::default())
            .unwrap();

        for i in 0..16 {
            put(&store, &format!("n{i}"));
        }

        let mut saw_error = false;
        while let Some(item) = watch.next().await {
            if let Err(e) = item {
                assert!(matches!(e, WatchError::TooOldResourceVersion { .. }));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_task() {
        let store = StateStore::open_in_memory().unwrap();
        let watch = engine(&store).watch::<VNet>(WatchRequest::default()).unwrap();
        let task = watch.task.abort_handle();
        drop(watch);
        for _ in 0..10 {
            if task.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(task.is_finished());
        // The store keeps accepting writes with no watcher attached.
        put(&store, "after");
        assert!(store.get::<VNet>(ACCOUNT, &ResourceRef::Name("after".into())).unwrap().is_some());
    }
}
