//! StateStore — redb-backed resource persistence.
//!
//! Reads go through short read transactions. Mutations go through
//! [`StateStore::write`], which runs a closure against a [`WriteTxn`],
//! commits, and then publishes the resulting [`ChangeEvent`]s. A write gate
//! keeps commit and publish in one critical section so the feed is ordered
//! by resource version.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::changes::ChangeEvent;
use crate::error::{StateError, StateResult};
use crate::row::StoredRow;
use crate::tables::*;
use crate::txn::WriteTxn;
use crate::types::{Resource, ResourceKind, ResourceRef};

/// Default capacity of the change feed. A subscriber that falls this many
/// events behind is reported as lagged.
pub const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    changes: broadcast::Sender<ChangeEvent>,
    write_gate: Arc<Mutex<()>>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANGE_BUFFER);
        Self {
            db: Arc::new(db),
            changes,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Resize the change feed. Existing subscribers keep the old feed, so
    /// call this before handing the store out.
    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        self.changes = changes;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for kind in ResourceKind::ALL {
            txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        }
        txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Change feed ────────────────────────────────────────────────

    /// Subscribe to changes committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Run `f` inside a single write transaction.
    ///
    /// If `f` returns an error the transaction is aborted and nothing is
    /// published. On success the transaction commits and its change events
    /// are broadcast before the next writer can start.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, E>,
    {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| StateError::Transaction("write gate poisoned".into()))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let (output, events) = {
            let mut wtxn = WriteTxn::begin(&txn)?;
            match f(&mut wtxn) {
                Ok(output) => (output, wtxn.finish()?),
                Err(e) => {
                    drop(wtxn);
                    txn.abort().map_err(map_err!(Transaction))?;
                    return Err(e);
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        for event in events {
            // No receivers is fine: nobody is watching.
            let _ = self.changes.send(event);
        }
        Ok(output)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a live resource by id or name.
    pub fn get<R: Resource>(&self, cloud_account_id: &str, by: &ResourceRef) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let resource_id = match by {
            ResourceRef::Id(id) => id.clone(),
            ResourceRef::Name(name) => {
                let index = txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
                let key = name_key(R::KIND, cloud_account_id, name);
                match index.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => guard.value().to_string(),
                    None => return Ok(None),
                }
            }
        };
        let table = txn.open_table(table_for(R::KIND)).map_err(map_err!(Table))?;
        match read_row(&table, &row_key(cloud_account_id, &resource_id))? {
            Some(row) if row.is_live() => Ok(Some(row.decode()?)),
            _ => Ok(None),
        }
    }

    /// List live resources ordered by name. `None` spans every account.
    pub fn list<R: Resource>(&self, cloud_account_id: Option<&str>) -> StateResult<Vec<R>> {
        Ok(self.snapshot(cloud_account_id)?.0)
    }

    /// List live resources together with the global resource version they
    /// were read at, from one read transaction.
    pub fn snapshot<R: Resource>(&self, cloud_account_id: Option<&str>) -> StateResult<(Vec<R>, u64)> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let version = {
            let seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            read_counter(&seq, RESOURCE_VERSION_SEQ)?
        };
        let table = txn.open_table(table_for(R::KIND)).map_err(map_err!(Table))?;
        let items = collect_rows(&table, cloud_account_id, false)?
            .iter()
            .map(StoredRow::decode)
            .collect::<StateResult<Vec<R>>>()?;
        Ok((items, version))
    }

    /// The highest resource version committed so far.
    pub fn current_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        read_counter(&seq, RESOURCE_VERSION_SEQ)
    }

    /// Versions at or below this value may have been purged from `kind`;
    /// history before it can no longer be replayed.
    pub fn compacted_through(&self, kind: ResourceKind) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        read_counter(&seq, &compaction_key(kind))
    }

    /// Every row of `kind` (tombstones included) whose version is greater
    /// than `after`, in version order, plus the global version the scan
    /// observed.
    pub fn changes_since(&self, kind: ResourceKind, after: u64) -> StateResult<(Vec<ChangeEvent>, u64)> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let version = {
            let seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            read_counter(&seq, RESOURCE_VERSION_SEQ)?
        };
        let table = txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        let mut rows: Vec<StoredRow> = collect_rows(&table, None, true)?
            .into_iter()
            .filter(|row| row.resource_version > after)
            .collect();
        rows.sort_by_key(|row| row.resource_version);
        let events = rows
            .into_iter()
            .map(|row| ChangeEvent::from_row(kind, row))
            .collect();
        Ok((events, version))
    }

    // ── Purge ──────────────────────────────────────────────────────

    /// Physically remove tombstones of `kind` finalized before `cutoff`,
    /// at most `limit` per call. Raises the compaction floor to the
    /// highest purged version. Returns the number of rows removed.
    pub fn purge_finalized(
        &self,
        kind: ResourceKind,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StateResult<u64> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| StateError::Transaction("write gate poisoned".into()))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut purged = 0u64;
        {
            let mut table = txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
            let expired: Vec<StoredRow> = collect_rows(&table, None, true)?
                .into_iter()
                .filter(|row| row.deleted_at.is_some_and(|at| at < cutoff))
                .take(limit)
                .collect();

            let mut floor = 0u64;
            for row in &expired {
                let key = row_key(&row.cloud_account_id, &row.resource_id);
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    purged += 1;
                    floor = floor.max(row.resource_version);
                }
            }

            let mut seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let compaction = compaction_key(kind);
            let current = read_counter(&seq, &compaction)?;
            if floor > current {
                seq.insert(compaction.as_str(), floor)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if purged > 0 {
            info!(%kind, purged, "finalized rows purged");
        }
        Ok(purged)
    }
}

// ── Table helpers ──────────────────────────────────────────────────

pub(crate) fn read_row(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<StoredRow>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(StoredRow::from_bytes(guard.value())?)),
        None => Ok(None),
    }
}

/// Collect rows for one account (or all), ordered by name then id.
pub(crate) fn collect_rows(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    cloud_account_id: Option<&str>,
    include_tombstones: bool,
) -> StateResult<Vec<StoredRow>> {
    let prefix = cloud_account_id.map(|id| format!("{id}/"));
    let range = match &prefix {
        Some(prefix) => table.range(prefix.as_str()..).map_err(map_err!(Read))?,
        None => table.iter().map_err(map_err!(Read))?,
    };

    let mut rows = Vec::new();
    for entry in range {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if let Some(prefix) = &prefix
            && !key.value().starts_with(prefix.as_str())
        {
            break;
        }
        let row = StoredRow::from_bytes(value.value())?;
        if include_tombstones || row.is_live() {
            rows.push(row);
        }
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.resource_id.cmp(&b.resource_id)));
    Ok(rows)
}

fn read_counter(table: &impl ReadableTable<&'static str, u64>, key: &str) -> StateResult<u64> {
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0))
}
