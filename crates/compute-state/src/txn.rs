//! Typed operations inside one redb write transaction.
//!
//! A [`WriteTxn`] is handed to the closure passed to
//! [`StateStore::write`](crate::StateStore::write). Everything done through
//! it commits or aborts together, and versions it allocates are published
//! on the change feed only after commit.

use chrono::Utc;
use redb::{ReadableTable, WriteTransaction};
use tracing::debug;

use crate::changes::ChangeEvent;
use crate::error::{StateError, StateResult};
use crate::row::StoredRow;
use crate::store::{collect_rows, read_row};
use crate::tables::*;
use crate::types::{Resource, ResourceKind, ResourceRef};

pub struct WriteTxn<'a> {
    txn: &'a WriteTransaction,
    /// Highest resource version allocated so far.
    version: u64,
    events: Vec<ChangeEvent>,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn begin(txn: &'a WriteTransaction) -> StateResult<Self> {
        let version = {
            let seq = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            seq.get(RESOURCE_VERSION_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        Ok(Self {
            txn,
            version,
            events: Vec::new(),
        })
    }

    /// Persist the version counter and hand back the buffered events.
    pub(crate) fn finish(self) -> StateResult<Vec<ChangeEvent>> {
        let mut seq = self.txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        seq.insert(RESOURCE_VERSION_SEQ, self.version)
            .map_err(map_err!(Write))?;
        Ok(self.events)
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// The global resource version as seen by this transaction.
    pub fn current_version(&self) -> u64 {
        self.version
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a live resource by id or name.
    pub fn get<R: Resource>(&self, cloud_account_id: &str, by: &ResourceRef) -> StateResult<Option<R>> {
        let Some(resource_id) = self.resolve_id(R::KIND, cloud_account_id, by)? else {
            return Ok(None);
        };
        match self.load_row(R::KIND, cloud_account_id, &resource_id)? {
            Some(row) if row.is_live() => Ok(Some(row.decode()?)),
            _ => Ok(None),
        }
    }

    /// List live resources, ordered by name. `None` spans every account.
    pub fn list<R: Resource>(&self, cloud_account_id: Option<&str>) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(table_for(R::KIND)).map_err(map_err!(Table))?;
        collect_rows(&table, cloud_account_id, false)?
            .iter()
            .map(StoredRow::decode)
            .collect()
    }

    fn resolve_id(
        &self,
        kind: ResourceKind,
        cloud_account_id: &str,
        by: &ResourceRef,
    ) -> StateResult<Option<String>> {
        match by {
            ResourceRef::Id(id) => Ok(Some(id.clone())),
            ResourceRef::Name(name) => {
                let index = self.txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
                let key = name_key(kind, cloud_account_id, name);
                Ok(index
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_string()))
            }
        }
    }

    fn load_row(
        &self,
        kind: ResourceKind,
        cloud_account_id: &str,
        resource_id: &str,
    ) -> StateResult<Option<StoredRow>> {
        let table = self.txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        read_row(&table, &row_key(cloud_account_id, resource_id))
    }

    // ── Writes ─────────────────────────────────────────────────────

    fn write_row(&mut self, kind: ResourceKind, row: StoredRow) -> StateResult<()> {
        let key = row_key(&row.cloud_account_id, &row.resource_id);
        let value = row.to_bytes()?;
        {
            let mut table = self.txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        debug!(%kind, %key, version = row.resource_version, live = row.is_live(), "row stored");
        self.events.push(ChangeEvent::from_row(kind, row));
        Ok(())
    }

    /// Insert a new resource and return it with its assigned version.
    ///
    /// Fails with `AlreadyExists` when the name is held by any
    /// non-tombstoned row of the same kind in the account, or when the
    /// resource id was ever used.
    pub fn insert<R: Resource>(&mut self, mut resource: R) -> StateResult<R> {
        let kind = R::KIND;
        let metadata = resource.metadata().clone();
        let index_key = name_key(kind, &metadata.cloud_account_id, &metadata.name);

        {
            let index = self.txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
            if index.get(index_key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!(
                    "{kind} {} already exists",
                    metadata.name
                )));
            }
        }
        if self
            .load_row(kind, &metadata.cloud_account_id, &metadata.resource_id)?
            .is_some()
        {
            return Err(StateError::AlreadyExists(format!(
                "{kind} with resource id {} already exists",
                metadata.resource_id
            )));
        }

        let version = self.next_version();
        resource.metadata_mut().resource_version = version;
        let row = StoredRow::from_resource(&resource, version)?;
        self.write_row(kind, row)?;

        let mut index = self.txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
        index
            .insert(index_key.as_str(), metadata.resource_id.as_str())
            .map_err(map_err!(Write))?;
        Ok(resource)
    }

    /// Read-modify-write a live resource.
    ///
    /// When `expected_version` is given it must equal the stored version,
    /// otherwise the update fails with `VersionConflict` and nothing is
    /// written. Identity fields and the creation timestamp cannot be
    /// changed by `mutate`.
    pub fn update<R, E, F>(
        &mut self,
        cloud_account_id: &str,
        by: &ResourceRef,
        expected_version: Option<u64>,
        mutate: F,
    ) -> Result<R, E>
    where
        R: Resource,
        E: From<StateError>,
        F: FnOnce(&mut R) -> Result<(), E>,
    {
        let kind = R::KIND;
        let not_found = || StateError::NotFound(format!("{kind} {by}"));
        let resource_id = self
            .resolve_id(kind, cloud_account_id, by)?
            .ok_or_else(not_found)?;
        let stored = match self.load_row(kind, cloud_account_id, &resource_id)? {
            Some(row) if row.is_live() => row,
            _ => return Err(not_found().into()),
        };
        if let Some(expected) = expected_version
            && expected != stored.resource_version
        {
            return Err(StateError::VersionConflict {
                expected,
                actual: stored.resource_version,
            }
            .into());
        }

        let mut resource: R = stored.decode()?;
        let before = resource.metadata().clone();
        mutate(&mut resource)?;

        let version = self.next_version();
        let metadata = resource.metadata_mut();
        metadata.cloud_account_id = before.cloud_account_id;
        metadata.resource_id = before.resource_id;
        metadata.name = before.name;
        metadata.creation_timestamp = before.creation_timestamp;
        metadata.resource_version = version;

        let row = StoredRow::from_resource(&resource, version)?;
        self.write_row(kind, row)?;
        Ok(resource)
    }

    /// Remove the finalizer: turn the row into a tombstone and release its
    /// name. Returns the resource as it was, or `None` when there is no
    /// live row (already finalized or never existed).
    pub fn finalize<R: Resource>(
        &mut self,
        cloud_account_id: &str,
        resource_id: &str,
    ) -> StateResult<Option<R>> {
        let kind = R::KIND;
        let mut row = match self.load_row(kind, cloud_account_id, resource_id)? {
            Some(row) if row.is_live() => row,
            _ => return Ok(None),
        };

        let resource: R = row.decode()?;
        row.deleted_at = Some(Utc::now());
        row.resource_version = self.next_version();
        let index_key = name_key(kind, cloud_account_id, &row.name);
        self.write_row(kind, row)?;

        let mut index = self.txn.open_table(NAME_INDEX).map_err(map_err!(Table))?;
        index.remove(index_key.as_str()).map_err(map_err!(Write))?;
        Ok(Some(resource))
    }
}
