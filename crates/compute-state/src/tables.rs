//! redb table definitions for the resource store.
//!
//! Resource tables use `{cloud_account_id}/{resource_id}` keys and JSON
//! [`StoredRow`](crate::row::StoredRow) values, so a prefix scan yields one
//! tenant's collection.

use redb::TableDefinition;

use crate::types::ResourceKind;

/// Instances keyed by `{cloud_account_id}/{resource_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Load balancers keyed by `{cloud_account_id}/{resource_id}`.
pub const LOAD_BALANCERS: TableDefinition<&str, &[u8]> = TableDefinition::new("load_balancers");

/// VNets keyed by `{cloud_account_id}/{resource_id}`.
pub const VNETS: TableDefinition<&str, &[u8]> = TableDefinition::new("vnets");

/// SSH public keys keyed by `{cloud_account_id}/{resource_id}`.
pub const SSH_PUBLIC_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("ssh_public_keys");

/// Unique name index: `{kind}/{cloud_account_id}/{name}` → resource id.
/// Holds an entry for every row that is not a tombstone.
pub const NAME_INDEX: TableDefinition<&str, &str> = TableDefinition::new("name_index");

/// Counters: the global resource version and per-kind compaction floors.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key of the global resource version counter in [`SEQUENCES`].
pub const RESOURCE_VERSION_SEQ: &str = "resource_version";

pub fn table_for(kind: ResourceKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        ResourceKind::Instance => INSTANCES,
        ResourceKind::LoadBalancer => LOAD_BALANCERS,
        ResourceKind::Vnet => VNETS,
        ResourceKind::SshPublicKey => SSH_PUBLIC_KEYS,
    }
}

pub fn row_key(cloud_account_id: &str, resource_id: &str) -> String {
    format!("{cloud_account_id}/{resource_id}")
}

pub fn name_key(kind: ResourceKind, cloud_account_id: &str, name: &str) -> String {
    format!("{kind}/{cloud_account_id}/{name}")
}

/// Key of a collection's compaction floor in [`SEQUENCES`].
pub fn compaction_key(kind: ResourceKind) -> String {
    format!("compacted/{kind}")
}
