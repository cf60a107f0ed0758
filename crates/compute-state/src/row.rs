//! Resource ↔ row transform.
//!
//! [`flatten`] splits a resource into a fixed, ordered list of promoted
//! columns plus a JSON document holding everything else. [`from_row`]
//! reassembles the resource from a [`StoredRow`]. Identity columns
//! (`cloud_account_id`, `resource_id`) and the resource version are owned
//! by the row itself and never appear in the flattened values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StateError, StateResult};
use crate::types::Resource;

/// Column names produced by [`flatten`], in order.
pub const FLATTENED_COLUMNS: [&str; 4] = ["name", "labels", "deletion_timestamp", "value"];

/// Metadata fields kept out of the `value` document because they live in
/// their own columns.
const PROMOTED_METADATA: [&str; 6] = [
    "cloud_account_id",
    "resource_id",
    "resource_version",
    "name",
    "labels",
    "deletion_timestamp",
];

/// Ordered non-identity columns and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct Flattened {
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
}

/// One persisted row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRow {
    pub cloud_account_id: String,
    pub resource_id: String,
    pub resource_version: u64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Set when the finalizer was removed. A row with `deleted_at` is a
    /// tombstone: invisible to reads, kept only for watch replay until
    /// the purge sweep removes it.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub value: Value,
}

/// Flatten a resource into its promoted columns and residual document.
pub fn flatten<R: Resource>(resource: &R) -> StateResult<Flattened> {
    let metadata = resource.metadata();
    let mut document = serde_json::to_value(resource).map_err(map_err!(Serialize))?;
    if let Some(fields) = document.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in PROMOTED_METADATA {
            fields.remove(field);
        }
    }

    let values = vec![
        Value::String(metadata.name.clone()),
        serde_json::to_value(&metadata.labels).map_err(map_err!(Serialize))?,
        serde_json::to_value(metadata.deletion_timestamp).map_err(map_err!(Serialize))?,
        document,
    ];
    Ok(Flattened {
        columns: FLATTENED_COLUMNS.to_vec(),
        values,
    })
}

/// Reconstruct a resource from a row.
pub fn from_row<R: Resource>(row: &StoredRow) -> StateResult<R> {
    let mut document = row.value.clone();
    let fields = document
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| StateError::MalformedRow(format!("{}: missing metadata", row.resource_id)))?;

    fields.insert("cloud_account_id".into(), Value::String(row.cloud_account_id.clone()));
    fields.insert("resource_id".into(), Value::String(row.resource_id.clone()));
    fields.insert("resource_version".into(), Value::from(row.resource_version));
    fields.insert("name".into(), Value::String(row.name.clone()));
    fields.insert(
        "labels".into(),
        serde_json::to_value(&row.labels).map_err(map_err!(Serialize))?,
    );
    fields.insert(
        "deletion_timestamp".into(),
        serde_json::to_value(row.deletion_timestamp).map_err(map_err!(Serialize))?,
    );

    serde_json::from_value(document).map_err(map_err!(Deserialize))
}

impl StoredRow {
    /// Assemble a row from identity columns and a [`Flattened`] value list.
    pub fn from_flattened(
        cloud_account_id: &str,
        resource_id: &str,
        resource_version: u64,
        flattened: Flattened,
    ) -> StateResult<Self> {
        let mut name = None;
        let mut labels = None;
        let mut deletion_timestamp = None;
        let mut value = None;

        for (column, v) in flattened.columns.into_iter().zip(flattened.values) {
            match column {
                "name" => {
                    name = Some(
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| StateError::MalformedRow("name is not a string".into()))?,
                    )
                }
                "labels" => labels = Some(serde_json::from_value(v).map_err(map_err!(Deserialize))?),
                "deletion_timestamp" => {
                    deletion_timestamp =
                        Some(serde_json::from_value(v).map_err(map_err!(Deserialize))?)
                }
                "value" => value = Some(v),
                other => return Err(StateError::MalformedRow(format!("unknown column {other}"))),
            }
        }

        let missing = |column: &str| StateError::MalformedRow(format!("missing column {column}"));
        Ok(Self {
            cloud_account_id: cloud_account_id.to_string(),
            resource_id: resource_id.to_string(),
            resource_version,
            name: name.ok_or_else(|| missing("name"))?,
            labels: labels.ok_or_else(|| missing("labels"))?,
            deletion_timestamp: deletion_timestamp.ok_or_else(|| missing("deletion_timestamp"))?,
            deleted_at: None,
            value: value.ok_or_else(|| missing("value"))?,
        })
    }

    /// Flatten `resource` and assemble its row at `resource_version`.
    pub fn from_resource<R: Resource>(resource: &R, resource_version: u64) -> StateResult<Self> {
        let metadata = resource.metadata();
        Self::from_flattened(
            &metadata.cloud_account_id,
            &metadata.resource_id,
            resource_version,
            flatten(resource)?,
        )
    }

    pub fn decode<R: Resource>(&self) -> StateResult<R> {
        from_row(self)
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub(crate) fn to_bytes(&self) -> StateResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(map_err!(Serialize))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
    }
}
