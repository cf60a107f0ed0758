//! Metadata handling shared by the create paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use compute_core::validate::{check_cloud_account_id, check_labels};
use compute_state::{ResourceMetadata, ResourceRef};

use crate::error::{ServiceError, ServiceResult};

/// Caller-supplied metadata of a resource being created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateMetadata {
    pub cloud_account_id: String,
    /// Defaults to the resource id.
    pub name: Option<String>,
    /// Only honoured on privileged paths, and must be a UUID.
    pub resource_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl CreateMetadata {
    /// Validate and turn into stored metadata.
    ///
    /// `check_name` validates the effective name. A caller-supplied
    /// resource id is dropped unless `privileged` is set.
    pub(crate) fn resolve(
        &self,
        privileged: bool,
        check_name: impl Fn(&str) -> ServiceResult<()>,
    ) -> ServiceResult<ResourceMetadata> {
        check_cloud_account_id(&self.cloud_account_id)?;
        let resource_id = match self.resource_id.as_deref().filter(|_| privileged) {
            Some(id) if !id.is_empty() => {
                Uuid::parse_str(id)
                    .map_err(|e| ServiceError::invalid(format!("invalid resource id {id:?}: {e}")))?;
                id.to_string()
            }
            _ => Uuid::new_v4().to_string(),
        };
        let name = match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => resource_id.clone(),
        };
        check_name(&name)?;
        check_labels(&self.labels)?;

        let mut metadata = ResourceMetadata::new(&self.cloud_account_id, &name, &resource_id);
        metadata.labels = self.labels.clone();
        Ok(metadata)
    }
}

/// Require a non-empty id or name.
pub(crate) fn check_ref(by: &ResourceRef) -> ServiceResult<()> {
    let empty = match by {
        ResourceRef::Id(id) => id.is_empty(),
        ResourceRef::Name(name) => name.is_empty(),
    };
    if empty {
        return Err(ServiceError::invalid("missing resource id or name"));
    }
    Ok(())
}
