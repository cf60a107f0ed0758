//! VNet service. Put is an idempotent upsert keyed by name; delete is
//! immediate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use compute_core::validate::{check_cloud_account_id, check_labels, check_resource_name};
use compute_state::{Instance, ResourceMetadata, ResourceRef, VNet, VNetSpec};
use compute_watch::SnapshotStream;

use crate::ServiceContext;
use crate::common::check_ref;
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VNetPut {
    pub cloud_account_id: String,
    pub name: String,
    pub spec: VNetSpec,
}

#[derive(Clone)]
pub struct VNetService {
    ctx: Arc<ServiceContext>,
}

impl VNetService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Create the vnet, or replace the spec of an existing one with the
    /// same name. The resource id of an existing vnet is kept.
    pub fn put(&self, req: VNetPut) -> ServiceResult<VNet> {
        check_cloud_account_id(&req.cloud_account_id)?;
        check_resource_name("vnet", &req.name)?;
        check_spec(&req.spec)?;

        let account = req.cloud_account_id.as_str();
        let by = ResourceRef::Name(req.name.clone());
        let (vnet, created) = self.ctx.store.write(|txn| {
            if txn.get::<VNet>(account, &by)?.is_some() {
                let spec = req.spec.clone();
                let updated = txn.update::<VNet, ServiceError, _>(account, &by, None, |vnet| {
                    vnet.spec = spec;
                    Ok(())
                })?;
                return Ok::<_, ServiceError>((updated, false));
            }
            let vnet = VNet {
                metadata: ResourceMetadata::new(account, &req.name, &Uuid::new_v4().to_string()),
                spec: req.spec.clone(),
            };
            Ok((txn.insert(vnet)?, true))
        })?;

        info!(
            cloud_account_id = %account,
            name = %vnet.metadata.name,
            availability_zone = %vnet.spec.availability_zone,
            created,
            "vnet stored"
        );
        Ok(vnet)
    }

    pub fn get(&self, account: &str, by: &ResourceRef) -> ServiceResult<VNet> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        self.ctx
            .store
            .get(account, by)?
            .ok_or_else(|| ServiceError::not_found(format!("vnet {by} not found")))
    }

    pub fn search(&self, account: &str, labels: &BTreeMap<String, String>) -> ServiceResult<Vec<VNet>> {
        check_cloud_account_id(account)?;
        check_labels(labels)?;
        let all: Vec<VNet> = self.ctx.store.list(Some(account))?;
        Ok(all
            .into_iter()
            .filter(|v| v.metadata.matches_labels(labels))
            .collect())
    }

    pub fn search_stream(&self, account: Option<&str>) -> ServiceResult<SnapshotStream<VNet>> {
        if let Some(account) = account {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.search_stream(account)?)
    }

    /// Delete immediately. Fails while any instance in the account still
    /// has an interface on the vnet.
    pub fn delete(&self, account: &str, by: &ResourceRef) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let deleted = self.ctx.store.write(|txn| {
            let vnet: VNet = txn
                .get(account, by)?
                .ok_or_else(|| ServiceError::not_found(format!("vnet {by} not found")))?;
            let in_use = txn
                .list::<Instance>(Some(account))?
                .into_iter()
                .filter(|i| i.spec.interfaces.iter().any(|n| n.vnet == vnet.metadata.name))
                .count();
            if in_use > 0 {
                return Err(ServiceError::precondition(format!(
                    "vnet {} is used by {in_use} instances",
                    vnet.metadata.name
                )));
            }
            txn.finalize::<VNet>(account, &vnet.metadata.resource_id)?;
            Ok(vnet)
        })?;
        info!(cloud_account_id = %account, name = %deleted.metadata.name, "vnet deleted");
        Ok(())
    }
}

fn check_spec(spec: &VNetSpec) -> ServiceResult<()> {
    if spec.region.is_empty() {
        return Err(ServiceError::invalid("missing region"));
    }
    if spec.availability_zone.is_empty() {
        return Err(ServiceError::invalid("missing availability zone"));
    }
    if !(1..=32).contains(&spec.prefix_length) {
        return Err(ServiceError::invalid(format!(
            "invalid prefix length {}, must be between 1 and 32",
            spec.prefix_length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ACCOUNT, create, services, services_with_limit};

    fn put(name: &str, prefix_length: u8) -> VNetPut {
        VNetPut {
            cloud_account_id: ACCOUNT.into(),
            name: name.into(),
            spec: VNetSpec {
                region: "us-dev-1".into(),
                availability_zone: "us-dev-1a".into(),
                prefix_length,
            },
        }
    }

    #[test]
    fn put_is_an_upsert_that_keeps_identity() {
        let svc = services_with_limit(0);
        let first = svc.vnets.put(put("net", 24)).unwrap();
        let second = svc.vnets.put(put("net", 22)).unwrap();

        assert_eq!(first.metadata.resource_id, second.metadata.resource_id);
        assert_eq!(second.spec.prefix_length, 22);
        assert!(second.metadata.resource_version > first.metadata.resource_version);
        assert_eq!(svc.vnets.search(ACCOUNT, &BTreeMap::new()).unwrap().len(), 1);
    }

    #[test]
    fn put_validates_spec() {
        let svc = services_with_limit(0);
        for prefix in [0, 33] {
            assert!(matches!(
                svc.vnets.put(put("net", prefix)),
                Err(ServiceError::InvalidArgument(_))
            ));
        }
        let mut missing_zone = put("net", 24);
        missing_zone.spec.availability_zone.clear();
        assert!(svc.vnets.put(missing_zone).is_err());
        assert!(svc.vnets.put(put("Net", 24)).is_err());
    }

    #[test]
    fn delete_is_immediate() {
        let svc = services_with_limit(0);
        let vnet = svc.vnets.put(put("net", 24)).unwrap();
        svc.vnets
            .delete(ACCOUNT, &ResourceRef::Id(vnet.metadata.resource_id.clone()))
            .unwrap();
        assert!(matches!(
            svc.vnets.get(ACCOUNT, &ResourceRef::Name("net".into())),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.vnets.delete(ACCOUNT, &ResourceRef::Name("net".into())),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn vnet_in_use_cannot_be_deleted() {
        let svc = services(10).await;
        svc.instances.create(create("vm-1")).await.unwrap();
        assert!(matches!(
            svc.vnets.delete(ACCOUNT, &ResourceRef::Name("default".into())),
            Err(ServiceError::FailedPrecondition(_))
        ));
    }
}
