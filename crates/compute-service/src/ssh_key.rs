//! SSH public key service.
//!
//! Keys are validated on create: the algorithm must be supported, the key
//! must be long enough for it, and the algorithm embedded in the key blob
//! must match the one written in front of it.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use compute_core::validate::{check_cloud_account_id, check_ssh_key_name};
use compute_state::{ResourceMetadata, ResourceRef, SshPublicKey, SshPublicKeySpec};
use compute_watch::SnapshotStream;

use crate::ServiceContext;
use crate::common::{CreateMetadata, check_ref};
use crate::error::{ServiceError, ServiceResult};

/// Minimum decoded key length in bits, per supported algorithm.
const MIN_KEY_BITS: &[(&str, usize)] = &[
    ("ssh-rsa", 3072),
    ("ecdsa-sha2-nistp256", 256),
    ("sk-ecdsa-sha2-nistp256@openssh.com", 256),
    ("ssh-ed25519", 256),
    ("sk-ssh-ed25519@openssh.com", 256),
    ("ecdsa-sha2-nistp384", 384),
    ("ecdsa-sha2-nistp521", 384),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshPublicKeyCreate {
    pub metadata: CreateMetadata,
    pub ssh_public_key: String,
    pub owner_email: String,
}

/// A key as shown to a particular reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshPublicKeyView {
    pub metadata: ResourceMetadata,
    pub spec: SshPublicKeySpec,
    pub allow_delete: bool,
}

impl SshPublicKeyView {
    fn for_reader(key: SshPublicKey, reader_email: &str) -> Self {
        let allow_delete = allow_delete(reader_email, &key.spec.owner_email);
        Self {
            metadata: key.metadata,
            spec: key.spec,
            allow_delete,
        }
    }
}

/// Keys without a recorded owner, and readers without an identity, are
/// not restricted.
pub fn allow_delete(reader_email: &str, owner_email: &str) -> bool {
    reader_email.is_empty() || owner_email.is_empty() || reader_email == owner_email
}

/// Check an `authorized_keys`-style line and return the decoded key blob.
pub fn validate_ssh_public_key(key: &str) -> ServiceResult<Vec<u8>> {
    let fields: Vec<&str> = key.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(ServiceError::invalid(
            "ssh public key must contain an algorithm and a key",
        ));
    }
    let algorithm = fields[0];
    let blob = STANDARD
        .decode(fields[1])
        .map_err(|e| ServiceError::invalid(format!("could not decode ssh public key: {e}")))?;

    let min_bits = MIN_KEY_BITS
        .iter()
        .find(|(name, _)| *name == algorithm)
        .map(|(_, bits)| *bits)
        .ok_or_else(|| ServiceError::invalid(format!("unsupported ssh key algorithm {algorithm:?}")))?;
    let bits = blob.len() * 8;
    if bits < min_bits {
        return Err(ServiceError::invalid(format!(
            "{algorithm} key is {bits} bits, at least {min_bits} are required"
        )));
    }

    match embedded_algorithm(&blob) {
        Some(embedded) if embedded == algorithm => Ok(blob),
        Some(_) => Err(ServiceError::invalid("ssh algorithm and key are mismatching")),
        None => Err(ServiceError::invalid("could not parse ssh public key")),
    }
}

/// The algorithm name at the start of a key blob: a big-endian `u32`
/// length followed by that many bytes.
fn embedded_algorithm(blob: &[u8]) -> Option<&str> {
    let len = u32::from_be_bytes(blob.get(..4)?.try_into().ok()?) as usize;
    std::str::from_utf8(blob.get(4..4 + len)?).ok()
}

/// OpenSSH-style `SHA256:` fingerprint.
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

#[derive(Clone)]
pub struct SshPublicKeyService {
    ctx: Arc<ServiceContext>,
}

impl SshPublicKeyService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn create(&self, req: SshPublicKeyCreate) -> ServiceResult<SshPublicKeyView> {
        let metadata = req
            .metadata
            .resolve(false, |name| Ok(check_ssh_key_name(name)?))?;
        let blob = validate_ssh_public_key(&req.ssh_public_key)?;
        let key = SshPublicKey {
            metadata,
            spec: SshPublicKeySpec {
                ssh_public_key: req.ssh_public_key.trim().to_string(),
                owner_email: req.owner_email.clone(),
                fingerprint: fingerprint(&blob),
            },
        };
        let created = self.ctx.store.write(|txn| txn.insert(key))?;
        info!(
            cloud_account_id = %created.metadata.cloud_account_id,
            name = %created.metadata.name,
            fingerprint = %created.spec.fingerprint,
            "ssh public key created"
        );
        Ok(SshPublicKeyView::for_reader(created, &req.owner_email))
    }

    pub fn get(&self, account: &str, by: &ResourceRef, reader_email: &str) -> ServiceResult<SshPublicKeyView> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let key = self.load(account, by)?;
        Ok(SshPublicKeyView::for_reader(key, reader_email))
    }

    pub fn search(&self, account: &str, reader_email: &str) -> ServiceResult<Vec<SshPublicKeyView>> {
        check_cloud_account_id(account)?;
        let keys: Vec<SshPublicKey> = self.ctx.store.list(Some(account))?;
        Ok(keys
            .into_iter()
            .map(|key| SshPublicKeyView::for_reader(key, reader_email))
            .collect())
    }

    pub fn search_stream(&self, account: Option<&str>) -> ServiceResult<SnapshotStream<SshPublicKey>> {
        if let Some(account) = account {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.search_stream(account)?)
    }

    /// Delete immediately. Only the owner may delete an owned key.
    pub fn delete(&self, account: &str, by: &ResourceRef, reader_email: &str) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let deleted = self.ctx.store.write(|txn| {
            let key: SshPublicKey = txn
                .get(account, by)?
                .ok_or_else(|| ServiceError::not_found(format!("ssh public key {by} not found")))?;
            if !allow_delete(reader_email, &key.spec.owner_email) {
                warn!(
                    cloud_account_id = %account,
                    name = %key.metadata.name,
                    reader = reader_email,
                    "ssh public key delete refused"
                );
                return Err(ServiceError::PermissionDenied(format!(
                    "ssh public key {} belongs to another user",
                    key.metadata.name
                )));
            }
            txn.finalize::<SshPublicKey>(account, &key.metadata.resource_id)?;
            Ok(key)
        })?;
        info!(cloud_account_id = %account, name = %deleted.metadata.name, "ssh public key deleted");
        Ok(())
    }

    fn load(&self, account: &str, by: &ResourceRef) -> ServiceResult<SshPublicKey> {
        self.ctx
            .store
            .get(account, by)?
            .ok_or_else(|| ServiceError::not_found(format!("ssh public key {by} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ACCOUNT, ed25519_key, fake_key, services_with_limit, ssh_key};

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn accepts_supported_keys() {
        assert!(validate_ssh_public_key(&ed25519_key()).is_ok());
        assert!(validate_ssh_public_key(&fake_key("ssh-rsa", 400)).is_ok());
        assert!(validate_ssh_public_key(&fake_key("ecdsa-sha2-nistp384", 97)).is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        let cases = [
            String::new(),
            "ssh-ed25519".to_string(),
            "ssh-ed25519 !!!not-base64!!!".to_string(),
            fake_key("ssh-dss", 400),
            // 2048-bit RSA is too short.
            fake_key("ssh-rsa", 200),
        ];
        for key in cases {
            assert!(
                matches!(validate_ssh_public_key(&key), Err(ServiceError::InvalidArgument(_))),
                "accepted {key:?}"
            );
        }
    }

    #[test]
    fn rejects_mismatched_algorithm() {
        let ed = ed25519_key();
        let (_, rest) = ed.split_once(' ').unwrap();
        let err = validate_ssh_public_key(&format!("ecdsa-sha2-nistp256 {rest}")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: ssh algorithm and key are mismatching"
        );
    }

    #[test]
    fn fingerprint_is_stable() {
        let blob = validate_ssh_public_key(&ed25519_key()).unwrap();
        let fp = fingerprint(&blob);
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert_eq!(fp, fingerprint(&blob));
    }

    #[test]
    fn allow_delete_rules() {
        assert!(allow_delete("", "alice@example.com"));
        assert!(allow_delete("bob@example.com", ""));
        assert!(allow_delete("alice@example.com", "alice@example.com"));
        assert!(!allow_delete("bob@example.com", "alice@example.com"));
    }

    // ── Service ─────────────────────────────────────────────────────

    #[test]
    fn create_records_fingerprint_and_owner() {
        let svc = services_with_limit(0);
        let view = svc
            .ssh_keys
            .create(ssh_key("alice@laptop", &ed25519_key(), "alice@example.com"))
            .unwrap();
        assert!(view.allow_delete);
        assert!(view.spec.fingerprint.starts_with("SHA256:"));

        let as_bob = svc
            .ssh_keys
            .get(ACCOUNT, &ResourceRef::Name("alice@laptop".into()), "bob@example.com")
            .unwrap();
        assert!(!as_bob.allow_delete);
        assert_eq!(svc.ssh_keys.search(ACCOUNT, "").unwrap().len(), 1);
    }

    #[test]
    fn only_owner_can_delete() {
        let svc = services_with_limit(0);
        svc.ssh_keys
            .create(ssh_key("laptop", &ed25519_key(), "alice@example.com"))
            .unwrap();
        let by = ResourceRef::Name("laptop".into());

        assert!(matches!(
            svc.ssh_keys.delete(ACCOUNT, &by, "bob@example.com"),
            Err(ServiceError::PermissionDenied(_))
        ));
        svc.ssh_keys.delete(ACCOUNT, &by, "alice@example.com").unwrap();
        assert!(matches!(
            svc.ssh_keys.get(ACCOUNT, &by, ""),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let svc = services_with_limit(0);
        svc.ssh_keys
            .create(ssh_key("laptop", &ed25519_key(), ""))
            .unwrap();
        assert!(matches!(
            svc.ssh_keys.create(ssh_key("laptop", &ed25519_key(), "")),
            Err(ServiceError::AlreadyExists(_))
        ));
    }
}
