//! Identifier, name and label validation.

use std::collections::BTreeMap;

use regex::Regex;
use thiserror::Error;

/// Result type alias for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of a resource name.
pub const MAX_NAME_LEN: usize = 63;

/// Maximum length of an instance group name. Leaves room for the
/// `-{index}` suffix of member names.
pub const MAX_GROUP_NAME_LEN: usize = 59;

const RESOURCE_NAME: &str = r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$";
const SSH_KEY_NAME: &str = r"^[a-z0-9](?:[a-z0-9\-\.@]{0,61}[a-z0-9])?$";
const GROUP_NAME: &str = r"^[a-z0-9](?:[a-z0-9-]{0,57}[a-z0-9])?$";
const LABEL_SEGMENT: &str = r"^[A-Za-z0-9](?:[-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$";
const DNS_SUBDOMAIN: &str = r"^[a-z0-9](?:[-a-z0-9.]{0,251}[a-z0-9])?$";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid CloudAccountId")]
    InvalidCloudAccountId,

    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("invalid label key: {0:?}")]
    InvalidLabelKey(String),

    #[error("invalid value {value:?} for label {key:?}")]
    InvalidLabelValue { key: String, value: String },

    #[error("unknown {kind} value: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// A cloud account id is exactly 12 ASCII digits.
pub fn check_cloud_account_id(id: &str) -> ValidationResult<()> {
    if id.len() == 12 && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCloudAccountId)
    }
}

/// Validate the name of an instance, load balancer or vnet.
pub fn check_resource_name(kind: &'static str, name: &str) -> ValidationResult<()> {
    check_pattern(RESOURCE_NAME, kind, name)
}

/// SSH key names additionally allow `.` and `@`.
pub fn check_ssh_key_name(name: &str) -> ValidationResult<()> {
    check_pattern(SSH_KEY_NAME, "ssh public key", name)
}

pub fn check_group_name(name: &str) -> ValidationResult<()> {
    check_pattern(GROUP_NAME, "instance group", name)
}

fn check_pattern(pattern: &str, kind: &'static str, name: &str) -> ValidationResult<()> {
    let re = Regex::new(pattern)?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Validate a label map.
///
/// Keys are `[prefix/]name` where the optional prefix is a DNS subdomain
/// and the name is at most 63 characters. Values may be empty.
pub fn check_labels(labels: &BTreeMap<String, String>) -> ValidationResult<()> {
    let segment = Regex::new(LABEL_SEGMENT)?;
    let subdomain = Regex::new(DNS_SUBDOMAIN)?;

    for (key, value) in labels {
        let (prefix, name) = match key.split_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key.as_str()),
        };
        let prefix_ok = prefix.is_none_or(|p| subdomain.is_match(p));
        if !prefix_ok || !segment.is_match(name) {
            return Err(ValidationError::InvalidLabelKey(key.clone()));
        }
        if !value.is_empty() && !segment.is_match(value) {
            return Err(ValidationError::InvalidLabelValue {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}
