//! Closed enums exchanged as strings on the wire.
//!
//! Every enum carries an exhaustive mapping to its wire string. Parsing an
//! unknown string fails with [`ValidationError::UnknownVariant`] rather than
//! falling back to a default, so bad values are rejected at the boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Declare a closed enum together with its wire-string mapping.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $wire ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok($name::$variant), )+
                    other => Err(ValidationError::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, ValidationError> {
                value.parse()
            }
        }

        impl From<$name> for &'static str {
            fn from(value: $name) -> Self {
                value.as_str()
            }
        }
    };
}

// ── Instances ──────────────────────────────────────────────────────

wire_enum! {
    /// Lifecycle phase reported by the VM operator in instance status.
    InstancePhase {
        Provisioning => "Provisioning",
        Ready => "Ready",
        Stopping => "Stopping",
        Stopped => "Stopped",
        Starting => "Starting",
        Terminating => "Terminating",
        Failed => "Failed",
    }
}

impl Default for InstancePhase {
    fn default() -> Self {
        InstancePhase::Provisioning
    }
}

wire_enum! {
    /// Desired power behaviour of an instance.
    RunStrategy {
        Always => "Always",
        RerunOnFailure => "RerunOnFailure",
        Halted => "Halted",
    }
}

impl Default for RunStrategy {
    fn default() -> Self {
        RunStrategy::Always
    }
}

wire_enum! {
    /// Hardware category of an instance type.
    InstanceCategory {
        VirtualMachine => "VirtualMachine",
        BareMetalHost => "BareMetalHost",
    }
}

wire_enum! {
    /// How a search treats the `instance_group` field.
    SearchFilterCriteria {
        /// Exact match when a group name is given, otherwise only
        /// instances outside any group.
        Default => "Default",
        ExactValue => "ExactValue",
        NonEmpty => "NonEmpty",
        Any => "Any",
    }
}

impl Default for SearchFilterCriteria {
    fn default() -> Self {
        SearchFilterCriteria::Default
    }
}

// ── Accounts ───────────────────────────────────────────────────────

wire_enum! {
    /// Commercial tier of a cloud account; selects the default quota table.
    AccountType {
        Standard => "STANDARD",
        Premium => "PREMIUM",
        Enterprise => "ENTERPRISE",
        EnterprisePending => "ENTERPRISE_PENDING",
        Intel => "INTEL",
    }
}

impl Default for AccountType {
    fn default() -> Self {
        AccountType::Standard
    }
}

// ── Load balancers ─────────────────────────────────────────────────

wire_enum! {
    /// Provisioning state reported by the load-balancer operator.
    LoadBalancerState {
        Pending => "Pending",
        Active => "Active",
        Deleting => "Deleting",
        Error => "Error",
    }
}

impl Default for LoadBalancerState {
    fn default() -> Self {
        LoadBalancerState::Pending
    }
}

wire_enum! {
    HealthMonitorType {
        Tcp => "tcp",
        Http => "http",
        Https => "https",
    }
}

// ── Watch ──────────────────────────────────────────────────────────

wire_enum! {
    /// Kind of a message on a watch or snapshot stream.
    DeltaKind {
        Updated => "Updated",
        Deleted => "Deleted",
        Bookmark => "Bookmark",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_uses_upper_snake_wire_names() {
        assert_eq!(AccountType::EnterprisePending.as_str(), "ENTERPRISE_PENDING");
        assert_eq!("INTEL".parse::<AccountType>().unwrap(), AccountType::Intel);
    }

    #[test]
    fn unknown_wire_value_is_rejected() {
        let err = "Paused".parse::<RunStrategy>().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnknownVariant { kind: "RunStrategy", .. }
        ));
    }

    #[test]
    fn serde_rejects_unknown_phase() {
        let ok: InstancePhase = serde_json::from_str("\"Ready\"").unwrap();
        assert_eq!(ok, InstancePhase::Ready);
        assert!(serde_json::from_str::<InstancePhase>("\"ready\"").is_err());
    }

    #[test]
    fn error_variant_converts_from_string() {
        let state = LoadBalancerState::try_from("Error".to_string()).unwrap();
        assert_eq!(state, LoadBalancerState::Error);
        assert!(LoadBalancerState::try_from("Failed".to_string()).is_err());
        let parsed: LoadBalancerState = serde_json::from_str("\"Error\"").unwrap();
        assert_eq!(parsed, LoadBalancerState::Error);
    }

    #[test]
    fn every_variant_maps_back_to_itself() {
        for phase in InstancePhase::ALL {
            assert_eq!(phase.as_str().parse::<InstancePhase>().unwrap(), *phase);
        }
        for kind in DeltaKind::ALL {
            assert_eq!(serde_json::to_string(kind).unwrap(), format!("\"{kind}\""));
        }
    }
}
