use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{DeviceId, UserId};
use crate::tier::Tier;

/// Resolved caller identity, supplied by upstream session middleware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Identity {
    #[serde(rename_all = "camelCase")]
    RegisteredUser { id: UserId, tier: Tier },
    #[serde(rename_all = "camelCase")]
    AnonymousDevice { device_id: DeviceId },
}

impl Identity {
    pub fn user(id: impl Into<String>, tier: Tier) -> Self {
        Self::RegisteredUser {
            id: UserId::from_raw(id),
            tier,
        }
    }

    pub fn device(device_id: impl Into<String>) -> Self {
        Self::AnonymousDevice {
            device_id: DeviceId::from_raw(device_id),
        }
    }

    /// The tier this identity is entitled to. Anonymous callers have no subscription.
    pub fn entitled_tier(&self) -> Tier {
        match self {
            Self::RegisteredUser { tier, .. } => *tier,
            Self::AnonymousDevice { .. } => Tier::Anonymous,
        }
    }

    pub fn key(&self) -> IdentityKey {
        match self {
            Self::RegisteredUser { id, .. } => IdentityKey::User(id.clone()),
            Self::AnonymousDevice { device_id } => IdentityKey::Device(device_id.clone()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::AnonymousDevice { .. })
    }
}

/// Key that owns quota state. Tier is deliberately not part of it: a user
/// who upgrades mid-month keeps their usage count.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    User(UserId),
    Device(DeviceId),
}

impl IdentityKey {
    /// Short stable digest for log fields. Raw device ids never reach logs.
    pub fn fingerprint(&self) -> String {
        let (kind, raw) = match self {
            Self::User(id) => ("user", id.as_str()),
            Self::Device(id) => ("device", id.as_str()),
        };
        let digest = Sha256::new()
            .chain_update(kind.as_bytes())
            .chain_update(b":")
            .chain_update(raw.as_bytes())
            .finalize();
        let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        format!("{kind}:{hex}")
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}
