//! Tier policy table.
//!
//! Single source of truth for what each subscription tier may do: how many
//! analyses it gets per calendar month, how detailed those analyses are, and
//! which result fields it is allowed to see. Every capability check in the
//! workspace goes through [`TierPolicy::exposes`] rather than comparing tier
//! names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Subscription tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Personal,
    Pro,
    Instant,
    Beta,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Anonymous,
        Tier::Free,
        Tier::Personal,
        Tier::Pro,
        Tier::Instant,
        Tier::Beta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Free => "free",
            Self::Personal => "personal",
            Self::Pro => "pro",
            Self::Instant => "instant",
            Self::Beta => "beta",
        }
    }

    /// Resolve a loosely-typed tier label. Unknown labels resolve to `Free`.
    pub fn parse_lossy(raw: &str) -> Tier {
        raw.parse().unwrap_or(Tier::Free)
    }

    pub fn policy(self) -> &'static TierPolicy {
        match self {
            Self::Anonymous => &ANONYMOUS,
            Self::Free => &FREE,
            Self::Personal => &PERSONAL,
            Self::Pro => &PRO,
            Self::Instant => &INSTANT,
            Self::Beta => &BETA,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Self::Anonymous),
            "free" => Ok(Self::Free),
            "personal" => Ok(Self::Personal),
            "pro" => Ok(Self::Pro),
            "instant" => Ok(Self::Instant),
            "beta" => Ok(Self::Beta),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Ordinal richness of an analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Basic,
    Standard,
    Full,
}

/// Result sections (and sub-sections) a tier can be entitled to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultField {
    ToneAnalysis,
    HealthScore,
    /// Participant-keyed tones inside `toneAnalysis`.
    ParticipantTones,
    RedFlags,
    CommunicationStyles,
    /// `participant` and `evidenceQuotes` on each red flag.
    RedFlagEvidence,
    ManipulationScores,
    PowerDynamics,
}

/// Monthly allowance. Serializes as a number or the string `"unlimited"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(u32),
    Unlimited,
}

impl QuotaLimit {
    pub fn admits(self, used: u32) -> bool {
        match self {
            Self::Limited(limit) => used < limit,
            Self::Unlimited => true,
        }
    }

    /// Remaining uses, `None` when unlimited.
    pub fn remaining(self, used: u32) -> Option<u32> {
        match self {
            Self::Limited(limit) => Some(limit.saturating_sub(used)),
            Self::Unlimited => None,
        }
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for QuotaLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::Limited(n)),
            Raw::Text(s) if s == "unlimited" => Ok(Self::Unlimited),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "expected a number or \"unlimited\", got {s:?}"
            ))),
        }
    }
}

/// Immutable per-tier policy.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPolicy {
    pub tier: Tier,
    pub monthly_limit: QuotaLimit,
    pub detail_level: DetailLevel,
    pub exposed_fields: &'static [ResultField],
}

impl TierPolicy {
    pub fn exposes(&self, field: ResultField) -> bool {
        self.exposed_fields.contains(&field)
    }
}

/// Look up the policy for a tier label. Total: unknown labels get the `free` policy.
pub fn policy_for(tier: &str) -> &'static TierPolicy {
    Tier::parse_lossy(tier).policy()
}

const ANONYMOUS_FIELDS: &[ResultField] = &[ResultField::ToneAnalysis, ResultField::HealthScore];

const BASIC_FIELDS: &[ResultField] = &[
    ResultField::ToneAnalysis,
    ResultField::HealthScore,
    ResultField::ParticipantTones,
];

const STANDARD_FIELDS: &[ResultField] = &[
    ResultField::ToneAnalysis,
    ResultField::HealthScore,
    ResultField::ParticipantTones,
    ResultField::RedFlags,
    ResultField::CommunicationStyles,
];

const FULL_FIELDS: &[ResultField] = &[
    ResultField::ToneAnalysis,
    ResultField::HealthScore,
    ResultField::ParticipantTones,
    ResultField::RedFlags,
    ResultField::CommunicationStyles,
    ResultField::RedFlagEvidence,
    ResultField::ManipulationScores,
    ResultField::PowerDynamics,
];

// Anonymous callers are metered by the lifetime allowance in `usage`, not this limit.
static ANONYMOUS: TierPolicy = TierPolicy {
    tier: Tier::Anonymous,
    monthly_limit: QuotaLimit::Limited(crate::usage::ANONYMOUS_LIMIT),
    detail_level: DetailLevel::Basic,
    exposed_fields: ANONYMOUS_FIELDS,
};

static FREE: TierPolicy = TierPolicy {
    tier: Tier::Free,
    monthly_limit: QuotaLimit::Limited(2),
    detail_level: DetailLevel::Basic,
    exposed_fields: BASIC_FIELDS,
};

static PERSONAL: TierPolicy = TierPolicy {
    tier: Tier::Personal,
    monthly_limit: QuotaLimit::Limited(10),
    detail_level: DetailLevel::Standard,
    exposed_fields: STANDARD_FIELDS,
};

static PRO: TierPolicy = TierPolicy {
    tier: Tier::Pro,
    monthly_limit: QuotaLimit::Limited(50),
    detail_level: DetailLevel::Full,
    exposed_fields: FULL_FIELDS,
};

static INSTANT: TierPolicy = TierPolicy {
    tier: Tier::Instant,
    monthly_limit: QuotaLimit::Limited(5),
    detail_level: DetailLevel::Full,
    exposed_fields: FULL_FIELDS,
};

static BETA: TierPolicy = TierPolicy {
    tier: Tier::Beta,
    monthly_limit: QuotaLimit::Unlimited,
    detail_level: DetailLevel::Full,
    exposed_fields: FULL_FIELDS,
};
