pub mod analysis;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod provider;
pub mod security;
pub mod tier;
pub mod usage;

pub use analysis::{AnalysisRequest, AnalysisResult, AnalysisSource, ConversationType};
pub use errors::{ProviderError, RequestError};
pub use identity::{Identity, IdentityKey};
pub use ids::{DeviceId, UserId};
pub use provider::{ReasoningProvider, ReasoningRequest};
pub use tier::{policy_for, DetailLevel, QuotaLimit, ResultField, Tier, TierPolicy};
pub use usage::{AnonymousUsageRecord, QuotaStatus, UsageRecord, ANONYMOUS_LIMIT};
