use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// What the analyzer sends to an external reasoning provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningRequest {
    pub instructions: String,
    pub conversation_text: String,
}

impl ReasoningRequest {
    pub fn new(instructions: impl Into<String>, conversation_text: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            conversation_text: conversation_text.into(),
        }
    }
}

/// Trait implemented by each reasoning backend.
///
/// `complete` returns the provider's structured reply as raw JSON. Interpreting
/// it as an analysis is the caller's job; a reply that is not a JSON object
/// should already be reported as [`ProviderError::MalformedResponse`].
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Whether the provider is currently willing to take calls. A provider
    /// that is circuit-broken reports `false` so callers can skip it.
    fn is_available(&self) -> bool {
        true
    }

    /// Called when the caller stopped waiting on [`complete`](Self::complete)
    /// because its deadline passed. The abandoned call never returns an
    /// error, so providers that track failures count it here.
    fn report_timeout(&self) {}

    async fn complete(&self, request: &ReasoningRequest) -> Result<serde_json::Value, ProviderError>;
}
