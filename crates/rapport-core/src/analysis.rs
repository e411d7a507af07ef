//! Analysis request and result data model.
//!
//! The JSON wire format is camelCase. Optional sections are omitted when
//! absent, never serialized as `null`, so a shaped result contains exactly
//! the keys its tier may see.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RequestError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    #[default]
    Dyad,
    Group,
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dyad => f.write_str("dyad"),
            Self::Group => f.write_str("group"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub conversation_text: String,
    pub participant_labels: Vec<String>,
    /// Loosely-typed tier label as supplied by the caller; resolved through the policy table.
    pub tier: String,
    #[serde(default)]
    pub conversation_type: ConversationType,
}

impl AnalysisRequest {
    pub fn dyad(
        conversation_text: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        Self {
            conversation_text: conversation_text.into(),
            participant_labels: vec![first.into(), second.into()],
            tier: tier.into(),
            conversation_type: ConversationType::Dyad,
        }
    }

    pub fn group(
        conversation_text: impl Into<String>,
        participant_labels: Vec<String>,
        tier: impl Into<String>,
    ) -> Self {
        Self {
            conversation_text: conversation_text.into(),
            participant_labels,
            tier: tier.into(),
            conversation_type: ConversationType::Group,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// Check the request invariants. Runs before any quota or provider work.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.conversation_text.trim().is_empty() {
            return Err(RequestError::EmptyConversation);
        }

        let actual = self.participant_labels.len();
        let count_ok = match self.conversation_type {
            ConversationType::Dyad => actual == 2,
            ConversationType::Group => actual >= 2,
        };
        if !count_ok {
            return Err(RequestError::ParticipantCount {
                conversation_type: self.conversation_type,
                actual,
            });
        }

        if let Some(index) = self
            .participant_labels
            .iter()
            .position(|label| label.trim().is_empty())
        {
            return Err(RequestError::BlankParticipantLabel(index));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn parse_lossy(raw: &str) -> Sentiment {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Provider,
    #[default]
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneAnalysis {
    pub overall_tone: String,
    pub sentiment: Sentiment,
    /// 0 to 10.
    pub emotional_intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_tones: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedFlag {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    /// 1 to 10.
    pub severity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quotes: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    /// 0 to 100.
    pub score: u8,
    pub label: String,
}

impl HealthScore {
    pub fn from_score(score: u8) -> Self {
        let score = score.min(100);
        Self {
            score,
            label: Self::label_for(score).to_string(),
        }
    }

    pub fn label_for(score: u8) -> &'static str {
        match score {
            80..=u8::MAX => "Healthy",
            60..=79 => "Stable",
            40..=59 => "Strained",
            _ => "Unhealthy",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantManipulation {
    pub gaslighting: u8,
    pub guilt_tripping: u8,
    pub stonewalling: u8,
    pub blame_shifting: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManipulationScores {
    /// Aggregate 0 to 10.
    pub drama_score: u8,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub participants: BTreeMap<String, ParticipantManipulation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerDynamics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_participant: Option<String>,
    /// 0 (one-sided) to 10 (balanced).
    pub balance_score: u8,
    pub summary: String,
}

/// Canonical analysis result. Produced fresh per request, never persisted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub tone_analysis: ToneAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red_flags: Option<Vec<RedFlag>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<HealthScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication_styles: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manipulation_scores: Option<ManipulationScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_dynamics: Option<PowerDynamics>,
    #[serde(default)]
    pub source: AnalysisSource,
}

impl AnalysisResult {
    pub fn has_flag(&self, kind: &str) -> bool {
        self.flag(kind).is_some()
    }

    pub fn flag(&self, kind: &str) -> Option<&RedFlag> {
        self.red_flags
            .as_deref()
            .and_then(|flags| flags.iter().find(|f| f.kind == kind))
    }
}
