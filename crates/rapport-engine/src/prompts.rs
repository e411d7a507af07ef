//! Instruction templates sent to the reasoning provider, one per detail level.

use rapport_core::analysis::{AnalysisRequest, ConversationType};
use rapport_core::tier::DetailLevel;

const PREAMBLE: &str = "You analyze the emotional dynamics of a text conversation. \
Reply with a single JSON object and nothing else. Use camelCase keys exactly as listed. \
Quote the conversation only verbatim.";

const BASIC_SCHEMA: &str = r#"{
  "toneAnalysis": {
    "overallTone": "short description of the overall tone",
    "sentiment": "Positive | Negative | Neutral",
    "emotionalIntensity": 0-10,
    "participantTones": { "<participant>": "short tone description" }
  },
  "healthScore": { "score": 0-100, "label": "Healthy | Stable | Strained | Unhealthy" }
}"#;

const STANDARD_SCHEMA: &str = r#"{
  "toneAnalysis": {
    "overallTone": "short description of the overall tone",
    "sentiment": "Positive | Negative | Neutral",
    "emotionalIntensity": 0-10,
    "participantTones": { "<participant>": "short tone description" }
  },
  "redFlags": [
    { "type": "short category", "description": "one sentence", "severity": 1-10 }
  ],
  "healthScore": { "score": 0-100, "label": "Healthy | Stable | Strained | Unhealthy" },
  "communicationStyles": { "<participant>": "short style description" }
}"#;

const FULL_SCHEMA: &str = r#"{
  "toneAnalysis": {
    "overallTone": "short description of the overall tone",
    "sentiment": "Positive | Negative | Neutral",
    "emotionalIntensity": 0-10,
    "participantTones": { "<participant>": "short tone description" }
  },
  "redFlags": [
    {
      "type": "short category",
      "description": "one sentence",
      "severity": 1-10,
      "participant": "<participant>",
      "evidenceQuotes": ["verbatim quote"]
    }
  ],
  "healthScore": { "score": 0-100, "label": "Healthy | Stable | Strained | Unhealthy" },
  "communicationStyles": { "<participant>": "short style description" },
  "manipulationScores": {
    "dramaScore": 0-10,
    "participants": {
      "<participant>": { "gaslighting": 0-10, "guiltTripping": 0-10, "stonewalling": 0-10, "blameShifting": 0-10 }
    }
  },
  "powerDynamics": { "dominantParticipant": "<participant or omit>", "balanceScore": 0-10, "summary": "one or two sentences" }
}"#;

/// Output schema for a detail level.
pub fn schema_for(level: DetailLevel) -> &'static str {
    match level {
        DetailLevel::Basic => BASIC_SCHEMA,
        DetailLevel::Standard => STANDARD_SCHEMA,
        DetailLevel::Full => FULL_SCHEMA,
    }
}

/// Full instructions for one request.
pub fn instructions_for(request: &AnalysisRequest, level: DetailLevel) -> String {
    let shape = match request.conversation_type {
        ConversationType::Dyad => "a conversation between two people",
        ConversationType::Group => "a group conversation",
    };
    let depth = match level {
        DetailLevel::Basic => "Keep the analysis brief.",
        DetailLevel::Standard => {
            "Identify concerning patterns as red flags; return an empty list if there are none."
        }
        DetailLevel::Full => {
            "Give a thorough analysis. Attribute every red flag to a participant and back it with verbatim quotes."
        }
    };

    format!(
        "{PREAMBLE}\n\nThis is {shape}. Participants: {}.\n{depth}\n\nRespond with this JSON shape:\n{}",
        request.participant_labels.join(", "),
        schema_for(level),
    )
}
