use rapport_core::analysis::AnalysisResult;
use rapport_core::tier::{policy_for, ResultField, Tier};

/// Remove everything the tier may not see.
///
/// Filtering is deep: `participantTones` inside `toneAnalysis` and the
/// per-flag `participant`/`evidenceQuotes` are gated separately from their
/// containers. A hidden section is absent, not emptied. Idempotent.
pub fn shape(mut result: AnalysisResult, tier: Tier) -> AnalysisResult {
    let policy = tier.policy();
    let exposes = |field| policy.exposes(field);

    if !exposes(ResultField::ParticipantTones) {
        result.tone_analysis.participant_tones = None;
    }

    if !exposes(ResultField::RedFlags) {
        result.red_flags = None;
    } else if !exposes(ResultField::RedFlagEvidence) {
        if let Some(flags) = result.red_flags.as_mut() {
            for flag in flags.iter_mut() {
                flag.participant = None;
                flag.evidence_quotes = None;
            }
        }
    }

    if !exposes(ResultField::HealthScore) {
        result.health_score = None;
    }
    if !exposes(ResultField::CommunicationStyles) {
        result.communication_styles = None;
    }
    if !exposes(ResultField::ManipulationScores) {
        result.manipulation_scores = None;
    }
    if !exposes(ResultField::PowerDynamics) {
        result.power_dynamics = None;
    }

    result
}

/// [`shape`] for a loosely-typed tier label. Unknown labels shape as `free`.
pub fn shape_for(result: AnalysisResult, tier: &str) -> AnalysisResult {
    shape(result, policy_for(tier).tier)
}
