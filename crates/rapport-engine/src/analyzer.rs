use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use rapport_core::analysis::{
    AnalysisRequest, AnalysisResult, AnalysisSource, HealthScore, ManipulationScores,
    ParticipantManipulation, PowerDynamics, RedFlag, Sentiment, ToneAnalysis,
};
use rapport_core::errors::ProviderError;
use rapport_core::provider::{ReasoningProvider, ReasoningRequest};
use rapport_core::tier::{policy_for, DetailLevel};

use crate::fallback::FallbackAnalyzer;
use crate::prompts;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    /// Upper bound for the provider call. The fallback is never timed.
    pub timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Which path an analysis takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Primary,
    Fallback,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// Produces an [`AnalysisResult`] for every valid request, via the reasoning
/// provider when one is usable and the local heuristics otherwise.
pub struct ConversationAnalyzer {
    provider: Option<Arc<dyn ReasoningProvider>>,
    fallback: FallbackAnalyzer,
    config: AnalyzerConfig,
}

impl ConversationAnalyzer {
    pub fn new(provider: Option<Arc<dyn ReasoningProvider>>, config: AnalyzerConfig) -> Self {
        Self {
            provider,
            fallback: FallbackAnalyzer::new(),
            config,
        }
    }

    /// Analyzer with no provider; every request takes the heuristic path.
    pub fn fallback_only() -> Self {
        Self::new(None, AnalyzerConfig::default())
    }

    /// The single decision point between provider and heuristics.
    pub fn strategy(&self) -> Strategy {
        match &self.provider {
            Some(p) if p.is_available() => Strategy::Primary,
            _ => Strategy::Fallback,
        }
    }

    pub async fn analyze(&self, request: &AnalysisRequest) -> AnalysisResult {
        self.analyze_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Analyze, aborting the in-flight provider call if `cancel` fires.
    /// Never fails: any provider problem yields the heuristic result.
    #[instrument(skip_all, fields(tier = %request.tier))]
    pub async fn analyze_with_cancel(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let level = policy_for(&request.tier).detail_level;
        let strategy = self.strategy();
        let started = Instant::now();

        let result = match (strategy, &self.provider) {
            (Strategy::Primary, Some(provider)) => {
                match self.run_provider(provider.as_ref(), request, level, cancel).await {
                    Ok(result) => result,
                    Err(ProviderError::Cancelled) => {
                        debug!("provider call cancelled");
                        self.fallback.analyze(request, level)
                    }
                    Err(e) => {
                        warn!(
                            provider = provider.name(),
                            error_kind = e.error_kind(),
                            error = %e,
                            "provider analysis failed, using fallback"
                        );
                        self.fallback.analyze(request, level)
                    }
                }
            }
            _ => self.fallback.analyze(request, level),
        };

        info!(
            strategy = strategy.as_str(),
            source = ?result.source,
            detail_level = ?level,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );
        result
    }

    async fn run_provider(
        &self,
        provider: &dyn ReasoningProvider,
        request: &AnalysisRequest,
        level: DetailLevel,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, ProviderError> {
        let reasoning = ReasoningRequest::new(
            prompts::instructions_for(request, level),
            request.conversation_text.clone(),
        );
        let timeout = self.config.timeout;

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            reply = tokio::time::timeout(timeout, provider.complete(&reasoning)) => match reply {
                Ok(reply) => reply?,
                Err(_) => {
                    provider.report_timeout();
                    return Err(ProviderError::Timeout(timeout));
                }
            }
        };

        normalize(&reply)
    }
}

// ── Provider reply normalization ────────────────────────────────────────────

/// Map a provider reply onto the canonical result shape.
///
/// Numbers are clamped into range rather than rejected; empty optional
/// sections are dropped. A reply without a non-empty
/// `toneAnalysis.overallTone` is malformed.
pub fn normalize(reply: &Value) -> Result<AnalysisResult, ProviderError> {
    let tone = reply
        .get("toneAnalysis")
        .and_then(Value::as_object)
        .ok_or_else(|| ProviderError::MalformedResponse("missing toneAnalysis".into()))?;

    let overall_tone = text(tone.get("overallTone"))
        .ok_or_else(|| ProviderError::MalformedResponse("missing toneAnalysis.overallTone".into()))?;

    let tone_analysis = ToneAnalysis {
        overall_tone,
        sentiment: tone
            .get("sentiment")
            .and_then(Value::as_str)
            .map_or(Sentiment::Neutral, Sentiment::parse_lossy),
        emotional_intensity: scaled(tone.get("emotionalIntensity"), 0, 10).unwrap_or(0),
        participant_tones: text_map(tone.get("participantTones")),
    };

    let red_flags = reply
        .get("redFlags")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(red_flag).collect::<Vec<_>>())
        .filter(|flags| !flags.is_empty());

    let health_score = match reply.get("healthScore") {
        Some(Value::Object(obj)) => scaled(obj.get("score"), 0, 100),
        other => scaled(other, 0, 100),
    }
    .map(HealthScore::from_score);

    Ok(AnalysisResult {
        tone_analysis,
        red_flags,
        health_score,
        communication_styles: text_map(reply.get("communicationStyles")),
        manipulation_scores: reply
            .get("manipulationScores")
            .and_then(Value::as_object)
            .and_then(manipulation_scores),
        power_dynamics: reply
            .get("powerDynamics")
            .and_then(Value::as_object)
            .and_then(power_dynamics),
        source: AnalysisSource::Provider,
    })
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Round a numeric (or numeric-string) value and clamp it into `lo..=hi`.
fn scaled(value: Option<&Value>, lo: u8, hi: u8) -> Option<u8> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(f64::from(lo), f64::from(hi)) as u8)
}

fn text_map(value: Option<&Value>) -> Option<BTreeMap<String, String>> {
    let map: BTreeMap<String, String> = value?
        .as_object()?
        .iter()
        .filter_map(|(k, v)| Some((k.clone(), text(Some(v))?)))
        .collect();
    (!map.is_empty()).then_some(map)
}

fn red_flag(value: &Value) -> Option<RedFlag> {
    let obj = value.as_object()?;
    let evidence: Vec<String> = obj
        .get("evidenceQuotes")
        .and_then(Value::as_array)
        .map(|quotes| quotes.iter().filter_map(|q| text(Some(q))).collect())
        .unwrap_or_default();

    Some(RedFlag {
        kind: text(obj.get("type"))?,
        description: text(obj.get("description")).unwrap_or_default(),
        severity: scaled(obj.get("severity"), 1, 10).unwrap_or(5),
        participant: text(obj.get("participant")),
        evidence_quotes: (!evidence.is_empty()).then_some(evidence),
    })
}

fn manipulation_scores(obj: &Map<String, Value>) -> Option<ManipulationScores> {
    let participants: BTreeMap<String, ParticipantManipulation> = obj
        .get("participants")
        .and_then(Value::as_object)
        .map(|people| {
            people
                .iter()
                .filter_map(|(name, scores)| {
                    let s = scores.as_object()?;
                    let score = |key: &str| scaled(s.get(key), 0, 10).unwrap_or(0);
                    Some((
                        name.clone(),
                        ParticipantManipulation {
                            gaslighting: score("gaslighting"),
                            guilt_tripping: score("guiltTripping"),
                            stonewalling: score("stonewalling"),
                            blame_shifting: score("blameShifting"),
                        },
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let drama_score = scaled(obj.get("dramaScore"), 0, 10);
    if drama_score.is_none() && participants.is_empty() {
        return None;
    }
    Some(ManipulationScores {
        drama_score: drama_score.unwrap_or(0),
        participants,
    })
}

fn power_dynamics(obj: &Map<String, Value>) -> Option<PowerDynamics> {
    Some(PowerDynamics {
        summary: text(obj.get("summary"))?,
        dominant_participant: text(obj.get("dominantParticipant")),
        balance_score: scaled(obj.get("balanceScore"), 0, 10).unwrap_or(5),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_llm::{MockProvider, MockResponse};
    use serde_json::json;

    fn request(tier: &str) -> AnalysisRequest {
        AnalysisRequest::dyad("Sam: thanks, I love you\nAlex: love you too", "Sam", "Alex", tier)
    }

    fn good_reply() -> Value {
        json!({
            "toneAnalysis": {
                "overallTone": "Affectionate",
                "sentiment": "positive",
                "emotionalIntensity": 6.6,
                "participantTones": { "Sam": "Grateful", "Alex": "Warm" }
            },
            "redFlags": [],
            "healthScore": { "score": 92, "label": "whatever the model says" },
            "manipulationScores": { "dramaScore": 1 }
        })
    }

    fn analyzer(mock: MockProvider, timeout: Duration) -> ConversationAnalyzer {
        ConversationAnalyzer::new(Some(Arc::new(mock)), AnalyzerConfig { timeout })
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(ConversationAnalyzer::fallback_only().strategy(), Strategy::Fallback);

        let a = analyzer(MockProvider::new(vec![]), DEFAULT_TIMEOUT);
        assert_eq!(a.strategy(), Strategy::Primary);

        let a = analyzer(MockProvider::new(vec![]).unavailable(), DEFAULT_TIMEOUT);
        assert_eq!(a.strategy(), Strategy::Fallback);
    }

    #[tokio::test]
    async fn provider_reply_is_normalized() {
        let a = analyzer(
            MockProvider::new(vec![MockResponse::reply(good_reply())]),
            DEFAULT_TIMEOUT,
        );
        let result = a.analyze(&request("pro")).await;

        assert_eq!(result.source, AnalysisSource::Provider);
        assert_eq!(result.tone_analysis.overall_tone, "Affectionate");
        assert_eq!(result.tone_analysis.sentiment, Sentiment::Positive);
        assert_eq!(result.tone_analysis.emotional_intensity, 7);
        assert!(result.red_flags.is_none(), "empty list is dropped");
        let health = result.health_score.unwrap();
        assert_eq!((health.score, health.label.as_str()), (92, "Healthy"));
        assert_eq!(result.manipulation_scores.unwrap().drama_score, 1);
    }

    #[tokio::test]
    async fn instructions_match_detail_level() {
        let mock = Arc::new(MockProvider::always(MockResponse::reply(good_reply())));
        let a = ConversationAnalyzer::new(Some(mock.clone()), AnalyzerConfig::default());

        let _ = a.analyze(&request("free")).await;
        let _ = a.analyze(&request("pro")).await;

        let seen = mock.requests();
        assert!(!seen[0].instructions.contains("manipulationScores"));
        assert!(seen[1].instructions.contains("manipulationScores"));
        assert_eq!(seen[0].conversation_text, request("free").conversation_text);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back() {
        let text = "Sam: I hate this, I'm angry and upset.\n\
                    Alex: That's stupid and terrible, you always blame me.\n\
                    Sam: thanks for nothing";
        let req = AnalysisRequest::dyad(text, "Sam", "Alex", "personal");
        let a = analyzer(
            MockProvider::new(vec![MockResponse::delayed(
                Duration::from_secs(60),
                MockResponse::reply(good_reply()),
            )]),
            Duration::from_secs(30),
        );

        let result = a.analyze(&req).await;
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert!(!result.tone_analysis.overall_tone.is_empty());
        assert_eq!(result.flag("Negative Tone").unwrap().severity, 6);
    }

    #[tokio::test]
    async fn provider_errors_fall_back() {
        for err in [
            ProviderError::AuthenticationFailed("bad key".into()),
            ProviderError::ServerError { status: 503, body: "down".into() },
            ProviderError::NetworkError("refused".into()),
        ] {
            let a = analyzer(MockProvider::new(vec![MockResponse::Error(err)]), DEFAULT_TIMEOUT);
            let result = a.analyze(&request("free")).await;
            assert_eq!(result.source, AnalysisSource::Fallback);
        }
    }

    #[tokio::test]
    async fn malformed_reply_falls_back() {
        for reply in [
            json!({"healthScore": 50}),
            json!({"toneAnalysis": {"overallTone": "   "}}),
            json!({"toneAnalysis": "happy"}),
        ] {
            let a = analyzer(MockProvider::new(vec![MockResponse::reply(reply)]), DEFAULT_TIMEOUT);
            assert_eq!(a.analyze(&request("pro")).await.source, AnalysisSource::Fallback);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_provider_call() {
        let a = analyzer(
            MockProvider::new(vec![MockResponse::delayed(
                Duration::from_secs(20),
                MockResponse::reply(good_reply()),
            )]),
            DEFAULT_TIMEOUT,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = a.analyze_with_cancel(&request("pro"), &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(result.source, AnalysisSource::Fallback);
    }

    #[tokio::test]
    async fn fallback_only_covers_every_tier() {
        let a = ConversationAnalyzer::fallback_only();
        for tier in ["anonymous", "free", "personal", "pro", "instant", "beta", "mystery"] {
            let result = a.analyze(&request(tier)).await;
            assert!(!result.tone_analysis.overall_tone.is_empty(), "{tier}");
        }
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let result = normalize(&json!({
            "toneAnalysis": { "overallTone": "Heated", "emotionalIntensity": 42 },
            "redFlags": [
                { "type": "Contempt", "description": "eye rolling", "severity": 0 },
                { "type": "Threat", "severity": "15", "evidenceQuotes": ["  ", "or else"] },
                { "description": "no type, dropped", "severity": 3 }
            ],
            "healthScore": -20,
            "powerDynamics": { "balanceScore": 99, "summary": "Sam leads" },
            "communicationStyles": {}
        }))
        .unwrap();

        assert_eq!(result.tone_analysis.emotional_intensity, 10);
        assert_eq!(result.tone_analysis.sentiment, Sentiment::Neutral);
        let flags = result.red_flags.unwrap();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].severity, 1);
        assert_eq!(flags[1].severity, 10);
        assert_eq!(flags[1].evidence_quotes.as_deref().unwrap(), ["or else"]);
        assert_eq!(result.health_score.unwrap().score, 0);
        assert_eq!(result.power_dynamics.unwrap().balance_score, 10);
        assert!(result.communication_styles.is_none());
    }

    #[test]
    fn normalize_reads_participant_manipulation() {
        let result = normalize(&json!({
            "toneAnalysis": { "overallTone": "Tense" },
            "manipulationScores": {
                "participants": { "Sam": { "gaslighting": 3, "blameShifting": 11 } }
            },
            "powerDynamics": { "balanceScore": 4 }
        }))
        .unwrap();

        let scores = result.manipulation_scores.unwrap();
        assert_eq!(scores.drama_score, 0);
        assert_eq!(scores.participants["Sam"].gaslighting, 3);
        assert_eq!(scores.participants["Sam"].blame_shifting, 10);
        assert!(result.power_dynamics.is_none(), "summary is required");
    }
}
