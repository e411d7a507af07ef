//! Deterministic lexicon-based analyzer.
//!
//! Runs locally with no network access. It produces the same result shape as
//! a provider reply, computing only the sections the requested detail level
//! calls for; hiding sections from a tier is the shaper's job.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use rapport_core::analysis::{
    AnalysisRequest, AnalysisResult, AnalysisSource, HealthScore, ManipulationScores, RedFlag,
    Sentiment, ToneAnalysis,
};
use rapport_core::tier::DetailLevel;

const POSITIVE_WORDS: &[&str] = &[
    "love", "loved", "happy", "glad", "great", "good", "thanks", "thank", "appreciate",
    "wonderful", "awesome", "nice", "kind", "care", "support", "excited", "enjoy", "fun",
    "beautiful", "proud", "understand", "sweet", "amazing", "yes",
];

const NEGATIVE_WORDS: &[&str] = &[
    "hate", "angry", "mad", "annoyed", "upset", "stupid", "terrible", "awful", "hurt", "sad",
    "disappointed", "frustrated", "ridiculous", "selfish", "liar", "lie", "lying", "blame",
    "worst", "sick", "tired", "fault", "useless", "pathetic", "never", "cry",
];

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}'’]+").expect("word pattern is valid"));

static AVOIDANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(won['’]t talk|don['’]t want to talk|ignor(?:e|es|ed|ing)|leave me alone|whatever|not talking|stop texting)\b",
    )
    .expect("avoidance pattern is valid")
});

pub const AVOIDANCE_FLAG: &str = "Avoidance";
pub const NEGATIVE_TONE_FLAG: &str = "Negative Tone";

const AVOIDANCE_SEVERITY: u8 = 5;
const NEGATIVE_TONE_MAX_SEVERITY: f64 = 8.0;

/// Positive/negative lexicon hits over a piece of text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LexiconCounts {
    pub positive: u32,
    pub negative: u32,
    pub words: u32,
}

impl LexiconCounts {
    pub fn of(text: &str) -> Self {
        let mut counts = Self::default();
        for m in WORD.find_iter(text) {
            let word = m
                .as_str()
                .trim_matches(|c| c == '\'' || c == '’')
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            counts.words += 1;
            if POSITIVE_WORDS.contains(&word.as_str()) {
                counts.positive += 1;
            } else if NEGATIVE_WORDS.contains(&word.as_str()) {
                counts.negative += 1;
            }
        }
        counts
    }

    pub fn sentiment(&self) -> Sentiment {
        match self.positive.cmp(&self.negative) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        }
    }

    /// `min(10, round(100 * hits / words))`, 0 for empty text.
    pub fn intensity(&self) -> u8 {
        if self.words == 0 {
            return 0;
        }
        let hits = f64::from(self.positive + self.negative);
        (100.0 * hits / f64::from(self.words)).round().min(10.0) as u8
    }

    fn negativity_ratio(&self) -> f64 {
        f64::from(self.negative) / f64::from(self.positive.max(1))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackAnalyzer;

impl FallbackAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, request: &AnalysisRequest, level: DetailLevel) -> AnalysisResult {
        let text = &request.conversation_text;
        let counts = LexiconCounts::of(text);

        let participant_tones = participant_tones(text, &request.participant_labels);
        let tone_analysis = ToneAnalysis {
            overall_tone: overall_tone(counts.sentiment()).to_string(),
            sentiment: counts.sentiment(),
            emotional_intensity: counts.intensity(),
            participant_tones: (!participant_tones.is_empty()).then_some(participant_tones),
        };

        let flags = if level >= DetailLevel::Standard {
            red_flags(text, &counts)
        } else {
            Vec::new()
        };

        let manipulation_scores = (level == DetailLevel::Full).then(|| ManipulationScores {
            drama_score: drama_score(&counts),
            participants: BTreeMap::new(),
        });

        AnalysisResult {
            tone_analysis,
            health_score: Some(health_score(&counts, flags.len())),
            red_flags: (!flags.is_empty()).then_some(flags),
            communication_styles: None,
            manipulation_scores,
            power_dynamics: None,
            source: AnalysisSource::Fallback,
        }
    }
}

fn overall_tone(sentiment: Sentiment) -> &'static str {
    match sentiment {
        Sentiment::Positive => "Warm and mostly positive",
        Sentiment::Negative => "Tense and mostly negative",
        Sentiment::Neutral => "Neutral and matter-of-fact",
    }
}

fn participant_tone(sentiment: Sentiment) -> &'static str {
    match sentiment {
        Sentiment::Positive => "Positive",
        Sentiment::Negative => "Negative",
        Sentiment::Neutral => "Neutral",
    }
}

/// Attribute `Label: ...` lines to participants and score each one.
fn participant_tones(text: &str, labels: &[String]) -> BTreeMap<String, String> {
    let mut per_participant: BTreeMap<&str, String> = BTreeMap::new();

    for line in text.lines() {
        let Some((speaker, said)) = line.split_once(':') else {
            continue;
        };
        let speaker = speaker.trim();
        if let Some(label) = labels
            .iter()
            .find(|l| l.trim().eq_ignore_ascii_case(speaker))
        {
            let buf = per_participant.entry(label.as_str()).or_default();
            buf.push_str(said);
            buf.push('\n');
        }
    }

    per_participant
        .into_iter()
        .map(|(label, said)| {
            let tone = participant_tone(LexiconCounts::of(&said).sentiment());
            (label.to_string(), tone.to_string())
        })
        .collect()
}

fn red_flags(text: &str, counts: &LexiconCounts) -> Vec<RedFlag> {
    let mut flags = Vec::new();

    let mut phrases: Vec<String> = Vec::new();
    for m in AVOIDANCE.find_iter(text) {
        let phrase = m.as_str().to_lowercase();
        if !phrases.contains(&phrase) {
            phrases.push(phrase);
        }
    }
    if !phrases.is_empty() {
        flags.push(RedFlag {
            kind: AVOIDANCE_FLAG.to_string(),
            description: "Language suggesting withdrawal from the conversation".to_string(),
            severity: AVOIDANCE_SEVERITY,
            participant: None,
            evidence_quotes: Some(phrases),
        });
    }

    let ratio = counts.negativity_ratio();
    if ratio > 2.0 {
        flags.push(RedFlag {
            kind: NEGATIVE_TONE_FLAG.to_string(),
            description: format!(
                "Negative language outweighs positive {}:{}",
                counts.negative,
                counts.positive.max(1)
            ),
            severity: ratio.round().min(NEGATIVE_TONE_MAX_SEVERITY) as u8,
            participant: None,
            evidence_quotes: None,
        });
    }

    flags
}

/// `min(10, round((2 * negative + positive) / 10))`.
fn drama_score(counts: &LexiconCounts) -> u8 {
    let weighted = f64::from(2 * counts.negative + counts.positive);
    (weighted / 10.0).round().min(10.0) as u8
}

/// `clamp(70 + 3 * positive - 5 * negative - 5 * flags, 0, 100)`.
fn health_score(counts: &LexiconCounts, flag_count: usize) -> HealthScore {
    let raw = 70 + 3 * i64::from(counts.positive)
        - 5 * i64::from(counts.negative)
        - 5 * i64::try_from(flag_count).unwrap_or(i64::MAX / 8);
    HealthScore::from_score(raw.clamp(0, 100) as u8)
}
