//! Hybrid Ranker
//!
//! Merges semantic similarity, keyword overlap and a temporal signal into a
//! single combined score. Ranking is a pure function of its inputs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::index::DistanceMetric;
use crate::core::{format_timestamp, ChunkId, TimeSec, VideoId};

/// Temporal score used when a query carries no temporal intent
pub const NEUTRAL_TEMPORAL_SCORE: f64 = 0.5;

// =============================================================================
// Configuration
// =============================================================================

/// Signal weights for the combined score
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankingWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub temporal: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            keyword: 0.3,
            temporal: 0.1,
        }
    }
}

impl RankingWeights {
    /// Clamps negatives to zero and rescales to sum to 1.
    ///
    /// All-zero (or non-finite) weights fall back to the defaults.
    pub fn normalized(&self) -> Self {
        let clean = |w: f64| if w.is_finite() { w.max(0.0) } else { 0.0 };
        let (s, k, t) = (clean(self.semantic), clean(self.keyword), clean(self.temporal));
        let sum = s + k + t;
        if sum <= 0.0 {
            return Self::default();
        }
        if (sum - 1.0).abs() < 1e-9 {
            return Self {
                semantic: s,
                keyword: k,
                temporal: t,
            };
        }
        Self {
            semantic: s / sum,
            keyword: k / sum,
            temporal: t / sum,
        }
    }
}

/// Which temporal signal the ranker uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalMode {
    /// Constant neutral score
    #[default]
    Neutral,
    /// Boost by position for "beginning"/"end"/"MM:SS" queries
    Positional,
}

/// Ranking settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankingConfig {
    pub weights: RankingWeights,
    /// Candidate pool size as a multiple of the requested result count
    pub candidate_multiplier: usize,
    /// Results below this combined score are dropped
    pub min_score: f64,
    pub temporal: TemporalMode,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            weights: RankingWeights::default(),
            candidate_multiplier: 3,
            min_score: 0.0,
            temporal: TemporalMode::Neutral,
        }
    }
}

// =============================================================================
// Temporal Intent
// =============================================================================

/// Position hint parsed from the query text
#[derive(Clone, Debug, PartialEq)]
pub enum TemporalIntent {
    None,
    Beginning,
    End,
    /// A specific moment, in seconds
    At(TimeSec),
}

const BEGINNING_PHRASES: &[&str] = &[
    "at the beginning",
    "in the beginning",
    "at the start",
    "beginning of the video",
    "start of the video",
    "early in the video",
];

const END_PHRASES: &[&str] = &[
    "at the end",
    "in the end",
    "towards the end",
    "toward the end",
    "near the end",
    "end of the video",
    "late in the video",
];

fn timestamp_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b(?:(\d{1,2}):)?(\d{1,2}):(\d{2})\b").ok())
        .as_ref()
}

impl TemporalIntent {
    /// Detects a temporal hint in `query`
    pub fn detect(query: &str) -> Self {
        if let Some(caps) = timestamp_pattern().and_then(|re| re.captures(query)) {
            let part = |i: usize| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            return TemporalIntent::At(part(1) * 3600.0 + part(2) * 60.0 + part(3));
        }

        let lowered = query.to_lowercase();
        if BEGINNING_PHRASES.iter().any(|p| lowered.contains(p)) {
            TemporalIntent::Beginning
        } else if END_PHRASES.iter().any(|p| lowered.contains(p)) {
            TemporalIntent::End
        } else {
            TemporalIntent::None
        }
    }
}

// =============================================================================
// Temporal Signals
// =============================================================================

/// Pluggable temporal relevance in `[0, 1]`
pub trait TemporalSignal: Send + Sync {
    fn score(&self, intent: &TemporalIntent, candidate: &RankCandidate, video_duration: Option<TimeSec>) -> f64;
}

/// Always [`NEUTRAL_TEMPORAL_SCORE`], so the temporal weight never reorders results
#[derive(Clone, Copy, Debug, Default)]
pub struct NeutralTemporal;

impl TemporalSignal for NeutralTemporal {
    fn score(&self, _intent: &TemporalIntent, _candidate: &RankCandidate, _video_duration: Option<TimeSec>) -> f64 {
        NEUTRAL_TEMPORAL_SCORE
    }
}

/// Scores by position within the video.
///
/// `Beginning` favors early chunks, `End` late chunks, and `At(t)` the chunk
/// covering `t` with a decay of 30 s. Without an intent or a known video
/// duration the score is neutral.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionalTemporal;

impl TemporalSignal for PositionalTemporal {
    fn score(&self, intent: &TemporalIntent, candidate: &RankCandidate, video_duration: Option<TimeSec>) -> f64 {
        match intent {
            TemporalIntent::None => NEUTRAL_TEMPORAL_SCORE,
            TemporalIntent::At(t) => {
                if candidate.start_sec <= *t && *t <= candidate.end_sec {
                    1.0
                } else {
                    let gap = (candidate.start_sec - t).abs().min((candidate.end_sec - t).abs());
                    1.0 / (1.0 + gap / 30.0)
                }
            }
            TemporalIntent::Beginning | TemporalIntent::End => {
                let Some(duration) = video_duration.filter(|d| *d > 0.0) else {
                    return NEUTRAL_TEMPORAL_SCORE;
                };
                let position = (candidate.start_sec / duration).clamp(0.0, 1.0);
                if *intent == TemporalIntent::Beginning {
                    1.0 - position
                } else {
                    (candidate.end_sec / duration).clamp(0.0, 1.0)
                }
            }
        }
    }
}

// =============================================================================
// Candidates and Results
// =============================================================================

/// A nearest-neighbor hit awaiting ranking
#[derive(Clone, Debug, PartialEq)]
pub struct RankCandidate {
    pub chunk_id: ChunkId,
    pub video_id: VideoId,
    pub start_sec: TimeSec,
    pub end_sec: TimeSec,
    pub text: String,
    pub distance: f32,
}

/// A ranked, timestamped result. Created per query, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub video_id: VideoId,
    pub start_sec: TimeSec,
    pub end_sec: TimeSec,
    /// `start_sec` as `MM:SS`
    pub timestamp: String,
    pub text: String,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub temporal_score: f64,
    pub combined_score: f64,
}

// =============================================================================
// Tokenization
// =============================================================================

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "did", "do", "does", "for",
    "from", "how", "i", "in", "is", "it", "me", "of", "on", "or", "show", "tell", "that", "the",
    "this", "to", "video", "was", "what", "when", "where", "which", "who", "why", "with", "you",
];

/// Lowercase alphanumeric terms with stop words removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of unique query terms present in `text`
pub fn keyword_score(query_terms: &HashSet<String>, text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let chunk_terms: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = query_terms.iter().filter(|t| chunk_terms.contains(*t)).count();
    hits as f64 / query_terms.len() as f64
}

// =============================================================================
// Hybrid Ranker
// =============================================================================

/// Combines signals into one ordered result list
#[derive(Clone)]
pub struct HybridRanker {
    weights: RankingWeights,
    metric: DistanceMetric,
    candidate_multiplier: usize,
    min_score: f64,
    temporal: Arc<dyn TemporalSignal>,
}

impl HybridRanker {
    /// Creates a ranker with the neutral temporal signal
    pub fn new(metric: DistanceMetric) -> Self {
        Self::from_config(&RankingConfig::default(), metric)
    }

    pub fn from_config(config: &RankingConfig, metric: DistanceMetric) -> Self {
        let temporal: Arc<dyn TemporalSignal> = match config.temporal {
            TemporalMode::Neutral => Arc::new(NeutralTemporal),
            TemporalMode::Positional => Arc::new(PositionalTemporal),
        };
        Self {
            weights: config.weights.normalized(),
            metric,
            candidate_multiplier: config.candidate_multiplier.max(1),
            min_score: config.min_score,
            temporal,
        }
    }

    pub fn with_weights(mut self, weights: RankingWeights) -> Self {
        self.weights = weights.normalized();
        self
    }

    pub fn with_temporal(mut self, temporal: Arc<dyn TemporalSignal>) -> Self {
        self.temporal = temporal;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Candidate pool to request for `final_k` results
    pub fn candidate_pool(&self, final_k: usize) -> usize {
        final_k.saturating_mul(self.candidate_multiplier)
    }

    /// Scores and orders `candidates`, keeping at most `final_k`.
    ///
    /// Sorted by combined score descending; ties go to the earlier
    /// `start_sec`, then to the smaller chunk id.
    pub fn rank(
        &self,
        query: &str,
        candidates: &[RankCandidate],
        video_durations: &HashMap<VideoId, TimeSec>,
        final_k: usize,
    ) -> Vec<SearchResult> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        let intent = TemporalIntent::detect(query);

        let mut results: Vec<SearchResult> = candidates
            .iter()
            .map(|candidate| {
                let semantic = self.metric.similarity(candidate.distance) as f64;
                let keyword = keyword_score(&terms, &candidate.text);
                let temporal = self
                    .temporal
                    .score(&intent, candidate, video_durations.get(&candidate.video_id).copied())
                    .clamp(0.0, 1.0);
                let combined = self.weights.semantic * semantic
                    + self.weights.keyword * keyword
                    + self.weights.temporal * temporal;

                SearchResult {
                    chunk_id: candidate.chunk_id.clone(),
                    video_id: candidate.video_id.clone(),
                    start_sec: candidate.start_sec,
                    end_sec: candidate.end_sec,
                    timestamp: format_timestamp(candidate.start_sec),
                    text: candidate.text.clone(),
                    semantic_score: semantic,
                    keyword_score: keyword,
                    temporal_score: temporal,
                    combined_score: combined,
                }
            })
            .filter(|r| r.combined_score >= self.min_score)
            .collect();

        results.sort_by(|a, b| {
            b.combined_score
                .total_cmp(&a.combined_score)
                .then(a.start_sec.total_cmp(&b.start_sec))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(final_k);
        results
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, start: f64, text: &str, distance: f32) -> RankCandidate {
        RankCandidate {
            chunk_id: id.to_string(),
            video_id: "vid".to_string(),
            start_sec: start,
            end_sec: start + 20.0,
            text: text.to_string(),
            distance,
        }
    }

    fn ranker() -> HybridRanker {
        HybridRanker::new(DistanceMetric::Cosine)
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    #[test]
    fn test_tokenize_drops_stop_words() {
        assert_eq!(
            tokenize("What is Gradient-Descent in the video?"),
            vec!["gradient", "descent"]
        );
    }

    #[test]
    fn test_keyword_score_fraction() {
        let terms: HashSet<String> = tokenize("gradient descent momentum").into_iter().collect();
        let score = keyword_score(&terms, "Gradient descent explained");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(keyword_score(&HashSet::new(), "anything"), 0.0);
    }

    #[test]
    fn test_detect_temporal_intent() {
        assert_eq!(TemporalIntent::detect("what happens at 02:30"), TemporalIntent::At(150.0));
        assert_eq!(TemporalIntent::detect("see 1:02:05"), TemporalIntent::At(3725.0));
        assert_eq!(
            TemporalIntent::detect("what is said at the beginning"),
            TemporalIntent::Beginning
        );
        assert_eq!(TemporalIntent::detect("summary at the end"), TemporalIntent::End);
        assert_eq!(TemporalIntent::detect("gradient descent"), TemporalIntent::None);
    }

    #[test]
    fn test_weights_normalized() {
        let w = RankingWeights {
            semantic: 2.0,
            keyword: 1.0,
            temporal: -5.0,
        }
        .normalized();
        assert!((w.semantic - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(w.temporal, 0.0);

        let zero = RankingWeights {
            semantic: 0.0,
            keyword: 0.0,
            temporal: 0.0,
        };
        assert_eq!(zero.normalized(), RankingWeights::default());
    }

    #[test]
    fn test_positional_temporal() {
        let early = candidate("a", 0.0, "", 0.0);
        let late = candidate("b", 580.0, "", 0.0);
        let signal = PositionalTemporal;

        assert!(
            signal.score(&TemporalIntent::Beginning, &early, Some(600.0))
                > signal.score(&TemporalIntent::Beginning, &late, Some(600.0))
        );
        assert!(
            signal.score(&TemporalIntent::End, &late, Some(600.0))
                > signal.score(&TemporalIntent::End, &early, Some(600.0))
        );
        assert_eq!(signal.score(&TemporalIntent::At(10.0), &early, None), 1.0);
        assert_eq!(
            signal.score(&TemporalIntent::Beginning, &early, None),
            NEUTRAL_TEMPORAL_SCORE
        );
    }

    // -------------------------------------------------------------------------
    // Ranking
    // -------------------------------------------------------------------------

    #[test]
    fn test_combined_score_uses_default_weights() {
        let results = ranker().rank(
            "gradient descent",
            &[candidate("a", 0.0, "gradient descent", 0.0)],
            &HashMap::new(),
            5,
        );

        let r = &results[0];
        assert_eq!(r.semantic_score, 1.0);
        assert_eq!(r.keyword_score, 1.0);
        assert_eq!(r.temporal_score, NEUTRAL_TEMPORAL_SCORE);
        assert!((r.combined_score - (0.6 + 0.3 + 0.1 * 0.5)).abs() < 1e-9);
        assert_eq!(r.timestamp, "00:00");
    }

    #[test]
    fn test_keyword_overlap_breaks_semantic_near_tie() {
        let results = ranker().rank(
            "gradient descent",
            &[
                candidate("intro", 0.0, "intro to the course", 0.30),
                candidate("body", 12.0, "gradient descent explanation", 0.32),
            ],
            &HashMap::new(),
            2,
        );

        assert_eq!(results[0].chunk_id, "body");
    }

    #[test]
    fn test_ties_prefer_earlier_start() {
        let results = ranker().rank(
            "nothing matches",
            &[
                candidate("late", 40.0, "x", 0.5),
                candidate("early", 10.0, "y", 0.5),
            ],
            &HashMap::new(),
            2,
        );

        assert_eq!(results[0].chunk_id, "early");
        assert_eq!(results[1].chunk_id, "late");
    }

    #[test]
    fn test_min_score_and_truncation() {
        let ranker = ranker().with_min_score(0.5);
        let results = ranker.rank(
            "gradient",
            &[
                candidate("good", 0.0, "gradient", 0.0),
                candidate("bad", 10.0, "unrelated", 1.9),
                candidate("ok", 20.0, "gradient", 0.1),
            ],
            &HashMap::new(),
            1,
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "good");

        let none = ranker.rank("gradient", &[candidate("bad", 0.0, "x", 2.0)], &HashMap::new(), 5);
        assert!(none.is_empty());
    }

    #[test]
    fn test_ranking_is_pure() {
        let candidates = vec![
            candidate("a", 0.0, "alpha beta", 0.2),
            candidate("b", 5.0, "beta gamma", 0.2),
            candidate("c", 9.0, "gamma delta", 0.4),
        ];
        let mut reversed = candidates.clone();
        reversed.reverse();

        let first = ranker().rank("beta gamma", &candidates, &HashMap::new(), 3);
        let second = ranker().rank("beta gamma", &reversed, &HashMap::new(), 3);

        assert_eq!(first, second);
    }

    struct LaterIsBetter;

    impl TemporalSignal for LaterIsBetter {
        fn score(&self, _intent: &TemporalIntent, candidate: &RankCandidate, _video_duration: Option<TimeSec>) -> f64 {
            (candidate.start_sec / 100.0).clamp(0.0, 1.0)
        }
    }

    #[test]
    fn test_custom_temporal_signal_and_weights() {
        let ranker = ranker()
            .with_weights(RankingWeights {
                semantic: 0.0,
                keyword: 0.0,
                temporal: 1.0,
            })
            .with_temporal(Arc::new(LaterIsBetter));

        let results = ranker.rank(
            "gradient",
            &[
                candidate("early", 0.0, "gradient", 0.0),
                candidate("late", 80.0, "unrelated", 0.9),
            ],
            &HashMap::new(),
            2,
        );

        assert_eq!(ranker.weights().temporal, 1.0);
        assert_eq!(results[0].chunk_id, "late");
        assert!((results[0].combined_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_candidate_pool() {
        assert_eq!(ranker().candidate_pool(5), 15);
    }
}
