//! Stagnation Detector: notice when iterations stop helping
//!
//! Compares each candidate in a trailing window with its predecessor. When the
//! window is full and the average similarity is above the threshold, the loop
//! is stagnant. Qualitative patterns (stuck, cosmetic, reverting, confused)
//! are classified from score and finding deltas so the reply can suggest a
//! different approach.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{AuditError, AuditResult};
use crate::session::IterationRecord;

/// Normalised [0,1] textual similarity; 1.0 means identical
pub trait SimilarityMetric: Send + Sync {
    fn name(&self) -> &'static str;
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Line-level diff ratio (`similar::TextDiff::ratio`)
#[derive(Debug, Clone, Copy, Default)]
pub struct LineDiffRatio;

impl SimilarityMetric for LineDiffRatio {
    fn name(&self) -> &'static str {
        "line_diff_ratio"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let ratio = similar::TextDiff::from_lines(a, b).ratio() as f64;
        if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Configuration for stagnation detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagnationConfig {
    /// Consecutive comparisons averaged (needs `window_size + 1` records)
    pub window_size: usize,
    /// Average similarity above which the loop is stagnant
    pub similarity_threshold: f64,
    /// Average similarity above which edits count as cosmetic
    pub cosmetic_similarity: f64,
    /// Max score range across the window for "cosmetic only"
    pub cosmetic_score_epsilon: f64,
    /// How much closer to an older snapshot counts as reverting
    pub revert_margin: f64,
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            similarity_threshold: 0.95,
            cosmetic_similarity: 0.85,
            cosmetic_score_epsilon: 2.0,
            revert_margin: 0.02,
        }
    }
}

impl StagnationConfig {
    pub fn validate(&self) -> AuditResult<()> {
        if self.window_size < 2 {
            return Err(AuditError::config("stagnation.window_size must be >= 2"));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(AuditError::config(format!(
                "stagnation.similarity_threshold {} outside (0, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.cosmetic_similarity) {
            return Err(AuditError::config(format!(
                "stagnation.cosmetic_similarity {} outside [0, 1]",
                self.cosmetic_similarity
            )));
        }
        if self.cosmetic_score_epsilon < 0.0 || self.revert_margin < 0.0 {
            return Err(AuditError::config(
                "stagnation epsilon and revert margin must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Qualitative patterns seen across the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagnationPatterns {
    /// Same finding locations recur in every review
    pub stuck_on_same_issue: bool,
    /// High similarity while the score barely moves
    pub cosmetic_only: bool,
    /// Latest candidate is closer to an older snapshot than to its predecessor
    pub reverting: bool,
    /// Score oscillates without a trend
    pub confusion: bool,
}

impl StagnationPatterns {
    pub fn any(&self) -> bool {
        self.stuck_on_same_issue || self.cosmetic_only || self.reverting || self.confusion
    }

    /// Names of the patterns that fired
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.stuck_on_same_issue {
            out.push("stuck_on_same_issue");
        }
        if self.cosmetic_only {
            out.push("cosmetic_only");
        }
        if self.reverting {
            out.push("reverting");
        }
        if self.confusion {
            out.push("confusion");
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagnationVerdict {
    pub stagnant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at_loop: Option<u32>,
    /// Average of `similarity_trend`, 0-1
    pub similarity_score: f64,
    pub recommendation: String,
    #[serde(default)]
    pub patterns: StagnationPatterns,
    /// Similarity of each windowed candidate to its predecessor
    #[serde(default)]
    pub similarity_trend: Vec<f64>,
    #[serde(default)]
    pub alternative_suggestions: Vec<String>,
}

/// Window-based stagnation detector
#[derive(Clone)]
pub struct StagnationDetector {
    config: StagnationConfig,
    metric: Arc<dyn SimilarityMetric>,
}

impl Default for StagnationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StagnationDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagnationDetector")
            .field("config", &self.config)
            .field("metric", &self.metric.name())
            .finish()
    }
}

impl StagnationDetector {
    /// Create a detector with default config and the line-diff metric
    pub fn new() -> Self {
        Self::with_config(StagnationConfig::default())
    }

    pub fn with_config(config: StagnationConfig) -> Self {
        Self {
            config,
            metric: Arc::new(LineDiffRatio),
        }
    }

    /// Swap the similarity metric
    pub fn with_metric(mut self, metric: Arc<dyn SimilarityMetric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn config(&self) -> &StagnationConfig {
        &self.config
    }

    /// Records needed before a verdict can be stagnant
    pub fn required_history(&self) -> usize {
        self.config.window_size + 1
    }

    /// Inspect the trailing window of `history` (oldest first)
    pub fn detect(&self, history: &[IterationRecord]) -> StagnationVerdict {
        let needed = self.required_history();
        let window = &history[history.len().saturating_sub(needed)..];

        let similarity_trend: Vec<f64> = window
            .windows(2)
            .map(|pair| {
                self.metric
                    .similarity(&pair[0].candidate, &pair[1].candidate)
            })
            .collect();
        let similarity_score = if similarity_trend.is_empty() {
            0.0
        } else {
            similarity_trend.iter().sum::<f64>() / similarity_trend.len() as f64
        };

        let full = window.len() >= needed;
        let patterns = self.classify_patterns(window, similarity_score);
        let stagnant = full && similarity_score > self.config.similarity_threshold;

        if !full {
            return StagnationVerdict {
                stagnant: false,
                detected_at_loop: None,
                similarity_score,
                recommendation: format!(
                    "Insufficient history: {} of {} iterations recorded; keep iterating",
                    window.len(),
                    needed
                ),
                patterns,
                similarity_trend,
                alternative_suggestions: Vec::new(),
            };
        }

        let detected_at_loop = if stagnant {
            window.last().map(|r| r.loop_index)
        } else {
            None
        };

        let recommendation = if stagnant {
            let mut text = format!(
                "Candidates are {:.0}% similar on average over the last {} loops; change approach before continuing",
                similarity_score * 100.0,
                similarity_trend.len()
            );
            if patterns.any() {
                text.push_str(&format!(" (patterns: {})", patterns.names().join(", ")));
            }
            text
        } else if patterns.any() {
            format!(
                "Still changing, but watch for: {}",
                patterns.names().join(", ")
            )
        } else {
            "Candidates are still changing; continue iterating".to_string()
        };

        let alternative_suggestions = if stagnant {
            alternative_suggestions(history, window, &patterns)
        } else {
            Vec::new()
        };

        if stagnant {
            tracing::debug!(
                loop_index = detected_at_loop.unwrap_or_default(),
                similarity = similarity_score,
                patterns = ?patterns.names(),
                metric = self.metric.name(),
                "Stagnation detected"
            );
        }

        StagnationVerdict {
            stagnant,
            detected_at_loop,
            similarity_score,
            recommendation,
            patterns,
            similarity_trend,
            alternative_suggestions,
        }
    }

    fn classify_patterns(&self, window: &[IterationRecord], avg: f64) -> StagnationPatterns {
        if window.len() < 2 {
            return StagnationPatterns::default();
        }
        let scores: Vec<f64> = window.iter().map(|r| r.review.score).collect();

        StagnationPatterns {
            stuck_on_same_issue: recurring_locations(window).is_some(),
            cosmetic_only: avg >= self.config.cosmetic_similarity
                && score_range(&scores) <= self.config.cosmetic_score_epsilon,
            reverting: self.is_reverting(window),
            confusion: is_oscillating(&scores),
        }
    }

    fn is_reverting(&self, window: &[IterationRecord]) -> bool {
        let n = window.len();
        if n < 3 {
            return false;
        }
        let latest = &window[n - 1].candidate;
        let to_previous = self.metric.similarity(latest, &window[n - 2].candidate);
        window[..n - 2].iter().any(|earlier| {
            self.metric.similarity(latest, &earlier.candidate) > to_previous + self.config.revert_margin
        })
    }
}

/// Finding locations present in every review of the window
fn recurring_locations(window: &[IterationRecord]) -> Option<Vec<(String, u32)>> {
    let mut iter = window.iter().map(|r| r.review.finding_locations());
    let first = iter.next()?;
    let common: HashSet<(String, u32)> =
        iter.fold(first, |acc, next| acc.intersection(&next).cloned().collect());
    if common.is_empty() {
        return None;
    }
    let mut locations: Vec<(String, u32)> = common.into_iter().collect();
    locations.sort();
    Some(locations)
}

fn score_range(scores: &[f64]) -> f64 {
    let max = scores.iter().cloned().fold(f64::MIN, f64::max);
    let min = scores.iter().cloned().fold(f64::MAX, f64::min);
    if scores.is_empty() {
        0.0
    } else {
        max - min
    }
}

/// Direction flips at least twice and the net change is under half the movement
fn is_oscillating(scores: &[f64]) -> bool {
    let deltas: Vec<f64> = scores
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| d.abs() > f64::EPSILON)
        .collect();
    let flips = deltas
        .windows(2)
        .filter(|w| w[0].signum() != w[1].signum())
        .count();
    let movement: f64 = deltas.iter().map(|d| d.abs()).sum();
    let net: f64 = deltas.iter().sum();
    flips >= 2 && net.abs() < movement / 2.0
}

fn alternative_suggestions(
    history: &[IterationRecord],
    window: &[IterationRecord],
    patterns: &StagnationPatterns,
) -> Vec<String> {
    let mut out = Vec::new();

    if patterns.reverting {
        let best = history.iter().fold(None::<&IterationRecord>, |best, r| match best {
            Some(b) if b.review.score >= r.review.score => Some(b),
            _ => Some(r),
        });
        match best {
            Some(b) => out.push(format!(
                "Revert to the best-scoring snapshot (loop {}, score {:.1}) and branch in a different direction",
                b.loop_index, b.review.score
            )),
            None => out.push(
                "Revert to the best-scoring snapshot and branch in a different direction".to_string(),
            ),
        }
    }
    if patterns.stuck_on_same_issue {
        let locations = recurring_locations(window).unwrap_or_default();
        let shown: Vec<String> = locations
            .iter()
            .take(3)
            .map(|(path, line)| format!("{}:{}", path, line))
            .collect();
        out.push(format!(
            "Isolate the blocking issue at {} and fix only that before touching anything else",
            shown.join(", ")
        ));
    }
    if patterns.cosmetic_only {
        out.push(
            "Stop cosmetic edits; address the substantive findings the judge keeps reporting"
                .to_string(),
        );
    }
    if patterns.confusion {
        out.push(
            "Scores are oscillating; pick the lowest-scoring rubric dimension and improve only that next loop"
                .to_string(),
        );
    }

    if out.is_empty() {
        out.push("Rewrite the failing section from scratch instead of patching it".to_string());
        out.push("Split the change into smaller, independently reviewable pieces".to_string());
        out.push("Request a narrower review focused on the lowest-scoring dimension".to_string());
    }
    out
}
