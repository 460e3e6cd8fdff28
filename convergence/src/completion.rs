//! Completion Evaluator: tiered acceptance thresholds and forced stops
//!
//! The required score is a decreasing step function of the loop index: early
//! loops must be near-perfect, later loops accept less. A hard cap forces the
//! loop to stop, and a stagnation verdict overrides everything else.
//! All decisions are deterministic and pure.

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, AuditResult};
use crate::session::SessionState;
use crate::stagnation::StagnationVerdict;

/// Why a session stopped, or that it has not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionReason {
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "score_95_at_10")]
    Score95At10,
    #[serde(rename = "score_90_at_15")]
    Score90At15,
    #[serde(rename = "score_85_at_20")]
    Score85At20,
    #[serde(rename = "max_loops_reached")]
    MaxLoopsReached,
    #[serde(rename = "stagnation_detected")]
    StagnationDetected,
    #[serde(rename = "manual")]
    Manual,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Score95At10 => "score_95_at_10",
            Self::Score90At15 => "score_90_at_15",
            Self::Score85At20 => "score_85_at_20",
            Self::MaxLoopsReached => "max_loops_reached",
            Self::StagnationDetected => "stagnation_detected",
            Self::Manual => "manual",
        }
    }

    /// Every reason except `in_progress` ends the session
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// The candidate met a score band
    pub fn is_acceptance(&self) -> bool {
        matches!(self, Self::Score95At10 | Self::Score90At15 | Self::Score85At20)
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the threshold table: loops strictly below `below_loop` need
/// at least `min_score`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub below_loop: u32,
    pub min_score: f64,
    pub reason: CompletionReason,
}

/// Band table plus hard cap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionPolicy {
    /// Ordered by `below_loop`; the last band also covers every later loop
    pub bands: Vec<ThresholdBand>,
    /// Loop at which the session is force-stopped regardless of score
    pub hard_cap: u32,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            bands: vec![
                ThresholdBand {
                    below_loop: 10,
                    min_score: 95.0,
                    reason: CompletionReason::Score95At10,
                },
                ThresholdBand {
                    below_loop: 15,
                    min_score: 90.0,
                    reason: CompletionReason::Score90At15,
                },
                ThresholdBand {
                    below_loop: 20,
                    min_score: 85.0,
                    reason: CompletionReason::Score85At20,
                },
            ],
            hard_cap: 25,
        }
    }
}

impl CompletionPolicy {
    pub fn validate(&self) -> AuditResult<()> {
        if self.bands.is_empty() {
            return Err(AuditError::config("completion.bands must not be empty"));
        }
        if self.hard_cap == 0 {
            return Err(AuditError::config("completion.hard_cap must be >= 1"));
        }
        for band in &self.bands {
            if !(0.0..=100.0).contains(&band.min_score) {
                return Err(AuditError::config(format!(
                    "band min_score {} outside 0-100",
                    band.min_score
                )));
            }
            if !band.reason.is_acceptance() {
                return Err(AuditError::config(format!(
                    "band reason {} is not a score reason",
                    band.reason
                )));
            }
        }
        for pair in self.bands.windows(2) {
            if pair[1].below_loop <= pair[0].below_loop {
                return Err(AuditError::config(format!(
                    "band loop bounds must be strictly increasing ({} then {})",
                    pair[0].below_loop, pair[1].below_loop
                )));
            }
            if pair[1].min_score > pair[0].min_score {
                return Err(AuditError::config(format!(
                    "band scores must be non-increasing ({} then {})",
                    pair[0].min_score, pair[1].min_score
                )));
            }
        }
        Ok(())
    }

    /// Band governing `loop_index`; loops past the last bound use the last band
    pub fn band_for(&self, loop_index: u32) -> Option<&ThresholdBand> {
        self.bands
            .iter()
            .find(|b| loop_index < b.below_loop)
            .or_else(|| self.bands.last())
    }

    /// Score `loop_index` must reach to be accepted
    pub fn required_score(&self, loop_index: u32) -> Option<f64> {
        self.band_for(loop_index).map(|b| b.min_score)
    }

    /// Loop at which the threshold next relaxes, and the band that applies then
    fn next_band(&self, loop_index: u32) -> Option<(u32, &ThresholdBand)> {
        let pos = self.bands.iter().position(|b| loop_index < b.below_loop)?;
        self.bands
            .get(pos + 1)
            .map(|next| (self.bands[pos].below_loop, next))
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDecision {
    pub complete: bool,
    pub reason: CompletionReason,
    pub message: String,
    /// Whether the host should submit another iteration
    pub continue_expected: bool,
    pub current_loop: u32,
    pub score: f64,
    /// Threshold the score was compared against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_score: Option<f64>,
}

impl CompletionDecision {
    /// Decision reconstructed from a persisted session
    pub fn from_state(state: &SessionState, policy: &CompletionPolicy) -> Self {
        let score = state.last_review.as_ref().map(|r| r.score).unwrap_or(0.0);
        let reason = state.completion_reason.unwrap_or(CompletionReason::InProgress);
        let complete = state.is_complete;
        let message = if complete {
            format!("Session completed at loop {} ({})", state.current_loop, reason)
        } else if state.current_loop == 0 {
            "No iterations recorded yet".to_string()
        } else {
            format!("Awaiting loop {}", state.next_loop())
        };
        Self {
            complete,
            reason,
            message,
            continue_expected: !complete,
            current_loop: state.current_loop,
            score,
            required_score: policy.required_score(state.current_loop.max(1)),
        }
    }

    /// Manual stop requested by the host
    pub fn manual(state: &SessionState, note: &str, policy: &CompletionPolicy) -> Self {
        let note = note.trim();
        Self {
            complete: true,
            reason: CompletionReason::Manual,
            message: if note.is_empty() {
                "Terminated manually".to_string()
            } else {
                format!("Terminated manually: {}", note)
            },
            continue_expected: false,
            current_loop: state.current_loop,
            score: state.last_review.as_ref().map(|r| r.score).unwrap_or(0.0),
            required_score: policy.required_score(state.current_loop.max(1)),
        }
    }
}

/// Tiered completion evaluator
#[derive(Debug, Clone, Default)]
pub struct CompletionEvaluator {
    policy: CompletionPolicy,
}

impl CompletionEvaluator {
    /// Create an evaluator with the default band table
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: CompletionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CompletionPolicy {
        &self.policy
    }

    pub fn evaluate(
        &self,
        score: f64,
        current_loop: u32,
        stagnation: Option<&StagnationVerdict>,
    ) -> CompletionDecision {
        evaluate(score, current_loop, stagnation, &self.policy)
    }
}

/// Decide whether the loop is done after `current_loop` scored `score`
pub fn evaluate(
    score: f64,
    current_loop: u32,
    stagnation: Option<&StagnationVerdict>,
    policy: &CompletionPolicy,
) -> CompletionDecision {
    let band = policy.band_for(current_loop);
    let required_score = band.map(|b| b.min_score);

    // Stagnation overrides any remaining budget
    if let Some(verdict) = stagnation.filter(|v| v.stagnant) {
        return CompletionDecision {
            complete: true,
            reason: CompletionReason::StagnationDetected,
            message: format!(
                "Stagnation detected at loop {} (similarity {:.2}): {}",
                current_loop, verdict.similarity_score, verdict.recommendation
            ),
            continue_expected: false,
            current_loop,
            score,
            required_score,
        };
    }

    if let Some(band) = band {
        if score >= band.min_score {
            return CompletionDecision {
                complete: true,
                reason: band.reason,
                message: format!(
                    "Score {:.1} meets the {:.0} required at loop {}",
                    score, band.min_score, current_loop
                ),
                continue_expected: false,
                current_loop,
                score,
                required_score,
            };
        }
    }

    if current_loop >= policy.hard_cap {
        return CompletionDecision {
            complete: true,
            reason: CompletionReason::MaxLoopsReached,
            message: format!(
                "Maximum loop cap of {} reached; accepting current state at score {:.1}",
                policy.hard_cap, score
            ),
            continue_expected: false,
            current_loop,
            score,
            required_score,
        };
    }

    let message = match (required_score, policy.next_band(current_loop)) {
        (Some(required), Some((from_loop, next))) => format!(
            "Score {:.1} is {:.1} short of {:.0} at loop {}; threshold relaxes to {:.0} from loop {} ({:.1} away)",
            score,
            required - score,
            required,
            current_loop,
            next.min_score,
            from_loop,
            (next.min_score - score).max(0.0)
        ),
        (Some(required), None) => format!(
            "Score {:.1} is {:.1} short of {:.0} at loop {}; forced stop at loop {}",
            score,
            required - score,
            required,
            current_loop,
            policy.hard_cap
        ),
        (None, _) => format!("Loop {} in progress", current_loop),
    };

    CompletionDecision {
        complete: false,
        reason: CompletionReason::InProgress,
        message,
        continue_expected: true,
        current_loop,
        score,
        required_score,
    }
}

/// How a force-stopped loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCategory {
    Timeout,
    Stagnation,
    Failure,
    Manual,
}

impl std::fmt::Display for TerminationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Stagnation => write!(f, "stagnation"),
            Self::Failure => write!(f, "failure"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Record produced when the loop stops without acceptance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationDecision {
    pub should_terminate: bool,
    pub reason: String,
    /// 0-100
    pub estimated_failure_rate: f64,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    pub final_assessment: String,
    pub category: TerminationCategory,
}

/// Build a termination record for a force-stopped (or failing) session.
///
/// `state` must already contain the iteration the decision was made on.
/// Returns `None` for accepted or still-running sessions, except when the
/// judge has failed `judge_failure_limit` times in a row.
pub fn assess_termination(
    state: &SessionState,
    decision: &CompletionDecision,
    policy: &CompletionPolicy,
    judge_failure_limit: u32,
) -> Option<TerminationDecision> {
    let (category, reason) = match decision.reason {
        CompletionReason::MaxLoopsReached => (
            TerminationCategory::Timeout,
            format!("Maximum loop cap of {} reached", policy.hard_cap),
        ),
        CompletionReason::StagnationDetected => {
            let similarity = state
                .last_stagnation
                .as_ref()
                .map(|v| format!(" (similarity {:.2})", v.similarity_score))
                .unwrap_or_default();
            (
                TerminationCategory::Stagnation,
                format!(
                    "Stagnation detected at loop {}{}",
                    decision.current_loop, similarity
                ),
            )
        }
        CompletionReason::Manual => (TerminationCategory::Manual, decision.message.clone()),
        CompletionReason::InProgress => {
            let failures = state.consecutive_synthetic_reviews();
            if judge_failure_limit == 0 || failures < judge_failure_limit {
                return None;
            }
            (
                TerminationCategory::Failure,
                format!("Judge failed {} consecutive times", failures),
            )
        }
        CompletionReason::Score95At10
        | CompletionReason::Score90At15
        | CompletionReason::Score85At20 => return None,
    };

    let last_review = state
        .last_review
        .as_ref()
        .or_else(|| state.iterations.last().map(|r| &r.review));
    let estimated_failure_rate = last_review
        .map(|r| (100.0 - r.score).clamp(0.0, 100.0))
        .unwrap_or(100.0);
    let critical_issues = last_review
        .map(|r| r.critical_findings().map(|f| f.describe()).collect())
        .unwrap_or_default();

    let final_assessment = match state.best_iteration() {
        Some(best) => format!(
            "Best score {:.1} at loop {} after {} loop(s); final score {:.1}",
            best.review.score,
            best.loop_index,
            state.iterations.len(),
            last_review.map(|r| r.score).unwrap_or(0.0)
        ),
        None => "No iterations were recorded".to_string(),
    };

    Some(TerminationDecision {
        should_terminate: true,
        reason,
        estimated_failure_rate,
        critical_issues,
        final_assessment,
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{InlineFinding, Review, Verdict};
    use crate::session::{IterationRecord, SessionConfig};
    use chrono::Utc;

    fn stagnant() -> StagnationVerdict {
        StagnationVerdict {
            stagnant: true,
            detected_at_loop: Some(7),
            similarity_score: 0.97,
            recommendation: "change approach".into(),
            ..Default::default()
        }
    }

    fn state_with(reviews: Vec<Review>) -> SessionState {
        let mut state = SessionState::new("s", SessionConfig::default(), Utc::now());
        for (i, review) in reviews.into_iter().enumerate() {
            state.iterations.push(IterationRecord {
                loop_index: i as u32 + 1,
                candidate: String::new(),
                review: review.clone(),
                timestamp: Utc::now(),
            });
            state.last_review = Some(review);
        }
        state.current_loop = state.iterations.len() as u32;
        state
    }

    #[test]
    fn test_band_scenarios() {
        let eval = CompletionEvaluator::new();

        let d = eval.evaluate(96.0, 9, None);
        assert!(d.complete);
        assert_eq!(d.reason, CompletionReason::Score95At10);

        let d = eval.evaluate(91.0, 12, None);
        assert!(d.complete);
        assert_eq!(d.reason, CompletionReason::Score90At15);

        let d = eval.evaluate(60.0, 25, None);
        assert!(d.complete);
        assert_eq!(d.reason, CompletionReason::MaxLoopsReached);
        assert!(!d.continue_expected);
    }

    #[test]
    fn test_in_progress_reports_gap() {
        let d = CompletionEvaluator::new().evaluate(80.0, 3, None);
        assert!(!d.complete);
        assert!(d.continue_expected);
        assert_eq!(d.reason, CompletionReason::InProgress);
        assert_eq!(d.required_score, Some(95.0));
        assert!(d.message.contains("15.0 short"));
        assert!(d.message.contains("relaxes to 90"));
    }

    #[test]
    fn test_last_band_extends_past_bound() {
        let policy = CompletionPolicy::default();
        assert_eq!(policy.required_score(22), Some(85.0));
        let d = evaluate(99.0, 25, None, &policy);
        assert_eq!(d.reason, CompletionReason::Score85At20);
        let d = evaluate(80.0, 21, None, &policy);
        assert!(!d.complete);
        assert!(d.message.contains("forced stop at loop 25"));
    }

    #[test]
    fn test_stagnation_overrides_score() {
        let verdict = stagnant();
        let d = CompletionEvaluator::new().evaluate(99.0, 5, Some(&verdict));
        assert!(d.complete);
        assert!(!d.continue_expected);
        assert_eq!(d.reason, CompletionReason::StagnationDetected);

        let not_stagnant = StagnationVerdict::default();
        let d = CompletionEvaluator::new().evaluate(50.0, 5, Some(&not_stagnant));
        assert_eq!(d.reason, CompletionReason::InProgress);
    }

    #[test]
    fn test_bands_non_increasing() {
        let policy = CompletionPolicy::default();
        let mut prev = f64::MAX;
        for loop_index in 1..=30 {
            let required = policy.required_score(loop_index).unwrap();
            assert!(required <= prev);
            prev = required;
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(CompletionPolicy::default().validate().is_ok());

        let mut rising = CompletionPolicy::default();
        rising.bands[1].min_score = 97.0;
        assert!(rising.validate().is_err());

        let mut unordered = CompletionPolicy::default();
        unordered.bands[2].below_loop = 12;
        assert!(unordered.validate().is_err());

        let zero_cap = CompletionPolicy {
            hard_cap: 0,
            ..Default::default()
        };
        assert!(zero_cap.validate().is_err());
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: CompletionPolicy = toml::from_str(
            r#"
            hard_cap = 12
            [[bands]]
            below_loop = 5
            min_score = 92.0
            reason = "score_95_at_10"
            "#,
        )
        .unwrap();
        assert_eq!(policy.hard_cap, 12);
        assert_eq!(policy.required_score(30), Some(92.0));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_termination_for_hard_cap() {
        let review = Review::new(60.0, Verdict::Revise, "")
            .with_finding(InlineFinding::new("api.rs", 9, "auth token logged in plaintext"));
        let state = state_with(vec![Review::new(70.0, Verdict::Revise, ""), review]);
        let policy = CompletionPolicy::default();
        let decision = evaluate(60.0, 25, None, &policy);

        let t = assess_termination(&state, &decision, &policy, 3).unwrap();
        assert_eq!(t.category, TerminationCategory::Timeout);
        assert!(t.reason.contains("Maximum loop cap of 25"));
        assert_eq!(t.estimated_failure_rate, 40.0);
        assert_eq!(t.critical_issues.len(), 1);
        assert!(t.final_assessment.contains("Best score 70.0 at loop 1"));
    }

    #[test]
    fn test_no_termination_on_acceptance_or_progress() {
        let state = state_with(vec![Review::new(96.0, Verdict::Pass, "")]);
        let policy = CompletionPolicy::default();
        let accepted = evaluate(96.0, 1, None, &policy);
        assert!(assess_termination(&state, &accepted, &policy, 3).is_none());

        let running = evaluate(50.0, 1, None, &policy);
        assert!(assess_termination(&state, &running, &policy, 3).is_none());
    }

    #[test]
    fn test_termination_after_judge_failures() {
        let state = state_with(vec![
            Review::fallback("timeout"),
            Review::fallback("timeout"),
            Review::fallback("exit 1"),
        ]);
        let policy = CompletionPolicy::default();
        let decision = evaluate(0.0, 3, None, &policy);
        let t = assess_termination(&state, &decision, &policy, 3).unwrap();
        assert_eq!(t.category, TerminationCategory::Failure);
        assert_eq!(t.reason, "Judge failed 3 consecutive times");
        assert_eq!(t.estimated_failure_rate, 100.0);
    }
}
