//! Session data model
//!
//! A session is the durable record of one audit loop: its configuration, the
//! append-only iteration history, and the completion state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::completion::{CompletionReason, TerminationDecision};
use crate::error::{AuditError, AuditResult};
use crate::review::Review;
use crate::stagnation::StagnationVerdict;

/// What part of the workspace the audit covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditScope {
    #[default]
    Diff,
    Paths,
    Workspace,
}

impl std::fmt::Display for AuditScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diff => write!(f, "diff"),
            Self::Paths => write!(f, "paths"),
            Self::Workspace => write!(f, "workspace"),
        }
    }
}

/// Per-session configuration, fixed at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// What the candidate is supposed to accomplish
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub scope: AuditScope,
    /// Required iff `scope == Paths`
    #[serde(default)]
    pub paths: Vec<String>,
    /// Judge acceptance threshold (0-100)
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Judge-internal revision cycles per invocation
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Candidates the judge may generate per cycle
    #[serde(default = "default_candidates")]
    pub candidates: u32,
    /// Judge identifiers to consult
    #[serde(default)]
    pub judges: Vec<String>,
    #[serde(default)]
    pub apply_fixes: bool,
}

fn default_threshold() -> f64 {
    85.0
}

fn default_max_cycles() -> u32 {
    1
}

fn default_candidates() -> u32 {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            scope: AuditScope::Diff,
            paths: Vec::new(),
            threshold: default_threshold(),
            max_cycles: default_max_cycles(),
            candidates: default_candidates(),
            judges: Vec::new(),
            apply_fixes: false,
        }
    }
}

impl SessionConfig {
    pub fn for_task(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AuditResult<()> {
        if !(0.0..=100.0).contains(&self.threshold) || !self.threshold.is_finite() {
            return Err(AuditError::config(format!(
                "threshold {} outside 0-100",
                self.threshold
            )));
        }
        match self.scope {
            AuditScope::Paths if self.paths.is_empty() => {
                return Err(AuditError::config("scope=paths requires at least one path"));
            }
            AuditScope::Diff | AuditScope::Workspace if !self.paths.is_empty() => {
                return Err(AuditError::config(format!(
                    "paths are only allowed with scope=paths (scope is {})",
                    self.scope
                )));
            }
            _ => {}
        }
        if self.max_cycles == 0 {
            return Err(AuditError::config("max_cycles must be >= 1"));
        }
        if self.candidates == 0 {
            return Err(AuditError::config("candidates must be >= 1"));
        }
        Ok(())
    }

    /// Validated copy, or defaults (keeping the task text) when invalid
    pub fn sanitized(self) -> Self {
        match self.validate() {
            Ok(()) => self,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid session config, falling back to defaults");
                Self::for_task(self.task)
            }
        }
    }
}

/// One recorded loop. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-indexed loop number
    pub loop_index: u32,
    /// Candidate snapshot judged in this loop
    pub candidate: String,
    pub review: Review,
    pub timestamp: DateTime<Utc>,
}

/// Durable state of one audit session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// External context id for judge continuity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub config: SessionConfig,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    pub current_loop: u32,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stagnation: Option<StagnationVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review: Option<Review>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, config: SessionConfig, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            context_id: None,
            config,
            iterations: Vec::new(),
            current_loop: 0,
            is_complete: false,
            completion_reason: None,
            last_stagnation: None,
            last_review: None,
            termination: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next loop index the session will accept
    pub fn next_loop(&self) -> u32 {
        self.current_loop + 1
    }

    pub fn has_loop(&self, loop_index: u32) -> bool {
        self.iterations.iter().any(|r| r.loop_index == loop_index)
    }

    pub fn iteration(&self, loop_index: u32) -> Option<&IterationRecord> {
        self.iterations.iter().find(|r| r.loop_index == loop_index)
    }

    /// Overall scores in loop order
    pub fn score_progression(&self) -> Vec<f64> {
        self.iterations.iter().map(|r| r.review.score).collect()
    }

    /// Highest-scoring loop; the earliest wins ties
    pub fn best_iteration(&self) -> Option<&IterationRecord> {
        self.iterations.iter().fold(None, |best, r| match best {
            Some(b) if b.review.score >= r.review.score => Some(b),
            _ => Some(r),
        })
    }

    /// Mean of consecutive score deltas, `None` with fewer than two loops
    pub fn average_improvement(&self) -> Option<f64> {
        let scores = self.score_progression();
        if scores.len() < 2 {
            return None;
        }
        let total: f64 = scores.windows(2).map(|w| w[1] - w[0]).sum();
        Some(total / (scores.len() - 1) as f64)
    }

    /// Most recent score delta, `None` with fewer than two loops
    pub fn last_delta(&self) -> Option<f64> {
        let scores = self.score_progression();
        match scores.as_slice() {
            [.., prev, last] => Some(last - prev),
            _ => None,
        }
    }

    /// Trailing run of synthetic (judge-failure) reviews
    pub fn consecutive_synthetic_reviews(&self) -> u32 {
        self.iterations
            .iter()
            .rev()
            .take_while(|r| r.review.synthetic)
            .count() as u32
    }

    /// Structural invariants a loaded record must satisfy
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.current_loop as usize != self.iterations.len() {
            return Err(format!(
                "current_loop {} does not match {} recorded iterations",
                self.current_loop,
                self.iterations.len()
            ));
        }
        if self.is_complete != self.completion_reason.is_some() {
            return Err("is_complete disagrees with completion_reason".to_string());
        }
        if let Some(reason) = self.completion_reason {
            if !reason.is_terminal() {
                return Err(format!("non-terminal completion reason {}", reason));
            }
        }
        for (i, record) in self.iterations.iter().enumerate() {
            if record.loop_index as usize != i + 1 {
                return Err(format!(
                    "iteration {} recorded with loop index {}",
                    i + 1,
                    record.loop_index
                ));
            }
        }
        Ok(())
    }

    /// Get a summary for logging
    pub fn summary(&self) -> String {
        format!(
            "session={} loop={} last_score={} complete={} reason={}",
            self.session_id,
            self.current_loop,
            self.last_review
                .as_ref()
                .map(|r| format!("{:.1}", r.score))
                .unwrap_or_else(|| "-".to_string()),
            self.is_complete,
            self.completion_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "in_progress".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::Verdict;

    fn state_with_scores(scores: &[f64]) -> SessionState {
        let now = Utc::now();
        let mut state = SessionState::new("s", SessionConfig::default(), now);
        for (i, score) in scores.iter().enumerate() {
            state.iterations.push(IterationRecord {
                loop_index: i as u32 + 1,
                candidate: format!("v{}", i),
                review: Review::new(*score, Verdict::Revise, ""),
                timestamp: now,
            });
        }
        state.current_loop = scores.len() as u32;
        state
    }

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());

        let paths_without_list = SessionConfig {
            scope: AuditScope::Paths,
            ..Default::default()
        };
        assert!(paths_without_list.validate().is_err());

        let list_without_paths_scope = SessionConfig {
            paths: vec!["src/lib.rs".into()],
            ..Default::default()
        };
        assert!(list_without_paths_scope.validate().is_err());

        let bad_threshold = SessionConfig {
            threshold: 120.0,
            ..Default::default()
        };
        assert!(bad_threshold.validate().is_err());
    }

    #[test]
    fn test_sanitized_keeps_task() {
        let cfg = SessionConfig {
            task: "harden parser".into(),
            threshold: -1.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.task, "harden parser");
        assert_eq!(cfg.threshold, 85.0);
    }

    #[test]
    fn test_score_helpers() {
        let state = state_with_scores(&[60.0, 70.0, 65.0, 80.0]);
        assert_eq!(state.score_progression(), vec![60.0, 70.0, 65.0, 80.0]);
        assert_eq!(state.last_delta(), Some(15.0));
        assert!((state.average_improvement().unwrap() - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(state.best_iteration().unwrap().loop_index, 4);
        assert!(state.check_invariants().is_ok());

        let single = state_with_scores(&[50.0]);
        assert_eq!(single.average_improvement(), None);
        assert_eq!(single.last_delta(), None);
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut state = state_with_scores(&[60.0, 70.0]);
        state.current_loop = 3;
        assert!(state.check_invariants().is_err());

        let mut state = state_with_scores(&[60.0]);
        state.is_complete = true;
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_consecutive_synthetic_reviews() {
        let mut state = state_with_scores(&[60.0]);
        for i in 2..=3 {
            state.iterations.push(IterationRecord {
                loop_index: i,
                candidate: String::new(),
                review: Review::fallback("timeout"),
                timestamp: Utc::now(),
            });
        }
        state.current_loop = 3;
        assert_eq!(state.consecutive_synthetic_reviews(), 2);
    }
}
