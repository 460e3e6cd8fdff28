//! Reply blocks returned to the host after each submission

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::{IssueCategory, Priority};
use crate::completion::{CompletionReason, TerminationCategory};
use crate::review::Verdict;
use crate::stagnation::StagnationPatterns;

/// Fields every reply carries, whatever else is known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardReply {
    pub session_id: String,
    /// Loop the reply is about (0 before the first iteration)
    pub loop_index: u32,
    pub next_iteration_needed: bool,
    /// Iterations recorded for the session
    pub history_length: usize,
}

/// Caps on the feedback lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub max_improvements: usize,
    pub max_critical_issues: usize,
    pub max_next_steps: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_improvements: 10,
            max_critical_issues: 5,
            max_next_steps: 5,
        }
    }
}

/// One actionable improvement derived from an inline finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub category: IssueCategory,
    pub priority: Priority,
    /// `path:line`
    pub location: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalIssue {
    pub category: IssueCategory,
    pub location: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStep {
    /// 1-based position in the list
    pub step: u32,
    pub priority: Priority,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressTrend {
    Stagnant,
    Improving,
    Declining,
    Flat,
}

impl std::fmt::Display for ProgressTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stagnant => write!(f, "STAGNANT"),
            Self::Improving => write!(f, "IMPROVING"),
            Self::Declining => write!(f, "DECLINING"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressAssessment {
    pub trend: ProgressTrend,
    /// Score change since the previous loop, when history has two loops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delta: Option<f64>,
    pub factors: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Feedback derived from the judge review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub score: f64,
    pub verdict: Verdict,
    pub summary: String,
    /// True when the review is a local fallback after a judge failure
    #[serde(default)]
    pub synthetic: bool,
    pub improvements: Vec<Improvement>,
    pub critical_issues: Vec<CriticalIssue>,
    pub next_steps: Vec<NextStep>,
    pub progress: ProgressAssessment,
    /// Stagnation patterns that fired, when stagnation was flagged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagnation_patterns: Option<StagnationPatterns>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub complete: bool,
    pub reason: CompletionReason,
    pub message: String,
    pub current_loop: u32,
    pub score: f64,
    /// Threshold the score was evaluated against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_score: Option<f64>,
    /// `current_loop / hard_cap`, 1.0 once complete
    pub progress: f64,
    pub continue_expected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub current_loop: u32,
    pub hard_cap: u32,
    pub loops_remaining: u32,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationInfo {
    pub should_terminate: bool,
    pub category: TerminationCategory,
    pub reason: String,
    pub failure_rate: f64,
    pub critical_issues: Vec<String>,
    pub final_assessment: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub task: String,
    pub total_loops: u32,
    pub score_progression: Vec<f64>,
    /// Mean of consecutive score deltas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_improvement: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_loop: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Standard reply plus whatever blocks the available inputs support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedReply {
    #[serde(flatten)]
    pub standard: StandardReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_info: Option<LoopInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_info: Option<TerminationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_metadata: Option<SessionMetadata>,
}

impl EnhancedReply {
    pub fn bare(standard: StandardReply) -> Self {
        Self {
            standard,
            feedback: None,
            completion_status: None,
            loop_info: None,
            termination_info: None,
            session_metadata: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
