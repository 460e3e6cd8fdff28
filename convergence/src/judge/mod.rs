//! Judge adapter: the boundary to the external scoring process
//!
//! The controller never scores candidates itself. It builds a `JudgeRequest`
//! (task, candidate, context pack, rubric, budget), hands it to a `Judge`,
//! and treats any recoverable failure as a synthetic reject review.

pub mod scripted;
pub mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::complexity::{AuditDepth, AuditDepthPlan, FocusArea};
use crate::error::{
    AuditError, AuditResult, ClassifiedError, ErrorCategory, RecoveryStrategy, Severity,
};
use crate::review::{InlineFinding, Review};
use crate::session::{AuditScope, SessionState};

pub use scripted::ScriptedJudge;
pub use subprocess::SubprocessJudge;

/// Judge invocation failures
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge executable not found: {program}")]
    ExecutableMissing { program: String },

    #[error("Judge timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Judge exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Malformed judge output: {message}")]
    Malformed { message: String },

    #[error("Judge IO error: {message}")]
    Io { message: String },
}

impl JudgeError {
    /// Only a missing executable stops the loop; everything else falls back
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ExecutableMissing { .. })
    }

    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            Self::ExecutableMissing { program } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Critical,
                false,
                RecoveryStrategy::UserIntervention,
                message,
            )
            .with_context("program", program.clone())
            .with_suggestion("Install the judge or point AUDIT_JUDGE_CMD at it"),
            Self::Timeout { secs } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Medium,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_context("timeout_secs", *secs)
            .with_suggestion("Raise depth.max_timeout_secs or reduce the candidate size"),
            Self::NonZeroExit { code, stderr } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Medium,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_context("exit_code", code.map(serde_json::Value::from).unwrap_or_default())
            .with_context("stderr", truncate(stderr, 500))
            .with_suggestion("Inspect the judge's stderr; a fallback review was recorded"),
            Self::Malformed { .. } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Medium,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_suggestion("The judge must print one JSON review object on stdout"),
            Self::Io { .. } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Medium,
                true,
                RecoveryStrategy::Retry,
                message,
            ),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "a signal".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Judge subprocess settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Consecutive fallback reviews before termination is advised
    pub max_consecutive_failures: u32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            program: "audit-judge".to_string(),
            args: Vec::new(),
            working_dir: None,
            max_consecutive_failures: 3,
        }
    }
}

impl JudgeConfig {
    pub fn validate(&self) -> AuditResult<()> {
        if self.program.trim().is_empty() {
            return Err(AuditError::config("judge.program must not be empty"));
        }
        Ok(())
    }

    /// Split a shell-style command line (whitespace separated) into program and args
    pub fn set_command(&mut self, command: &str) {
        let mut parts = command.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            self.program = program;
            self.args = parts.collect();
        }
    }
}

/// One weighted rubric dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricDimension {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub description: String,
}

/// Named, weighted dimensions the judge scores against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub dimensions: Vec<RubricDimension>,
}

impl Default for Rubric {
    fn default() -> Self {
        let dim = |name: &str, weight: f64, description: &str| RubricDimension {
            name: name.to_string(),
            weight,
            description: description.to_string(),
        };
        Self {
            dimensions: vec![
                dim("correctness", 0.30, "Does the change do what the task asks, including edge cases"),
                dim("security", 0.20, "Injection, unsafe input handling, secrets, auth"),
                dim("performance", 0.15, "Algorithmic cost, allocation, blocking on hot paths"),
                dim("maintainability", 0.20, "Structure, naming, complexity, testability"),
                dim("documentation", 0.15, "Comments and docs where behaviour is non-obvious"),
            ],
        }
    }
}

impl Rubric {
    /// Boost the plan's focus areas (first area most) and renormalise to 1
    pub fn emphasise(&self, plan: &AuditDepthPlan) -> Rubric {
        let boosts = [1.5, 1.3, 1.15];
        let mut dimensions = self.dimensions.clone();
        for (area, boost) in plan.focus_areas.iter().zip(boosts) {
            let key = match area {
                FocusArea::Testing => "correctness",
                other => other.as_str(),
            };
            if let Some(dim) = dimensions.iter_mut().find(|d| d.name == key) {
                dim.weight *= boost;
            }
        }
        let mut rubric = Rubric { dimensions };
        rubric.normalize();
        rubric
    }

    /// Scale weights to sum to 1; equal weights when all are zero
    pub fn normalize(&mut self) {
        let total: f64 = self.dimensions.iter().map(|d| d.weight.max(0.0)).sum();
        let n = self.dimensions.len() as f64;
        for dim in &mut self.dimensions {
            dim.weight = if total > 0.0 {
                dim.weight.max(0.0) / total
            } else {
                1.0 / n
            };
        }
    }

    pub fn weight_of(&self, name: &str) -> Option<f64> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.weight)
    }
}

/// Revision budget the judge may spend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JudgeBudget {
    pub max_cycles: u32,
    pub candidates: u32,
    pub threshold: f64,
}

/// What the judge needs beyond the candidate itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    pub session_id: String,
    pub loop_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub scope: AuditScope,
    #[serde(default)]
    pub paths: Vec<String>,
    pub depth: AuditDepth,
    #[serde(default)]
    pub focus_areas: Vec<FocusArea>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<f64>,
    /// Findings from the previous loop, so the judge can check they were fixed
    #[serde(default)]
    pub previous_findings: Vec<InlineFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub task: String,
    pub candidate: String,
    pub context: ContextPack,
    pub rubric: Rubric,
    pub budget: JudgeBudget,
    #[serde(default)]
    pub judges: Vec<String>,
    #[serde(default)]
    pub apply_fixes: bool,
}

impl JudgeRequest {
    /// Request for the next loop of `state`
    pub fn for_session(
        state: &SessionState,
        loop_index: u32,
        candidate: impl Into<String>,
        plan: &AuditDepthPlan,
    ) -> Self {
        let config = &state.config;
        Self {
            task: config.task.clone(),
            candidate: candidate.into(),
            context: ContextPack {
                session_id: state.session_id.clone(),
                loop_index,
                context_id: state.context_id.clone(),
                scope: config.scope,
                paths: config.paths.clone(),
                depth: plan.depth,
                focus_areas: plan.focus_areas.clone(),
                previous_score: state.last_review.as_ref().map(|r| r.score),
                previous_findings: state
                    .last_review
                    .as_ref()
                    .map(|r| r.findings.clone())
                    .unwrap_or_default(),
            },
            rubric: Rubric::default().emphasise(plan),
            budget: JudgeBudget {
                max_cycles: config.max_cycles,
                candidates: config.candidates,
                threshold: config.threshold,
            },
            judges: config.judges.clone(),
            apply_fixes: config.apply_fixes,
        }
    }
}

/// External scorer
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    /// Score one candidate; must give up after `timeout`
    async fn review(&self, request: &JudgeRequest, timeout: Duration) -> Result<Review, JudgeError>;
}

/// Locate the outermost `{ ... }` in judge output and parse it as a review
pub fn parse_review(output: &str) -> Result<Review, JudgeError> {
    let start = output.find('{');
    let end = output.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &output[s..=e],
        _ => {
            return Err(JudgeError::Malformed {
                message: format!("no JSON object in output ({} bytes)", output.len()),
            })
        }
    };
    serde_json::from_str::<Review>(json)
        .map(Review::normalized)
        .map_err(|e| JudgeError::Malformed {
            message: e.to_string(),
        })
}
