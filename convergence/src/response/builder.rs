//! Turns judge output and controller decisions into an `EnhancedReply`
//!
//! Every block is optional: a block whose input is missing is omitted, never
//! filled with placeholder values.

use crate::classify::{classify_comment, is_critical_comment, Priority};
use crate::completion::{CompletionDecision, TerminationCategory, TerminationDecision};
use crate::review::Review;
use crate::session::SessionState;
use crate::stagnation::StagnationVerdict;

use super::types::{
    CompletionStatus, CriticalIssue, EnhancedReply, Feedback, FeedbackConfig, Improvement,
    LoopInfo, NextStep, ProgressAssessment, ProgressTrend, SessionMetadata, StandardReply,
    TerminationInfo,
};

const HIGH_SCORE: f64 = 90.0;
const LOW_SCORE: f64 = 20.0;

/// Optional inputs to [`ResponseBuilder::build`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyInputs<'a> {
    pub review: Option<&'a Review>,
    pub completion: Option<&'a CompletionDecision>,
    pub session: Option<&'a SessionState>,
    pub stagnation: Option<&'a StagnationVerdict>,
    pub termination: Option<&'a TerminationDecision>,
}

#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    config: FeedbackConfig,
    hard_cap: u32,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self {
            config: FeedbackConfig::default(),
            hard_cap: 25,
        }
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: FeedbackConfig) -> Self {
        self.config = config;
        self
    }

    /// Loop cap used for progress and loops-remaining
    pub fn with_hard_cap(mut self, hard_cap: u32) -> Self {
        self.hard_cap = hard_cap.max(1);
        self
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    pub fn build(&self, standard: StandardReply, inputs: ReplyInputs<'_>) -> EnhancedReply {
        let ReplyInputs {
            review,
            completion,
            session,
            stagnation,
            termination,
        } = inputs;

        EnhancedReply {
            standard,
            feedback: review.map(|r| self.feedback(r, session, stagnation, termination)),
            completion_status: completion.map(|c| self.completion_status(c)),
            loop_info: session.map(|s| self.loop_info(s)),
            termination_info: termination.map(termination_info),
            session_metadata: session.map(session_metadata),
        }
    }

    fn feedback(
        &self,
        review: &Review,
        session: Option<&SessionState>,
        stagnation: Option<&StagnationVerdict>,
        termination: Option<&TerminationDecision>,
    ) -> Feedback {
        let improvements = self.improvements(review);
        let critical_issues = self.critical_issues(review);
        let stagnant = stagnation.filter(|v| v.stagnant);
        let next_steps = self.next_steps(review, &improvements, stagnant, termination);
        let progress = progress(review, session, stagnant, critical_issues.len());

        Feedback {
            score: review.score,
            verdict: review.verdict,
            summary: review.summary.clone(),
            synthetic: review.synthetic,
            improvements,
            critical_issues,
            next_steps,
            progress,
            stagnation_patterns: stagnant.map(|v| v.patterns),
        }
    }

    /// One entry per actionable finding, most urgent first
    fn improvements(&self, review: &Review) -> Vec<Improvement> {
        let mut out: Vec<Improvement> = review
            .findings
            .iter()
            .filter(|f| f.is_actionable())
            .map(|f| {
                let category = classify_comment(&f.comment);
                Improvement {
                    category,
                    priority: category.priority(),
                    location: location(&f.path, f.line),
                    description: f.comment.trim().to_string(),
                }
            })
            .collect();
        // stable: equal priorities keep judge order
        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out.truncate(self.config.max_improvements);
        out
    }

    fn critical_issues(&self, review: &Review) -> Vec<CriticalIssue> {
        review
            .findings
            .iter()
            .filter(|f| f.is_actionable() && is_critical_comment(&f.comment))
            .take(self.config.max_critical_issues)
            .map(|f| CriticalIssue {
                category: classify_comment(&f.comment),
                location: location(&f.path, f.line),
                description: f.comment.trim().to_string(),
            })
            .collect()
    }

    fn next_steps(
        &self,
        review: &Review,
        improvements: &[Improvement],
        stagnant: Option<&StagnationVerdict>,
        termination: Option<&TerminationDecision>,
    ) -> Vec<NextStep> {
        let mut steps: Vec<(Priority, String)> = Vec::new();

        if let Some(verdict) = stagnant {
            steps.push((
                Priority::Critical,
                format!(
                    "Stagnation detected (similarity {:.2}): {}",
                    verdict.similarity_score, verdict.recommendation
                ),
            ));
            steps.extend(
                verdict
                    .alternative_suggestions
                    .iter()
                    .map(|s| (Priority::High, s.clone())),
            );
        } else {
            steps.extend(improvements.iter().map(|i| {
                (
                    i.priority,
                    format!("Fix {} issue at {}: {}", i.category, i.location, i.description),
                )
            }));
            if improvements.is_empty() && review.verdict != crate::review::Verdict::Pass {
                let action = if review.summary.trim().is_empty() {
                    "Revise the candidate and resubmit".to_string()
                } else {
                    format!("Revise the candidate: {}", review.summary.trim())
                };
                steps.push((Priority::Medium, action));
            }
            if let Some(t) = termination {
                steps.push((Priority::Medium, t.final_assessment.clone()));
            }
        }

        steps
            .into_iter()
            .take(self.config.max_next_steps)
            .enumerate()
            .map(|(i, (priority, action))| NextStep {
                step: i as u32 + 1,
                priority,
                action,
            })
            .collect()
    }

    fn completion_status(&self, decision: &CompletionDecision) -> CompletionStatus {
        let progress = if decision.complete {
            1.0
        } else {
            (decision.current_loop as f64 / self.hard_cap as f64).min(1.0)
        };
        CompletionStatus {
            complete: decision.complete,
            reason: decision.reason,
            message: decision.message.clone(),
            current_loop: decision.current_loop,
            score: decision.score,
            required_score: decision.required_score,
            progress,
            continue_expected: decision.continue_expected,
        }
    }

    fn loop_info(&self, session: &SessionState) -> LoopInfo {
        LoopInfo {
            current_loop: session.current_loop,
            hard_cap: self.hard_cap,
            loops_remaining: if session.is_complete {
                0
            } else {
                self.hard_cap.saturating_sub(session.current_loop)
            },
            is_complete: session.is_complete,
        }
    }
}

fn location(path: &str, line: Option<u32>) -> String {
    match line {
        Some(line) => format!("{}:{}", path.trim(), line),
        None => path.trim().to_string(),
    }
}

fn progress(
    review: &Review,
    session: Option<&SessionState>,
    stagnant: Option<&StagnationVerdict>,
    critical_count: usize,
) -> ProgressAssessment {
    let last_delta = session.and_then(|s| s.last_delta());
    let trend = if stagnant.is_some() {
        ProgressTrend::Stagnant
    } else {
        match last_delta {
            Some(d) if d > 0.0 => ProgressTrend::Improving,
            Some(d) if d < 0.0 => ProgressTrend::Declining,
            _ => ProgressTrend::Flat,
        }
    };

    let mut factors = Vec::new();
    if review.score >= HIGH_SCORE {
        factors.push("High audit score achieved".to_string());
    } else if review.score < LOW_SCORE {
        factors.push("Low audit score indicates fundamental issues".to_string());
    }
    if review.synthetic {
        factors.push("Judge review unavailable; score is a fallback".to_string());
    }
    if critical_count > 0 {
        factors.push(format!("{} critical issue(s) outstanding", critical_count));
    }
    match last_delta {
        Some(d) => factors.push(format!("Score changed by {:+.1} since the previous loop", d)),
        None if session.is_some() => {
            factors.push("Not enough history to establish a trend".to_string())
        }
        None => {}
    }
    if let Some(v) = stagnant {
        if !v.patterns.names().is_empty() {
            factors.push(format!("Stagnation patterns: {}", v.patterns.names().join(", ")));
        }
    }

    let recommendations = match trend {
        ProgressTrend::Stagnant => vec![
            "Change approach instead of polishing the current candidate".to_string(),
            "Restart from the best-scoring snapshot if recent loops regressed".to_string(),
        ],
        ProgressTrend::Improving => vec![
            "Keep the current approach and work through remaining findings by priority"
                .to_string(),
        ],
        ProgressTrend::Declining => vec![
            "Review what changed in the last loop and consider reverting it".to_string(),
            "Fix one finding at a time to see which change hurts the score".to_string(),
        ],
        ProgressTrend::Flat => vec!["Target the highest-priority finding directly".to_string()],
    };

    ProgressAssessment {
        trend,
        last_delta,
        factors,
        recommendations,
    }
}

/// Category from the reason text: "maximum"/"cap" is a timeout, "stagnation"
/// is stagnation, anything else a failure
pub fn classify_termination_reason(reason: &str) -> TerminationCategory {
    let reason = reason.to_ascii_lowercase();
    if reason.contains("maximum") || reason.contains("cap") {
        TerminationCategory::Timeout
    } else if reason.contains("stagnation") {
        TerminationCategory::Stagnation
    } else {
        TerminationCategory::Failure
    }
}

fn termination_info(decision: &TerminationDecision) -> TerminationInfo {
    let category = match decision.category {
        TerminationCategory::Manual => TerminationCategory::Manual,
        _ => classify_termination_reason(&decision.reason),
    };

    let mut recommendations = vec![match category {
        TerminationCategory::Timeout => {
            "Accept the best-scoring iteration or split the task into smaller audits".to_string()
        }
        TerminationCategory::Stagnation => {
            "Restart from the best-scoring snapshot with a different approach".to_string()
        }
        TerminationCategory::Failure => {
            "Check the judge command and its stderr before resubmitting".to_string()
        }
        TerminationCategory::Manual => {
            "Start a new session if more iterations are needed".to_string()
        }
    }];
    if !decision.critical_issues.is_empty() {
        recommendations.push(format!(
            "Resolve {} critical issue(s) before shipping",
            decision.critical_issues.len()
        ));
    }
    if decision.estimated_failure_rate >= 50.0 {
        recommendations.push("Treat the current candidate as not ready for review".to_string());
    }

    TerminationInfo {
        should_terminate: decision.should_terminate,
        category,
        reason: decision.reason.clone(),
        failure_rate: decision.estimated_failure_rate,
        critical_issues: decision.critical_issues.clone(),
        final_assessment: decision.final_assessment.clone(),
        recommendations,
    }
}

fn session_metadata(session: &SessionState) -> SessionMetadata {
    let best = session.best_iteration();
    SessionMetadata {
        session_id: session.session_id.clone(),
        context_id: session.context_id.clone(),
        task: session.config.task.clone(),
        total_loops: session.current_loop,
        score_progression: session.score_progression(),
        average_improvement: session.average_improvement(),
        best_score: best.map(|r| r.review.score),
        best_loop: best.map(|r| r.loop_index),
        created_at: session.created_at,
        updated_at: session.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::IssueCategory;
    use crate::completion::{CompletionPolicy, CompletionReason};
    use crate::review::{InlineFinding, Verdict};
    use crate::session::{IterationRecord, SessionConfig};
    use chrono::Utc;

    fn standard() -> StandardReply {
        StandardReply {
            session_id: "s".to_string(),
            loop_index: 2,
            next_iteration_needed: true,
            history_length: 2,
        }
    }

    fn session(scores: &[f64]) -> SessionState {
        let now = Utc::now();
        let mut state = SessionState::new("s", SessionConfig::for_task("audit"), now);
        for (i, score) in scores.iter().enumerate() {
            let review = Review::new(*score, Verdict::Revise, "");
            state.iterations.push(IterationRecord {
                loop_index: i as u32 + 1,
                candidate: format!("v{}", i),
                review: review.clone(),
                timestamp: now,
            });
            state.last_review = Some(review);
        }
        state.current_loop = scores.len() as u32;
        state
    }

    #[test]
    fn test_bare_reply_omits_everything() {
        let reply = ResponseBuilder::new().build(standard(), ReplyInputs::default());
        assert!(reply.feedback.is_none());
        assert!(reply.completion_status.is_none());
        assert!(reply.loop_info.is_none());
        assert!(reply.termination_info.is_none());
        assert!(reply.session_metadata.is_none());

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["session_id"], "s");
        assert!(json.get("feedback").is_none());
    }

    #[test]
    fn test_sql_injection_is_critical_security() {
        let review = Review::new(70.0, Verdict::Revise, "")
            .with_finding(InlineFinding::new("src/db.rs", 42, "Possible SQL injection via format!"));
        let reply = ResponseBuilder::new().build(
            standard(),
            ReplyInputs {
                review: Some(&review),
                ..Default::default()
            },
        );
        let fb = reply.feedback.unwrap();
        assert_eq!(fb.improvements.len(), 1);
        assert_eq!(fb.improvements[0].category, IssueCategory::Security);
        assert_eq!(fb.improvements[0].priority, Priority::Critical);
        assert_eq!(fb.critical_issues.len(), 1);
        assert!(fb.critical_issues[0].description.contains("SQL injection"));
        assert_eq!(fb.critical_issues[0].location, "src/db.rs:42");
        // no session: no loop info or metadata
        assert!(reply.loop_info.is_none());
        assert!(reply.session_metadata.is_none());
    }

    #[test]
    fn test_improvements_sorted_skipped_and_capped() {
        let review = Review::new(50.0, Verdict::Revise, "")
            .with_finding(InlineFinding::new("a.rs", 1, "naming nit"))
            .with_finding(InlineFinding::new("a.rs", 2, "slow loop, allocates per call"))
            .with_finding(InlineFinding::new("", 3, "no path"))
            .with_finding(InlineFinding {
                path: "a.rs".to_string(),
                line: None,
                comment: "no line".to_string(),
            })
            .with_finding(InlineFinding::new("a.rs", 4, "  "))
            .with_finding(InlineFinding::new("a.rs", 5, "missing edge case"))
            .with_finding(InlineFinding::new("a.rs", 6, "leaks a secret to logs"));
        let builder = ResponseBuilder::new().with_config(FeedbackConfig {
            max_improvements: 3,
            ..Default::default()
        });
        let fb = builder
            .build(
                standard(),
                ReplyInputs {
                    review: Some(&review),
                    ..Default::default()
                },
            )
            .feedback
            .unwrap();
        let priorities: Vec<Priority> = fb.improvements.iter().map(|i| i.priority).collect();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium]
        );
        assert_eq!(fb.next_steps[0].step, 1);
        assert_eq!(fb.next_steps[0].priority, Priority::Critical);
    }

    #[test]
    fn test_stagnation_leads_next_steps() {
        let review = Review::new(60.0, Verdict::Revise, "")
            .with_finding(InlineFinding::new("a.rs", 1, "missing edge case"));
        let verdict = StagnationVerdict {
            stagnant: true,
            detected_at_loop: Some(4),
            similarity_score: 0.97,
            recommendation: "Stop iterating on the same change".to_string(),
            alternative_suggestions: vec!["Isolate the blocking issue".to_string()],
            ..Default::default()
        };
        let state = session(&[60.0, 60.5, 60.0, 60.0]);
        let fb = ResponseBuilder::new()
            .build(
                standard(),
                ReplyInputs {
                    review: Some(&review),
                    session: Some(&state),
                    stagnation: Some(&verdict),
                    ..Default::default()
                },
            )
            .feedback
            .unwrap();
        assert_eq!(fb.next_steps[0].priority, Priority::Critical);
        assert!(fb.next_steps[0].action.contains("Stagnation"));
        assert_eq!(fb.next_steps[1].action, "Isolate the blocking issue");
        assert_eq!(fb.progress.trend, ProgressTrend::Stagnant);
        assert!(fb.stagnation_patterns.is_some());
    }

    #[test]
    fn test_trend_and_factors() {
        let builder = ResponseBuilder::new();
        let high = Review::new(92.0, Verdict::Pass, "");
        let state = session(&[80.0, 92.0]);
        let fb = builder
            .build(
                standard(),
                ReplyInputs {
                    review: Some(&high),
                    session: Some(&state),
                    ..Default::default()
                },
            )
            .feedback
            .unwrap();
        assert_eq!(fb.progress.trend, ProgressTrend::Improving);
        assert!(fb.progress.factors.contains(&"High audit score achieved".to_string()));

        let low = Review::new(10.0, Verdict::Reject, "");
        let state = session(&[30.0, 10.0]);
        let fb = builder
            .build(
                standard(),
                ReplyInputs {
                    review: Some(&low),
                    session: Some(&state),
                    ..Default::default()
                },
            )
            .feedback
            .unwrap();
        assert_eq!(fb.progress.trend, ProgressTrend::Declining);
        assert!(fb
            .progress
            .factors
            .contains(&"Low audit score indicates fundamental issues".to_string()));

        let fb = builder
            .build(
                standard(),
                ReplyInputs {
                    review: Some(&low),
                    ..Default::default()
                },
            )
            .feedback
            .unwrap();
        assert_eq!(fb.progress.trend, ProgressTrend::Flat);
        assert!(fb.progress.last_delta.is_none());
    }

    #[test]
    fn test_completion_progress() {
        let policy = CompletionPolicy::default();
        let state = session(&[50.0, 55.0, 60.0, 62.0, 70.0]);
        let running = crate::completion::evaluate(70.0, 5, None, &policy);
        let status = ResponseBuilder::new()
            .build(
                standard(),
                ReplyInputs {
                    completion: Some(&running),
                    ..Default::default()
                },
            )
            .completion_status
            .unwrap();
        assert!((status.progress - 0.2).abs() < 1e-9);
        assert_eq!(status.required_score, Some(95.0));

        let done = CompletionDecision::manual(&state, "enough", &policy);
        let status = ResponseBuilder::new()
            .build(
                standard(),
                ReplyInputs {
                    completion: Some(&done),
                    ..Default::default()
                },
            )
            .completion_status
            .unwrap();
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.reason, CompletionReason::Manual);
    }

    #[test]
    fn test_session_blocks() {
        let state = session(&[40.0, 50.0, 70.0]);
        let reply = ResponseBuilder::new().with_hard_cap(10).build(
            standard(),
            ReplyInputs {
                session: Some(&state),
                ..Default::default()
            },
        );
        assert!(reply.feedback.is_none());
        let info = reply.loop_info.unwrap();
        assert_eq!(info.current_loop, 3);
        assert_eq!(info.hard_cap, 10);
        assert_eq!(info.loops_remaining, 7);
        let meta = reply.session_metadata.unwrap();
        assert_eq!(meta.score_progression, vec![40.0, 50.0, 70.0]);
        assert_eq!(meta.average_improvement, Some(15.0));
        assert_eq!(meta.best_loop, Some(3));
    }

    #[test]
    fn test_termination_category_from_reason() {
        assert_eq!(
            classify_termination_reason("Maximum loop cap of 25 reached"),
            TerminationCategory::Timeout
        );
        assert_eq!(
            classify_termination_reason("Stagnation detected at loop 7"),
            TerminationCategory::Stagnation
        );
        assert_eq!(
            classify_termination_reason("Judge failed 3 consecutive times"),
            TerminationCategory::Failure
        );

        let decision = TerminationDecision {
            should_terminate: true,
            reason: "Maximum loop cap of 25 reached".to_string(),
            estimated_failure_rate: 40.0,
            critical_issues: vec!["a.rs:1: token leak".to_string()],
            final_assessment: "Best score 60.0 at loop 20".to_string(),
            category: TerminationCategory::Timeout,
        };
        let info = ResponseBuilder::new()
            .build(
                standard(),
                ReplyInputs {
                    termination: Some(&decision),
                    ..Default::default()
                },
            )
            .termination_info
            .unwrap();
        assert_eq!(info.category, TerminationCategory::Timeout);
        assert_eq!(info.failure_rate, 40.0);
        assert_eq!(info.recommendations.len(), 2);
    }
}
