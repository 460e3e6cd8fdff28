//! Audit controller
//!
//! One `submit` is one loop: lock the session, judge the candidate, decide
//! whether the loop goes on, persist once, and render the reply.
//!
//! ```text
//! lock → open → plan depth → judge ─┬→ stage → stagnation → completion
//!                                   │        → termination → persist → reply
//!                                   └→ (cancelled) reply, nothing persisted
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assessors::{AssessmentContext, AssessorPanel};
use crate::clock::{Clock, SystemClock};
use crate::completion::{assess_termination, CompletionDecision, CompletionEvaluator};
use crate::complexity::{AuditDepthPlan, ComplexityProfile, DepthController, Language};
use crate::config::ControllerConfig;
use crate::error::{AuditError, AuditResult};
use crate::judge::{Judge, JudgeRequest};
use crate::response::{EnhancedReply, ReplyInputs, ResponseBuilder, StandardReply};
use crate::review::Review;
use crate::session::{
    record_outcome, stage_iteration, LoopOutcome, SessionConfig, SessionManager, SessionState,
    SharedSessionStore, Staged,
};
use crate::stagnation::{SimilarityMetric, StagnationDetector};

/// One candidate submitted for judging
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub session_id: String,
    /// 1-based; `None` means the session's next loop
    pub loop_index: Option<u32>,
    pub candidate: String,
    /// Used only when the session is created
    pub config: SessionConfig,
    pub context_id: Option<String>,
    /// Falls back to the first configured path's extension
    pub language: Option<Language>,
}

impl Submission {
    pub fn new(session_id: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    pub fn with_loop(mut self, loop_index: u32) -> Self {
        self.loop_index = Some(loop_index);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }
}

pub struct AuditController {
    sessions: SessionManager,
    judge: Arc<dyn Judge>,
    config: ControllerConfig,
    evaluator: CompletionEvaluator,
    detector: StagnationDetector,
    depth: DepthController,
    builder: ResponseBuilder,
    assessors: AssessorPanel,
}

impl AuditController {
    pub fn new(store: SharedSessionStore, judge: Arc<dyn Judge>, config: ControllerConfig) -> Self {
        Self::with_clock(store, judge, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: SharedSessionStore,
        judge: Arc<dyn Judge>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            sessions: SessionManager::with_clock(store, clock),
            judge,
            evaluator: CompletionEvaluator::with_policy(config.completion.clone()),
            detector: StagnationDetector::with_config(config.stagnation.clone()),
            depth: DepthController::with_config(config.depth.clone()),
            builder: ResponseBuilder::new()
                .with_config(config.feedback.clone())
                .with_hard_cap(config.completion.hard_cap),
            assessors: AssessorPanel::new(),
            config,
        }
    }

    /// Assessors whose scores are merged into each judge review
    pub fn with_assessors(mut self, assessors: AssessorPanel) -> Self {
        self.assessors = assessors;
        self
    }

    pub fn with_similarity_metric(mut self, metric: Arc<dyn SimilarityMetric>) -> Self {
        self.detector = self.detector.with_metric(metric);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Complexity profile and depth plan for a piece of source
    pub fn analyze(&self, source: &str, language: Language) -> (ComplexityProfile, AuditDepthPlan) {
        let profile = self.depth.analyze(source, language);
        let plan = self.depth.plan(&profile);
        (profile, plan)
    }

    pub async fn submit(&self, submission: Submission) -> AuditResult<EnhancedReply> {
        self.submit_with_cancel(submission, CancellationToken::new())
            .await
    }

    /// Run one loop. If `cancel` fires while the judge is running, nothing
    /// is recorded and the reply reports the session as still in progress.
    pub async fn submit_with_cancel(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> AuditResult<EnhancedReply> {
        let Submission {
            session_id,
            loop_index,
            candidate,
            config,
            context_id,
            language,
        } = submission;

        let lease = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AuditError::Cancelled {
                    message: format!("gave up waiting for session {}", session_id),
                });
            }
            lease = self.sessions.lock(&session_id) => lease?,
        };
        let (state, origin) = self.sessions.open(&lease, config, context_id).await?;
        let loop_index = loop_index.unwrap_or_else(|| state.next_loop());

        if loop_index == 0 {
            return Err(AuditError::validation("loop index is 1-based"));
        }
        if state.has_loop(loop_index) {
            info!(session_id = %session_id, loop_index, "Duplicate iteration ignored");
            return Ok(self.reply_for_state(&state, loop_index));
        }
        if state.is_complete {
            warn!(
                session_id = %session_id,
                loop_index,
                reason = ?state.completion_reason,
                "Submission to completed session rejected"
            );
            return Ok(self.reply_for_state(&state, state.current_loop));
        }
        if loop_index != state.next_loop() {
            return Err(AuditError::OutOfSequence {
                session_id,
                expected: state.next_loop(),
                got: loop_index,
            });
        }

        let language = language
            .or_else(|| {
                state
                    .config
                    .paths
                    .first()
                    .map(|p| Language::from_path(Path::new(p)))
            })
            .unwrap_or_default();
        let (_, plan) = self.analyze(&candidate, language);
        info!(
            session_id = %session_id,
            loop_index,
            origin = ?origin,
            depth = %plan.depth,
            timeout_secs = plan.timeout_secs,
            "Starting loop"
        );

        let request = JudgeRequest::for_session(&state, loop_index, candidate.as_str(), &plan);
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(session_id = %session_id, loop_index, "Judge call cancelled; nothing recorded");
                return Ok(self.cancelled_reply(&state, loop_index));
            }
            result = self.judge.review(&request, plan.timeout()) => result,
        };

        let mut review = match result {
            Ok(review) => review,
            Err(e) if e.is_recoverable() => {
                warn!(
                    session_id = %session_id,
                    loop_index,
                    judge = self.judge.name(),
                    error = %e,
                    "Judge failed, recording fallback review"
                );
                Review::fallback(e.to_string())
            }
            Err(e) => return Err(e.into()),
        };

        if !self.assessors.is_empty() && !review.synthetic {
            let context = AssessmentContext {
                language,
                task: state.config.task.clone(),
                loop_index,
            };
            self.assessors
                .run(&candidate, &context)
                .await
                .merge_into(&mut review);
        }

        let now = self.sessions.clock().now();
        let mut next = match stage_iteration(&state, loop_index, candidate, review, now)? {
            Staged::Next(next) => next,
            Staged::Duplicate => return Ok(self.reply_for_state(&state, loop_index)),
        };

        let stagnation = self.detector.detect(&next.iterations);
        if stagnation.stagnant {
            warn!(
                session_id = %session_id,
                loop_index,
                similarity = stagnation.similarity_score,
                patterns = ?stagnation.patterns.names(),
                "Stagnation detected"
            );
        }
        let score = next.last_review.as_ref().map(|r| r.score).unwrap_or(0.0);
        let decision = self.evaluator.evaluate(score, loop_index, Some(&stagnation));

        // termination reads the recorded stagnation verdict
        record_outcome(
            &mut next,
            LoopOutcome {
                stagnation: Some(stagnation.clone()),
                ..Default::default()
            },
        );
        let termination = assess_termination(
            &next,
            &decision,
            &self.config.completion,
            self.config.judge.max_consecutive_failures,
        );
        record_outcome(
            &mut next,
            LoopOutcome {
                stagnation: None,
                completion: Some(decision.reason),
                termination: termination.clone(),
            },
        );

        self.sessions.persist(&lease, &next).await?;
        info!(
            session_id = %session_id,
            loop_index,
            score,
            reason = %decision.reason,
            complete = decision.complete,
            "Iteration recorded"
        );
        if let Some(t) = &termination {
            warn!(session_id = %session_id, category = %t.category, reason = %t.reason, "Termination advised");
        }

        let standard = StandardReply {
            session_id,
            loop_index,
            next_iteration_needed: decision.continue_expected && termination.is_none(),
            history_length: next.iterations.len(),
        };
        Ok(self.builder.build(
            standard,
            ReplyInputs {
                review: next.last_review.as_ref(),
                completion: Some(&decision),
                session: Some(&next),
                stagnation: Some(&stagnation),
                termination: termination.as_ref(),
            },
        ))
    }

    /// Reply for the persisted state, without mutating it
    pub async fn status(&self, session_id: &str) -> AuditResult<EnhancedReply> {
        let state = self
            .sessions
            .load(session_id)
            .await?
            .ok_or_else(|| AuditError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(self.reply_for_state(&state, state.current_loop))
    }

    /// Stop a session manually
    pub async fn terminate(&self, session_id: &str, reason: &str) -> AuditResult<EnhancedReply> {
        let lease = self.sessions.lock(session_id).await?;
        let state = self
            .sessions
            .load_locked(&lease)
            .await?
            .ok_or_else(|| AuditError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if state.is_complete {
            return Ok(self.reply_for_state(&state, state.current_loop));
        }

        let decision = CompletionDecision::manual(&state, reason, &self.config.completion);
        let termination = assess_termination(
            &state,
            &decision,
            &self.config.completion,
            self.config.judge.max_consecutive_failures,
        );
        let state = self
            .sessions
            .complete_locked(&lease, state, decision.reason, termination)
            .await?;

        let standard = StandardReply {
            session_id: state.session_id.clone(),
            loop_index: state.current_loop,
            next_iteration_needed: false,
            history_length: state.iterations.len(),
        };
        Ok(self.builder.build(
            standard,
            ReplyInputs {
                review: state.last_review.as_ref(),
                completion: Some(&decision),
                session: Some(&state),
                stagnation: state.last_stagnation.as_ref(),
                termination: state.termination.as_ref(),
            },
        ))
    }

    fn reply_for_state(&self, state: &SessionState, loop_index: u32) -> EnhancedReply {
        let decision = CompletionDecision::from_state(state, &self.config.completion);
        let review = state
            .iteration(loop_index)
            .map(|r| &r.review)
            .or(state.last_review.as_ref());
        // stagnation and termination describe the latest loop only
        let latest = loop_index == state.current_loop;
        let standard = StandardReply {
            session_id: state.session_id.clone(),
            loop_index,
            next_iteration_needed: !state.is_complete && state.termination.is_none(),
            history_length: state.iterations.len(),
        };
        self.builder.build(
            standard,
            ReplyInputs {
                review,
                completion: Some(&decision),
                session: Some(state),
                stagnation: state.last_stagnation.as_ref().filter(|_| latest),
                termination: state.termination.as_ref().filter(|_| latest),
            },
        )
    }

    fn cancelled_reply(&self, state: &SessionState, loop_index: u32) -> EnhancedReply {
        let mut decision = CompletionDecision::from_state(state, &self.config.completion);
        decision.message = format!("Judge call cancelled; loop {} was not recorded", loop_index);
        let standard = StandardReply {
            session_id: state.session_id.clone(),
            loop_index: state.current_loop,
            next_iteration_needed: true,
            history_length: state.iterations.len(),
        };
        self.builder.build(
            standard,
            ReplyInputs {
                completion: Some(&decision),
                session: Some(state),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionReason;
    use crate::judge::{JudgeError, ScriptedJudge};
    use crate::review::Verdict;
    use crate::session::{MemorySessionStore, SessionStore};
    use std::time::Duration;

    fn controller(judge: Arc<ScriptedJudge>) -> (AuditController, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        (
            AuditController::new(store.clone(), judge, ControllerConfig::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_first_submission_creates_session() {
        let judge = Arc::new(ScriptedJudge::with_scores(&[60.0]));
        let (ctl, store) = controller(judge.clone());
        let reply = ctl
            .submit(Submission::new("s1", "fn main() {}").with_config(SessionConfig::for_task("t")))
            .await
            .unwrap();
        assert_eq!(reply.standard.loop_index, 1);
        assert!(reply.standard.next_iteration_needed);
        assert_eq!(reply.completion_status.unwrap().reason, CompletionReason::InProgress);
        assert_eq!(reply.session_metadata.unwrap().score_progression, vec![60.0]);

        let stored = store.load("s1").await.unwrap().unwrap();
        assert_eq!(stored.current_loop, 1);
        assert_eq!(stored.config.task, "t");
        assert_eq!(judge.requests()[0].task, "t");
    }

    #[tokio::test]
    async fn test_acceptance_completes_session() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_review(Review::new(97.0, Verdict::Pass, "great"));
        let (ctl, store) = controller(judge);
        let reply = ctl.submit(Submission::new("s1", "x")).await.unwrap();
        let status = reply.completion_status.unwrap();
        assert!(status.complete);
        assert_eq!(status.reason, CompletionReason::Score95At10);
        assert!(!reply.standard.next_iteration_needed);
        assert!(reply.termination_info.is_none());

        let stored = store.load("s1").await.unwrap().unwrap();
        assert!(stored.is_complete);
    }

    #[tokio::test]
    async fn test_duplicate_loop_does_not_call_judge() {
        let judge = Arc::new(ScriptedJudge::with_scores(&[50.0, 70.0]));
        let (ctl, store) = controller(judge.clone());
        ctl.submit(Submission::new("s1", "v1").with_loop(1)).await.unwrap();
        let again = ctl.submit(Submission::new("s1", "v1").with_loop(1)).await.unwrap();
        assert_eq!(judge.call_count(), 1);
        assert_eq!(again.standard.history_length, 1);
        assert_eq!(again.feedback.unwrap().score, 50.0);
        assert_eq!(store.load("s1").await.unwrap().unwrap().iterations.len(), 1);
    }

    #[tokio::test]
    async fn test_recoverable_judge_failure_records_fallback() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_error(JudgeError::Timeout { secs: 60 });
        let (ctl, store) = controller(judge);
        let reply = ctl.submit(Submission::new("s1", "x")).await.unwrap();
        let fb = reply.feedback.unwrap();
        assert!(fb.synthetic);
        assert_eq!(fb.verdict, Verdict::Reject);
        assert!(reply.standard.next_iteration_needed);
        let stored = store.load("s1").await.unwrap().unwrap();
        assert!(stored.iterations[0].review.synthetic);
        assert!(!stored.is_complete);
    }

    #[tokio::test]
    async fn test_missing_judge_is_fatal_and_records_nothing() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_error(JudgeError::ExecutableMissing {
            program: "audit-judge".to_string(),
        });
        let (ctl, store) = controller(judge);
        let err = ctl.submit(Submission::new("s1", "x")).await.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_judge_failures_advise_termination() {
        let judge = Arc::new(ScriptedJudge::new());
        for _ in 0..3 {
            judge.push_error(JudgeError::Malformed {
                message: "garbage".to_string(),
            });
        }
        let (ctl, _) = controller(judge);
        for i in 1..=2 {
            let reply = ctl.submit(Submission::new("s1", format!("v{i}"))).await.unwrap();
            assert!(reply.termination_info.is_none());
        }
        let reply = ctl.submit(Submission::new("s1", "v3")).await.unwrap();
        let info = reply.termination_info.unwrap();
        assert_eq!(info.category, crate::completion::TerminationCategory::Failure);
        assert!(!reply.standard.next_iteration_needed);
    }

    #[tokio::test]
    async fn test_good_review_after_failures_clears_termination() {
        let judge = Arc::new(ScriptedJudge::new());
        for _ in 0..3 {
            judge.push_error(JudgeError::Malformed {
                message: "garbage".to_string(),
            });
        }
        judge.push_review(Review::new(70.0, Verdict::Revise, "back on track"));
        let (ctl, store) = controller(judge);
        for i in 1..=3 {
            ctl.submit(Submission::new("s1", format!("v{i}"))).await.unwrap();
        }
        assert!(store.load("s1").await.unwrap().unwrap().termination.is_some());

        let reply = ctl.submit(Submission::new("s1", "v4")).await.unwrap();
        assert!(reply.standard.next_iteration_needed);
        assert!(reply.termination_info.is_none());

        let stored = store.load("s1").await.unwrap().unwrap();
        assert!(stored.termination.is_none());
        assert!(!stored.is_complete);

        let status = ctl.status("s1").await.unwrap();
        assert!(status.standard.next_iteration_needed);
        assert!(status.termination_info.is_none());
        assert!(!status.completion_status.unwrap().complete);
    }

    #[tokio::test]
    async fn test_retry_of_older_loop_omits_latest_loop_blocks() {
        let judge = Arc::new(
            ScriptedJudge::new().with_fallback(Review::new(70.0, Verdict::Revise, "same")),
        );
        let (ctl, _) = controller(judge);
        for _ in 1..=4 {
            ctl.submit(Submission::new("s1", "fn same() {}\n")).await.unwrap();
        }
        let latest = ctl.status("s1").await.unwrap();
        assert!(latest.termination_info.is_some());
        assert!(latest.feedback.unwrap().stagnation_patterns.is_some());

        let retry = ctl
            .submit(Submission::new("s1", "fn same() {}\n").with_loop(2))
            .await
            .unwrap();
        assert_eq!(retry.standard.loop_index, 2);
        assert!(retry.termination_info.is_none());
        assert!(retry.feedback.unwrap().stagnation_patterns.is_none());
    }

    #[tokio::test]
    async fn test_cancel_records_nothing() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_delayed(Duration::from_secs(30), Review::new(90.0, Verdict::Pass, ""));
        let (ctl, store) = controller(judge);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let reply = ctl
            .submit_with_cancel(Submission::new("s1", "x"), cancel)
            .await
            .unwrap();
        let status = reply.completion_status.unwrap();
        assert_eq!(status.reason, CompletionReason::InProgress);
        assert!(status.message.contains("cancelled"));
        assert_eq!(reply.standard.history_length, 0);
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminate_and_status() {
        let judge = Arc::new(ScriptedJudge::with_scores(&[40.0]));
        let (ctl, _) = controller(judge.clone());
        ctl.submit(Submission::new("s1", "x")).await.unwrap();

        let reply = ctl.terminate("s1", "out of budget").await.unwrap();
        let info = reply.termination_info.unwrap();
        assert_eq!(info.category, crate::completion::TerminationCategory::Manual);
        assert_eq!(info.failure_rate, 60.0);

        let status = ctl.status("s1").await.unwrap();
        assert!(status.completion_status.unwrap().complete);
        assert!(!status.standard.next_iteration_needed);

        // completed sessions do not reach the judge
        ctl.submit(Submission::new("s1", "y")).await.unwrap();
        assert_eq!(judge.call_count(), 1);

        assert!(matches!(
            ctl.status("nope").await.unwrap_err(),
            AuditError::SessionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_out_of_sequence() {
        let judge = Arc::new(ScriptedJudge::with_scores(&[40.0]));
        let (ctl, _) = controller(judge);
        let err = ctl
            .submit(Submission::new("s1", "x").with_loop(3))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::OutOfSequence { expected: 1, got: 3, .. }));
    }
}
