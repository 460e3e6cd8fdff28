//! Convergence control for iterative, judge-scored code audits
//!
//! A candidate is submitted, scored by an external judge, and the loop either
//! accepts it, asks for another revision, or stops. This crate decides which:
//!
//! - **Completion**: score thresholds that relax as loops accumulate, plus a
//!   hard loop cap
//! - **Stagnation**: windowed candidate similarity and qualitative patterns
//! - **Complexity**: lexical metrics that set audit depth, judge timeout, and
//!   rubric focus
//! - **Sessions**: durable, append-only history with per-session locking
//! - **Response**: prioritised feedback rendered from all of the above
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use convergence::{
//!     AuditController, ControllerConfig, FileSessionStore, SessionConfig, Submission,
//!     SubprocessJudge,
//! };
//!
//! # async fn run() -> convergence::AuditResult<()> {
//! let config = ControllerConfig::load_or_default(None);
//! let store = Arc::new(FileSessionStore::new(&config.state_dir));
//! let judge = Arc::new(SubprocessJudge::from_config(&config.judge));
//! let controller = AuditController::new(store, judge, config);
//!
//! let reply = controller
//!     .submit(Submission::new("feature-42", "fn main() {}").with_config(SessionConfig::for_task("review")))
//!     .await?;
//! println!("{}", reply.to_json());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod assessors;
pub mod classify;
pub mod clock;
pub mod completion;
pub mod complexity;
pub mod config;
pub mod controller;
pub mod error;
pub mod judge;
pub mod response;
pub mod review;
pub mod session;
pub mod stagnation;

pub use assessors::{
    Assessment, AssessmentContext, AssessorPanel, ComplexityAssessor, PanelReport,
    QualityAssessor,
};
pub use classify::{classify_comment, is_critical_comment, IssueCategory, Priority};
pub use clock::{Clock, FixedClock, SystemClock};
pub use completion::{
    assess_termination, evaluate, CompletionDecision, CompletionEvaluator, CompletionPolicy,
    CompletionReason, TerminationCategory, TerminationDecision, ThresholdBand,
};
pub use complexity::{
    analyze, plan, AuditDepth, AuditDepthPlan, ComplexityProfile, DepthConfig, DepthController,
    FocusArea, Language,
};
pub use config::ControllerConfig;
pub use controller::{AuditController, Submission};
pub use error::{
    classify_any, classify_message, AuditError, AuditResult, ClassifiedError, ErrorCategory,
    RecoveryStrategy, Severity,
};
pub use judge::{
    Judge, JudgeConfig, JudgeError, JudgeRequest, Rubric, ScriptedJudge, SubprocessJudge,
};
pub use response::{EnhancedReply, FeedbackConfig, ResponseBuilder, StandardReply};
pub use review::{InlineFinding, Review, Verdict};
pub use session::{
    FileSessionStore, MemorySessionStore, SessionConfig, SessionManager, SessionState,
    SessionStore,
};
pub use stagnation::{StagnationConfig, StagnationDetector, StagnationVerdict};
