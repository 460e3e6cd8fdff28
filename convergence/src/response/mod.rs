//! Response Builder
//!
//! Renders the controller's decisions into the reply the host returns:
//!
//! ```text
//! Review ──────────┐
//! CompletionDecision┤
//! SessionState ─────┼─→ ResponseBuilder ─→ EnhancedReply
//! StagnationVerdict ┤
//! TerminationDecision┘
//! ```

pub mod builder;
pub mod types;

pub use builder::{classify_termination_reason, ReplyInputs, ResponseBuilder};
pub use types::{
    CompletionStatus, CriticalIssue, EnhancedReply, Feedback, FeedbackConfig, Improvement,
    LoopInfo, NextStep, ProgressAssessment, ProgressTrend, SessionMetadata, StandardReply,
    TerminationInfo,
};
