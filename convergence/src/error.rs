//! Error types and classification
//!
//! Every failure the controller can surface maps onto a small taxonomy
//! (category, severity, recoverability, recovery strategy) so hosts can decide
//! whether to keep looping or stop. Recoverable errors degrade into fallbacks;
//! only non-recoverable ones abort a submission.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::judge::JudgeError;
use crate::session::store::StoreError;

/// Result type alias for controller operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Taxonomy bucket for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid or missing configuration
    Config,
    /// Judge subprocess unavailable, timed out, or produced garbage
    Judge,
    /// Session read/write failure
    Filesystem,
    /// Corrupted or missing session record
    Session,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Judge => write!(f, "judge"),
            Self::Filesystem => write!(f, "filesystem"),
            Self::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Skip,
    Abort,
    UserIntervention,
}

/// Structured, serialisable view of an error.
///
/// ```json
/// {
///   "category": "judge",
///   "severity": "medium",
///   "recoverable": true,
///   "strategy": "fallback",
///   "message": "Judge timed out after 60s",
///   "suggestions": ["Raise depth.max_timeout_secs ..."],
///   "context": { "timeout_secs": 60 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub strategy: RecoveryStrategy,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ClassifiedError {
    pub fn new(
        category: ErrorCategory,
        severity: Severity,
        recoverable: bool,
        strategy: RecoveryStrategy,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            strategy,
            message: message.into(),
            suggestions: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Add session context (common pattern)
    pub fn with_session(self, session_id: &str, loop_index: u32) -> Self {
        self.with_context("session_id", session_id.to_string())
            .with_context("loop_index", loop_index)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| {
            format!(
                r#"{{"category":"{}","message":"{}"}}"#,
                self.category, self.message
            )
        })
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{:?}] {}", self.category, self.severity, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

/// Errors raised by the controller
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session {session_id} is complete ({reason}); no further iterations accepted")]
    SessionComplete { session_id: String, reason: String },

    /// Loop index skips ahead of the recorded history
    #[error("Loop {got} is out of sequence for session {session_id} (expected {expected})")]
    OutOfSequence {
        session_id: String,
        expected: u32,
        got: u32,
    },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },
}

impl AuditError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.classify().recoverable
    }

    /// Map this error onto the taxonomy
    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            Self::Config { .. } => ClassifiedError::new(
                ErrorCategory::Config,
                Severity::Medium,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_suggestion("Check the TOML file and AUDIT_* environment variables")
            .with_suggestion("Defaults are used until the configuration validates"),
            Self::Judge(err) => err.classify(),
            Self::Store(err) => err.classify(),
            Self::SessionNotFound { session_id } => ClassifiedError::new(
                ErrorCategory::Session,
                Severity::Low,
                true,
                RecoveryStrategy::Fallback,
                message,
            )
            .with_context("session_id", session_id.clone())
            .with_suggestion("Submit a first iteration to create the session"),
            Self::SessionComplete { session_id, reason } => ClassifiedError::new(
                ErrorCategory::Session,
                Severity::Low,
                false,
                RecoveryStrategy::Skip,
                message,
            )
            .with_context("session_id", session_id.clone())
            .with_context("reason", reason.clone())
            .with_suggestion("Start a new session id to audit further revisions"),
            Self::OutOfSequence {
                session_id,
                expected,
                got,
            } => ClassifiedError::new(
                ErrorCategory::Session,
                Severity::Medium,
                false,
                RecoveryStrategy::UserIntervention,
                message,
            )
            .with_context("session_id", session_id.clone())
            .with_context("expected", *expected)
            .with_context("got", *got)
            .with_suggestion(format!("Resubmit with loop index {}", expected)),
            Self::Validation { .. } => ClassifiedError::new(
                ErrorCategory::Config,
                Severity::Medium,
                false,
                RecoveryStrategy::UserIntervention,
                message,
            )
            .with_suggestion("Check the request parameters and try again"),
            Self::Cancelled { .. } => ClassifiedError::new(
                ErrorCategory::Judge,
                Severity::Low,
                true,
                RecoveryStrategy::Retry,
                message,
            )
            .with_suggestion("Resubmit the same loop index; nothing was recorded"),
        }
    }
}

/// Coerce an unclassified error message into the taxonomy.
///
/// Executable-not-found text maps to `judge` (critical), permission and
/// missing-file text to `filesystem`. Anything else lands in the most
/// conservative bucket: non-recoverable `filesystem`.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();

    let judge_missing = [
        "command not found",
        "executable not found",
        "executable file not found",
        "no such executable",
        "not recognized as an internal or external command",
    ];
    if judge_missing.iter().any(|p| lower.contains(p)) {
        return ClassifiedError::new(
            ErrorCategory::Judge,
            Severity::Critical,
            false,
            RecoveryStrategy::UserIntervention,
            message,
        )
        .with_suggestion("Install the judge or point AUDIT_JUDGE_CMD at it");
    }

    let judge_transient = ["timed out", "timeout", "malformed", "invalid json", "judge"];
    if judge_transient.iter().any(|p| lower.contains(p)) {
        return ClassifiedError::new(
            ErrorCategory::Judge,
            Severity::Medium,
            true,
            RecoveryStrategy::Fallback,
            message,
        )
        .with_suggestion("A fallback reject review is recorded; the loop continues");
    }

    let filesystem = [
        "permission denied",
        "eacces",
        "eperm",
        "enoent",
        "no such file or directory",
        "read-only file system",
        "disk full",
        "no space left",
    ];
    if filesystem.iter().any(|p| lower.contains(p)) {
        return ClassifiedError::new(
            ErrorCategory::Filesystem,
            Severity::Medium,
            true,
            RecoveryStrategy::Retry,
            message,
        )
        .with_suggestion("Check that the state directory exists and is writable");
    }

    if lower.contains("corrupt") || lower.contains("session") {
        return ClassifiedError::new(
            ErrorCategory::Session,
            Severity::Low,
            true,
            RecoveryStrategy::Fallback,
            message,
        )
        .with_suggestion("A fresh session record is created");
    }

    ClassifiedError::new(
        ErrorCategory::Filesystem,
        Severity::High,
        false,
        RecoveryStrategy::Abort,
        message,
    )
    .with_suggestion("Unrecognised failure; inspect logs before retrying")
}

/// Classify any error by its rendered message chain
pub fn classify_any(err: &anyhow::Error) -> ClassifiedError {
    if let Some(audit) = err.downcast_ref::<AuditError>() {
        return audit.classify();
    }
    classify_message(&format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_recoverable_fallback() {
        let c = AuditError::config("hard_cap must be >= 1").classify();
        assert_eq!(c.category, ErrorCategory::Config);
        assert!(c.recoverable);
        assert_eq!(c.strategy, RecoveryStrategy::Fallback);
        assert!(!c.suggestions.is_empty());
    }

    #[test]
    fn test_classify_message_executable_missing() {
        let c = classify_message("sh: judge-cli: command not found");
        assert_eq!(c.category, ErrorCategory::Judge);
        assert_eq!(c.severity, Severity::Critical);
        assert!(!c.recoverable);
    }

    #[test]
    fn test_classify_message_filesystem() {
        let c = classify_message("open /var/state/s1.json: Permission denied (os error 13)");
        assert_eq!(c.category, ErrorCategory::Filesystem);
        assert!(c.recoverable);

        let c = classify_message("ENOENT: no such file or directory");
        assert_eq!(c.category, ErrorCategory::Filesystem);
    }

    #[test]
    fn test_classify_message_defaults_conservative() {
        let c = classify_message("something odd happened");
        assert_eq!(c.category, ErrorCategory::Filesystem);
        assert_eq!(c.strategy, RecoveryStrategy::Abort);
        assert!(!c.recoverable);
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn test_out_of_sequence_context() {
        let c = AuditError::OutOfSequence {
            session_id: "s1".into(),
            expected: 3,
            got: 5,
        }
        .classify();
        assert_eq!(c.context.get("expected").unwrap(), &3);
        assert_eq!(c.context.get("got").unwrap(), &5);
        assert!(c.suggestions[0].contains('3'));
    }

    #[test]
    fn test_classified_error_serialization() {
        let c = ClassifiedError::new(
            ErrorCategory::Judge,
            Severity::Medium,
            true,
            RecoveryStrategy::Fallback,
            "judge timed out",
        )
        .with_session("abc", 4);

        let json = c.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["category"], "judge");
        assert_eq!(parsed["strategy"], "fallback");
        assert_eq!(parsed["context"]["loop_index"], 4);

        let restored: ClassifiedError = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, c);
    }

    #[test]
    fn test_classify_any_downcasts() {
        let err = anyhow::Error::new(AuditError::SessionNotFound {
            session_id: "x".into(),
        });
        assert_eq!(classify_any(&err).category, ErrorCategory::Session);

        let err = anyhow::anyhow!("write failed: no space left on device");
        assert_eq!(classify_any(&err).category, ErrorCategory::Filesystem);
    }
}
