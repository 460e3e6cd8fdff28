//! Keyword classification of judge comments
//!
//! Deterministic, lexical only. Shared by the response builder (improvements
//! and critical issues) and the termination assessment.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Broad category of a review comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Security,
    Performance,
    Style,
    Other,
}

impl IssueCategory {
    /// Fixed priority mapping for a category
    pub fn priority(&self) -> Priority {
        match self {
            Self::Security => Priority::Critical,
            Self::Performance => Priority::High,
            Self::Style => Priority::Low,
            Self::Other => Priority::Medium,
        }
    }
}

impl std::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Performance => write!(f, "performance"),
            Self::Style => write!(f, "style"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Ordered low to critical, so `max()` picks the most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

static SECURITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(security|vulnerab\w*|injections?|xss|csrf|auth(?:entication|orization|n|z)?|secrets?|passwords?|credentials?|tokens?|unsafe|sanitiz\w*|unescaped|escaping|overflows?|exploit\w*)\b",
    )
    .expect("SECURITY_RE regex should compile")
});

static PERFORMANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(performance|slow\w*|latency|allocat\w*|clones?|cloning|copies|copying|quadratic|cach(?:e|es|ed|ing)|inefficient\w*|memory|blocking|hot path)\b|O\(n)",
    )
    .expect("PERFORMANCE_RE regex should compile")
});

static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(style|format\w*|naming|renam\w*|typos?|whitespace|indent\w*|readab\w*|lint\w*|comments?|docs?|nits?)\b",
    )
    .expect("STYLE_RE regex should compile")
});

static CRITICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(critical|crash\w*|panic\w*|data loss|corrupt\w*|deadlocks?|race conditions?|undefined behavio\w*|must fix|blockers?|broken)\b",
    )
    .expect("CRITICAL_RE regex should compile")
});

/// Classify a comment by keyword; security wins over performance over style
pub fn classify_comment(comment: &str) -> IssueCategory {
    if SECURITY_RE.is_match(comment) {
        IssueCategory::Security
    } else if PERFORMANCE_RE.is_match(comment) {
        IssueCategory::Performance
    } else if STYLE_RE.is_match(comment) {
        IssueCategory::Style
    } else {
        IssueCategory::Other
    }
}

/// Critical when security-related or matching a critical keyword
pub fn is_critical_comment(comment: &str) -> bool {
    classify_comment(comment) == IssueCategory::Security || CRITICAL_RE.is_match(comment)
}
