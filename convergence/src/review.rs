//! Judge review model
//!
//! A `Review` is what the external judge returns for one candidate. The core
//! never computes these scores; it only reads them, persists them, and turns
//! them into feedback.

use serde::{Deserialize, Serialize};

/// Categorical outcome of a judge pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Candidate meets the rubric
    Pass,
    /// Candidate needs another revision
    Revise,
    /// Candidate is rejected outright
    Reject,
}

impl Verdict {
    /// Parse a verdict from judge output, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "accept" | "approved" => Some(Self::Pass),
            "revise" | "revision" | "needs_revision" => Some(Self::Revise),
            "reject" | "rejected" | "fail" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Revise => write!(f, "revise"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Score for one named rubric dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub name: String,
    /// 0-100
    pub score: f64,
}

/// Inline comment anchored to a file location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InlineFinding {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub comment: String,
}

impl InlineFinding {
    pub fn new(path: impl Into<String>, line: u32, comment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: Some(line),
            comment: comment.into(),
        }
    }

    /// A finding is usable only when path, line, and comment are all present
    pub fn is_actionable(&self) -> bool {
        !self.path.trim().is_empty()
            && self.line.is_some()
            && !self.comment.trim().is_empty()
    }

    /// `path:line` key used for recurrence tracking
    pub fn location(&self) -> Option<(String, u32)> {
        if !self.is_actionable() {
            return None;
        }
        self.line.map(|line| (self.path.trim().to_string(), line))
    }
}

/// Per-judge breakdown when several judges were consulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScoreCard {
    pub judge: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

/// Full judge review for one loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Overall score, 0-100
    pub score: f64,
    pub verdict: Verdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionScore>,
    #[serde(default)]
    pub findings: Vec<InlineFinding>,
    #[serde(default)]
    pub citations: Vec<String>,
    /// Judge-internal iterations consumed producing this review
    #[serde(default)]
    pub judge_iterations: u32,
    #[serde(default)]
    pub judge_cards: Vec<JudgeScoreCard>,
    /// True when produced locally after a judge failure
    #[serde(default)]
    pub synthetic: bool,
}

impl Review {
    pub fn new(score: f64, verdict: Verdict, summary: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            verdict,
            summary: summary.into(),
            dimensions: Vec::new(),
            findings: Vec::new(),
            citations: Vec::new(),
            judge_iterations: 0,
            judge_cards: Vec::new(),
            synthetic: false,
        }
    }

    /// Stand-in review used when the judge could not produce one
    pub fn fallback(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            summary: format!("Judge unavailable: {}", reason),
            synthetic: true,
            ..Self::new(0.0, Verdict::Reject, String::new())
        }
    }

    pub fn with_finding(mut self, finding: InlineFinding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn with_dimension(mut self, name: impl Into<String>, score: f64) -> Self {
        self.dimensions.push(DimensionScore {
            name: name.into(),
            score: score.clamp(0.0, 100.0),
        });
        self
    }

    /// Clamp scores into range after deserialising untrusted judge output
    pub fn normalized(mut self) -> Self {
        self.score = sanitize_score(self.score);
        for dim in &mut self.dimensions {
            dim.score = sanitize_score(dim.score);
        }
        for card in &mut self.judge_cards {
            card.score = sanitize_score(card.score);
        }
        self
    }

    /// Locations of actionable findings, deduplicated
    pub fn finding_locations(&self) -> std::collections::HashSet<(String, u32)> {
        self.findings.iter().filter_map(|f| f.location()).collect()
    }

    /// Actionable findings that are security-related or flagged critical
    pub fn critical_findings(&self) -> impl Iterator<Item = &InlineFinding> {
        self.findings
            .iter()
            .filter(|f| f.is_actionable() && crate::classify::is_critical_comment(&f.comment))
    }
}

impl InlineFinding {
    /// `path:line: comment` rendering used in issue lists
    pub fn describe(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}: {}", self.path.trim(), line, self.comment.trim()),
            None => format!("{}: {}", self.path.trim(), self.comment.trim()),
        }
    }
}

fn sanitize_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
