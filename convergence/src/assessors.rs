//! Quality assessor aggregation
//!
//! Assessors are pluggable scorers for a single criterion. The panel only
//! runs them and folds their scores together; it never invents a score for a
//! criterion nobody assessed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::complexity::{analyze_with_caps, Language, NormalizationCaps};
use crate::review::{DimensionScore, Review};

/// What an assessor gets to see besides the code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentContext {
    pub language: Language,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub loop_index: u32,
}

/// Result of one assessor run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub criterion: String,
    /// 0-100
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait QualityAssessor: Send + Sync {
    /// Rubric dimension this assessor scores
    fn criterion(&self) -> &str;

    /// Relative weight in the panel's overall score
    fn weight(&self) -> f64 {
        1.0
    }

    async fn evaluate(&self, code: &str, context: &AssessmentContext) -> anyhow::Result<Assessment>;
}

/// Aggregated output of a panel run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelReport {
    pub assessments: Vec<Assessment>,
    /// Weighted mean of assessment scores; `None` when nothing was assessed
    pub overall: Option<f64>,
    pub dimensions: Vec<DimensionScore>,
}

impl PanelReport {
    pub fn all_passed(&self) -> bool {
        self.assessments.iter().all(|a| a.passed)
    }

    /// Add assessed dimensions the judge did not score itself.
    /// The judge's own score and dimensions are left untouched.
    pub fn merge_into(&self, review: &mut Review) {
        for dim in &self.dimensions {
            let known = review
                .dimensions
                .iter()
                .any(|d| d.name.eq_ignore_ascii_case(&dim.name));
            if !known {
                review.dimensions.push(dim.clone());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct AssessorPanel {
    assessors: Vec<Arc<dyn QualityAssessor>>,
}

impl std::fmt::Debug for AssessorPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.assessors.iter().map(|a| a.criterion()).collect();
        f.debug_struct("AssessorPanel").field("assessors", &names).finish()
    }
}

impl AssessorPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, assessor: Arc<dyn QualityAssessor>) -> Self {
        self.register(assessor);
        self
    }

    pub fn register(&mut self, assessor: Arc<dyn QualityAssessor>) {
        self.assessors.push(assessor);
    }

    pub fn len(&self) -> usize {
        self.assessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assessors.is_empty()
    }

    /// Run every assessor in registration order. A failing assessor is
    /// logged and left out of the aggregate.
    pub async fn run(&self, code: &str, context: &AssessmentContext) -> PanelReport {
        let mut report = PanelReport::default();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for assessor in &self.assessors {
            let assessment = match assessor.evaluate(code, context).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(criterion = assessor.criterion(), error = %e, "Assessor failed");
                    continue;
                }
            };
            let score = if assessment.score.is_finite() {
                assessment.score.clamp(0.0, 100.0)
            } else {
                0.0
            };
            let weight = assessor.weight().max(0.0);
            weighted += score * weight;
            total_weight += weight;

            debug!(criterion = %assessment.criterion, score, passed = assessment.passed, "Assessed");
            report.dimensions.push(DimensionScore {
                name: assessment.criterion.clone(),
                score,
            });
            report.assessments.push(Assessment {
                score,
                ..assessment
            });
        }

        if total_weight > 0.0 {
            report.overall = Some(weighted / total_weight);
        }
        report
    }
}

/// Maintainability from lexical complexity: `100 - overall_complexity`
#[derive(Debug, Clone)]
pub struct ComplexityAssessor {
    caps: NormalizationCaps,
    pass_mark: f64,
    weight: f64,
}

impl Default for ComplexityAssessor {
    fn default() -> Self {
        Self {
            caps: NormalizationCaps::default(),
            pass_mark: 60.0,
            weight: 1.0,
        }
    }
}

impl ComplexityAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caps(mut self, caps: NormalizationCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_pass_mark(mut self, pass_mark: f64) -> Self {
        self.pass_mark = pass_mark.clamp(0.0, 100.0);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[async_trait]
impl QualityAssessor for ComplexityAssessor {
    fn criterion(&self) -> &str {
        "maintainability"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    async fn evaluate(&self, code: &str, context: &AssessmentContext) -> anyhow::Result<Assessment> {
        let profile = analyze_with_caps(code, context.language, &self.caps);
        let score = (100.0 - profile.overall_complexity).clamp(0.0, 100.0);
        let passed = score >= self.pass_mark;

        let evidence = vec![
            format!("cyclomatic complexity {}", profile.cyclomatic_complexity),
            format!("max nesting depth {}", profile.max_nesting_depth),
            format!(
                "{} function(s) across {} lines of code",
                profile.function_count, profile.lines_of_code
            ),
            format!("{} external dependencies", profile.dependency_count),
        ];

        let mut suggestions = Vec::new();
        if profile.max_nesting_depth > 4 {
            suggestions.push("Flatten deep nesting with early returns or guard clauses".to_string());
        }
        if profile.cyclomatic_complexity > 20 {
            suggestions.push("Split branch-heavy logic into smaller functions".to_string());
        }
        if profile.function_count > 0 && profile.lines_of_code / profile.function_count > 60 {
            suggestions.push("Break up long functions".to_string());
        }
        if profile.dependency_count > 15 {
            suggestions.push("Trim the number of external dependencies".to_string());
        }

        let feedback = if passed {
            format!("Maintainability {:.0} meets the pass mark of {:.0}", score, self.pass_mark)
        } else {
            format!(
                "Maintainability {:.0} is below the pass mark of {:.0}",
                score, self.pass_mark
            )
        };

        Ok(Assessment {
            criterion: self.criterion().to_string(),
            score,
            passed,
            evidence,
            feedback,
            suggestions,
        })
    }
}
