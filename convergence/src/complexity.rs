//! Complexity-Depth Controller
//!
//! Lexical complexity metrics for a candidate, and the audit depth, judge
//! timeout, and focus areas that follow from them. No parsing: every metric
//! comes from language-specific regexes and a bracket counter, which keeps
//! the analysis cheap enough to run on every loop.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{AuditError, AuditResult};

/// Source language, used to pick lexical patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    #[default]
    Other,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => Self::Rust,
            Some("py") | Some("pyi") => Self::Python,
            Some("js") | Some("mjs") | Some("cjs") | Some("jsx") => Self::JavaScript,
            Some("ts") | Some("tsx") | Some("mts") => Self::TypeScript,
            Some("go") => Self::Go,
            Some("java") => Self::Java,
            _ => Self::Other,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rust" | "rs" => Self::Rust,
            "python" | "py" => Self::Python,
            "javascript" | "js" => Self::JavaScript,
            "typescript" | "ts" => Self::TypeScript,
            "go" | "golang" => Self::Go,
            "java" => Self::Java,
            _ => Self::Other,
        }
    }

    fn line_comment(&self) -> &'static str {
        match self {
            Self::Python => "#",
            _ => "//",
        }
    }

    fn block_comment(&self) -> (&'static str, &'static str) {
        match self {
            Self::Python => ("\"\"\"", "\"\"\""),
            _ => ("/*", "*/"),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rust => write!(f, "rust"),
            Self::Python => write!(f, "python"),
            Self::JavaScript => write!(f, "javascript"),
            Self::TypeScript => write!(f, "typescript"),
            Self::Go => write!(f, "go"),
            Self::Java => write!(f, "java"),
            Self::Other => write!(f, "other"),
        }
    }
}

struct LanguagePatterns {
    function: Regex,
    class: Regex,
    import: Regex,
}

impl LanguagePatterns {
    fn new(function: &str, class: &str, import: &str) -> Self {
        Self {
            function: Regex::new(function).expect("function regex should compile"),
            class: Regex::new(class).expect("class regex should compile"),
            import: Regex::new(import).expect("import regex should compile"),
        }
    }
}

static RUST_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+\S+\s+)?fn\s+\w+",
        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|union)\s+\w+",
        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:use|extern\s+crate)\s+\w",
    )
});

static PYTHON_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"(?m)^\s*(?:async\s+)?def\s+\w+",
        r"(?m)^\s*class\s+\w+",
        r"(?m)^\s*(?:import|from)\s+[\w.]+",
    )
});

static JS_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"\bfunction\b|=>",
        r"\bclass\s+\w+",
        r#"(?m)^\s*import\b|\brequire\s*\(\s*['"]"#,
    )
});

static TS_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"\bfunction\b|=>",
        r"\b(?:class|interface|enum)\s+\w+",
        r#"(?m)^\s*import\b|\brequire\s*\(\s*['"]"#,
    )
});

static GO_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"(?m)^\s*func\b",
        r"(?m)^\s*type\s+\w+\s+(?:struct|interface)\b",
        r#"(?m)^\s*(?:import\s+)?(?:\w+\s+)?"[^"]+"\s*$"#,
    )
});

static JAVA_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"(?m)^\s*(?:(?:public|private|protected|static|final|synchronized|abstract|native)\s+)+[\w<>\[\],.? ]+\s+\w+\s*\(",
        r"\b(?:class|interface|enum|record)\s+\w+",
        r"(?m)^\s*import\s+[\w.*]+",
    )
});

static OTHER_PATTERNS: LazyLock<LanguagePatterns> = LazyLock::new(|| {
    LanguagePatterns::new(
        r"\b(?:fn|def|func|function)\s+\w+",
        r"\b(?:class|struct|interface|trait)\s+\w+",
        r#"(?m)^\s*(?:import|use|from|#include)\b|\brequire\s*\("#,
    )
});

/// Go `import ( ... )` blocks; the quoted paths inside are counted
static GO_IMPORT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\bimport\s*\(([^)]*)\)").expect("GO_IMPORT_BLOCK regex should compile")
});

static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|elif|for|while|loop|match|case|catch|except)\b")
        .expect("BRANCH_RE regex should compile")
});

/// `cond ? a : b`; not applied to Rust (`?` is propagation) or Python
static TERNARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\?[^?:;\n.]*:").expect("TERNARY_RE regex should compile")
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)'|\d+(?:\.\d+)?|[A-Za-z_]\w*|==|!=|<=|>=|&&|\|\||->|=>|::|\+=|-=|\*=|/=|[+\-*/%=<>!&|^~?:;,.(){}\[\]]"#,
    )
    .expect("TOKEN_RE regex should compile")
});

const KEYWORDS: &[&str] = &[
    "if", "else", "elif", "for", "while", "loop", "match", "case", "switch", "catch", "except",
    "try", "finally", "return", "break", "continue", "fn", "def", "func", "function", "let",
    "var", "const", "mut", "pub", "class", "struct", "enum", "trait", "impl", "interface",
    "import", "from", "use", "new", "in", "as", "await", "async", "yield", "throw", "raise",
    "static", "public", "private", "protected", "type", "where", "with", "lambda", "and", "or",
    "not",
];

fn patterns(language: Language) -> &'static LanguagePatterns {
    match language {
        Language::Rust => &*RUST_PATTERNS,
        Language::Python => &*PYTHON_PATTERNS,
        Language::JavaScript => &*JS_PATTERNS,
        Language::TypeScript => &*TS_PATTERNS,
        Language::Go => &*GO_PATTERNS,
        Language::Java => &*JAVA_PATTERNS,
        Language::Other => &*OTHER_PATTERNS,
    }
}

/// Simplified Halstead measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HalsteadMetrics {
    pub distinct_operators: u32,
    pub distinct_operands: u32,
    pub total_operators: u32,
    pub total_operands: u32,
    pub volume: f64,
    pub difficulty: f64,
    pub effort: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityProfile {
    pub language: Language,
    pub cyclomatic_complexity: u32,
    pub cognitive_complexity: u32,
    /// Non-blank, non-comment lines
    pub lines_of_code: u32,
    pub function_count: u32,
    pub class_count: u32,
    pub max_nesting_depth: u32,
    pub dependency_count: u32,
    pub halstead: HalsteadMetrics,
    /// Weighted, normalised 0-100
    pub overall_complexity: f64,
}

/// Per-metric values that map to 100 when normalising
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationCaps {
    pub cyclomatic: f64,
    pub cognitive: f64,
    pub lines_of_code: f64,
    pub functions: f64,
    pub classes: f64,
    pub nesting: f64,
    pub dependencies: f64,
}

impl Default for NormalizationCaps {
    fn default() -> Self {
        Self {
            cyclomatic: 50.0,
            cognitive: 100.0,
            lines_of_code: 1000.0,
            functions: 50.0,
            classes: 20.0,
            nesting: 10.0,
            dependencies: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    pub base_timeout_secs: u64,
    pub timeout_multiplier: f64,
    pub max_timeout_secs: u64,
    pub caps: NormalizationCaps,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            base_timeout_secs: 60,
            timeout_multiplier: 3.0,
            max_timeout_secs: 600,
            caps: NormalizationCaps::default(),
        }
    }
}

impl DepthConfig {
    pub fn validate(&self) -> AuditResult<()> {
        if self.base_timeout_secs == 0 {
            return Err(AuditError::config("depth.base_timeout_secs must be >= 1"));
        }
        if self.max_timeout_secs < self.base_timeout_secs {
            return Err(AuditError::config(format!(
                "depth.max_timeout_secs {} is below base_timeout_secs {}",
                self.max_timeout_secs, self.base_timeout_secs
            )));
        }
        if !(self.timeout_multiplier >= 0.0 && self.timeout_multiplier.is_finite()) {
            return Err(AuditError::config("depth.timeout_multiplier must be >= 0"));
        }
        let caps = &self.caps;
        let all_positive = [
            caps.cyclomatic,
            caps.cognitive,
            caps.lines_of_code,
            caps.functions,
            caps.classes,
            caps.nesting,
            caps.dependencies,
        ]
        .iter()
        .all(|c| *c > 0.0);
        if !all_positive {
            return Err(AuditError::config("depth.caps must all be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDepth {
    Shallow,
    Standard,
    Deep,
    Comprehensive,
}

impl AuditDepth {
    pub fn from_complexity(overall: f64) -> Self {
        if overall <= 30.0 {
            Self::Shallow
        } else if overall <= 60.0 {
            Self::Standard
        } else if overall <= 80.0 {
            Self::Deep
        } else {
            Self::Comprehensive
        }
    }
}

impl std::fmt::Display for AuditDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shallow => write!(f, "shallow"),
            Self::Standard => write!(f, "standard"),
            Self::Deep => write!(f, "deep"),
            Self::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

/// Audit focus area; declaration order is the tie-break precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    Testing,
    Security,
    Performance,
    Maintainability,
    Documentation,
}

impl FocusArea {
    pub const ALL: [FocusArea; 5] = [
        Self::Testing,
        Self::Security,
        Self::Performance,
        Self::Maintainability,
        Self::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Testing => "testing",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Maintainability => "maintainability",
            Self::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for FocusArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDepthPlan {
    pub depth: AuditDepth,
    pub timeout_secs: u64,
    /// At most three, highest priority first
    pub focus_areas: Vec<FocusArea>,
    pub recommendations: Vec<String>,
    pub justification: String,
}

impl AuditDepthPlan {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Analyses candidates and plans audit depth
#[derive(Debug, Clone, Default)]
pub struct DepthController {
    config: DepthConfig,
}

impl DepthController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DepthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DepthConfig {
        &self.config
    }

    pub fn analyze(&self, source: &str, language: Language) -> ComplexityProfile {
        analyze_with_caps(source, language, &self.config.caps)
    }

    pub fn plan(&self, profile: &ComplexityProfile) -> AuditDepthPlan {
        plan_with_config(profile, &self.config)
    }
}

/// Analyse with default normalisation caps
pub fn analyze(source: &str, language: Language) -> ComplexityProfile {
    analyze_with_caps(source, language, &NormalizationCaps::default())
}

/// Plan with default depth configuration
pub fn plan(profile: &ComplexityProfile) -> AuditDepthPlan {
    plan_with_config(profile, &DepthConfig::default())
}

pub fn analyze_with_caps(
    source: &str,
    language: Language,
    caps: &NormalizationCaps,
) -> ComplexityProfile {
    let code_lines = code_lines(source, language);
    let code = code_lines.join("\n");
    let pats = patterns(language);

    let lines_of_code = code_lines.len() as u32;
    let function_count = pats.function.find_iter(&code).count() as u32;
    let class_count = pats.class.find_iter(&code).count() as u32;
    let dependency_count = dependency_count(&code, language, pats);
    let max_nesting_depth = max_nesting(&code);

    let mut branches = BRANCH_RE.find_iter(&code).count() as u32;
    if !matches!(language, Language::Rust | Language::Python) {
        branches += TERNARY_RE.find_iter(&code).count() as u32;
    }
    let cyclomatic_complexity = 1 + branches;
    let cognitive_complexity = cyclomatic_complexity + 2 * max_nesting_depth;
    let halstead = halstead(&code);

    let norm = |value: u32, cap: f64| ((value as f64 / cap).min(1.0) * 100.0).max(0.0);
    let overall = 0.25 * norm(cyclomatic_complexity, caps.cyclomatic)
        + 0.25 * norm(cognitive_complexity, caps.cognitive)
        + 0.15 * norm(lines_of_code, caps.lines_of_code)
        + 0.10 * norm(function_count, caps.functions)
        + 0.10 * norm(class_count, caps.classes)
        + 0.10 * norm(max_nesting_depth, caps.nesting)
        + 0.05 * norm(dependency_count, caps.dependencies);
    let overall_complexity = if overall.is_finite() {
        overall.clamp(0.0, 100.0)
    } else {
        0.0
    };

    ComplexityProfile {
        language,
        cyclomatic_complexity,
        cognitive_complexity,
        lines_of_code,
        function_count,
        class_count,
        max_nesting_depth,
        dependency_count,
        halstead,
        overall_complexity,
    }
}

/// Weighted priority of each focus area, highest first; ties keep precedence
pub fn focus_priorities(profile: &ComplexityProfile) -> Vec<(FocusArea, f64)> {
    let overall = profile.overall_complexity;
    let cyclomatic = profile.cyclomatic_complexity as f64;
    let cognitive = profile.cognitive_complexity as f64;
    let nesting = profile.max_nesting_depth as f64;
    let functions = profile.function_count as f64;
    let classes = profile.class_count as f64;
    let deps = profile.dependency_count as f64;
    let loc = profile.lines_of_code as f64;

    let mut ranked: Vec<(FocusArea, f64)> = FocusArea::ALL
        .iter()
        .map(|area| {
            let priority = match area {
                FocusArea::Testing => overall * 1.5 + cyclomatic,
                FocusArea::Security => deps * 3.0 + overall * 0.3,
                FocusArea::Performance => nesting * 8.0 + cyclomatic * 0.5,
                FocusArea::Maintainability => cognitive * 0.8 + functions * 0.5 + loc * 0.02,
                FocusArea::Documentation => functions * 1.5 + classes * 2.0,
            };
            (*area, priority)
        })
        .collect();
    // Stable sort keeps ALL order for equal priorities
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

pub fn plan_with_config(profile: &ComplexityProfile, config: &DepthConfig) -> AuditDepthPlan {
    let overall = profile.overall_complexity.clamp(0.0, 100.0);
    let depth = AuditDepth::from_complexity(overall);

    let raw_timeout =
        config.base_timeout_secs as f64 * (1.0 + (overall / 100.0) * config.timeout_multiplier);
    let timeout_secs = (raw_timeout.round() as u64).min(config.max_timeout_secs);

    let focus_areas: Vec<FocusArea> = focus_priorities(profile)
        .into_iter()
        .take(3)
        .map(|(area, _)| area)
        .collect();

    let mut recommendations: Vec<String> = match depth {
        AuditDepth::Shallow => vec!["Quick pass: confirm correctness of the changed lines".into()],
        AuditDepth::Standard => vec![
            "Review control flow of the most branch-heavy functions".into(),
            "Check error handling on every fallible call".into(),
        ],
        AuditDepth::Deep => vec![
            "Trace error paths and edge cases through nested blocks".into(),
            "Split functions with high cognitive complexity before polishing them".into(),
        ],
        AuditDepth::Comprehensive => vec![
            "Trace error paths and edge cases through nested blocks".into(),
            "Require a test for every branch before acceptance".into(),
            "Audit each external dependency and its usage".into(),
        ],
    };
    if profile.max_nesting_depth > 5 {
        recommendations.push(format!(
            "Reduce nesting depth (currently {}) with early returns or helper functions",
            profile.max_nesting_depth
        ));
    }
    if profile.dependency_count > 15 {
        recommendations.push(format!(
            "Review {} external dependencies for necessity",
            profile.dependency_count
        ));
    }
    if profile.function_count == 0 && profile.lines_of_code > 50 {
        recommendations.push("Break the code into named functions".into());
    }

    let justification = format!(
        "Overall complexity {:.1} maps to {} depth: cyclomatic {}, cognitive {}, {} LOC, nesting {}, {} dependencies",
        overall,
        depth,
        profile.cyclomatic_complexity,
        profile.cognitive_complexity,
        profile.lines_of_code,
        profile.max_nesting_depth,
        profile.dependency_count
    );

    AuditDepthPlan {
        depth,
        timeout_secs,
        focus_areas,
        recommendations,
        justification,
    }
}

/// Code portion of each non-blank, non-comment line
fn code_lines(source: &str, language: Language) -> Vec<String> {
    let line_marker = language.line_comment();
    let (open, close) = language.block_comment();
    let docstring_only = language == Language::Python;

    let mut out = Vec::new();
    let mut in_block = false;

    for raw in source.lines() {
        let mut rest: &str = raw.trim();
        let mut code = String::new();

        loop {
            if in_block {
                match rest.find(close) {
                    Some(end) => {
                        in_block = false;
                        rest = rest[end + close.len()..].trim_start();
                    }
                    None => break,
                }
                continue;
            }

            let start = if docstring_only {
                rest.starts_with(open).then_some(0)
            } else {
                rest.find(open)
            };
            match start {
                Some(idx) => {
                    let before = &rest[..idx];
                    let stripped = strip_line_comment(before, line_marker);
                    code.push_str(stripped);
                    if stripped.len() < before.len() {
                        // Line comment began before the block opener
                        break;
                    }
                    in_block = true;
                    rest = &rest[idx + open.len()..];
                }
                None => {
                    code.push_str(strip_line_comment(rest, line_marker));
                    break;
                }
            }
        }

        let code = code.trim();
        if !code.is_empty() {
            out.push(code.to_string());
        }
    }
    out
}

/// Text before an unquoted line comment marker
fn strip_line_comment<'a>(line: &'a str, marker: &str) -> &'a str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if !in_string && line[i..].starts_with(marker) => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Deepest bracket nesting; the counter never goes below zero
fn max_nesting(code: &str) -> u32 {
    let mut depth: u32 = 0;
    let mut max = 0;
    for c in code.chars() {
        match c {
            '{' | '(' | '[' => {
                depth += 1;
                max = max.max(depth);
            }
            '}' | ')' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn dependency_count(code: &str, language: Language, pats: &LanguagePatterns) -> u32 {
    if language == Language::Go {
        let mut count = 0;
        let mut outside = code.to_string();
        for block in GO_IMPORT_BLOCK.captures_iter(code) {
            if let Some(body) = block.get(1) {
                count += body.as_str().lines().filter(|l| l.contains('"')).count() as u32;
            }
            if let Some(whole) = block.get(0) {
                outside = outside.replace(whole.as_str(), "");
            }
        }
        let singles = outside
            .lines()
            .filter(|l| l.trim_start().starts_with("import "))
            .count() as u32;
        return count + singles;
    }
    pats.import.find_iter(code).count() as u32
}

fn halstead(code: &str) -> HalsteadMetrics {
    let keywords: HashSet<&str> = KEYWORDS.iter().copied().collect();
    let mut operators: HashSet<&str> = HashSet::new();
    let mut operands: HashSet<&str> = HashSet::new();
    let (mut n1_total, mut n2_total) = (0u32, 0u32);

    for token in TOKEN_RE.find_iter(code).map(|m| m.as_str()) {
        let first = token.chars().next().unwrap_or(' ');
        let is_operand = (first.is_alphanumeric() || first == '_' || first == '"' || first == '\'')
            && !keywords.contains(token);
        if is_operand {
            operands.insert(token);
            n2_total += 1;
        } else {
            operators.insert(token);
            n1_total += 1;
        }
    }

    let n1 = operators.len() as f64;
    let n2 = operands.len() as f64;
    let vocabulary = n1 + n2;
    let length = (n1_total + n2_total) as f64;
    let volume = if vocabulary > 1.0 {
        length * vocabulary.log2()
    } else {
        0.0
    };
    let difficulty = if n2 > 0.0 {
        (n1 / 2.0) * (n2_total as f64 / n2)
    } else {
        0.0
    };

    HalsteadMetrics {
        distinct_operators: operators.len() as u32,
        distinct_operands: operands.len() as u32,
        total_operators: n1_total,
        total_operands: n2_total,
        volume,
        difficulty,
        effort: difficulty * volume,
    }
}
