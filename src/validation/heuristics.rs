//! Static artifact heuristics.
//!
//! Every check is a pure function of the artifact text and the task type,
//! so identical input always yields the identical score and issue list.
//! The score starts at 100 and each issue subtracts its severity penalty.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::llm::TaskType;

/// At most this many issues are reported per check.
const MAX_ISSUES_PER_CHECK: usize = 5;

/// Lines longer than this count as overlong.
const LONG_LINE: usize = 120;

/// Nesting deeper than this is flagged.
const MAX_NESTING: usize = 4;

/// Below this many non-blank lines, documentation density is not checked.
const DOC_CHECK_MIN_LINES: usize = 20;

/// An issue found by the heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub message: String,
    /// 1-based line number, when the issue is local
    pub line: Option<usize>,
}

impl Issue {
    pub fn new(severity: IssueSeverity, category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "[{}/{}] line {}: {}",
                self.severity, self.category, line, self.message
            ),
            None => write!(f, "[{}/{}] {}", self.severity, self.category, self.message),
        }
    }
}

/// Severity level of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Critical issue - must be fixed
    Critical,
    /// High severity - should be fixed
    High,
    /// Medium severity - consider fixing
    Medium,
    /// Low severity - minor issue
    Low,
}

impl IssueSeverity {
    /// Points subtracted from the score.
    pub fn penalty(&self) -> u32 {
        match self {
            Self::Critical => 30,
            Self::High => 15,
            Self::Medium => 8,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Category of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// Nothing usable was produced
    Empty,
    /// Placeholder left instead of an implementation
    Incomplete,
    /// Construct that aborts or hides failures
    ErrorHandling,
    /// Secret or dynamic evaluation
    Security,
    /// Structural complexity
    Complexity,
    /// Missing documentation
    Documentation,
    /// Formatting
    Style,
}

impl std::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::ErrorHandling => write!(f, "error_handling"),
            Self::Security => write!(f, "security"),
            Self::Complexity => write!(f, "complexity"),
            Self::Documentation => write!(f, "documentation"),
            Self::Style => write!(f, "style"),
        }
    }
}

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(todo!\s*\(|unimplemented!\s*\(|raise\s+NotImplementedError|\bpass\s*#\s*todo)")
        .expect("invalid regex")
});

static MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(TODO|FIXME|XXX|TBD)\b").expect("invalid regex"));

static ABORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\.unwrap\(\)|\.expect\(|panic!\s*\(|except\s*:\s*pass|catch\s*\(\w*\)\s*\{\s*\})")
        .expect("invalid regex")
});

static EVAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(eval|exec)\s*\(").expect("invalid regex"));

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(api[_-]?key|secret|password|passwd|token)\s*[:=]\s*["'][^"'\s]{8,}["']"#)
        .expect("invalid regex")
});

static COMMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(//|#|/\*|\*|--|"""|''')"#).expect("invalid regex")
});

/// Run every heuristic applicable to `task_type`.
pub fn analyze(artifact: &str, task_type: TaskType) -> Vec<Issue> {
    if artifact.trim().is_empty() {
        return vec![Issue::new(
            IssueSeverity::Critical,
            IssueCategory::Empty,
            "artifact is empty",
        )];
    }

    let mut issues = Vec::new();
    issues.extend(line_matches(
        artifact,
        &SECRET_PATTERN,
        IssueSeverity::Critical,
        IssueCategory::Security,
        "hardcoded credential",
    ));
    issues.extend(line_matches(
        artifact,
        &EVAL_PATTERN,
        IssueSeverity::High,
        IssueCategory::Security,
        "dynamic code evaluation",
    ));
    issues.extend(line_matches(
        artifact,
        &MARKER_PATTERN,
        IssueSeverity::Low,
        IssueCategory::Incomplete,
        "unresolved marker",
    ));

    if task_type.produces_code() {
        issues.extend(line_matches(
            artifact,
            &PLACEHOLDER_PATTERN,
            IssueSeverity::High,
            IssueCategory::Incomplete,
            "placeholder instead of implementation",
        ));
        issues.extend(line_matches(
            artifact,
            &ABORT_PATTERN,
            IssueSeverity::Medium,
            IssueCategory::ErrorHandling,
            "failure is aborted or swallowed",
        ));
        issues.extend(nesting_issue(artifact));
        issues.extend(documentation_issue(artifact));
    } else if artifact.split_whitespace().count() < 10 {
        issues.push(Issue::new(
            IssueSeverity::Medium,
            IssueCategory::Incomplete,
            "response is too short to be useful",
        ));
    }

    issues.extend(long_line_issue(artifact));
    issues
}

/// Score an issue list, 0-100.
pub fn score_issues(issues: &[Issue]) -> u8 {
    let penalty: u32 = issues.iter().map(|i| i.severity.penalty()).sum();
    100u32.saturating_sub(penalty) as u8
}

fn line_matches(
    artifact: &str,
    pattern: &Regex,
    severity: IssueSeverity,
    category: IssueCategory,
    message: &str,
) -> Vec<Issue> {
    artifact
        .lines()
        .enumerate()
        .filter(|(_, line)| pattern.is_match(line))
        .take(MAX_ISSUES_PER_CHECK)
        .map(|(idx, _)| Issue::new(severity, category, message).at_line(idx + 1))
        .collect()
}

/// Deepest bracket nesting, ignoring brackets inside string literals.
pub fn max_nesting_depth(artifact: &str) -> usize {
    let mut depth: usize = 0;
    let mut max_depth = 0;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for c in artifact.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' | '(' | '[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ')' | ']' => depth = depth.saturating_sub(1),
            '\n' => {
                // Unterminated char literals (lifetimes) must not swallow the file
                in_string = None;
            }
            _ => {}
        }
    }
    max_depth
}

fn nesting_issue(artifact: &str) -> Option<Issue> {
    let depth = max_nesting_depth(artifact);
    (depth > MAX_NESTING).then(|| {
        Issue::new(
            IssueSeverity::Medium,
            IssueCategory::Complexity,
            format!("nesting depth {} exceeds {}", depth, MAX_NESTING),
        )
    })
}

fn documentation_issue(artifact: &str) -> Option<Issue> {
    let lines: Vec<&str> = artifact.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < DOC_CHECK_MIN_LINES {
        return None;
    }
    let comments = lines.iter().filter(|l| COMMENT_PATTERN.is_match(l)).count();
    let density = comments as f64 / lines.len() as f64;
    (density < 0.05).then(|| {
        Issue::new(
            IssueSeverity::Medium,
            IssueCategory::Documentation,
            format!("{} of {} lines are comments", comments, lines.len()),
        )
    })
}

fn long_line_issue(artifact: &str) -> Option<Issue> {
    let mut long = artifact
        .lines()
        .enumerate()
        .filter(|(_, line)| line.chars().count() > LONG_LINE);
    let (first, _) = long.next()?;
    let count = 1 + long.count();
    Some(
        Issue::new(
            IssueSeverity::Low,
            IssueCategory::Style,
            format!("{} lines exceed {} characters", count, LONG_LINE),
        )
        .at_line(first + 1),
    )
}
