use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MEMORY_MB: u64 = 256;
pub const DEFAULT_FLOAT_EPSILON: f64 = 1e-9;

/// Languages with a sandbox adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
        }
    }
}

/// Parses a language id as it appears in grading requests
impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            other => Err(format!("unsupported language '{}'", other)),
        }
    }
}

impl Language {
    pub fn all() -> &'static [Language] {
        &[Language::Python]
    }
}

/// How actual and expected values are compared for a problem
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonPolicy {
    /// Tolerance applied whenever either side is a float
    pub float_epsilon: f64,
    /// Compare arrays as multisets instead of sequences
    pub unordered_sequences: bool,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        Self {
            float_epsilon: DEFAULT_FLOAT_EPSILON,
            unordered_sequences: false,
        }
    }
}

/// Per-problem comparison settings; fields left out keep the grader's defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unordered_sequences: Option<bool>,
}

impl ComparisonOverride {
    pub fn apply_to(&self, base: ComparisonPolicy) -> ComparisonPolicy {
        ComparisonPolicy {
            float_epsilon: self.float_epsilon.unwrap_or(base.float_epsilon),
            unordered_sequences: self.unordered_sequences.unwrap_or(base.unordered_sequences),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: Value,
    pub expected_output: Value,
}

/// Immutable problem definition, one per grading request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemSpec {
    pub function_name: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub source_code: String,
    pub language: Language,
}

/// Per-submission resource envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_memory_mb() -> u64 {
    DEFAULT_MEMORY_MB
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Wire format of a grading request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingRequest {
    pub function_name: String,
    pub test_cases: Vec<TestCase>,
    pub language_id: String,
    pub source_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonOverride>,
}

impl GradingRequest {
    pub fn problem(&self) -> ProblemSpec {
        ProblemSpec {
            function_name: self.function_name.clone(),
            test_cases: self.test_cases.clone(),
            comparison: self.comparison,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailureKind {
    #[default]
    None,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    TypeMismatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::None => "None",
            FailureKind::RuntimeError => "RuntimeError",
            FailureKind::Timeout => "Timeout",
            FailureKind::ResourceExceeded => "ResourceExceeded",
            FailureKind::TypeMismatch => "TypeMismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub input: Value,
    pub expected_output: Value,
    pub actual_output: Option<Value>,
    pub passed: bool,
    pub failure_kind: FailureKind,
    pub diagnostic_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalErrorKind {
    ValidationError,
    CompileError,
    DefinitionMissing,
    SandboxUnavailable,
}

impl fmt::Display for FatalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FatalErrorKind::ValidationError => "ValidationError",
            FatalErrorKind::CompileError => "CompileError",
            FatalErrorKind::DefinitionMissing => "DefinitionMissing",
            FatalErrorKind::SandboxUnavailable => "SandboxUnavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub kind: FatalErrorKind,
    pub message: String,
}

/// Final verdict for one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub overall_passed: bool,
    pub fatal_error: Option<FatalError>,
    pub case_results: Vec<CaseResult>,
}

impl SubmissionResult {
    /// Submission-level failure; no case is reported individually
    pub fn fatal(kind: FatalErrorKind, message: impl Into<String>) -> Self {
        Self {
            overall_passed: false,
            fatal_error: Some(FatalError {
                kind,
                message: message.into(),
            }),
            case_results: Vec::new(),
        }
    }

    /// Lowest-index failing case, if any
    pub fn first_failure(&self) -> Option<(usize, &CaseResult)> {
        self.case_results.iter().enumerate().find(|(_, c)| !c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.case_results.iter().filter(|c| c.passed).count()
    }

    /// Only infrastructure failures are worth retrying, and only by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.fatal_error,
            Some(FatalError {
                kind: FatalErrorKind::SandboxUnavailable,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_language_parsing() {
        assert_eq!("python".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" Python3 ".parse::<Language>(), Ok(Language::Python));
        assert!("cobol".parse::<Language>().unwrap_err().contains("cobol"));
        assert_eq!(Language::Python.to_string(), "python");
    }

    #[test]
    fn test_partial_comparison_keeps_base() {
        let base = ComparisonPolicy {
            float_epsilon: 0.5,
            unordered_sequences: false,
        };

        let only_unordered: ComparisonOverride =
            serde_json::from_value(json!({"unorderedSequences": true})).unwrap();
        let resolved = only_unordered.apply_to(base);
        assert_eq!(resolved.float_epsilon, 0.5);
        assert!(resolved.unordered_sequences);

        let only_epsilon: ComparisonOverride = serde_json::from_value(json!({"floatEpsilon": 0.0})).unwrap();
        assert_eq!(only_epsilon.apply_to(base).float_epsilon, 0.0);
        assert!(!only_epsilon.apply_to(base).unordered_sequences);

        assert_eq!(ComparisonOverride::default().apply_to(base), base);
    }

    #[test]
    fn test_request_defaults() {
        let request: GradingRequest = serde_json::from_value(json!({
            "functionName": "add",
            "testCases": [{"input": {"a": 2, "b": 3}, "expectedOutput": 5}],
            "languageId": "python",
            "sourceCode": "def add(a, b): return a + b"
        }))
        .unwrap();

        assert!(request.limits.is_none());
        let problem = request.problem();
        assert_eq!(problem.function_name, "add");
        assert_eq!(problem.test_cases[0].expected_output, json!(5));
        assert!(problem.comparison.is_none());
    }

    #[test]
    fn test_partial_limits_fill_defaults() {
        let limits: Limits = serde_json::from_value(json!({"timeoutMs": 1000})).unwrap();
        assert_eq!(limits.timeout_ms, 1000);
        assert_eq!(limits.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(limits.memory_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_result_wire_shape() {
        let result = SubmissionResult {
            overall_passed: false,
            fatal_error: None,
            case_results: vec![CaseResult {
                input: json!({"a": 2, "b": 3}),
                expected_output: json!(5),
                actual_output: Some(json!(-1)),
                passed: false,
                failure_kind: FailureKind::None,
                diagnostic_text: String::new(),
            }],
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["overallPassed"], json!(false));
        assert_eq!(value["fatalError"], Value::Null);
        assert_eq!(value["caseResults"][0]["actualOutput"], json!(-1));
        assert_eq!(value["caseResults"][0]["failureKind"], json!("None"));
        assert_eq!(value["caseResults"][0]["expectedOutput"], json!(5));
    }

    #[test]
    fn test_fatal_result() {
        let result = SubmissionResult::fatal(FatalErrorKind::DefinitionMissing, "no add");
        assert!(!result.overall_passed);
        assert!(result.case_results.is_empty());
        assert!(!result.is_retryable());

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["fatalError"]["kind"], json!("DefinitionMissing"));
        assert_eq!(value["fatalError"]["message"], json!("no add"));

        let unavailable = SubmissionResult::fatal(FatalErrorKind::SandboxUnavailable, "busy");
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_first_failure() {
        let case = |passed| CaseResult {
            input: json!([]),
            expected_output: json!(1),
            actual_output: Some(json!(1)),
            passed,
            failure_kind: FailureKind::None,
            diagnostic_text: String::new(),
        };
        let result = SubmissionResult {
            overall_passed: false,
            fatal_error: None,
            case_results: vec![case(true), case(false), case(false)],
        };
        assert_eq!(result.first_failure().map(|(i, _)| i), Some(1));
        assert_eq!(result.passed_count(), 1);
    }
}
