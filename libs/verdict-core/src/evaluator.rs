/// Result Aggregator - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Turn raw call outcomes into per-case verdicts and combine them into a
/// submission-level verdict.
///
/// **Critical Properties:**
/// - Knows nothing about processes or containers
/// - Knows nothing about language runtimes
/// - Pure functions: (outcome, expected value) → CaseResult
///
/// **Verdict Rules:**
/// - Returned value → comparator decides (Match passes, kind change is TypeMismatch)
/// - Raised exception → RuntimeError with the traceback as diagnostic
/// - Killed on wall clock → Timeout
/// - Memory ceiling or oversized reply → ResourceExceeded
/// - Value outside the JSON domain → TypeMismatch
/// - Interpreter died mid-call → RuntimeError
///
/// **Aggregation Rules:**
/// - overallPassed iff at least one case and every case passed
/// - Case order is preserved exactly
/// - Aggregating an already aggregated case list gives the same result
use crate::comparator::{compare, Comparison};
use crate::sandbox::CallOutcome;
use tracing::debug;
use verdict_common::types::{CaseResult, ComparisonPolicy, FailureKind, SubmissionResult, TestCase};

pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Bound diagnostic text to `limit` bytes, cutting on a char boundary.
/// The marker counts against the limit.
pub fn truncate_diagnostic(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }

    if limit <= TRUNCATION_MARKER.len() {
        return text[..floor_char_boundary(text, limit)].to_string();
    }

    let keep = floor_char_boundary(text, limit - TRUNCATION_MARKER.len());
    let mut truncated = String::with_capacity(keep + TRUNCATION_MARKER.len());
    truncated.push_str(&text[..keep]);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Evaluate a single test case from the raw outcome of its call
pub fn evaluate_case(
    case: &TestCase,
    outcome: CallOutcome,
    policy: &ComparisonPolicy,
    diagnostic_limit: usize,
) -> CaseResult {
    let (actual_output, passed, failure_kind, diagnostic) = match outcome {
        CallOutcome::Returned { value, stderr, .. } => {
            let (passed, kind) = match compare(&value, &case.expected_output, policy) {
                Comparison::Match => (true, FailureKind::None),
                Comparison::Mismatch => (false, FailureKind::None),
                Comparison::TypeMismatch => (false, FailureKind::TypeMismatch),
            };
            (Some(value), passed, kind, stderr)
        }
        CallOutcome::Raised {
            message, traceback, ..
        } => {
            let text = if traceback.trim().is_empty() { message } else { traceback };
            (None, false, FailureKind::RuntimeError, text)
        }
        CallOutcome::TimedOut => (
            None,
            false,
            FailureKind::Timeout,
            "Execution exceeded the wall-clock time limit".to_string(),
        ),
        CallOutcome::ResourceExceeded { message } => (None, false, FailureKind::ResourceExceeded, message),
        CallOutcome::Unrepresentable { message } => (None, false, FailureKind::TypeMismatch, message),
        CallOutcome::Crashed { message } => (None, false, FailureKind::RuntimeError, message),
    };

    CaseResult {
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output,
        passed,
        failure_kind,
        diagnostic_text: truncate_diagnostic(&diagnostic, diagnostic_limit),
    }
}

/// Case result for a case that never reached the function
pub fn unreachable_case(case: &TestCase, message: &str, diagnostic_limit: usize) -> CaseResult {
    CaseResult {
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output: None,
        passed: false,
        failure_kind: FailureKind::RuntimeError,
        diagnostic_text: truncate_diagnostic(message, diagnostic_limit),
    }
}

/// Case result for a case skipped because the grading ran out of time
pub fn expired_case(case: &TestCase, diagnostic_limit: usize) -> CaseResult {
    CaseResult {
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output: None,
        passed: false,
        failure_kind: FailureKind::Timeout,
        diagnostic_text: truncate_diagnostic(
            "Grading time budget was used up before this case ran",
            diagnostic_limit,
        ),
    }
}

/// Combine per-case verdicts into the submission verdict
pub fn aggregate(case_results: Vec<CaseResult>) -> SubmissionResult {
    let overall_passed = !case_results.is_empty() && case_results.iter().all(|c| c.passed);

    debug!(
        cases = case_results.len(),
        passed = case_results.iter().filter(|c| c.passed).count(),
        overall_passed,
        "Aggregated case results"
    );

    SubmissionResult {
        overall_passed,
        fatal_error: None,
        case_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Helper to create a test case
    fn make_case(input: Value, expected_output: Value) -> TestCase {
        TestCase {
            input,
            expected_output,
        }
    }

    /// Helper to create a successful outcome
    fn returned(value: Value) -> CallOutcome {
        CallOutcome::Returned {
            value,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn evaluate(case: &TestCase, outcome: CallOutcome) -> CaseResult {
        evaluate_case(case, outcome, &ComparisonPolicy::default(), 4096)
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        assert_eq!(truncate_diagnostic("boom", 100), "boom");
        assert_eq!(truncate_diagnostic("", 0), "");
    }

    #[test]
    fn test_truncate_adds_marker_within_limit() {
        let text = "x".repeat(100);
        let truncated = truncate_diagnostic(&text, 40);
        assert!(truncated.len() <= 40);
        assert!(truncated.ends_with("[truncated]"));
        assert!(truncated.starts_with("xxxx"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(50);
        let truncated = truncate_diagnostic(&text, 30);
        assert!(truncated.len() <= 30);
        assert!(truncated.ends_with(TRUNCATION_MARKER));

        let tiny = truncate_diagnostic(&text, 5);
        assert_eq!(tiny, "éé");
    }

    #[test]
    fn test_exact_match() {
        let case = make_case(json!({"a": 2, "b": 3}), json!(5));
        let result = evaluate(&case, returned(json!(5)));

        assert!(result.passed);
        assert_eq!(result.failure_kind, FailureKind::None);
        assert_eq!(result.actual_output, Some(json!(5)));
        assert_eq!(result.input, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_wrong_answer() {
        let case = make_case(json!({"a": 2, "b": 3}), json!(5));
        let result = evaluate(&case, returned(json!(-1)));

        assert!(!result.passed);
        assert_eq!(result.failure_kind, FailureKind::None);
        assert_eq!(result.actual_output, Some(json!(-1)));
    }

    #[test]
    fn test_type_mismatch() {
        let case = make_case(json!([1]), json!(5));
        let result = evaluate(&case, returned(json!("5")));

        assert!(!result.passed);
        assert_eq!(result.failure_kind, FailureKind::TypeMismatch);
    }

    #[test]
    fn test_runtime_error_uses_traceback() {
        let case = make_case(json!([0]), json!(1));
        let result = evaluate(
            &case,
            CallOutcome::Raised {
                message: "ZeroDivisionError: division by zero".to_string(),
                traceback: "Traceback (most recent call last):\nZeroDivisionError: division by zero".to_string(),
                stderr: String::new(),
            },
        );

        assert!(!result.passed);
        assert_eq!(result.failure_kind, FailureKind::RuntimeError);
        assert!(result.diagnostic_text.starts_with("Traceback"));
        assert_eq!(result.actual_output, None);
    }

    #[test]
    fn test_runtime_error_without_traceback() {
        let case = make_case(json!([0]), json!(1));
        let result = evaluate(
            &case,
            CallOutcome::Raised {
                message: "ValueError: bad".to_string(),
                traceback: String::new(),
                stderr: String::new(),
            },
        );
        assert_eq!(result.diagnostic_text, "ValueError: bad");
    }

    #[test]
    fn test_failure_kinds() {
        let case = make_case(json!([]), json!(1));

        assert_eq!(evaluate(&case, CallOutcome::TimedOut).failure_kind, FailureKind::Timeout);
        assert_eq!(
            evaluate(&case, CallOutcome::ResourceExceeded { message: "MemoryError".to_string() }).failure_kind,
            FailureKind::ResourceExceeded
        );
        assert_eq!(
            evaluate(&case, CallOutcome::Unrepresentable { message: "object".to_string() }).failure_kind,
            FailureKind::TypeMismatch
        );
        assert_eq!(
            evaluate(&case, CallOutcome::Crashed { message: "exit 1".to_string() }).failure_kind,
            FailureKind::RuntimeError
        );
    }

    #[test]
    fn test_diagnostic_is_bounded() {
        let case = make_case(json!([]), json!(1));
        let result = evaluate_case(
            &case,
            CallOutcome::Crashed {
                message: "y".repeat(10_000),
            },
            &ComparisonPolicy::default(),
            256,
        );
        assert!(result.diagnostic_text.len() <= 256);
    }

    #[test]
    fn test_float_tolerance_policy() {
        let case = make_case(json!([0.1, 0.2]), json!(0.3));
        let result = evaluate(&case, returned(json!(0.30000000000000004)));
        assert!(result.passed);
    }

    #[test]
    fn test_aggregate_all_pass() {
        let case = make_case(json!([1]), json!(1));
        let results = vec![evaluate(&case, returned(json!(1))), evaluate(&case, returned(json!(1)))];

        let result = aggregate(results);
        assert!(result.overall_passed);
        assert!(result.fatal_error.is_none());
        assert_eq!(result.case_results.len(), 2);
    }

    #[test]
    fn test_aggregate_partial_and_empty() {
        let case = make_case(json!([1]), json!(1));
        let results = vec![
            evaluate(&case, returned(json!(1))),
            evaluate(&case, returned(json!(2))),
            evaluate(&case, returned(json!(1))),
        ];

        let result = aggregate(results);
        assert!(!result.overall_passed);
        assert_eq!(result.first_failure().map(|(i, _)| i), Some(1));

        assert!(!aggregate(Vec::new()).overall_passed);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let case = make_case(json!([1]), json!(1));
        let first = aggregate(vec![
            evaluate(&case, returned(json!(1))),
            evaluate(&case, CallOutcome::TimedOut),
        ]);
        let second = aggregate(first.case_results.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreachable_case() {
        let case = make_case(json!([1]), json!(1));
        let result = unreachable_case(&case, "sandbox could not be restarted", 4096);
        assert!(!result.passed);
        assert_eq!(result.failure_kind, FailureKind::RuntimeError);
        assert_eq!(result.diagnostic_text, "sandbox could not be restarted");
    }

    #[test]
    fn test_expired_case() {
        let case = make_case(json!([2]), json!(4));
        let result = expired_case(&case, 4096);
        assert!(!result.passed);
        assert_eq!(result.failure_kind, FailureKind::Timeout);
        assert!(result.actual_output.is_none());
        assert!(result.diagnostic_text.contains("time budget"));
    }
}
