//! Human-readable feedback built from a finished `SubmissionResult`.
//!
//! Explainers only ever see the structured result, never sandbox internals.
//! Hosted-model explainers live outside this crate and implement the same
//! trait.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Write as _;
use verdict_common::types::{CaseResult, FailureKind, SubmissionResult};

#[async_trait]
pub trait DiagnosticExplainer: Send + Sync {
    async fn explain(&self, result: &SubmissionResult) -> Result<String>;
}

/// Deterministic plain-text summary of the fatal error or the failing cases
#[derive(Debug, Clone)]
pub struct SummaryExplainer {
    max_cases: usize,
}

impl Default for SummaryExplainer {
    fn default() -> Self {
        Self { max_cases: 3 }
    }
}

impl SummaryExplainer {
    pub fn new(max_cases: usize) -> Self {
        Self { max_cases }
    }

    pub fn render(&self, result: &SubmissionResult) -> String {
        if let Some(fatal) = &result.fatal_error {
            return format!("Submission could not be graded ({}).\n{}", fatal.kind, fatal.message);
        }

        let total = result.case_results.len();
        let passed = result.passed_count();
        if result.overall_passed {
            return format!("All {} test cases passed.", total);
        }

        let mut out = format!("{}/{} test cases passed.", passed, total);
        let failing: Vec<(usize, &CaseResult)> = result
            .case_results
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.passed)
            .collect();

        for (index, case) in failing.iter().take(self.max_cases) {
            let _ = write!(out, "\n\nCase {}: {}", index + 1, describe(case));
            let _ = write!(out, "\n  input:    {}", compact(&case.input));
            let _ = write!(out, "\n  expected: {}", compact(&case.expected_output));
            if let Some(actual) = &case.actual_output {
                let _ = write!(out, "\n  actual:   {}", compact(actual));
            }
            if let Some(line) = last_meaningful_line(&case.diagnostic_text) {
                let _ = write!(out, "\n  detail:   {}", line);
            }
        }

        if failing.len() > self.max_cases {
            let _ = write!(out, "\n\n...and {} more failing cases.", failing.len() - self.max_cases);
        }

        out
    }
}

#[async_trait]
impl DiagnosticExplainer for SummaryExplainer {
    async fn explain(&self, result: &SubmissionResult) -> Result<String> {
        Ok(self.render(result))
    }
}

fn describe(case: &CaseResult) -> &'static str {
    match case.failure_kind {
        FailureKind::None => "wrong answer",
        FailureKind::RuntimeError => "runtime error",
        FailureKind::Timeout => "time limit exceeded",
        FailureKind::ResourceExceeded => "resource limit exceeded",
        FailureKind::TypeMismatch => "returned the wrong type",
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

// Tracebacks end with the exception line, which is the useful part
fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty() && *l != "[truncated]")
}
