//! Grading Coordinator - public entry point of the engine.
//!
//! **Lifecycle of one grading:**
//! Received → Validating → {Rejected | Loading} → {LoadFailed | Executing}
//! → Aggregated → Returned
//!
//! Every failure below this layer, a panic included, comes back as a
//! `SubmissionResult` with `fatalError` set. Nothing is retried here; the
//! caller decides whether a `SandboxUnavailable` is worth another attempt.

use crate::evaluator::aggregate;
use crate::harness::TestHarness;
use crate::pool::WorkerPool;
use crate::sandbox::{build_sandbox, LoadError, LoadRequest, Sandbox, SandboxRunner};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use verdict_common::config::{GraderConfig, LanguageConfigManager};
use verdict_common::types::{
    ComparisonPolicy, FatalErrorKind, GradingRequest, Language, Limits, ProblemSpec, Submission,
    SubmissionResult,
};

/// Largest accepted submission; the Docker backend ships source through the environment
pub const MAX_SOURCE_CODE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradingStage {
    Received,
    Validating,
    Rejected,
    Loading,
    LoadFailed,
    Executing,
    Aggregated,
    Returned,
}

impl fmt::Display for GradingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GradingStage::Received => "received",
            GradingStage::Validating => "validating",
            GradingStage::Rejected => "rejected",
            GradingStage::Loading => "loading",
            GradingStage::LoadFailed => "load_failed",
            GradingStage::Executing => "executing",
            GradingStage::Aggregated => "aggregated",
            GradingStage::Returned => "returned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("functionName must not be empty")]
    EmptyFunctionName,
    #[error("functionName '{0}' is not a valid identifier")]
    InvalidFunctionName(String),
    #[error("testCases must not be empty")]
    NoTestCases,
    #[error("sourceCode must not be empty")]
    EmptySource,
    #[error("sourceCode exceeds {limit} bytes")]
    SourceTooLarge { limit: usize },
    #[error("language '{0}' is not supported")]
    UnsupportedLanguage(String),
    #[error("limits.{field} must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("comparison.floatEpsilon must be a finite, non-negative number")]
    InvalidEpsilon,
}

impl From<&LoadError> for FatalErrorKind {
    fn from(error: &LoadError) -> Self {
        match error {
            LoadError::Compile(_) => FatalErrorKind::CompileError,
            LoadError::DefinitionMissing(_) => FatalErrorKind::DefinitionMissing,
            LoadError::Unavailable(_) => FatalErrorKind::SandboxUnavailable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Grader {
    config: GraderConfig,
    languages: LanguageConfigManager,
    runner: SandboxRunner,
    pool: WorkerPool,
}

impl Grader {
    pub fn new(config: GraderConfig, languages: LanguageConfigManager, sandbox: Arc<dyn Sandbox>) -> Self {
        let pool = WorkerPool::new(config.max_concurrent, config.max_queued);
        Self {
            config,
            languages,
            runner: SandboxRunner::new(sandbox),
            pool,
        }
    }

    /// Build a grader with the sandbox backend named in `config`
    pub fn from_config(config: GraderConfig, languages: LanguageConfigManager) -> anyhow::Result<Self> {
        let sandbox = build_sandbox(&config, &languages)?;
        Ok(Self::new(config, languages, sandbox))
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn backend(&self) -> &'static str {
        self.runner.backend()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Grade a submission with the default limits for its language
    pub async fn grade(&self, problem: &ProblemSpec, submission: &Submission) -> SubmissionResult {
        self.grade_with_limits(problem, submission, None).await
    }

    /// Grade a request as it arrives over the JSON boundary
    pub async fn grade_request(&self, request: GradingRequest) -> SubmissionResult {
        let language = match request.language_id.parse::<Language>() {
            Ok(language) => language,
            Err(e) => {
                warn!(language_id = %request.language_id, stage = %GradingStage::Rejected, error = %e, "Unknown language");
                return SubmissionResult::fatal(
                    FatalErrorKind::ValidationError,
                    ValidationError::UnsupportedLanguage(request.language_id).to_string(),
                );
            }
        };

        let problem = request.problem();
        let submission = Submission {
            source_code: request.source_code,
            language,
        };
        self.grade_with_limits(&problem, &submission, request.limits).await
    }

    #[instrument(
        skip_all,
        fields(
            grading_id = %uuid::Uuid::new_v4(),
            function = %problem.function_name,
            language = %submission.language,
            cases = problem.test_cases.len(),
        )
    )]
    pub async fn grade_with_limits(
        &self,
        problem: &ProblemSpec,
        submission: &Submission,
        limits: Option<Limits>,
    ) -> SubmissionResult {
        let started = Instant::now();
        info!(stage = %GradingStage::Received, "Grading submission");

        let result = match AssertUnwindSafe(self.run(problem, submission, limits))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Grading panicked");
                SubmissionResult::fatal(
                    FatalErrorKind::SandboxUnavailable,
                    format!("internal grading failure: {}", message),
                )
            }
        };

        info!(
            stage = %GradingStage::Returned,
            overall_passed = result.overall_passed,
            fatal = ?result.fatal_error.as_ref().map(|f| f.kind),
            passed = result.passed_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Grading finished"
        );
        result
    }

    async fn run(&self, problem: &ProblemSpec, submission: &Submission, limits: Option<Limits>) -> SubmissionResult {
        info!(stage = %GradingStage::Validating, "Validating submission");
        let (limits, policy) = match self.validate(problem, submission, limits) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(stage = %GradingStage::Rejected, error = %e, "Submission rejected");
                return SubmissionResult::fatal(FatalErrorKind::ValidationError, e.to_string());
            }
        };

        // Released on every exit path, including cancellation
        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "No sandbox slot available");
                return SubmissionResult::fatal(FatalErrorKind::SandboxUnavailable, e.to_string());
            }
        };

        info!(
            stage = %GradingStage::Loading,
            backend = self.runner.backend(),
            timeout_ms = limits.timeout_ms,
            memory_mb = limits.memory_mb,
            "Loading submission"
        );
        let request = LoadRequest {
            source_code: &submission.source_code,
            function_name: &problem.function_name,
            language: submission.language,
            limits,
        };

        // Execution budget for the whole submission, reloads included
        let deadline = tokio::time::Instant::now() + limits.timeout() + self.config.grading_overhead();

        let loaded = match self.runner.load(&request).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let kind = FatalErrorKind::from(&e);
                warn!(stage = %GradingStage::LoadFailed, kind = %kind, error = %e, "Submission failed to load");
                return SubmissionResult::fatal(kind, e.to_string());
            }
        };

        info!(stage = %GradingStage::Executing, "Running test cases");
        let harness = TestHarness::new(
            &self.runner,
            request,
            self.config.isolation,
            policy,
            self.config.diagnostic_limit,
            deadline,
        );
        let case_results = harness.run_all(problem, loaded).await;

        let result = aggregate(case_results);
        info!(stage = %GradingStage::Aggregated, overall_passed = result.overall_passed, "Verdict computed");
        result
    }

    /// Check the inputs and resolve the effective limits and comparison policy
    fn validate(
        &self,
        problem: &ProblemSpec,
        submission: &Submission,
        limits: Option<Limits>,
    ) -> Result<(Limits, ComparisonPolicy), ValidationError> {
        if problem.function_name.trim().is_empty() {
            return Err(ValidationError::EmptyFunctionName);
        }
        if !is_identifier(&problem.function_name) {
            return Err(ValidationError::InvalidFunctionName(problem.function_name.clone()));
        }
        if problem.test_cases.is_empty() {
            return Err(ValidationError::NoTestCases);
        }
        if submission.source_code.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if submission.source_code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(ValidationError::SourceTooLarge {
                limit: MAX_SOURCE_CODE_BYTES,
            });
        }

        let language_config = self
            .languages
            .get_config(&submission.language)
            .map_err(|_| ValidationError::UnsupportedLanguage(submission.language.to_string()))?;

        let requested = limits.unwrap_or(Limits {
            timeout_ms: self.config.default_limits.timeout_ms,
            memory_mb: u64::from(language_config.memory_limit_mb),
        });
        let limits = self.clamp_limits(requested)?;

        let base = ComparisonPolicy {
            float_epsilon: self.config.float_epsilon,
            ..ComparisonPolicy::default()
        };
        let policy = problem
            .comparison
            .map_or(base, |comparison| comparison.apply_to(base));
        if !policy.float_epsilon.is_finite() || policy.float_epsilon < 0.0 {
            return Err(ValidationError::InvalidEpsilon);
        }

        Ok((limits, policy))
    }

    fn clamp_limits(&self, requested: Limits) -> Result<Limits, ValidationError> {
        if requested.timeout_ms == 0 {
            return Err(ValidationError::ZeroLimit { field: "timeoutMs" });
        }
        if requested.memory_mb == 0 {
            return Err(ValidationError::ZeroLimit { field: "memoryMb" });
        }

        let mut limits = requested;
        if limits.timeout_ms > self.config.max_timeout_ms {
            warn!(
                requested = limits.timeout_ms,
                max = self.config.max_timeout_ms,
                "Timeout above ceiling, clamping"
            );
            limits.timeout_ms = self.config.max_timeout_ms;
        }
        if limits.memory_mb > self.config.max_memory_mb {
            warn!(
                requested = limits.memory_mb,
                max = self.config.max_memory_mb,
                "Memory limit above ceiling, clamping"
            );
            limits.memory_mb = self.config.max_memory_mb;
        }
        Ok(limits)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("add"));
        assert!(is_identifier("_private2"));
        assert!(is_identifier("größe"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("os.system('x')"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_load_error_kinds() {
        assert_eq!(
            FatalErrorKind::from(&LoadError::Compile("x".into())),
            FatalErrorKind::CompileError
        );
        assert_eq!(
            FatalErrorKind::from(&LoadError::DefinitionMissing("x".into())),
            FatalErrorKind::DefinitionMissing
        );
        assert_eq!(
            FatalErrorKind::from(&LoadError::Unavailable("x".into())),
            FatalErrorKind::SandboxUnavailable
        );
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(GradingStage::LoadFailed.to_string(), "load_failed");
        assert_eq!(GradingStage::Returned.to_string(), "returned");
    }
}
