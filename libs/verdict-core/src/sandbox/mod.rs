//! Sandbox Runner - isolated execution of untrusted submissions
//!
//! **Core Responsibility:**
//! Load a submission into a fresh interpreter that lives in its own OS
//! process (or container), then invoke the required function once per call.
//!
//! **Critical Architectural Boundary:**
//! - The sandbox knows HOW to execute (process, Docker)
//! - The sandbox does NOT know expected outputs or scoring rules
//! - Every failure is returned as a value; nothing escapes as a panic
//!
//! **Isolation Rules:**
//! - One interpreter per loaded submission, never shared between submissions
//! - No network, no subprocesses, no filesystem outside the scratch area,
//!   enforced by the kernel (namespaces, rlimits, seccomp or a container)
//! - Wall-clock timeout per call, enforced by killing the interpreter
//! - Memory ceiling per interpreter

pub mod confine;
pub mod docker;
pub mod process;
pub mod protocol;
pub mod scratch;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use verdict_common::config::{BackendKind, GraderConfig, LanguageConfigManager};
use verdict_common::types::{Language, Limits};

use self::confine::ConfinementSettings;
use self::docker::DockerSandbox;
use self::process::ProcessSandbox;
use self::scratch::ScratchAllocator;

/// Harness executed inside every Python sandbox
pub const PYTHON_HARNESS: &str = include_str!("harness.py");

/// How a test-case input is passed to the target function.
///
/// - object → keyword call, `f(**input)`
/// - array → positional call, `f(*input)`
/// - any other value → a single positional argument, `f(input)`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", content = "args", rename_all = "lowercase")]
pub enum Invocation {
    Keyword(Map<String, Value>),
    Positional(Vec<Value>),
}

impl Invocation {
    pub fn from_input(input: &Value) -> Self {
        match input {
            Value::Object(fields) => Invocation::Keyword(fields.clone()),
            Value::Array(items) => Invocation::Positional(items.clone()),
            other => Invocation::Positional(vec![other.clone()]),
        }
    }
}

/// Everything a sandbox needs to load one submission
#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub source_code: &'a str,
    pub function_name: &'a str,
    pub language: Language,
    pub limits: Limits,
}

/// Submission-level failure before any case runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    DefinitionMissing(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Raw result of one call into a loaded function
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Returned {
        value: Value,
        stdout: String,
        stderr: String,
    },
    Raised {
        message: String,
        traceback: String,
        stderr: String,
    },
    TimedOut,
    ResourceExceeded {
        message: String,
    },
    /// The function returned something outside the JSON value domain
    Unrepresentable {
        message: String,
    },
    /// The interpreter died or the channel broke mid-call
    Crashed {
        message: String,
    },
}

impl CallOutcome {
    /// True when the interpreter can no longer be trusted for further calls
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            CallOutcome::TimedOut | CallOutcome::Crashed { .. }
        )
    }
}

/// Outcome of the one-shot `execute` primitive
#[derive(Debug, Clone, PartialEq)]
pub enum RawExecutionOutcome {
    Completed(CallOutcome),
    LoadFailed(LoadError),
}

/// A sandbox backend able to load submissions
#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedFunction>, LoadError>;
}

/// A submission loaded into a live interpreter
#[async_trait]
pub trait LoadedFunction: Send {
    async fn call(&mut self, invocation: &Invocation, timeout: Duration) -> CallOutcome;

    /// False once a call timed out or the interpreter died
    fn is_usable(&self) -> bool;

    /// Terminate the interpreter and release its scratch space
    async fn shutdown(self: Box<Self>);
}

#[derive(Debug, Clone)]
pub struct SandboxRunner {
    sandbox: Arc<dyn Sandbox>,
}

impl SandboxRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    pub fn backend(&self) -> &'static str {
        self.sandbox.name()
    }

    pub async fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedFunction>, LoadError> {
        self.sandbox.load(request).await
    }

    /// Load, call once with `input`, tear down
    pub async fn execute(&self, request: &LoadRequest<'_>, input: &Value) -> RawExecutionOutcome {
        let mut function = match self.load(request).await {
            Ok(function) => function,
            Err(e) => return RawExecutionOutcome::LoadFailed(e),
        };

        let outcome = function
            .call(&Invocation::from_input(input), request.limits.timeout())
            .await;
        function.shutdown().await;

        RawExecutionOutcome::Completed(outcome)
    }
}

/// Build the configured backend
pub fn build_sandbox(
    config: &GraderConfig,
    languages: &LanguageConfigManager,
) -> anyhow::Result<Arc<dyn Sandbox>> {
    let sandbox: Arc<dyn Sandbox> = match config.backend {
        BackendKind::Process => Arc::new(ProcessSandbox::new(
            languages.clone(),
            ScratchAllocator::new(&config.scratch_dir),
            config.max_response_bytes,
            ConfinementSettings::from_config(config),
        )),
        BackendKind::Docker => Arc::new(DockerSandbox::new_with_config(
            languages,
            config.max_response_bytes,
        )?),
    };
    Ok(sandbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_branches() {
        assert_eq!(
            Invocation::from_input(&json!({"a": 2, "b": 3})),
            Invocation::Keyword(json!({"a": 2, "b": 3}).as_object().unwrap().clone())
        );
        assert_eq!(
            Invocation::from_input(&json!([2, 3])),
            Invocation::Positional(vec![json!(2), json!(3)])
        );
        assert_eq!(
            Invocation::from_input(&json!("abc")),
            Invocation::Positional(vec![json!("abc")])
        );
        // a single list argument must be wrapped by the problem author
        assert_eq!(
            Invocation::from_input(&json!([[1, 2, 3]])),
            Invocation::Positional(vec![json!([1, 2, 3])])
        );
    }

    #[test]
    fn test_invocation_wire_format() {
        let keyword = serde_json::to_value(Invocation::from_input(&json!({"a": 1}))).unwrap();
        assert_eq!(keyword, json!({"mode": "keyword", "args": {"a": 1}}));

        let positional = serde_json::to_value(Invocation::from_input(&json!(7))).unwrap();
        assert_eq!(positional, json!({"mode": "positional", "args": [7]}));
    }

    #[test]
    fn test_poisoning_outcomes() {
        assert!(CallOutcome::TimedOut.poisons_session());
        assert!(CallOutcome::Crashed { message: String::new() }.poisons_session());
        assert!(!CallOutcome::ResourceExceeded { message: String::new() }.poisons_session());
        assert!(!CallOutcome::Returned {
            value: json!(1),
            stdout: String::new(),
            stderr: String::new(),
        }
        .poisons_session());
    }
}
