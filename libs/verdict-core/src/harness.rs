//! Test Harness - drives one loaded submission through every test case.
//!
//! Cases run in declared order and every case is attempted, including the
//! ones after the first failure. A call that times out or crashes leaves the
//! interpreter unusable; the next case then gets a freshly loaded one so the
//! poisoned state never leaks forward.
//!
//! The whole run shares one deadline. Each call gets the smaller of the
//! per-call timeout and the time left; once the deadline has passed, the
//! remaining cases are recorded as `Timeout` and no interpreter is started
//! for them.

use crate::evaluator::{evaluate_case, expired_case, unreachable_case};
use crate::sandbox::{Invocation, LoadRequest, LoadedFunction, SandboxRunner};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use verdict_common::config::IsolationPolicy;
use verdict_common::types::{CaseResult, ComparisonPolicy, ProblemSpec};

pub struct TestHarness<'a> {
    runner: &'a SandboxRunner,
    request: LoadRequest<'a>,
    isolation: IsolationPolicy,
    policy: ComparisonPolicy,
    diagnostic_limit: usize,
    deadline: Instant,
}

impl<'a> TestHarness<'a> {
    pub fn new(
        runner: &'a SandboxRunner,
        request: LoadRequest<'a>,
        isolation: IsolationPolicy,
        policy: ComparisonPolicy,
        diagnostic_limit: usize,
        deadline: Instant,
    ) -> Self {
        Self {
            runner,
            request,
            isolation,
            policy,
            diagnostic_limit,
            deadline,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run every case of `problem` against `loaded`, one result per case in order
    pub async fn run_all(&self, problem: &ProblemSpec, loaded: Box<dyn LoadedFunction>) -> Vec<CaseResult> {
        let timeout = self.request.limits.timeout();
        let mut results = Vec::with_capacity(problem.test_cases.len());
        let mut current = Some(loaded);

        for (index, case) in problem.test_cases.iter().enumerate() {
            let remaining = self.remaining();
            if remaining.is_zero() {
                debug!(case = index, "Grading deadline passed");
                results.push(expired_case(case, self.diagnostic_limit));
                continue;
            }

            let fresh_needed = index > 0
                && (self.isolation == IsolationPolicy::PerCase
                    || current.as_ref().map_or(true, |f| !f.is_usable()));

            if fresh_needed {
                if let Some(previous) = current.take() {
                    previous.shutdown().await;
                }

                match tokio::time::timeout(remaining, self.runner.load(&self.request)).await {
                    Ok(Ok(function)) => current = Some(function),
                    Ok(Err(e)) => {
                        warn!(case = index, error = %e, "Failed to reload submission");
                        results.push(unreachable_case(
                            case,
                            &format!("sandbox could not be restarted: {}", e),
                            self.diagnostic_limit,
                        ));
                        continue;
                    }
                    Err(_) => {
                        debug!(case = index, "Grading deadline passed while reloading");
                        results.push(expired_case(case, self.diagnostic_limit));
                        continue;
                    }
                }
            }

            let Some(function) = current.as_mut() else {
                results.push(unreachable_case(
                    case,
                    "sandbox could not be restarted",
                    self.diagnostic_limit,
                ));
                continue;
            };

            let budget = timeout.min(self.remaining());
            if budget.is_zero() {
                results.push(expired_case(case, self.diagnostic_limit));
                continue;
            }

            let outcome = function
                .call(&Invocation::from_input(&case.input), budget)
                .await;
            let result = evaluate_case(case, outcome, &self.policy, self.diagnostic_limit);

            debug!(
                case = index,
                passed = result.passed,
                failure_kind = %result.failure_kind,
                "Case evaluated"
            );
            results.push(result);
        }

        if let Some(function) = current {
            function.shutdown().await;
        }

        results
    }
}
