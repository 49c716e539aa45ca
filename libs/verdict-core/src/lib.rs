//! Grading engine for untrusted function submissions.
//!
//! A [`Grader`] validates a submission, loads it into an isolated sandbox,
//! calls the required function once per test case, compares each return
//! value against the expected one and reports a structured verdict.

pub mod comparator;
pub mod coordinator;
pub mod diagnostics;
pub mod evaluator;
pub mod harness;
pub mod pool;
pub mod sandbox;


pub use coordinator::Grader;
