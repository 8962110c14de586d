pub mod backend;
pub mod cancel;
pub mod compare;
pub mod config;
pub mod error;
pub mod exercise;
pub mod judge;
pub mod precheck;
pub mod probe;
pub mod script;
pub mod slots;
pub mod submission;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use judge::Executor;
pub use submission::{ExecutionLimits, Submission, TestCase};

/// Everything the engine knows about one finished submission.
///
/// Produced exactly once per `Executor::execute` call. Persisting it is the
/// caller's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Human readable reason for rejections, compile errors and faults.
    pub message: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub per_test_results: Vec<TestReport>,
    pub wall_time_ms: u64,
    pub memory_used_bytes: u64,
    pub exit_status: Option<i32>,
}

impl ExecutionResult {
    pub(crate) fn bare(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: Some(message.into()),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            per_test_results: Vec::new(),
            wall_time_ms: 0,
            memory_used_bytes: 0,
            exit_status: None,
        }
    }

    pub fn passed_cases(&self) -> usize {
        self.per_test_results.iter().filter(|r| r.passed).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub passed: bool,
    pub input: Value,
    pub expected_output: Value,
    pub actual_output: Option<Value>,
    pub error: Option<CaseFault>,
}

/// An exception raised while evaluating a single test case, or a mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFault {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    WrongAnswer,
    RuntimeError,
    CompileOrSyntaxError,
    Timeout,
    MemoryExceeded,
    SecurityRejected,
    InternalError,
}

impl Outcome {
    /// Higher wins when several outcomes are possible for one run.
    pub fn precedence(self) -> u8 {
        match self {
            Outcome::SecurityRejected => 7,
            Outcome::InternalError => 6,
            Outcome::Timeout => 5,
            Outcome::MemoryExceeded => 4,
            Outcome::CompileOrSyntaxError => 3,
            Outcome::RuntimeError => 2,
            Outcome::WrongAnswer => 1,
            Outcome::Accepted => 0,
        }
    }
}

/// A resource limit the run crossed. Never conflated with a plain non-zero
/// exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBreach {
    Timeout,
    MemoryExceeded,
}

impl From<LimitBreach> for Outcome {
    fn from(v: LimitBreach) -> Self {
        match v {
            LimitBreach::Timeout => Outcome::Timeout,
            LimitBreach::MemoryExceeded => Outcome::MemoryExceeded,
        }
    }
}
