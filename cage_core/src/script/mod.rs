//! The restricted interpreter both isolation backends run submissions in.
//!
//! Submissions are Rhai scripts. The engine is built from an empty core plus
//! the standard package only: arithmetic, strings, arrays, maps, comparisons,
//! iteration and `print`/`debug`. Nothing that touches files, sockets,
//! processes or other modules is registered, and `eval` is switched off.
//!
//! This is an allow-list, not a capability system. On its own it only
//! protects the host as long as the interpreter itself has no bug, which is
//! why the process backend wraps it in a separate, locked-down process.

mod harness;
mod sandbox;

use std::time::Duration;

use log::debug;
use rhai::AST;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cancel::CancelToken,
    submission::{ExecutionLimits, Submission, TestCase},
    CaseFault, LimitBreach, TestReport,
};

use self::sandbox::{Failure, Sandbox};

/// Name of the constant holding the submission's standard input.
pub const STDIN_CONSTANT: &str = "STDIN";

/// What the interpreter needs from a submission. This is also the wire
/// format sent to the sandbox process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl From<&Submission> for ScriptRequest {
    fn from(v: &Submission) -> Self {
        Self {
            code: v.code.clone(),
            stdin: v.stdin.clone(),
            entry_point: v.entry_point.clone(),
            test_cases: v.test_cases.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptLimits {
    pub timeout: Duration,
    pub cpu_budget: Duration,
    pub memory_bytes: u64,
    pub output_limit: usize,
}

impl From<&ExecutionLimits> for ScriptLimits {
    fn from(v: &ExecutionLimits) -> Self {
        Self {
            timeout: v.timeout(),
            cpu_budget: v.cpu_budget(),
            memory_bytes: v.memory_bytes,
            output_limit: v.output_limit_bytes,
        }
    }
}

/// What one test case produced, in case order. Inputs and expectations stay
/// with the caller, who sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub passed: bool,
    #[serde(default)]
    pub actual_output: Option<Value>,
    #[serde(default)]
    pub error: Option<CaseFault>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptStatus {
    Completed { cases: Vec<CaseOutcome> },
    CompileError { message: String },
    /// Uncaught error in top-level code, outside any test case.
    Raised { fault: CaseFault },
    Breached { breach: LimitBreach },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptReport {
    pub status: ScriptStatus,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub cpu_time_ms: u64,
    /// Peak growth of resident memory seen while the script ran.
    pub memory_growth_bytes: u64,
}

/// Why the watchdog stopped a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    Breach(LimitBreach),
    Cancelled,
}

impl From<Trip> for ScriptStatus {
    fn from(v: Trip) -> Self {
        match v {
            Trip::Breach(breach) => ScriptStatus::Breached { breach },
            Trip::Cancelled => ScriptStatus::Cancelled,
        }
    }
}

/// Compile and run `request` in a fresh interpreter on the calling thread,
/// then run its test cases. Never panics on bad scripts.
pub fn run(request: &ScriptRequest, limits: &ScriptLimits, cancel: &CancelToken) -> ScriptReport {
    Prepared::new(request, limits, cancel).run()
}

/// Full per-case reports for `outcomes`, rebuilt from the cases in `request`.
pub fn case_reports(
    request: &ScriptRequest,
    outcomes: Vec<CaseOutcome>,
    output_limit: usize,
) -> Vec<TestReport> {
    harness::reports(request, outcomes, output_limit)
}

/// A submission compiled in its own interpreter, not started yet. Memory is
/// accounted from the moment it starts, so building the engine and parsing
/// the source are not charged to the script.
pub struct Prepared<'a> {
    request: &'a ScriptRequest,
    sandbox: Sandbox,
    compiled: std::result::Result<AST, String>,
}

impl<'a> Prepared<'a> {
    pub fn new(request: &'a ScriptRequest, limits: &ScriptLimits, cancel: &CancelToken) -> Self {
        let sandbox = Sandbox::new(limits, cancel.clone());
        let compiled = sandbox
            .engine
            .compile(&request.code)
            .map_err(|err| err.to_string());
        Self {
            request,
            sandbox,
            compiled,
        }
    }

    pub fn run(self) -> ScriptReport {
        self.sandbox.arm();
        let status = match &self.compiled {
            Ok(ast) => evaluate(&self.sandbox, ast, self.request),
            Err(message) => ScriptStatus::CompileError {
                message: message.clone(),
            },
        };
        debug!("script finished: {:?}", status_name(&status));
        self.sandbox.finish(status)
    }
}

fn evaluate(sandbox: &Sandbox, ast: &AST, request: &ScriptRequest) -> ScriptStatus {
    let mut scope = sandbox.scope(request.stdin.as_deref());
    // Stdio cases replay the whole script themselves.
    if !harness::replays_script(request) {
        if let Err(err) = sandbox.engine.run_ast_with_scope(&mut scope, ast) {
            return match sandbox.interpret(&err) {
                Failure::Trip(trip) => trip.into(),
                Failure::Fault(fault) => ScriptStatus::Raised { fault },
            };
        }
    }

    match harness::run_cases(sandbox, ast, &scope, request) {
        Ok(cases) => ScriptStatus::Completed { cases },
        Err(trip) => trip.into(),
    }
}

fn status_name(status: &ScriptStatus) -> &'static str {
    match status {
        ScriptStatus::Completed { .. } => "completed",
        ScriptStatus::CompileError { .. } => "compile_error",
        ScriptStatus::Raised { .. } => "raised",
        ScriptStatus::Breached { .. } => "breached",
        ScriptStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> ScriptLimits {
        ScriptLimits {
            timeout: Duration::from_millis(2000),
            cpu_budget: Duration::from_millis(2000),
            memory_bytes: 16 * 1024 * 1024,
            output_limit: 4096,
        }
    }

    fn request(code: &str) -> ScriptRequest {
        ScriptRequest {
            code: code.into(),
            stdin: None,
            entry_point: None,
            test_cases: vec![],
        }
    }

    #[test]
    fn prints_are_captured() {
        let report = run(&request("print(1 + 2); debug(\"dbg\");"), &limits(), &CancelToken::new());
        assert_eq!(report.status, ScriptStatus::Completed { cases: vec![] });
        assert_eq!(report.stdout, "3\n");
        assert!(report.stderr.contains("dbg"));
        assert!(!report.output_truncated);
    }

    #[test]
    fn syntax_error() {
        let report = run(&request("let x = ;"), &limits(), &CancelToken::new());
        assert!(matches!(report.status, ScriptStatus::CompileError { .. }));
    }

    #[test]
    fn top_level_throw() {
        let report = run(&request("print(\"before\"); throw \"boom\";"), &limits(), &CancelToken::new());
        match report.status {
            ScriptStatus::Raised { fault } => {
                assert_eq!(fault.kind, "Exception");
                assert!(fault.message.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.stdout, "before\n");
    }

    #[test]
    fn infinite_loop_times_out() {
        let limits = ScriptLimits {
            timeout: Duration::from_millis(200),
            ..limits()
        };
        let started = std::time::Instant::now();
        let report = run(&request("let x = 0; loop { x += 1; }"), &limits, &CancelToken::new());
        assert_eq!(
            report.status,
            ScriptStatus::Breached {
                breach: LimitBreach::Timeout
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn string_growth_exceeds_memory() {
        let limits = ScriptLimits {
            memory_bytes: 1024 * 1024,
            ..limits()
        };
        let report = run(&request("let s = \"x\"; loop { s += s; }"), &limits, &CancelToken::new());
        assert_eq!(
            report.status,
            ScriptStatus::Breached {
                breach: LimitBreach::MemoryExceeded
            }
        );
    }

    #[test]
    fn cancellation_stops_the_run() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run(&request("loop { }"), &limits(), &cancel);
        assert_eq!(report.status, ScriptStatus::Cancelled);
    }

    #[test]
    fn output_is_bounded() {
        let limits = ScriptLimits {
            output_limit: 64,
            ..limits()
        };
        let report = run(
            &request("for i in 0..1000 { print(\"line \" + i); }"),
            &limits,
            &CancelToken::new(),
        );
        assert!(matches!(report.status, ScriptStatus::Completed { .. }));
        assert!(report.stdout.len() <= 64);
        assert!(report.output_truncated);
    }

    #[test]
    fn stdin_constant() {
        let mut req = request("print(STDIN.len());");
        req.stdin = Some("abcd".into());
        let report = run(&req, &limits(), &CancelToken::new());
        assert_eq!(report.stdout, "4\n");
    }

    #[test]
    fn modules_and_eval_are_unavailable() {
        let report = run(&request("import \"os\" as os;"), &limits(), &CancelToken::new());
        assert!(!matches!(report.status, ScriptStatus::Completed { .. }));
        let report = run(&request("eval(\"1\")"), &limits(), &CancelToken::new());
        assert!(!matches!(report.status, ScriptStatus::Completed { .. }));
    }

    #[test]
    fn report_wire_format() -> crate::error::Result<()> {
        let report = run(&request("print(1);"), &limits(), &CancelToken::new());
        let wire = serde_json::to_value(&report)?;
        assert_eq!(wire["status"]["kind"], json!("completed"));
        assert_eq!(wire["status"]["cases"], json!([]));
        let back: ScriptReport = serde_json::from_value(wire)?;
        assert_eq!(back, report);
        Ok(())
    }
}
