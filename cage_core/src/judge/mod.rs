pub mod verdict;

use log::{debug, error, info, warn};

use crate::{
    backend::{self, IsolationBackend, RunReport},
    cancel::CancelToken,
    config::EngineConfig,
    error::{Error, Result},
    precheck::PreCheck,
    script::{self, ScriptRequest, ScriptStatus},
    slots::SlotPool,
    submission::{ExecutionLimits, Submission},
    ExecutionResult, Outcome,
};

/// Message for every infrastructure fault. Details only go to the log.
const INTERNAL_MESSAGE: &str = "internal error";
const CANCELLED_MESSAGE: &str = "execution cancelled";

/// Where one submission is in its life. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    PreChecking,
    Running,
    Collecting,
    Done(Outcome),
}

/// The stages one submission went through, in order.
struct Lifecycle {
    stage: Stage,
    visited: Vec<Stage>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            stage: Stage::Pending,
            visited: vec![Stage::Pending],
        }
    }

    fn advance(&mut self, next: Stage) {
        debug!("stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
        self.visited.push(next);
    }

    fn finish(&mut self, result: ExecutionResult) -> ExecutionResult {
        self.advance(Stage::Done(result.outcome));
        result
    }
}

/// Judges submissions. Shareable between threads; holds no per-submission
/// state.
pub struct Executor {
    config: EngineConfig,
    precheck: PreCheck,
    backend: Box<dyn IsolationBackend>,
    slots: SlotPool,
}

impl Executor {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let backend = backend::from_config(&config)?;
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: EngineConfig, backend: Box<dyn IsolationBackend>) -> Result<Self> {
        config.validate()?;
        let precheck = config.precheck()?;
        info!(
            "executor ready: backend {}, {} slots",
            backend.name(),
            config.slots
        );
        Ok(Self {
            slots: SlotPool::new(config.slots),
            precheck,
            backend,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Pre-check only, without running anything.
    pub fn precheck(&self, code: &str) -> crate::precheck::CheckOutcome {
        self.precheck.check(code)
    }

    pub fn execute(&self, submission: &Submission) -> ExecutionResult {
        self.execute_with(submission, None, &CancelToken::new())
    }

    /// Judge `submission` under `limits`, or the configured defaults. Always
    /// produces exactly one result.
    pub fn execute_with(
        &self,
        submission: &Submission,
        limits: Option<ExecutionLimits>,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        self.judge(submission, limits, cancel).0
    }

    fn judge(
        &self,
        submission: &Submission,
        limits: Option<ExecutionLimits>,
        cancel: &CancelToken,
    ) -> (ExecutionResult, Vec<Stage>) {
        let mut stage = Lifecycle::new();
        stage.advance(Stage::PreChecking);
        let result = self.judge_in(submission, limits, cancel, &mut stage);
        (result, stage.visited)
    }

    fn judge_in(
        &self,
        submission: &Submission,
        limits: Option<ExecutionLimits>,
        cancel: &CancelToken,
        stage: &mut Lifecycle,
    ) -> ExecutionResult {
        if let Err(err) = submission.check_language() {
            let reason = match err {
                Error::Argument(reason) => reason,
                other => other.to_string(),
            };
            return stage.finish(ExecutionResult::bare(Outcome::CompileOrSyntaxError, reason));
        }

        let limits = limits.unwrap_or_else(|| self.config.limits.clone());
        if let Err(err) = limits.validate() {
            error!("rejected execution limits {:?}: {}", limits, err);
            return stage.finish(internal_error());
        }

        let check = self.precheck.check(&submission.code);
        if !check.allowed {
            info!("submission rejected by pre-check: {}", check.reason);
            return stage.finish(ExecutionResult::bare(
                Outcome::SecurityRejected,
                check.reason,
            ));
        }

        let request = ScriptRequest::from(submission);
        let run = self.run_isolated(&request, &limits, cancel, stage);
        // Breaches go straight to Done.
        if !matches!(&run, Ok(report) if report.limit_hit.is_some()) {
            stage.advance(Stage::Collecting);
        }

        let result = match run {
            Ok(report) => collect(report, &request, &limits),
            Err(Error::Cancelled) => {
                warn!("submission cancelled");
                ExecutionResult::bare(Outcome::InternalError, CANCELLED_MESSAGE)
            }
            Err(err) => {
                error!("{} backend failed: {:?}", self.backend.name(), err);
                internal_error()
            }
        };
        info!(
            "verdict {:?} in {} ms",
            result.outcome, result.wall_time_ms
        );
        stage.finish(result)
    }

    /// Holds a slot for exactly one backend call; never retried.
    fn run_isolated(
        &self,
        request: &ScriptRequest,
        limits: &ExecutionLimits,
        cancel: &CancelToken,
        stage: &mut Lifecycle,
    ) -> Result<RunReport> {
        let _slot = self.slots.acquire(cancel)?;
        stage.advance(Stage::Running);
        self.backend.run(request, limits, cancel)
    }
}

fn internal_error() -> ExecutionResult {
    ExecutionResult::bare(Outcome::InternalError, INTERNAL_MESSAGE)
}

fn collect(report: RunReport, request: &ScriptRequest, limits: &ExecutionLimits) -> ExecutionResult {
    let (outcome, message) = verdict::judge_run(&report);
    let per_test_results = match report.script {
        Some(ScriptStatus::Completed { cases }) => {
            script::case_reports(request, cases, limits.output_limit_bytes)
        }
        _ => Vec::new(),
    };
    ExecutionResult {
        outcome,
        message,
        stdout: report.stdout,
        stderr: report.stderr,
        output_truncated: report.output_truncated,
        per_test_results,
        wall_time_ms: report.wall_time.as_millis() as u64,
        memory_used_bytes: report.memory_used,
        exit_status: report.exit_status,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use serde_json::json;

    use super::*;
    use crate::{backend::BackendKind, backend::InProcessBackend, TestCase};

    /// Wraps the in-process backend and counts calls.
    struct CountingBackend {
        inner: InProcessBackend,
        calls: Arc<AtomicUsize>,
    }

    impl IsolationBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(
            &self,
            request: &ScriptRequest,
            limits: &ExecutionLimits,
            cancel: &CancelToken,
        ) -> Result<RunReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.run(request, limits, cancel)
        }
    }

    struct FailingBackend;

    impl IsolationBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _: &ScriptRequest, _: &ExecutionLimits, _: &CancelToken) -> Result<RunReport> {
            Err(Error::Sandbox("/var/lib/cage/cell exploded".into()))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            backend: BackendKind::InProcess,
            allow_in_process: true,
            ..Default::default()
        }
    }

    fn executor() -> (Executor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend {
            inner: InProcessBackend::new(),
            calls: calls.clone(),
        };
        let executor = Executor::with_backend(config(), Box::new(backend)).unwrap();
        (executor, calls)
    }

    fn add_submission(expected: i64) -> Submission {
        Submission::new("fn add(a, b) { a + b }")
            .with_entry_point("add")
            .with_case(TestCase::new(json!({"a": 2, "b": 3}), json!(expected)))
    }

    #[test]
    fn rejected_code_never_reaches_backend() {
        let (executor, calls) = executor();
        let result = executor.execute(&Submission::new("import \"fs\" as fs;"));
        assert_eq!(result.outcome, Outcome::SecurityRejected);
        assert_eq!(result.message.as_deref(), Some("forbidden construct: import"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.slots().available(), 4);
    }

    #[test]
    fn backend_called_exactly_once() {
        let (executor, calls) = executor();
        let result = executor.execute(&add_submission(5));
        assert_eq!(result.outcome, Outcome::Accepted);
        assert_eq!(result.passed_cases(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result = executor.execute(&Submission::new("throw \"x\";"));
        assert_eq!(result.outcome, Outcome::RuntimeError);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.slots().available(), 4);
    }

    #[test]
    fn wrong_answer_keeps_evaluating() {
        let (executor, _) = executor();
        let submission = add_submission(6)
            .with_case(TestCase::new(json!([1, 1]), json!(2)).named("second"));
        let result = executor.execute(&submission);
        assert_eq!(result.outcome, Outcome::WrongAnswer);
        assert_eq!(result.per_test_results.len(), 2);
        assert!(!result.per_test_results[0].passed);
        assert!(result.per_test_results[1].passed);
    }

    #[test]
    fn unsupported_language() {
        let (executor, calls) = executor();
        let mut submission = add_submission(5);
        submission.language = Some("python".into());
        let result = executor.execute(&submission);
        assert_eq!(result.outcome, Outcome::CompileOrSyntaxError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_limits_are_internal() {
        let (executor, calls) = executor();
        let limits = ExecutionLimits {
            filesystem_allowed: true,
            ..Default::default()
        };
        let result = executor.execute_with(&add_submission(5), Some(limits), &CancelToken::new());
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_within_bound() {
        let (executor, _) = executor();
        let limits = ExecutionLimits {
            timeout_ms: 200,
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let result = executor.execute_with(
            &Submission::new("let i = 0; loop { i += 1; }"),
            Some(limits),
            &CancelToken::new(),
        );
        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
    }

    #[test]
    fn breach_skips_collecting() {
        let (executor, _) = executor();
        let limits = ExecutionLimits {
            timeout_ms: 100,
            ..Default::default()
        };
        let (result, visited) =
            executor.judge(&Submission::new("loop {}"), Some(limits), &CancelToken::new());
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(
            visited,
            [
                Stage::Pending,
                Stage::PreChecking,
                Stage::Running,
                Stage::Done(Outcome::Timeout)
            ]
        );

        let (result, visited) = executor.judge(&add_submission(5), None, &CancelToken::new());
        assert_eq!(result.outcome, Outcome::Accepted);
        assert_eq!(visited[3], Stage::Collecting);
        assert_eq!(visited[4], Stage::Done(Outcome::Accepted));
    }

    #[test]
    fn over_allocation_is_memory_exceeded() {
        let (executor, _) = executor();
        let limits = ExecutionLimits {
            memory_bytes: 2 * 1024 * 1024,
            ..Default::default()
        };
        let result = executor.execute_with(
            &Submission::new("let a = []; loop { a.push(\"xxxxxxxx\"); }"),
            Some(limits),
            &CancelToken::new(),
        );
        assert_eq!(result.outcome, Outcome::MemoryExceeded);
    }

    #[test]
    fn cancelled_before_start() {
        let (executor, calls) = executor();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = executor.execute_with(&add_submission(5), None, &cancel);
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.message.as_deref(), Some("execution cancelled"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_while_running() {
        let (executor, _) = executor();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(100));
            trigger.cancel();
        });
        let result = executor.execute_with(&Submission::new("loop {}"), None, &cancel);
        canceller.join().unwrap();
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.message.as_deref(), Some("execution cancelled"));
        assert_eq!(executor.slots().available(), 4);
    }

    #[test]
    fn backend_fault_is_opaque() {
        let executor = Executor::with_backend(config(), Box::new(FailingBackend)).unwrap();
        let result = executor.execute(&add_submission(5));
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.message.as_deref(), Some("internal error"));
        assert_eq!(executor.slots().available(), 4);
    }

    #[test]
    fn repeated_runs_do_not_leak_state() {
        let (executor, _) = executor();
        let code = "let counter = 0; counter += 1; print(counter);";
        let first = executor.execute(&Submission::new(code));
        let second = executor.execute(&Submission::new(code));
        assert_eq!(first.outcome, Outcome::Accepted);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.stdout, "1\n");
        assert_eq!(second.stdout, "1\n");
    }

    #[test]
    fn concurrent_results_are_attributed() {
        let (executor, calls) = executor();
        let executor = Arc::new(executor);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let executor = executor.clone();
                thread::spawn(move || {
                    let code = format!("for n in 0..50 {{ print({}); }}", i);
                    (i, executor.execute(&Submission::new(code)))
                })
            })
            .collect();
        for handle in handles {
            let (i, result) = handle.join().unwrap();
            assert_eq!(result.outcome, Outcome::Accepted);
            let expected = format!("{}\n", i).repeat(50);
            assert_eq!(result.stdout, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(executor.slots().available(), 4);
    }
}
