//! Runs the interpreter on a worker thread of the host process.
//!
//! Weak isolation: the script shares the host's address space and fault
//! domain, the watchdog only fires between interpreter operations, and
//! memory is accounted as RSS growth of the whole host. Only enabled when
//! the engine configuration opts in.

use std::{thread, time::Instant};

use log::{debug, error};

use super::{IsolationBackend, RunReport};
use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    probe::Rlimit,
    script::{self, ScriptLimits, ScriptRequest, ScriptStatus},
    submission::ExecutionLimits,
};

/// Deep recursion in the interpreter needs far more than the default 2 MiB.
const WORKER_STACK: usize = 32 * 1024 * 1024;

pub struct InProcessBackend {
    stack_size: usize,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self {
            stack_size: WORKER_STACK,
        }
    }

    /// Cap the address space of the whole host process. Affects every thread,
    /// not only the workers.
    pub fn with_host_memory_limit(bytes: u64) -> Result<Self> {
        Rlimit::AddressSpace.apply(bytes, bytes)?;
        debug!("host address space capped at {} bytes", bytes);
        Ok(Self::new())
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn run(
        &self,
        request: &ScriptRequest,
        limits: &ExecutionLimits,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let job = request.clone();
        let script_limits = ScriptLimits::from(limits);
        let token = cancel.clone();

        let started = Instant::now();
        let worker = thread::Builder::new()
            .name("cage-worker".into())
            .stack_size(self.stack_size)
            .spawn(move || script::run(&job, &script_limits, &token))?;
        let report = worker.join().map_err(|_| {
            error!("interpreter worker panicked");
            Error::Sandbox("interpreter worker panicked".into())
        })?;
        let wall_time = started.elapsed();

        let (exit_status, limit_hit) = match &report.status {
            ScriptStatus::Completed { .. } => (Some(0), None),
            ScriptStatus::CompileError { .. } | ScriptStatus::Raised { .. } => (Some(1), None),
            ScriptStatus::Breached { breach } => (None, Some(*breach)),
            ScriptStatus::Cancelled => return Err(Error::Cancelled),
        };

        Ok(RunReport {
            stdout: report.stdout,
            stderr: report.stderr,
            output_truncated: report.output_truncated,
            exit_status,
            wall_time,
            memory_used: report.memory_growth_bytes,
            limit_hit,
            script: Some(report.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LimitBreach;

    fn request(code: &str) -> ScriptRequest {
        ScriptRequest {
            code: code.into(),
            stdin: None,
            entry_point: None,
            test_cases: vec![],
        }
    }

    #[test]
    fn plain_run() -> Result<()> {
        let report = InProcessBackend::new().run(
            &request("print(\"hi\");"),
            &ExecutionLimits::default(),
            &CancelToken::new(),
        )?;
        assert_eq!(report.stdout, "hi\n");
        assert_eq!(report.exit_status, Some(0));
        assert_eq!(report.limit_hit, None);
        Ok(())
    }

    #[test]
    fn deep_recursion_is_contained() -> Result<()> {
        let report = InProcessBackend::new().run(
            &request("fn f(n) { f(n + 1) } f(0);"),
            &ExecutionLimits::default(),
            &CancelToken::new(),
        )?;
        assert_eq!(report.exit_status, Some(1));
        assert!(matches!(report.script, Some(ScriptStatus::Raised { .. })));
        Ok(())
    }

    #[test]
    fn timeout_is_a_breach() -> Result<()> {
        let limits = ExecutionLimits {
            timeout_ms: 150,
            ..Default::default()
        };
        let report =
            InProcessBackend::new().run(&request("loop {}"), &limits, &CancelToken::new())?;
        assert_eq!(report.limit_hit, Some(LimitBreach::Timeout));
        assert_eq!(report.exit_status, None);
        Ok(())
    }

    #[test]
    fn cancellation_is_an_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let res = InProcessBackend::new().run(&request("loop {}"), &ExecutionLimits::default(), &cancel);
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
