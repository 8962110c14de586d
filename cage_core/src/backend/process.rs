//! Runs the interpreter inside a separate `cage_cell` process.
//!
//! The cell gets an empty environment, a throwaway working directory, its own
//! process group and rlimits it applies to itself before touching the
//! script. The job goes in as JSON on stdin, a `ScriptReport` comes back as
//! JSON on stdout.

use std::{
    io::Write,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use super::{
    capture::{Captured, Collector},
    IsolationBackend, RunReport,
};
use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    probe::{signal_group, ProcessBio, ProcessProbe},
    script::{ScriptReport, ScriptRequest, ScriptStatus},
    submission::ExecutionLimits,
    LimitBreach,
};

pub const CELL_NAME: &str = "cage_cell";
/// Exit code of a cell that could not read or parse its job.
pub const CELL_EXIT_BAD_REQUEST: i32 = 2;
/// Exit code of a cell that could not lock itself down.
pub const CELL_EXIT_ENVIRONMENT: i32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
/// Room on the report pipe for JSON framing and per-case bookkeeping.
const REPORT_OVERHEAD: usize = 1024 * 1024;
const CASE_OVERHEAD: usize = 256;
/// Worst-case growth of text when written as a JSON string (`\u00XX`).
const JSON_ESCAPE_FACTOR: usize = 6;
const CELL_STDERR_LIMIT: usize = 64 * 1024;
/// What a user sees when the cell died without saying why.
const ABNORMAL_EXIT: &str = "process terminated abnormally";

pub struct ProcessBackend {
    cell: PathBuf,
    kill_grace: Duration,
    isolate_network: bool,
    require_network_isolation: bool,
    require_filesystem_isolation: bool,
}

impl ProcessBackend {
    pub fn new(cell: PathBuf) -> Self {
        Self {
            cell,
            kill_grace: DEFAULT_KILL_GRACE,
            isolate_network: true,
            require_network_isolation: false,
            require_filesystem_isolation: false,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_network_isolation(mut self, isolate: bool, required: bool) -> Self {
        self.isolate_network = isolate || required;
        self.require_network_isolation = required;
        self
    }

    /// The cell always denies itself the filesystem where the kernel lets it;
    /// `required` turns a kernel that cannot into a refused job.
    pub fn with_filesystem_isolation(mut self, required: bool) -> Self {
        self.require_filesystem_isolation = required;
        self
    }

    /// Find the cell binary: the configured path, next to the running
    /// executable (or one level up, for test binaries in `deps/`), then `PATH`.
    pub fn locate(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            return Err(Error::NotFound(path.to_string_lossy().to_string()));
        }
        if let Ok(exe) = std::env::current_exe() {
            for dir in exe.ancestors().skip(1).take(2) {
                let candidate = dir.join(CELL_NAME);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        which::which(CELL_NAME).map_err(|_| Error::NotFound(CELL_NAME.into()))
    }

    fn command(&self, limits: &ExecutionLimits, workdir: &Path) -> Command {
        let mut command = Command::new(&self.cell);
        command
            .arg("-t")
            .arg(limits.timeout_ms.to_string())
            .arg("-c")
            .arg(limits.cpu_budget().as_millis().to_string())
            .arg("-m")
            .arg(limits.memory_bytes.to_string())
            .arg("-o")
            .arg(limits.output_limit_bytes.to_string());
        if self.isolate_network {
            command.arg("--isolate-network");
        }
        if self.require_network_isolation {
            command.arg("--require-network-isolation");
        }
        if self.require_filesystem_isolation {
            command.arg("--require-filesystem-isolation");
        }
        command
            .env_clear()
            .current_dir(workdir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Wait for the cell, killing its group once the deadline passes or the
    /// caller cancels. Returns the reaped status and why we killed, if we did.
    fn supervise(
        &self,
        guard: &mut ChildGuard,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<(ProcessBio, Option<Kill>)> {
        let probe = ProcessProbe::new(guard.pid())?;
        loop {
            if let Some(bio) = probe.try_watching()? {
                guard.reaped = true;
                return Ok((bio, None));
            }
            let reason = if cancel.is_cancelled() {
                Some(Kill::Cancelled)
            } else if Instant::now() >= deadline {
                Some(Kill::Deadline)
            } else {
                None
            };
            if let Some(reason) = reason {
                warn!("stopping cell {}: {:?}", guard.pid(), reason);
                let bio = self.terminate(&probe)?;
                guard.reaped = true;
                return Ok((bio, Some(reason)));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn terminate(&self, probe: &ProcessProbe) -> Result<ProcessBio> {
        signal_group(probe.pid(), libc::SIGTERM);
        let grace_end = Instant::now() + self.kill_grace;
        while Instant::now() < grace_end {
            if let Some(bio) = probe.try_watching()? {
                return Ok(bio);
            }
            thread::sleep(POLL_INTERVAL);
        }
        signal_group(probe.pid(), libc::SIGKILL);
        probe.watching()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kill {
    Deadline,
    Cancelled,
}

/// Kills and reaps the cell on every path out of `run` that did not reap it.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            signal_group(self.child.id(), libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn run(
        &self,
        request: &ScriptRequest,
        limits: &ExecutionLimits,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let payload = serde_json::to_vec(request)?;
        let workdir = tempfile::Builder::new().prefix("cage-").tempdir()?;

        let started = Instant::now();
        let child = self.command(limits, workdir.path()).spawn()?;
        let mut guard = ChildGuard {
            child,
            reaped: false,
        };
        debug!("cell {} spawned in {:?}", guard.pid(), workdir.path());

        let stdout = guard
            .child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("cell stdout is not piped".into()))?;
        let stderr = guard
            .child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("cell stderr is not piped".into()))?;
        let out = Collector::spawn(stdout, report_capacity(request, limits))?;
        let err = Collector::spawn(stderr, CELL_STDERR_LIMIT)?;

        if let Some(mut cin) = guard.child.stdin.take() {
            // A cell that died early closes the pipe; its exit status tells why.
            if let Err(e) = cin.write_all(&payload).and_then(|_| cin.flush()) {
                warn!("failed to hand job to cell {}: {}", guard.pid(), e);
            }
        }

        let deadline = started + limits.timeout() + self.kill_grace;
        let (bio, killed) = self.supervise(&mut guard, deadline, cancel)?;
        let wall_time = started.elapsed();

        let out = out.join()?;
        let err = err.join()?;
        drop(workdir);

        if killed == Some(Kill::Cancelled) {
            return Err(Error::Cancelled);
        }
        classify(request, bio, killed, out, err, limits, wall_time)
    }
}

/// Upper bound on the size of an honest report. The cell never echoes case
/// data back; everything it does send is clipped to the output limit.
fn report_capacity(request: &ScriptRequest, limits: &ExecutionLimits) -> usize {
    let cases = request.test_cases.len();
    // stdout, stderr, then an answer and a fault message per case
    let texts = cases.saturating_mul(2).saturating_add(2);
    limits
        .output_limit_bytes
        .saturating_mul(texts)
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(cases.saturating_mul(CASE_OVERHEAD))
        .saturating_add(REPORT_OVERHEAD)
}

fn classify(
    request: &ScriptRequest,
    bio: ProcessBio,
    killed: Option<Kill>,
    out: Captured,
    err: Captured,
    limits: &ExecutionLimits,
    wall_time: Duration,
) -> Result<RunReport> {
    let cell_stderr = err.text();
    let exit_status = Some(bio.get_status());

    if killed.is_none() && bio.get_exit_code() == Some(0) {
        if !cell_stderr.is_empty() {
            debug!("cell stderr: {}", cell_stderr.trim_end());
        }
        let report = read_report(request, &out)?;
        let limit_hit = match report.status {
            ScriptStatus::Breached { breach } => Some(breach),
            ScriptStatus::Cancelled => return Err(Error::Cancelled),
            _ => None,
        };
        return Ok(RunReport {
            stdout: report.stdout,
            stderr: report.stderr,
            output_truncated: report.output_truncated,
            exit_status,
            wall_time,
            memory_used: report.memory_growth_bytes,
            limit_hit,
            script: Some(report.status),
        });
    }

    match bio.get_exit_code() {
        Some(CELL_EXIT_BAD_REQUEST) | Some(CELL_EXIT_ENVIRONMENT) => {
            error!("cell refused the job: {}", cell_stderr.trim_end());
            return Err(Error::Sandbox(format!(
                "cell exited with {}",
                bio.get_status()
            )));
        }
        _ => {}
    }

    let limit_hit = breach_evidence(&bio, killed, &cell_stderr, limits);
    match limit_hit {
        Some(breach) => warn!("cell breached {:?} (status {})", breach, bio.get_status()),
        None => warn!(
            "cell terminated abnormally (status {}): {}",
            bio.get_status(),
            cell_stderr.trim_end()
        ),
    }
    Ok(RunReport {
        stdout: String::new(),
        stderr: if limit_hit.is_some() {
            String::new()
        } else {
            ABNORMAL_EXIT.to_string()
        },
        output_truncated: out.truncated,
        exit_status,
        wall_time,
        memory_used: bio.get_peak_memory(),
        limit_hit,
        script: None,
    })
}

/// The report of a cell that exited cleanly. Anything unreadable here is our
/// fault, not the script's.
fn read_report(request: &ScriptRequest, out: &Captured) -> Result<ScriptReport> {
    if out.truncated {
        return Err(Error::Sandbox(format!(
            "cell report exceeds {} bytes",
            out.bytes.len()
        )));
    }
    let report: ScriptReport = serde_json::from_slice(&out.bytes)?;
    if let ScriptStatus::Completed { cases } = &report.status {
        if cases.len() != request.test_cases.len() {
            return Err(Error::Sandbox(format!(
                "cell reported {} cases, {} were sent",
                cases.len(),
                request.test_cases.len()
            )));
        }
    }
    Ok(report)
}

/// Why a cell that never reported back stopped, if a limit explains it.
fn breach_evidence(
    bio: &ProcessBio,
    killed: Option<Kill>,
    cell_stderr: &str,
    limits: &ExecutionLimits,
) -> Option<LimitBreach> {
    if killed == Some(Kill::Deadline) {
        return Some(LimitBreach::Timeout);
    }
    let cpu_budget_ms = limits.cpu_budget().as_millis() as u64;
    match bio.get_signal() {
        Some(libc::SIGXCPU) => return Some(LimitBreach::Timeout),
        Some(libc::SIGKILL) if bio.get_time_usage() >= cpu_budget_ms => {
            return Some(LimitBreach::Timeout)
        }
        _ => {}
    }
    // The address-space rlimit makes the allocator abort with this message.
    if cell_stderr.contains("memory allocation") {
        return Some(LimitBreach::MemoryExceeded);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_cell_must_exist() {
        let res = ProcessBackend::locate(Some(Path::new("/nonexistent/cage_cell")));
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[test]
    fn required_isolation_implies_isolation() {
        let backend = ProcessBackend::new("cell".into()).with_network_isolation(false, true);
        assert!(backend.isolate_network);
        assert!(backend.require_network_isolation);
    }

    fn captured(bytes: &[u8], truncated: bool) -> Captured {
        Captured {
            bytes: bytes.to_vec(),
            truncated,
        }
    }

    fn request_with_cases(n: usize) -> ScriptRequest {
        ScriptRequest {
            code: "fn f(x) { x }".into(),
            stdin: None,
            entry_point: Some("f".into()),
            test_cases: (0..n)
                .map(|i| crate::TestCase::new(serde_json::json!(i), serde_json::json!(i)))
                .collect(),
        }
    }

    #[test]
    fn unreadable_report_is_our_fault() {
        let request = request_with_cases(1);
        let res = read_report(&request, &captured(b"{\"status\":", true));
        assert!(matches!(res, Err(Error::Sandbox(_))));
        let res = read_report(&request, &captured(b"{\"status\":", false));
        assert!(matches!(res, Err(Error::Json(_))));
    }

    #[test]
    fn report_must_cover_every_case() -> Result<()> {
        let request = request_with_cases(2);
        let report = serde_json::to_vec(&ScriptReport {
            status: ScriptStatus::Completed {
                cases: vec![crate::script::CaseOutcome {
                    passed: true,
                    actual_output: Some(serde_json::json!(0)),
                    error: None,
                }],
            },
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            cpu_time_ms: 1,
            memory_growth_bytes: 0,
        })?;
        let res = read_report(&request, &captured(&report, false));
        assert!(matches!(res, Err(Error::Sandbox(_))));
        Ok(())
    }

    #[test]
    fn capacity_ignores_case_data() {
        let limits = ExecutionLimits::default();
        let mut small = request_with_cases(3);
        let base = report_capacity(&small, &limits);
        small.test_cases[0].input = serde_json::json!(vec![7; 100_000]);
        assert_eq!(report_capacity(&small, &limits), base);
        assert!(report_capacity(&request_with_cases(30), &limits) > base);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let backend = ProcessBackend::new("/nonexistent/cage_cell".into());
        let request = ScriptRequest {
            code: "1".into(),
            stdin: None,
            entry_point: None,
            test_cases: vec![],
        };
        let res = backend.run(&request, &ExecutionLimits::default(), &CancelToken::new());
        assert!(matches!(res, Err(Error::IO(_))));
    }
}
