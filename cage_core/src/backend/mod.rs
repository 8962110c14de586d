mod capture;
pub mod in_process;
pub mod process;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use self::{in_process::InProcessBackend, process::ProcessBackend};
use crate::{
    cancel::CancelToken,
    config::EngineConfig,
    error::Result,
    script::{ScriptRequest, ScriptStatus},
    submission::ExecutionLimits,
    LimitBreach,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    InProcess,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Process
    }
}

/// What one isolated run left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub exit_status: Option<i32>,
    pub wall_time: Duration,
    /// Bytes. Memory growth while the script ran, or peak RSS of a cell that
    /// never reported back.
    pub memory_used: u64,
    pub limit_hit: Option<LimitBreach>,
    /// `None` when the run ended without the interpreter reporting back.
    pub script: Option<ScriptStatus>,
}

/// Runs one script under limits. `Err` is reserved for infrastructure
/// faults and cancellation; anything the script itself does ends up in the
/// report.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        request: &ScriptRequest,
        limits: &ExecutionLimits,
        cancel: &CancelToken,
    ) -> Result<RunReport>;
}

pub fn from_config(config: &EngineConfig) -> Result<Box<dyn IsolationBackend>> {
    config.validate()?;
    let backend: Box<dyn IsolationBackend> = match config.backend {
        BackendKind::Process => {
            let cell = ProcessBackend::locate(config.cell_path.as_deref())?;
            Box::new(
                ProcessBackend::new(cell)
                    .with_kill_grace(config.kill_grace())
                    .with_network_isolation(
                        config.isolate_network,
                        config.require_network_isolation,
                    )
                    .with_filesystem_isolation(config.require_filesystem_isolation),
            )
        }
        BackendKind::InProcess => match config.host_memory_limit_bytes {
            Some(bytes) => Box::new(InProcessBackend::with_host_memory_limit(bytes)?),
            None => Box::new(InProcessBackend::new()),
        },
    };
    Ok(backend)
}
