use std::{env, fs, path::PathBuf, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    backend::BackendKind,
    error::{Error, Result},
    precheck::PreCheck,
    submission::ExecutionLimits,
};

/// Environment variable naming the engine configuration file.
pub const CONFIG_ENV: &str = "CAGE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// The in-process backend shares the host's fault domain; it has to be
    /// asked for twice.
    pub allow_in_process: bool,
    pub host_memory_limit_bytes: Option<u64>,
    pub cell_path: Option<PathBuf>,
    pub slots: usize,
    pub kill_grace_ms: u64,
    pub isolate_network: bool,
    pub require_network_isolation: bool,
    /// Limits for submissions that do not bring their own.
    pub limits: ExecutionLimits,
    pub deny_list: Option<Vec<String>>,
    /// YAML file of the form `patterns: [...]`. Exclusive with `deny_list`.
    pub deny_file: Option<PathBuf>,
    pub require_filesystem_isolation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Process,
            allow_in_process: false,
            host_memory_limit_bytes: None,
            cell_path: None,
            slots: 4,
            kill_grace_ms: 500,
            isolate_network: true,
            require_network_isolation: false,
            limits: ExecutionLimits::default(),
            deny_list: None,
            deny_file: None,
            require_filesystem_isolation: false,
        }
    }
}

impl EngineConfig {
    fn from_string(content: &str) -> Result<Self> {
        let v: Self = serde_yaml::from_str(content)?;
        v.validate()?;
        Ok(v)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_string(&content)
    }

    /// Load from `path`, else from `$CAGE_CONFIG`, else defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let from_env = env::var(CONFIG_ENV).ok();
        match path.or(from_env.as_deref()) {
            Some(path) => {
                debug!("loading engine config from {}", path);
                Self::from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(Error::Config("slots must be at least 1".into()));
        }
        if self.backend == BackendKind::InProcess && !self.allow_in_process {
            return Err(Error::Config(
                "in_process backend requires allow_in_process".into(),
            ));
        }
        if self.deny_list.is_some() && self.deny_file.is_some() {
            return Err(Error::Config(
                "deny_list and deny_file are mutually exclusive".into(),
            ));
        }
        if let Some(0) = self.host_memory_limit_bytes {
            return Err(Error::Config("host memory limit must be positive".into()));
        }
        self.limits
            .validate()
            .map_err(|e| Error::Config(format!("default limits: {}", e)))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn precheck(&self) -> Result<PreCheck> {
        match (&self.deny_list, &self.deny_file) {
            (Some(patterns), _) => PreCheck::new(patterns.iter().map(|f| f.as_str()).collect()),
            (None, Some(path)) => {
                debug!("loading deny list from {}", path.display());
                PreCheck::from_file(path)
            }
            (None, None) => PreCheck::with_defaults(),
        }
    }
}
