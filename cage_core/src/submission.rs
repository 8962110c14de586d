use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const SUPPORTED_LANGUAGE: &str = "rhai";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Function called by cases that do not name one.
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Submission {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = Some(name.into());
        self
    }

    pub fn with_case(mut self, case: TestCase) -> Self {
        self.test_cases.push(case);
        self
    }

    pub fn check_language(&self) -> Result<()> {
        match &self.language {
            Some(tag) if !tag.eq_ignore_ascii_case(SUPPORTED_LANGUAGE) => Err(Error::Argument(
                format!("unsupported language `{}`", tag),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "empty_arguments")]
    pub input: Value,
    #[serde(alias = "output", default)]
    pub expected_output: Value,
    #[serde(default)]
    pub function_name: Option<String>,
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}

impl TestCase {
    pub fn new(input: Value, expected_output: Value) -> Self {
        Self {
            name: None,
            input,
            expected_output,
            function_name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn calling(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = Some(function_name.into());
        self
    }

    /// `index` is zero based.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("case {}", index + 1),
        }
    }
}

/// Limits for a single run. Milliseconds and bytes, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    pub timeout_ms: u64,
    pub memory_bytes: u64,
    /// Fraction of one CPU; the CPU time budget is `timeout_ms * cpu_quota`.
    pub cpu_quota: f64,
    pub output_limit_bytes: usize,
    pub network_allowed: bool,
    pub filesystem_allowed: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            memory_bytes: 50 * 1024 * 1024,
            cpu_quota: 1.0,
            output_limit_bytes: 64 * 1024,
            network_allowed: false,
            filesystem_allowed: false,
        }
    }
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cpu_budget(&self) -> Duration {
        Duration::from_millis((self.timeout_ms as f64 * self.cpu_quota).ceil() as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Argument("timeout must be positive".into()));
        }
        if self.memory_bytes == 0 {
            return Err(Error::Argument("memory ceiling must be positive".into()));
        }
        if !(self.cpu_quota > 0.0 && self.cpu_quota <= 1.0) {
            return Err(Error::Argument(format!(
                "cpu quota {} outside (0, 1]",
                self.cpu_quota
            )));
        }
        if self.output_limit_bytes == 0 {
            return Err(Error::Argument("output limit must be positive".into()));
        }
        if self.network_allowed || self.filesystem_allowed {
            return Err(Error::Argument(
                "network and filesystem access cannot be granted".into(),
            ));
        }
        Ok(())
    }
}
