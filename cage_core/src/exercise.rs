use std::fs;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    submission::{ExecutionLimits, Submission, TestCase},
};

/// An instructor-defined problem: the function to call and the cases to
/// call it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub name: String,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    #[serde(alias = "cases")]
    pub test_cases: Vec<TestCase>,
}

impl Exercise {
    fn from_string(content: &str) -> Result<Self> {
        let v: Self = serde_yaml::from_str(content)?;
        v.check_valid()?;
        Ok(v)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_string(&content)
    }

    fn check_valid(&self) -> Result<()> {
        if self.test_cases.is_empty() {
            return Err(Error::Argument(format!(
                "exercise `{}` has no test cases",
                self.name
            )));
        }
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        Ok(())
    }

    pub fn submission(&self, code: impl Into<String>) -> Submission {
        Submission {
            code: code.into(),
            language: None,
            stdin: None,
            entry_point: self.entry_point.clone(),
            test_cases: self.test_cases.clone(),
        }
    }
}
