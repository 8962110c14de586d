use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Entries starting with this prefix are regular expressions, the rest are
/// plain substrings.
pub const PATTERN_PREFIX: &str = "re:";

pub const DEFAULT_DENY_LIST: [&str; 12] = [
    "import ",
    "__import__",
    "eval",
    "exec(",
    "compile(",
    "open(",
    "file(",
    "input(",
    "socket",
    "subprocess",
    r"re:\bfn\s*\(",
    r"re:\bcurry\s*\(",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub reason: String,
}

impl CheckOutcome {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }
}

enum DenyRule {
    Substring { raw: String, lowered: String },
    Pattern { raw: String, regex: Regex },
}

impl DenyRule {
    fn parse(raw: &str) -> Result<Self> {
        if let Some(pattern) = raw.strip_prefix(PATTERN_PREFIX) {
            let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
            Ok(DenyRule::Pattern {
                raw: raw.to_string(),
                regex,
            })
        } else if raw.trim().is_empty() {
            Err(Error::Config("empty deny pattern".into()))
        } else {
            Ok(DenyRule::Substring {
                raw: raw.to_string(),
                lowered: raw.to_lowercase(),
            })
        }
    }

    fn matches(&self, code: &str, lowered_code: &str) -> bool {
        match self {
            DenyRule::Substring { lowered, .. } => lowered_code.contains(lowered.as_str()),
            DenyRule::Pattern { regex, .. } => regex.is_match(code),
        }
    }

    fn raw(&self) -> &str {
        match self {
            DenyRule::Substring { raw, .. } | DenyRule::Pattern { raw, .. } => raw,
        }
    }
}

/// Fast, conservative text scan run before any execution resource is spent.
///
/// Over-rejection is acceptable. This is never the only line of defence: it
/// cannot see dangerous calls that are assembled at run time.
#[derive(Serialize, Deserialize)]
pub struct PreCheck {
    #[serde(skip_serializing, skip_deserializing)]
    _rules: Vec<DenyRule>,
    patterns: Vec<String>,
}

impl PreCheck {
    pub fn new(patterns: Vec<&str>) -> Result<Self> {
        let mut v = Self {
            _rules: Vec::new(),
            patterns: patterns.into_iter().map(|f| f.to_string()).collect(),
        };
        v.init()?;
        Ok(v)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_DENY_LIST.to_vec())
    }

    fn from_string(content: &str) -> Result<Self> {
        let mut v: Self = serde_yaml::from_str(content)?;
        v.init()?;
        Ok(v)
    }

    /// Load a deny file of the form `patterns: [...]`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_string(&content)
    }

    fn init(&mut self) -> Result<()> {
        if self.patterns.is_empty() {
            return Err(Error::Config("deny list is empty".into()));
        }
        self._rules = self
            .patterns
            .iter()
            .map(|f| DenyRule::parse(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn check(&self, code: &str) -> CheckOutcome {
        let lowered = code.to_lowercase();
        for rule in self._rules.iter() {
            if rule.matches(code, &lowered) {
                return CheckOutcome {
                    allowed: false,
                    reason: format!("forbidden construct: {}", rule.raw().trim()),
                };
            }
        }
        CheckOutcome::allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_arithmetic_passes() -> Result<()> {
        let check = PreCheck::with_defaults()?;
        let res = check.check("fn add(a, b) { a + b }\nprint(add(1, 2));");
        assert!(res.allowed);
        assert!(res.reason.is_empty());
        Ok(())
    }

    #[test]
    fn module_import_rejected() -> Result<()> {
        let check = PreCheck::with_defaults()?;
        let res = check.check("import \"secrets\" as s;");
        assert!(!res.allowed);
        assert_eq!(res.reason, "forbidden construct: import");
        Ok(())
    }

    #[test]
    fn matching_ignores_case() -> Result<()> {
        let check = PreCheck::with_defaults()?;
        assert!(!check.check("let x = EVAL(\"1\");").allowed);
        assert!(!check.check("let f = FN (\"add\");").allowed);
        Ok(())
    }

    #[test]
    fn function_definitions_are_not_pointers() -> Result<()> {
        let check = PreCheck::with_defaults()?;
        assert!(check.check("fn helper(x) { x * 2 }").allowed);
        assert!(!check.check("let f = Fn(\"helper\");").allowed);
        Ok(())
    }

    #[test]
    fn custom_list() -> Result<()> {
        let check = PreCheck::new(vec!["loop", r"re:while\s+true"])?;
        assert!(!check.check("loop { }").allowed);
        assert!(!check.check("while   TRUE { }").allowed);
        assert!(check.check("eval").allowed);
        Ok(())
    }

    #[test]
    fn from_yaml() -> Result<()> {
        let check = PreCheck::from_string("patterns:\n  - danger\n")?;
        assert_eq!(check.patterns(), &["danger".to_string()]);
        assert!(!check.check("let danger = 1;").allowed);
        Ok(())
    }

    #[test]
    fn broken_pattern_is_config_error() {
        assert!(matches!(
            PreCheck::new(vec!["re:(unclosed"]),
            Err(Error::Pattern(_))
        ));
        assert!(matches!(PreCheck::new(vec![]), Err(Error::Config(_))));
    }
}
