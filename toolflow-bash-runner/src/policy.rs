use regex::Regex;

/// Deny patterns applied when configuration does not supply its own.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[a-zA-Z]*r[a-zA-Z]*f?[a-zA-Z]*\s+/(\s|$)",
    r"\bmkfs(\.\w+)?\b",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r"\bdd\s+.*\bof=/dev/",
    r"(?i)\bFormat-Volume\b",
    r"(?i)\bRemove-Item\b.*-Recurse.*\s[A-Za-z]:\\?(\s|$)",
];

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Gatekeeper consulted with the translated command before anything runs.
pub trait CommandPolicy: Send + Sync {
    fn validate(&self, native_command: &str) -> PolicyDecision;
}

pub struct AllowAllPolicy;

impl CommandPolicy for AllowAllPolicy {
    fn validate(&self, _native_command: &str) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// Denies any command matching one of a set of regular expressions.
#[derive(Debug, Clone)]
pub struct PatternPolicy {
    deny: Vec<Regex>,
}

impl PatternPolicy {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let deny = patterns
            .into_iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { deny })
    }

    pub fn with_defaults() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_DENY_PATTERNS.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.deny.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty()
    }
}

impl CommandPolicy for PatternPolicy {
    fn validate(&self, native_command: &str) -> PolicyDecision {
        match self.deny.iter().find(|re| re.is_match(native_command)) {
            Some(re) => PolicyDecision::deny(format!(
                "command matches deny pattern `{}`",
                re.as_str()
            )),
            None => PolicyDecision::allow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_compile_and_block_destructive_commands() {
        let policy = PatternPolicy::with_defaults().unwrap();
        assert_eq!(policy.len(), DEFAULT_DENY_PATTERNS.len());

        for command in ["rm -rf /", "sudo mkfs.ext4 /dev/sda1", "shutdown -h now", "dd if=/dev/zero of=/dev/sda"] {
            let decision = policy.validate(command);
            assert!(!decision.allowed, "{command}");
            assert!(decision.reason.unwrap().contains("deny pattern"));
        }

        for command in ["rm -rf ./target", "ls -la", "cargo test", "test -f Cargo.toml"] {
            assert!(policy.validate(command).allowed, "{command}");
        }
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(PatternPolicy::new(["(unclosed"]).is_err());
    }

    #[test]
    fn allow_all_allows() {
        assert_eq!(AllowAllPolicy.validate("anything"), PolicyDecision::allow());
    }
}
