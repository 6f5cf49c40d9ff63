use std::fmt;
use std::str::FromStr;

use super::CALLBACK_FAILURE_ENV;

/// What the reclamation hook does once every callback for a subject has run
/// and at least one of them panicked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log each failure and carry on.
    #[default]
    Report,
    /// Resume the first panic after the siblings ran. Falls back to
    /// [`FailurePolicy::Report`] when the thread is already unwinding.
    Propagate,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "propagate" => Ok(Self::Propagate),
            other => Err(format!(
                "unknown callback failure policy {other:?} (expected \"report\" or \"propagate\")"
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Report => write!(f, "report"),
            FailurePolicy::Propagate => write!(f, "propagate"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    pub failure_policy: FailurePolicy,
}

impl RegistryConfig {
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Reads `REAPER_CALLBACK_FAILURE`. Unset or blank keeps the default.
    pub fn from_env() -> Self {
        let raw = std::env::var(CALLBACK_FAILURE_ENV).ok();
        Self::from_env_value(raw.as_deref())
    }

    fn from_env_value(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };
        match raw.parse() {
            Ok(failure_policy) => Self { failure_policy },
            Err(err) => {
                tracing::warn!(
                    var = CALLBACK_FAILURE_ENV,
                    %err,
                    "ignoring invalid configuration"
                );
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(" Propagate ".parse::<FailurePolicy>(), Ok(FailurePolicy::Propagate));
        assert_eq!("REPORT".parse::<FailurePolicy>(), Ok(FailurePolicy::Report));
        assert!("abort".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn env_value_falls_back_to_default() {
        assert_eq!(RegistryConfig::from_env_value(None), RegistryConfig::default());
        assert_eq!(RegistryConfig::from_env_value(Some("  ")), RegistryConfig::default());
        assert_eq!(
            RegistryConfig::from_env_value(Some("sometimes")),
            RegistryConfig::default()
        );
        assert_eq!(
            RegistryConfig::from_env_value(Some("propagate")).failure_policy,
            FailurePolicy::Propagate
        );
    }
}
