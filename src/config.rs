use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do when the segment directory cannot be reached during a
/// conditional evaluation. Admission decisions always fail closed regardless
/// of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryFailurePolicy {
    /// Treat directory-backed predicates as false and keep going.
    FailOpen,
    /// Freeze the execution for operator attention.
    Freeze,
}

/// Engine-wide tuning knobs. Flow behaviour lives in the flow definition;
/// these only cover retries and failure policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total dispatch attempts per effect node, including the first one.
    pub max_attempts: u32,
    /// Backoff base for transient effector failures; doubles per retry.
    pub retry_base_delay: Duration,
    pub directory_policy: DirectoryFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            directory_policy: DirectoryFailurePolicy::Freeze,
        }
    }
}

impl EngineConfig {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset or unparsable. Loads a `.env` file first if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(raw) = env::var("RETENTIC_MAX_ATTEMPTS") {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => config.max_attempts = n,
                _ => warn!("ignoring invalid RETENTIC_MAX_ATTEMPTS: {}", raw),
            }
        }
        if let Ok(raw) = env::var("RETENTIC_RETRY_BASE_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => config.retry_base_delay = Duration::from_secs(secs),
                _ => warn!("ignoring invalid RETENTIC_RETRY_BASE_SECS: {}", raw),
            }
        }
        if let Ok(raw) = env::var("RETENTIC_DIRECTORY_POLICY") {
            match raw.as_str() {
                "fail_open" => config.directory_policy = DirectoryFailurePolicy::FailOpen,
                "freeze" => config.directory_policy = DirectoryFailurePolicy::Freeze,
                _ => warn!("ignoring invalid RETENTIC_DIRECTORY_POLICY: {}", raw),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.directory_policy, DirectoryFailurePolicy::Freeze);
    }
}
