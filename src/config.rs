//! Engine configuration loaded from environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the engine.
///
/// `Default` gives the built-in values; [`EngineConfig::from_env`] overlays any
/// `ROADMAP_*` variables that are set and parse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per unit of work before a version conflict is surfaced (ROADMAP_MAX_ATTEMPTS)
    pub max_attempts: u32,
    /// Base delay between conflict retries, multiplied by the attempt number (ROADMAP_RETRY_BACKOFF_MS)
    pub retry_backoff: Duration,
    /// Upper bound for one whole transaction including retries (ROADMAP_TRANSACTION_TIMEOUT_SECS)
    pub transaction_timeout: Duration,
    /// Per-call timeout for text generation, notification and progress collaborators (ROADMAP_COLLABORATOR_TIMEOUT_MS)
    pub collaborator_timeout: Duration,
    /// Extra attempts after a failed or timed out collaborator call (ROADMAP_COLLABORATOR_RETRIES)
    pub collaborator_retries: u32,
    /// Weight of each satisfied prerequisite when ranking next phases (ROADMAP_PREREQUISITE_WEIGHT)
    pub prerequisite_weight: f64,
    /// How long an expansion fingerprint collapses replays (ROADMAP_FINGERPRINT_TTL_SECS)
    pub fingerprint_ttl: Duration,
    /// Whether branch expansion is enabled at all (ROADMAP_DYNAMIC_EXPANSION)
    pub dynamic_expansion: bool,
    /// Refuse to complete a step whose dependencies are unfinished (ROADMAP_REQUIRE_DEPENDENCIES)
    pub require_dependencies: bool,
    /// Finished branches below a step before it is flagged for expansion (ROADMAP_EXPANSION_TRIGGER)
    pub expansion_trigger_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            transaction_timeout: Duration::from_secs(30),
            collaborator_timeout: Duration::from_millis(5000),
            collaborator_retries: 1,
            prerequisite_weight: 1.0,
            fingerprint_ttl: Duration::from_secs(86_400),
            dynamic_expansion: true,
            require_dependencies: true,
            expansion_trigger_threshold: roadmap_core::models::DEFAULT_EXPANSION_TRIGGER,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_attempts: env_parse("ROADMAP_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_attempts),
            retry_backoff: env_parse("ROADMAP_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            transaction_timeout: env_parse("ROADMAP_TRANSACTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.transaction_timeout),
            collaborator_timeout: env_parse("ROADMAP_COLLABORATOR_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.collaborator_timeout),
            collaborator_retries: env_parse("ROADMAP_COLLABORATOR_RETRIES")
                .unwrap_or(defaults.collaborator_retries),
            prerequisite_weight: env_parse("ROADMAP_PREREQUISITE_WEIGHT")
                .unwrap_or(defaults.prerequisite_weight),
            fingerprint_ttl: env_parse("ROADMAP_FINGERPRINT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fingerprint_ttl),
            dynamic_expansion: env_flag("ROADMAP_DYNAMIC_EXPANSION")
                .unwrap_or(defaults.dynamic_expansion),
            require_dependencies: env_flag("ROADMAP_REQUIRE_DEPENDENCIES")
                .unwrap_or(defaults.require_dependencies),
            expansion_trigger_threshold: env_parse("ROADMAP_EXPANSION_TRIGGER")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.expansion_trigger_threshold),
        }
    }

    /// Defaults with retry delays removed, for tests.
    pub fn without_backoff() -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
        assert_eq!(config.fingerprint_ttl, Duration::from_secs(86_400));
        assert!(config.dynamic_expansion);
        assert!(config.require_dependencies);
        assert_eq!(config.expansion_trigger_threshold, 3);
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        assert_eq!(env_parse::<u32>("ROADMAP_TEST_SURELY_UNSET_VARIABLE"), None);
        assert_eq!(env_flag("ROADMAP_TEST_SURELY_UNSET_VARIABLE"), None);
    }
}
