//! Engine configuration.
//!
//! Values come from, in increasing precedence: defaults, an optional TOML
//! file, and environment variables. The CLI layers its flags on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::role::{Role, SettingsClass};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// What happens to the rest of a project when a required task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep running independent work; the project is failed at the end.
    #[default]
    Continue,
    /// Stop scheduling at the first required terminal failure.
    Abort,
}

/// Provider call parameters for one class of role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSettings {
    pub manager: GenerationSettings,
    pub worker: GenerationSettings,
    pub specialist: GenerationSettings,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            manager: GenerationSettings {
                max_tokens: 2000,
                temperature: 0.6,
            },
            worker: GenerationSettings {
                max_tokens: 1500,
                temperature: 0.7,
            },
            specialist: GenerationSettings {
                max_tokens: 2500,
                temperature: 0.5,
            },
        }
    }
}

impl RoleSettings {
    pub fn for_role(&self, role: Role) -> GenerationSettings {
        match role.settings_class() {
            SettingsClass::Manager => self.manager,
            SettingsClass::Worker => self.worker,
            SettingsClass::Specialist => self.specialist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission ceiling for concurrent provider calls.
    pub max_concurrent_requests: usize,
    /// Applies to each provider call and to each admission wait.
    pub request_timeout_secs: u64,
    pub max_task_retries: u32,
    pub max_agents: usize,
    /// Response cache TTL.
    pub cache_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub rate_limit_per_minute: Option<u32>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub tick_interval_ms: u64,
    /// Cooldown before an agent in `error` returns to `idle`.
    pub agent_recovery_ms: u64,
    pub latency_window: usize,
    pub event_capacity: usize,
    pub failure_policy: FailurePolicy,
    /// Append a manager review task after every planned project.
    pub review_tasks: bool,
    pub model: String,
    pub roles: RoleSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout_secs: 30,
            max_task_retries: 3,
            max_agents: 20,
            cache_timeout_secs: 300,
            cache_enabled: true,
            cache_max_entries: 1024,
            rate_limit_per_minute: None,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            tick_interval_ms: 100,
            agent_recovery_ms: 1000,
            latency_window: 256,
            event_capacity: 256,
            failure_policy: FailurePolicy::Continue,
            review_tasks: true,
            model: DEFAULT_MODEL.to_string(),
            roles: RoleSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with variables from `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::default().with_vars(lookup)
    }

    /// Read a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay recognised environment-style variables onto `self`.
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = parse("MAX_CONCURRENT_REQUESTS", v)?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT") {
            self.request_timeout_secs = parse("REQUEST_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("MAX_TASK_RETRIES") {
            self.max_task_retries = parse("MAX_TASK_RETRIES", v)?;
        }
        if let Some(v) = lookup("MAX_AGENTS") {
            self.max_agents = parse("MAX_AGENTS", v)?;
        }
        if let Some(v) = lookup("CACHE_TIMEOUT") {
            self.cache_timeout_secs = parse("CACHE_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("CACHE_ENABLED") {
            self.cache_enabled = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "CACHE_ENABLED".into(),
                        value: v,
                    });
                }
            };
        }
        if let Some(v) = lookup("RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = Some(parse("RATE_LIMIT_PER_MINUTE", v)?);
        }
        if let Some(v) = lookup("ANTHROPIC_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = v.trim().to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_concurrent_requests", self.max_concurrent_requests as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("max_agents", self.max_agents as u64),
            ("tick_interval_ms", self.tick_interval_ms),
            ("event_capacity", self.event_capacity as u64),
            ("latency_window", self.latency_window as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        for (class, settings) in [
            ("manager", self.roles.manager),
            ("worker", self.roles.worker),
            ("specialist", self.roles.specialist),
        ] {
            if !(0.0..=1.0).contains(&settings.temperature) {
                return Err(ConfigError::Temperature {
                    class,
                    value: settings.temperature,
                });
            }
            if settings.max_tokens == 0 {
                return Err(ConfigError::Zero("max_tokens"));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn agent_recovery(&self) -> Duration {
        Duration::from_millis(self.agent_recovery_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_requests, 10);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.roles.for_role(Role::Manager).max_tokens, 2000);
        assert_eq!(config.roles.for_role(Role::Worker).temperature, 0.7);
        assert_eq!(config.roles.for_role(Role::Devops).max_tokens, 2500);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_vars(vars(&[
            ("MAX_CONCURRENT_REQUESTS", "4"),
            ("REQUEST_TIMEOUT", " 12 "),
            ("CACHE_ENABLED", "off"),
            ("RATE_LIMIT_PER_MINUTE", "50"),
            ("ANTHROPIC_MODEL", "claude-test"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.request_timeout_secs, 12);
        assert!(!config.cache_enabled);
        assert_eq!(config.rate_limit_per_minute, Some(50));
        assert_eq!(config.model, "claude-test");
    }

    #[test]
    fn bad_env_values_are_reported() {
        let err = EngineConfig::from_vars(vars(&[("MAX_TASK_RETRIES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_TASK_RETRIES"));

        let err = EngineConfig::from_vars(vars(&[("MAX_CONCURRENT_REQUESTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("max_concurrent_requests")));
    }

    #[test]
    fn temperature_out_of_range_is_rejected() {
        let mut config = EngineConfig::default();
        config.roles.worker.temperature = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Temperature { class: "worker", .. })
        ));
    }

    #[test]
    fn toml_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devcrew.toml");
        std::fs::write(
            &path,
            "max_concurrent_requests = 3\nfailure_policy = \"abort\"\n\n[roles.manager]\nmax_tokens = 900\ntemperature = 0.2\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_requests, 3);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.roles.manager.max_tokens, 900);
        assert_eq!(config.roles.worker.max_tokens, 1500);
        assert_eq!(config.max_task_retries, 3);
    }
}
