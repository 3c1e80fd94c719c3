//! Runtime configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty file (or no file at all) yields a working configuration.
//!
//! Lookup order:
//! 1. explicit path (`--config` / `CHI_AGENT_CONFIG`)
//! 2. `~/.config/chi-agent/config.toml`
//! 3. built-in defaults

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::security::{default_rules, DenyRule, SafetyGuard};
use crate::tools::ToolsConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("deny rule '{name}' has an invalid pattern: {source}")]
    InvalidRule {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("{0} must be greater than zero")]
    ZeroBudget(&'static str),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub safety: SafetyConfig,
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    pub telemetry: TelemetryConfig,
}

/// Model endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Model used for chat
    pub model: String,
    /// Pulled on first start when `model` is not available locally
    pub fallback_model: String,
    pub request_timeout_secs: u64,
    /// Delay before the single retry of a failed model call
    pub retry_backoff_ms: u64,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "chi".to_string(),
            fallback_model: "qwen3:8b".to_string(),
            request_timeout_secs: 120,
            retry_backoff_ms: 500,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Replaces the built-in rule set when present in the file
    pub rules: Vec<DenyRule>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `history.db` and the provisioning marker
    pub data_dir: PathBuf,
    /// Inactivity gap after which a new conversation starts
    pub session_gap_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chi-agent");
        Self {
            data_dir,
            session_gap_hours: 2,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join("provisioned.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unix socket for the desktop UI
    pub socket_path: PathBuf,
    /// Status HTTP endpoint for the panel indicator and metrics
    pub status_addr: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            socket_path: runtime_dir.join("chi-agent.sock"),
            status_addr: "127.0.0.1:7878".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    /// Overrides the default log filter (RUST_LOG still wins)
    pub log_filter: Option<String>,
}

impl Config {
    /// Default location: `~/.config/chi-agent/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("chi-agent").join("config.toml"))
    }

    /// Load, falling back to the default path and then to defaults.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.safety.rules {
            regex::Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidRule {
                name: rule.name.clone(),
                source,
            })?;
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::ZeroBudget("agent.max_tool_rounds"));
        }
        if self.agent.denied_repeat_limit == 0 {
            return Err(ConfigError::ZeroBudget("agent.denied_repeat_limit"));
        }
        if self.tools.shell_timeout_secs == 0 {
            return Err(ConfigError::ZeroBudget("tools.shell_timeout_secs"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroBudget("model.request_timeout_secs"));
        }
        if self.storage.session_gap_hours == 0 {
            return Err(ConfigError::ZeroBudget("storage.session_gap_hours"));
        }
        Ok(())
    }

    /// Compile the configured deny rules
    pub fn safety_guard(&self) -> Result<SafetyGuard, ConfigError> {
        SafetyGuard::new(&self.safety.rules).map_err(|source| ConfigError::InvalidRule {
            name: "<rule set>".to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.model.model, "chi");
        assert_eq!(config.agent.max_tool_rounds, 6);
        assert_eq!(config.agent.denied_repeat_limit, 2);
        assert_eq!(config.tools.shell_timeout_secs, 30);
        assert_eq!(config.storage.session_gap_hours, 2);
        assert_eq!(config.safety.rules, default_rules());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            [model]
            model = "llama3.2"

            [agent]
            max_tool_rounds = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.model.model, "llama3.2");
        assert_eq!(config.model.base_url, "http://localhost:11434");
        assert_eq!(config.agent.max_tool_rounds, 3);
        assert_eq!(config.agent.denied_repeat_limit, 2);
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let config = Config::from_toml(
            r#"
            [[safety.rules]]
            name = "no_reboot"
            pattern = '\breboot\b'
            reason = "rebooting"
            "#,
        )
        .unwrap();
        assert_eq!(config.safety.rules.len(), 1);
        let guard = config.safety_guard().unwrap();
        assert!(!guard.check("systemctl reboot").is_allowed());
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let config = Config::from_toml(
            r#"
            [[safety.rules]]
            name = "broken"
            pattern = "(oops"
            reason = "x"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRule { ref name, .. }) if name == "broken"
        ));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = Config::from_toml("[agent]\nmax_tool_rounds = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroBudget("agent.max_tool_rounds"))
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/chi-agent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
