use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::StockPilotError;

fn default_assistant_name() -> String {
    "StockPilot".into()
}
fn default_data_dir() -> String {
    "./stockpilot.data".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_max_tool_iterations() -> usize {
    25
}
fn default_max_history_messages() -> usize {
    50
}
fn default_memory_top_k() -> usize {
    5
}
fn default_memory_candidate_limit() -> usize {
    200
}
fn default_provider_timeout_secs() -> u64 {
    120
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_confirmation_timeout_secs() -> u64 {
    120
}
fn default_ticket_ttl_secs() -> u64 {
    30
}
fn default_ticket_skew_secs() -> u64 {
    15
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}
fn default_embed_batch_size() -> usize {
    16
}
fn default_embed_max_retries() -> i64 {
    3
}
fn default_embed_stale_secs() -> u64 {
    300
}
fn default_embed_interval_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    3600
}
fn default_memory_decay_window_days() -> i64 {
    30
}
fn default_memory_decay_factor() -> f64 {
    0.9
}
fn default_memory_retention_days() -> i64 {
    14
}
fn default_extraction_enabled() -> bool {
    true
}
fn default_extraction_max_facts() -> usize {
    10
}
fn default_query_service_url() -> String {
    "http://127.0.0.1:9471".into()
}
fn default_device_service_url() -> String {
    "http://127.0.0.1:9472".into()
}
fn default_web_host() -> String {
    "127.0.0.1".into()
}
fn default_web_port() -> u16 {
    10972
}

/// One entry in the chat-provider fallback chain, evaluated in order at
/// startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatProviderConfig {
    pub kind: String, // "anthropic" or "openai" (openai also covers local servers via base_url)
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// One entry in the embedding-provider fallback chain. Independent of the
/// chat chain; chat and embeddings may use different back-ends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    pub kind: String, // "openai" or "ollama"
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub dimension: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub chat_providers: Vec<ChatProviderConfig>,
    #[serde(default)]
    pub embedding_providers: Vec<EmbeddingProviderConfig>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    #[serde(default = "default_memory_candidate_limit")]
    pub memory_candidate_limit: usize,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_ticket_ttl_secs")]
    pub ticket_ttl_secs: u64,
    #[serde(default = "default_ticket_skew_secs")]
    pub ticket_skew_secs: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_embed_max_retries")]
    pub embed_max_retries: i64,
    #[serde(default = "default_embed_stale_secs")]
    pub embed_stale_secs: u64,
    #[serde(default = "default_embed_interval_secs")]
    pub embed_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_memory_decay_window_days")]
    pub memory_decay_window_days: i64,
    #[serde(default = "default_memory_decay_factor")]
    pub memory_decay_factor: f64,
    #[serde(default = "default_memory_retention_days")]
    pub memory_retention_days: i64,
    #[serde(default = "default_extraction_enabled")]
    pub extraction_enabled: bool,
    #[serde(default = "default_extraction_max_facts")]
    pub extraction_max_facts: usize,
    #[serde(default = "default_query_service_url")]
    pub query_service_url: String,
    #[serde(default = "default_device_service_url")]
    pub device_service_url: String,
    #[serde(default)]
    pub service_token: String,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub web_auth_token: Option<String>,
}

impl Config {
    pub fn data_root_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, StockPilotError> {
        if let Ok(custom) = std::env::var("STOCKPILOT_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(StockPilotError::Config(format!(
                "STOCKPILOT_CONFIG points to non-existent file: {custom}"
            )));
        }

        if std::path::Path::new("./stockpilot.config.yaml").exists() {
            return Ok(Some(PathBuf::from("./stockpilot.config.yaml")));
        }
        if std::path::Path::new("./stockpilot.config.yml").exists() {
            return Ok(Some(PathBuf::from("./stockpilot.config.yml")));
        }
        Ok(None)
    }

    /// Load config from the YAML file.
    pub fn load() -> Result<Self, StockPilotError> {
        let yaml_path = Self::resolve_config_path()?;

        if let Some(path) = yaml_path {
            let path_str = path.to_string_lossy().to_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StockPilotError::Config(format!("Failed to read {path_str}: {e}")))?;
            let mut config: Config = serde_yaml::from_str(&content)
                .map_err(|e| StockPilotError::Config(format!("Failed to parse {path_str}: {e}")))?;
            config.post_deserialize()?;
            return Ok(config);
        }

        Err(StockPilotError::Config(
            "No stockpilot.config.yaml found.".into(),
        ))
    }

    pub fn from_yaml(content: &str) -> Result<Self, StockPilotError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| StockPilotError::Config(format!("Failed to parse config: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), StockPilotError> {
        for provider in &mut self.chat_providers {
            provider.kind = provider.kind.trim().to_lowercase();
            if !matches!(provider.kind.as_str(), "anthropic" | "openai") {
                return Err(StockPilotError::Config(format!(
                    "Unknown chat provider kind: {}",
                    provider.kind
                )));
            }
            if provider.model.is_empty() {
                provider.model = match provider.kind.as_str() {
                    "anthropic" => "claude-sonnet-4-5-20250929".into(),
                    _ => "gpt-5.2".into(),
                };
            }
        }

        for provider in &mut self.embedding_providers {
            provider.kind = provider.kind.trim().to_lowercase();
            if !matches!(provider.kind.as_str(), "openai" | "ollama") {
                return Err(StockPilotError::Config(format!(
                    "Unknown embedding provider kind: {}",
                    provider.kind
                )));
            }
            if provider.model.is_empty() {
                provider.model = match provider.kind.as_str() {
                    "ollama" => "nomic-embed-text".into(),
                    _ => "text-embedding-3-small".into(),
                };
            }
        }

        if self.max_tokens == 0 {
            return Err(StockPilotError::Config("max_tokens must be > 0".into()));
        }
        if self.max_tool_iterations == 0 {
            return Err(StockPilotError::Config(
                "max_tool_iterations must be > 0".into(),
            ));
        }
        if self.ticket_ttl_secs < 5 {
            return Err(StockPilotError::Config(
                "ticket_ttl_secs must be at least 5".into(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(StockPilotError::Config(
                "breaker_failure_threshold must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_decay_factor) {
            return Err(StockPilotError::Config(
                "memory_decay_factor must be within [0, 1]".into(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(StockPilotError::Config(
                "embed_batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.assistant_name, "StockPilot");
        assert_eq!(config.max_tokens, 8192);
        assert!(config.chat_providers.is_empty());
        assert_eq!(config.ticket_ttl_secs, 30);
    }

    #[test]
    fn test_provider_kind_normalized_and_model_defaulted() {
        let config = Config::from_yaml(
            r#"
chat_providers:
  - kind: " Anthropic "
    api_key: sk-test
"#,
        )
        .unwrap();
        assert_eq!(config.chat_providers[0].kind, "anthropic");
        assert!(!config.chat_providers[0].model.is_empty());
    }

    #[test]
    fn test_unknown_chat_provider_rejected() {
        let err = Config::from_yaml(
            r#"
chat_providers:
  - kind: carrier-pigeon
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown chat provider kind"));
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let err = Config::from_yaml(
            r#"
embedding_providers:
  - kind: fax
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider kind"));
    }

    #[test]
    fn test_decay_factor_out_of_range_rejected() {
        let err = Config::from_yaml("memory_decay_factor: 1.5").unwrap_err();
        assert!(err.to_string().contains("memory_decay_factor"));
    }

    #[test]
    fn test_tiny_ticket_ttl_rejected() {
        let err = Config::from_yaml("ticket_ttl_secs: 1").unwrap_err();
        assert!(err.to_string().contains("ticket_ttl_secs"));
    }
}
