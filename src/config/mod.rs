use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Engine configuration. Thresholds and the aggregation-sensitive knobs are
/// deliberately configurable rather than baked in; the defaults reproduce the
/// production values (0.6 evidence, 0.8 checklist).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Minimum relevance score for a verdict to become an evidence record.
    pub evidence_threshold: f64,
    /// Minimum relevance score for record evidence to touch the checklist.
    pub checklist_threshold: f64,
    /// Concurrent reasoning calls per audit run.
    pub analysis_workers: usize,
    /// Attempts for index/record persistence before the run is failed.
    pub persistence_retries: u32,
    /// Directory holding the per-audit analysis index files.
    pub index_root: PathBuf,
    pub database_url: Option<String>,
    pub reasoning: ReasoningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub base_url: String,
    pub model: String,
    /// Per-call timeout; a stuck call must not stall the worker pool.
    pub timeout_secs: u64,
    pub temperature: f32,
    /// Token budget for document analysis replies.
    pub document_max_tokens: u32,
    /// Token budget for record analysis replies (records need shorter replies).
    pub record_max_tokens: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            evidence_threshold: 0.6,
            checklist_threshold: 0.8,
            analysis_workers: 4,
            persistence_retries: 3,
            index_root: PathBuf::from("audit_indexes"),
            database_url: None,
            reasoning: ReasoningConfig::default(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout_secs: 90,
            temperature: 0.3,
            document_max_tokens: 800,
            record_max_tokens: 400,
        }
    }
}

impl CorrelatorConfig {
    /// Defaults overridden by `CORRELATOR_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<f64>("CORRELATOR_EVIDENCE_THRESHOLD") {
            config.evidence_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("CORRELATOR_CHECKLIST_THRESHOLD") {
            config.checklist_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("CORRELATOR_ANALYSIS_WORKERS") {
            config.analysis_workers = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("CORRELATOR_PERSISTENCE_RETRIES") {
            config.persistence_retries = v.max(1);
        }
        if let Ok(v) = std::env::var("CORRELATOR_INDEX_ROOT") {
            config.index_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            config.database_url = Some(v);
        }
        if let Ok(v) = std::env::var("CORRELATOR_REASONING_URL") {
            config.reasoning.base_url = v;
        }
        if let Ok(v) = std::env::var("CORRELATOR_REASONING_MODEL") {
            config.reasoning.model = v;
        }
        if let Some(v) = env_parse::<u64>("CORRELATOR_REASONING_TIMEOUT_SECS") {
            config.reasoning.timeout_secs = v;
        }
        if let Some(v) = env_parse::<f32>("CORRELATOR_REASONING_TEMPERATURE") {
            config.reasoning.temperature = v;
        }
        if let Some(v) = env_parse::<u32>("CORRELATOR_REASONING_DOCUMENT_MAX_TOKENS") {
            config.reasoning.document_max_tokens = v;
        }
        if let Some(v) = env_parse::<u32>("CORRELATOR_REASONING_RECORD_MAX_TOKENS") {
            config.reasoning.record_max_tokens = v;
        }
        config
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, #[source] toml::de::Error),
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = CorrelatorConfig::default();
        assert_eq!(config.evidence_threshold, 0.6);
        assert_eq!(config.checklist_threshold, 0.8);
        assert_eq!(config.reasoning.timeout_secs, 90);
    }

    #[test]
    fn env_overrides_reasoning_knobs() {
        std::env::set_var("CORRELATOR_REASONING_TEMPERATURE", "0.1");
        std::env::set_var("CORRELATOR_REASONING_DOCUMENT_MAX_TOKENS", "1200");
        std::env::set_var("CORRELATOR_REASONING_RECORD_MAX_TOKENS", "300");
        let config = CorrelatorConfig::from_env();
        std::env::remove_var("CORRELATOR_REASONING_TEMPERATURE");
        std::env::remove_var("CORRELATOR_REASONING_DOCUMENT_MAX_TOKENS");
        std::env::remove_var("CORRELATOR_REASONING_RECORD_MAX_TOKENS");
        assert_eq!(config.reasoning.temperature, 0.1);
        assert_eq!(config.reasoning.document_max_tokens, 1200);
        assert_eq!(config.reasoning.record_max_tokens, 300);
    }

    #[test]
    fn toml_overrides_nest() {
        let raw = r#"
            evidence_threshold = 0.5

            [reasoning]
            model = "mistral"
        "#;
        let config: CorrelatorConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.evidence_threshold, 0.5);
        assert_eq!(config.reasoning.model, "mistral");
        assert_eq!(config.checklist_threshold, 0.8);
    }
}
