//! Run configuration.
//!
//! All tunables live in typed structs deserialized from an optional TOML
//! file, with serde defaults matching the production values. The resulting
//! `RunConfig` is passed explicitly into each component; nothing here is a
//! global. Secrets (API keys) come from the environment, never from the file.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use config::Config;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model for the streaming (chunked chat) pipeline.
    pub stream_model: String,
    /// Model for the asynchronous batch pipeline.
    pub batch_model: String,
    pub temperature: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            stream_model: "gpt-4.1-nano".to_string(),
            batch_model: "gpt-4.1-nano".to_string(),
            temperature: 0.0,
        }
    }
}

/// Pacing, retry, and chunking bounds for the streaming pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamLimits {
    /// Token-per-minute budget the pacing sleep aims to stay under.
    pub tpm_budget: u64,
    pub base_sleep_secs: f64,
    /// Total attempts per chat call.
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub min_chunk: usize,
    pub max_chunk: usize,
    /// Chunk size at the start of the first pass (clamped to max_chunk).
    pub initial_chunk: usize,
    /// Rough token estimate contributed by one row.
    pub token_per_row: u64,
    pub max_passes: u32,
}

impl StreamLimits {
    /// Chunk bounds the dispatch loop relies on to make progress.
    fn validate(&self) -> AppResult<()> {
        if self.min_chunk < 1 {
            return Err(AppError::Config(format!(
                "min_chunk must be at least 1, got {}",
                self.min_chunk
            )));
        }
        if self.min_chunk > self.max_chunk {
            return Err(AppError::Config(format!(
                "min_chunk ({}) exceeds max_chunk ({})",
                self.min_chunk, self.max_chunk
            )));
        }
        Ok(())
    }
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            tpm_budget: 360_000,
            base_sleep_secs: 1.5,
            max_retries: 6,
            initial_backoff_secs: 2.0,
            max_backoff_secs: 30.0,
            min_chunk: 10,
            max_chunk: 100,
            initial_chunk: 80,
            token_per_row: 120,
            max_passes: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub completion_window: String,
    pub poll_interval_secs: f64,
    pub max_poll_backoff_secs: f64,
    /// Optional wall-clock cap on polling; aborts with a timeout error.
    pub hard_timeout_secs: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            completion_window: "24h".to_string(),
            poll_interval_secs: 20.0,
            max_poll_backoff_secs: 120.0,
            hard_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub skipped_subdir: String,
    pub checkpoints_subdir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("persona_output"),
            skipped_subdir: "Skipped prospects".to_string(),
            checkpoints_subdir: "_checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// The closed persona vocabulary. Exact matches only; anything else is
    /// a skip (possibly repaired by the fuzzy pass).
    pub valid: Vec<String>,
    pub fuzzy_correction: bool,
    /// Minimum normalized similarity for a fuzzy repair.
    pub fuzzy_threshold: f64,
    /// Optional files holding the framing instructions and persona
    /// definitions. When absent, a default system prompt is generated from
    /// the vocabulary.
    pub frame_file: Option<PathBuf>,
    pub definitions_file: Option<PathBuf>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            valid: [
                "Executive Sponsor",
                "Economic Buyer",
                "Data Product Manager/Owner",
                "Data User",
                "Application Developer",
                "Real-time Specialist",
                "Operator/Systems Administrator",
                "Technical Decision Maker",
                "Not a target",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            fuzzy_correction: true,
            fuzzy_threshold: 0.85,
            frame_file: None,
            definitions_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Rows whose email matches this pattern are excluded before enrichment.
    pub email_exclude_pattern: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            email_exclude_pattern: "@ververica|test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    pub persona_property: Option<String>,
    pub certainty_property: Option<String>,
    /// Persona name -> CRM enum value. Identity when a name is absent.
    pub persona_mapping: HashMap<String, String>,
}

impl CrmConfig {
    pub fn persona_property(&self) -> &str {
        self.persona_property.as_deref().unwrap_or("hs_persona")
    }

    pub fn certainty_property(&self) -> &str {
        self.certainty_property
            .as_deref()
            .unwrap_or("persona_certainty")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub limits: StreamLimits,
    pub batch: BatchConfig,
    pub output: OutputConfig,
    pub personas: PersonaConfig,
    pub input: InputConfig,
    pub crm: CrmConfig,
}

impl RunConfig {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let cfg: Self = match path {
            Some(path) => {
                let cfg = Config::builder()
                    .add_source(config::File::from(path))
                    .build()
                    .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
                cfg.try_deserialize()
                    .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        cfg.limits.validate()?;
        Ok(cfg)
    }
}

/// API credentials, resolved from the environment after `dotenvy`.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub openai_api_key: String,
    pub hubspot_read_key: Option<String>,
    pub hubspot_write_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> AppResult<Self> {
        let openai_api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| AppError::Config("OPENAI_API_KEY not set (in env or .env)".to_string()))?;
        Ok(Self {
            openai_api_key,
            hubspot_read_key: env::var("HUBSPOT_API_KEY").ok(),
            hubspot_write_key: env::var("HUBSPOT_WRITE_API_KEY").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_values() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.limits.tpm_budget, 360_000);
        assert_eq!(cfg.limits.min_chunk, 10);
        assert_eq!(cfg.limits.max_chunk, 100);
        assert_eq!(cfg.limits.max_passes, 3);
        assert_eq!(cfg.personas.valid.len(), 9);
        assert!(cfg.personas.valid.iter().any(|p| p == "Economic Buyer"));
        assert_eq!(cfg.crm.persona_property(), "hs_persona");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = RunConfig::load(None).unwrap();
        assert_eq!(cfg.model.stream_model, "gpt-4.1-nano");
        assert_eq!(cfg.batch.completion_window, "24h");
    }

    #[test]
    fn test_zero_min_chunk_is_a_config_error() {
        let limits = StreamLimits {
            min_chunk: 0,
            ..StreamLimits::default()
        };
        let err = limits.validate().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("min_chunk"));
    }

    #[test]
    fn test_inverted_chunk_bounds_are_a_config_error() {
        let limits = StreamLimits {
            min_chunk: 50,
            max_chunk: 10,
            ..StreamLimits::default()
        };
        assert!(matches!(
            limits.validate(),
            Err(AppError::Config(_))
        ));
        assert!(StreamLimits::default().validate().is_ok());
    }
}
