//! Configuration for contexts and generation runs.
//!
//! Everything here deserializes from JSON with per-field defaults, so a config file
//! only has to name the values it changes.

use std::path::Path;

use llama_runtime::MemoryGuardConfig;
use llama_sampling::SamplingParams;
use serde::Deserialize;

use crate::error::{ConfigError, Result, StreamError};

/// Settings for a [`crate::Context`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextConfig {
    /// Memory ceiling handed to the guard. 0 = unlimited, no monitoring.
    #[serde(default)]
    pub memory_limit_bytes: usize,

    /// Clear the sequence cache before a new stream when the guard has asked for cleanup.
    #[serde(default = "default_auto_unload")]
    pub auto_unload_on_memory_pressure: bool,

    /// Applied to the guard only when the context creates its own.
    #[serde(default)]
    pub guard: MemoryGuardConfig,
}

fn default_auto_unload() -> bool {
    true
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            memory_limit_bytes: 0,
            auto_unload_on_memory_pressure: default_auto_unload(),
            guard: MemoryGuardConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn from_json_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: ContextConfig = serde_json::from_str(&data)?;
        Ok(config)
    }
}

/// Grammar source plus the rule generation starts from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GrammarSpec {
    pub source: String,

    #[serde(default = "default_grammar_root")]
    pub root: String,
}

fn default_grammar_root() -> String {
    "root".to_string()
}

impl GrammarSpec {
    pub fn new(source: impl Into<String>) -> Self {
        GrammarSpec {
            source: source.into(),
            root: default_grammar_root(),
        }
    }
}

/// Parameters for one generation run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(flatten)]
    pub sampling: SamplingParams,

    #[serde(default)]
    pub grammar: Option<GrammarSpec>,

    /// Mean confidence below which the run asks for handoff. 0.0 disables tracking.
    #[serde(default)]
    pub confidence_threshold: f32,
}

fn default_max_tokens() -> usize {
    512
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            max_tokens: default_max_tokens(),
            sampling: SamplingParams::default(),
            grammar: None,
            confidence_threshold: 0.0,
        }
    }
}

impl GenerationParams {
    pub fn from_json_str(json: &str) -> std::result::Result<Self, ConfigError> {
        let params: GenerationParams = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StreamError::InvalidInput(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if let Some(grammar) = &self.grammar {
            if grammar.source.trim().is_empty() {
                return Err(StreamError::InvalidInput("grammar source is empty".to_string()));
            }
            if grammar.root.is_empty() {
                return Err(StreamError::InvalidInput("grammar root is empty".to_string()));
            }
        }
        Ok(())
    }
}
