//! Run configuration for an evaluation sweep.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::gateway::{GenerationParams, RetryPolicy};
use crate::prompts::Strategy;

pub const DEFAULT_MODELS: &[&str] = &["Qwen/Qwen2-7B-Instruct"];
pub const DEFAULT_LOG_PATH: &str = "results/structured_results.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A language code and the directory holding its labeled CSV files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSource {
    pub code: String,
    pub data_dir: PathBuf,
}

impl LanguageSource {
    pub fn new(code: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Parse a `code=dir` pair.
    pub fn parse_pair(s: &str) -> Result<Self, String> {
        let (code, dir) = s
            .split_once('=')
            .ok_or_else(|| format!("expected code=dir, got '{s}'"))?;
        let (code, dir) = (code.trim(), dir.trim());
        if code.is_empty() || dir.is_empty() {
            return Err(format!("expected code=dir, got '{s}'"));
        }
        Ok(Self::new(code, dir))
    }
}

/// Immutable parameters of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub models: Vec<String>,
    pub strategies: Vec<Strategy>,
    pub languages: Vec<LanguageSource>,
    pub samples_per_language: usize,
    pub inter_call_delay_ms: u64,
    /// Seeds the sample draw; `None` draws from entropy.
    pub seed: Option<u64>,
    pub resume: bool,
    pub log_path: PathBuf,
    pub retry: RetryPolicy,
    pub generation: GenerationParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            strategies: Strategy::ALL.to_vec(),
            languages: vec![
                LanguageSource::new("zh", "data/dev_labeled"),
                LanguageSource::new("en", "data_en_baidu/dev_labeled"),
            ],
            samples_per_language: 10,
            inter_call_delay_ms: 800,
            seed: None,
            resume: false,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            retry: RetryPolicy::default(),
            generation: GenerationParams::default(),
        }
    }
}

impl RunConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Invalid("models must not be empty".into()));
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::Invalid("model ids must not be blank".into()));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid("strategies must not be empty".into()));
        }
        if self.languages.is_empty() {
            return Err(ConfigError::Invalid("languages must not be empty".into()));
        }
        if let Some(lang) = self.languages.iter().find(|l| l.code.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "language code must not be empty (dir {})",
                lang.data_dir.display()
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_ratio {} out of range [0, 1]",
                self.retry.jitter_ratio
            )));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Invalid(format!(
                "generation.temperature {} out of range [0, 2]",
                self.generation.temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_sweep() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.models, vec!["Qwen/Qwen2-7B-Instruct".to_string()]);
        assert_eq!(cfg.strategies.len(), 4);
        assert_eq!(cfg.languages[0], LanguageSource::new("zh", "data/dev_labeled"));
        assert_eq!(cfg.samples_per_language, 10);
        assert_eq!(cfg.inter_call_delay_ms, 800);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.generation.max_tokens, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"models":["m1","m2"],"strategies":["few_shot_cot"],"seed":9,"retry":{"max_attempts":2}}"#,
        )
        .unwrap();
        let cfg = RunConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.models, vec!["m1", "m2"]);
        assert_eq!(cfg.strategies, vec![Strategy::FewShotCot]);
        assert_eq!(cfg.seed, Some(9));
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.languages.len(), 2);
    }

    #[test]
    fn validation_rejects_empty_lists_and_zero_attempts() {
        let mut cfg = RunConfig::default();
        cfg.models.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = RunConfig::default();
        cfg.strategies.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_blank_model_among_valid_ones() {
        let mut cfg = RunConfig::default();
        cfg.models = vec!["m1".into(), "  ".into()];
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn jitter_ratio_outside_unit_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"retry":{"jitter_ratio":1e300}}"#).unwrap();
        assert!(matches!(
            RunConfig::load_from_path(&path),
            Err(ConfigError::Invalid(_))
        ));

        let mut cfg = RunConfig::default();
        cfg.retry.jitter_ratio = -0.1;
        assert!(cfg.validate().is_err());
        cfg.retry.jitter_ratio = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_strategy_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"strategies":["tree_of_thought"]}"#).unwrap();
        assert!(matches!(
            RunConfig::load_from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn language_pairs_parse() {
        assert_eq!(
            LanguageSource::parse_pair("en=data/en").unwrap(),
            LanguageSource::new("en", "data/en")
        );
        assert!(LanguageSource::parse_pair("en").is_err());
        assert!(LanguageSource::parse_pair("=dir").is_err());
    }
}
