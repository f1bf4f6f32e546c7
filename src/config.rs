use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub kb: KbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KbConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("faiss_store")
}
fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Chat-completion backend used for conflict checks and tagging.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible API. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: default_llm_model(),
            url: None,
            api_key_env: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

fn default_llm_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    2
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn base_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.trim_end_matches('/').to_string();
        }
        match self.provider.as_str() {
            "openai" => "https://api.openai.com/v1".to_string(),
            _ => "https://api.groq.com/openai/v1".to_string(),
        }
    }

    pub fn key_env(&self) -> String {
        if let Some(name) = &self.api_key_env {
            return name.clone();
        }
        match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            _ => "GROQ_API_KEY".to_string(),
        }
    }
}

/// Tunables for the conflict-detection pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct ConflictConfig {
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_max_cluster_batch")]
    pub max_cluster_batch: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_noise_ratio")]
    pub noise_ratio: f32,
    #[serde(default = "default_reassign_threshold")]
    pub reassign_threshold: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_tag_sample_size")]
    pub tag_sample_size: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            max_cluster_batch: default_max_cluster_batch(),
            similarity_threshold: default_similarity_threshold(),
            noise_ratio: default_noise_ratio(),
            reassign_threshold: default_reassign_threshold(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            output_dir: default_output_dir(),
            tag_sample_size: default_tag_sample_size(),
        }
    }
}

fn default_min_cluster_size() -> usize {
    2
}
fn default_max_cluster_batch() -> usize {
    30
}
fn default_similarity_threshold() -> f32 {
    0.95
}
fn default_noise_ratio() -> f32 {
    0.30
}
fn default_reassign_threshold() -> f32 {
    0.65
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data/conflict_detection")
}
fn default_tag_sample_size() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sim_threshold")]
    pub sim_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sim_threshold: default_sim_threshold(),
            top_k: default_top_k(),
            keywords: default_keywords(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_sim_threshold() -> f32 {
    0.35
}
fn default_keywords() -> Vec<String> {
    [
        "requirement",
        "requirements",
        "specification",
        "standard",
        "security",
        "privacy",
        "compliance",
        "regulation",
        "payment",
        "billing",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Expected `X-API-Key` value. Requests are not checked when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Seconds a finished job stays pollable before it is swept.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
            job_retention_secs: default_job_retention_secs(),
        }
    }
}

fn default_job_retention_secs() -> u64 {
    crate::jobs::DEFAULT_JOB_RETENTION.as_secs()
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// All defaults: embeddings and LLM disabled, KB under `./faiss_store`.
    pub fn minimal() -> Self {
        Self {
            kb: KbConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            conflicts: ConflictConfig::default(),
            rag: RagConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(key) = std::env::var("REQH_API_KEY") {
        if !key.is_empty() {
            config.server.api_key = Some(key);
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate kb
    if config.kb.max_top_k == 0 {
        anyhow::bail!("kb.max_top_k must be >= 1");
    }
    if config.kb.default_top_k == 0 || config.kb.default_top_k > config.kb.max_top_k {
        anyhow::bail!(
            "kb.default_top_k must be in [1, {}] (kb.max_top_k)",
            config.kb.max_top_k
        );
    }

    // Validate conflicts
    let c = &config.conflicts;
    if c.min_cluster_size < 2 {
        anyhow::bail!("conflicts.min_cluster_size must be >= 2");
    }
    if c.max_cluster_batch < 2 {
        anyhow::bail!("conflicts.max_cluster_batch must be >= 2");
    }
    for (name, value) in [
        ("conflicts.similarity_threshold", c.similarity_threshold),
        ("conflicts.noise_ratio", c.noise_ratio),
        ("conflicts.reassign_threshold", c.reassign_threshold),
        ("rag.sim_threshold", config.rag.sim_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "disabled" | "groq" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, groq, or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.kb.base_dir, PathBuf::from("faiss_store"));
        assert_eq!(cfg.conflicts.min_cluster_size, 2);
        assert_eq!(cfg.conflicts.max_cluster_batch, 30);
        assert!((cfg.rag.sim_threshold - 0.35).abs() < 1e-6);
        assert_eq!(cfg.rag.keywords.len(), 10);
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.llm.is_enabled());
        assert_eq!(cfg.server.job_retention_secs, 3600);
        validate(&cfg).unwrap();
    }

    #[test]
    fn rejects_unknown_embedding_provider() {
        let cfg: Config = toml::from_str("[embedding]\nprovider = \"word2vec\"").unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"), "{}", err);
    }

    #[test]
    fn remote_embedding_requires_model_and_dims() {
        let cfg: Config = toml::from_str("[embedding]\nprovider = \"openai\"").unwrap();
        assert!(validate(&cfg).is_err());

        let cfg: Config = toml::from_str(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536",
        )
        .unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn rejects_tiny_cluster_size() {
        let cfg: Config = toml::from_str("[conflicts]\nmin_cluster_size = 1").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let cfg: Config = toml::from_str("[conflicts]\nsimilarity_threshold = 1.5").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn llm_defaults_per_provider() {
        let cfg: Config = toml::from_str("[llm]\nprovider = \"openai\"").unwrap();
        assert_eq!(cfg.llm.base_url(), "https://api.openai.com/v1");
        assert_eq!(cfg.llm.key_env(), "OPENAI_API_KEY");

        let cfg: Config =
            toml::from_str("[llm]\nprovider = \"groq\"\nurl = \"http://localhost:9999/v1/\"")
                .unwrap();
        assert_eq!(cfg.llm.base_url(), "http://localhost:9999/v1");
        assert_eq!(cfg.llm.key_env(), "GROQ_API_KEY");
    }
}
