//! TOML configuration parsing and validation.
//!
//! A single [`Config`] is loaded once by the binary and handed to every
//! component constructor. Only `[db]` is mandatory; every other section falls
//! back to defaults so a minimal file looks like:
//!
//! ```toml
//! [db]
//! path = "./data/ragdock.sqlite"
//! ```
//!
//! API keys never live in the file. Providers read `OPENAI_API_KEY` /
//! `COHERE_API_KEY` from the environment when they are constructed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub vector_db: VectorDbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorDbConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Data directory of the embedded engine.
    #[serde(default = "default_vector_path")]
    pub path: PathBuf,
    /// Postgres connection URL, required for `pgvector`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_distance")]
    pub distance: String,
    #[serde(default = "default_index_threshold")]
    pub index_threshold: usize,
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_vector_path(),
            url: None,
            distance: default_distance(),
            index_threshold: default_index_threshold(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

fn default_backend() -> String {
    "embedded".to_string()
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("./data/vectors")
}
fn default_distance() -> String {
    "cosine".to_string()
}
fn default_index_threshold() -> usize {
    100
}
fn default_insert_batch_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override, e.g. an OpenAI-compatible gateway.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_input_chars: default_max_input_chars(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_max_input_chars() -> usize {
    1000
}
fn default_max_output_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplatesConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Directory holding `<lang>/<namespace>.toml` override files.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            default_language: default_language(),
            dir: None,
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Asset files live under `<root>/<project_id>/`.
    #[serde(default = "default_files_root")]
    pub root: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_files_root(),
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap_size(),
        }
    }
}

fn default_files_root() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_chunk_size() -> usize {
    500
}
fn default_overlap_size() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Expected wall-clock bound per job; feeds the ledger's stuck check.
    #[serde(default = "default_time_limit_secs")]
    pub time_limit_secs: u64,
    #[serde(default = "default_job_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_countdown_secs")]
    pub retry_countdown_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            time_limit_secs: default_time_limit_secs(),
            max_retries: default_job_max_retries(),
            retry_countdown_secs: default_retry_countdown_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_time_limit_secs() -> u64 {
    600
}
fn default_job_max_retries() -> u32 {
    3
}
fn default_retry_countdown_secs() -> u64 {
    60
}
fn default_retention_secs() -> u64 {
    86400
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Vector store
    match config.vector_db.backend.as_str() {
        "embedded" => {}
        "pgvector" => {
            if config.vector_db.url.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("vector_db.url must be set when backend is 'pgvector'");
            }
        }
        other => anyhow::bail!(
            "Unknown vector_db backend: '{}'. Must be embedded or pgvector.",
            other
        ),
    }

    match config.vector_db.distance.as_str() {
        "cosine" | "dot" => {}
        other => anyhow::bail!(
            "Unknown vector_db distance: '{}'. Must be cosine or dot.",
            other
        ),
    }

    if config.vector_db.index_threshold == 0 {
        anyhow::bail!("vector_db.index_threshold must be > 0");
    }
    if config.vector_db.insert_batch_size == 0 {
        anyhow::bail!("vector_db.insert_batch_size must be > 0");
    }
    if config.indexing.page_size == 0 {
        anyhow::bail!("indexing.page_size must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "cohere" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or cohere.",
            other
        ),
    }

    if config.embedding.is_enabled() {
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

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "cohere" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or cohere.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    // Files and jobs
    if config.files.chunk_size == 0 {
        anyhow::bail!("files.chunk_size must be > 0");
    }
    if config.files.overlap_size >= config.files.chunk_size {
        anyhow::bail!("files.overlap_size must be smaller than files.chunk_size");
    }
    if config.jobs.workers == 0 {
        anyhow::bail!("jobs.workers must be >= 1");
    }

    Ok(())
}
