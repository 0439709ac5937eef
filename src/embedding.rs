//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`CohereEmbedder`]**: calls the Cohere v2 embed API, tagging inputs as
//!   documents or queries.
//!
//! Also provides the similarity helpers used by the embedded vector store:
//! [`cosine_similarity`] and [`dot_product`].
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the provider named by the
//! configuration:
//!
//! ```rust,no_run
//! # use ragdock::config::EmbeddingConfig;
//! # use ragdock::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const COHERE_DEFAULT_URL: &str = "https://api.cohere.com/v2";

/// Whether texts are being embedded for storage or for lookup. Some
/// providers embed the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Document,
    Query,
}

/// Capability contract for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled ============

/// Embedder used when `embedding.provider = "disabled"`.
///
/// It still reports the configured dimension so collection names can be
/// computed (e.g. for `info` and `reset`) without any provider credentials.
pub struct DisabledEmbedder {
    dims: usize,
}

impl DisabledEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, _texts: &[String], _purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        Err(RagError::provider("Embedding provider is disabled"))
    }
}

// ============ OpenAI ============

/// Embedder calling `POST {url}/embeddings`. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config)?;
        let api_key = api_key_from_env("OPENAI_API_KEY")?;
        Ok(Self {
            model,
            dims,
            url: base_url(config.url.as_deref(), OPENAI_DEFAULT_URL),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String], _purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/embeddings", self.url),
            &self.api_key,
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        tracing::debug!(model = %self.model, count = texts.len(), "openai embeddings received");
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::provider("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::provider("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Cohere ============

/// Embedder calling the Cohere v2 `POST {url}/embed` endpoint. Requires
/// `COHERE_API_KEY`.
pub struct CohereEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl CohereEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config)?;
        let api_key = api_key_from_env("COHERE_API_KEY")?;
        Ok(Self {
            model,
            dims,
            url: base_url(config.url.as_deref(), COHERE_DEFAULT_URL),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

fn cohere_input_type(purpose: EmbedPurpose) -> &'static str {
    match purpose {
        EmbedPurpose::Document => "search_document",
        EmbedPurpose::Query => "search_query",
    }
}

#[async_trait]
impl Embedder for CohereEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String], purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "texts": texts,
            "input_type": cohere_input_type(purpose),
            "embedding_types": ["float"],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/embed", self.url),
            &self.api_key,
            &body,
            self.max_retries,
            "Cohere",
        )
        .await?;
        tracing::debug!(model = %self.model, count = texts.len(), "cohere embeddings received");
        parse_cohere_response(&json)
    }
}

/// Accepts both the v2 shape (`embeddings.float`) and the v1 shape
/// (`embeddings` as a plain array).
fn parse_cohere_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .ok_or_else(|| RagError::provider("Invalid Cohere response: missing embeddings"))?;

    let list = embeddings
        .get("float")
        .and_then(|f| f.as_array())
        .or_else(|| embeddings.as_array())
        .ok_or_else(|| RagError::provider("Invalid Cohere response: no float embeddings"))?;

    list.iter().map(parse_vector).collect()
}

// ============ Shared ============

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| RagError::provider("embedding is not an array"))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::provider("embedding contains a non-numeric value"))
        })
        .collect()
}

fn model_and_dims(config: &EmbeddingConfig) -> Result<(String, usize)> {
    let model = config.model.clone().ok_or_else(|| {
        RagError::config(format!(
            "embedding.model required for {} provider",
            config.provider
        ))
    })?;
    let dims = config.dims.filter(|d| *d > 0).ok_or_else(|| {
        RagError::config(format!(
            "embedding.dims required for {} provider",
            config.provider
        ))
    })?;
    Ok((model, dims))
}

pub(crate) fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| RagError::config(format!("{} environment variable not set", var)))
}

pub(crate) fn base_url(configured: Option<&str>, default: &str) -> String {
    configured
        .filter(|u| !u.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::provider_from("building http client", e))
}

/// POST a JSON body with bearer auth, retrying transient failures.
///
/// Retry strategy:
/// - HTTP 429 or 5xx → retry with exponential backoff
/// - HTTP 4xx (not 429) → fail immediately
/// - Network error → retry
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::warn!(provider = label, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = RagError::provider(format!("{} API error {}: {}", label, status, body_text));

                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }

                return Err(err);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| RagError::provider(format!("{} request failed after retries", label))))
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"cohere"` | [`CohereEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder::new(config.dims.unwrap_or(0)))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "cohere" => Ok(Arc::new(CohereEmbedder::new(config)?)),
        other => Err(RagError::config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Inner product; `0.0` when lengths differ.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(dot_product(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_response_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Provider);
    }

    #[test]
    fn test_parse_cohere_response_shapes() {
        let v2 = serde_json::json!({"embeddings": {"float": [[0.5, 0.5]]}});
        assert_eq!(parse_cohere_response(&v2).unwrap(), vec![vec![0.5, 0.5]]);

        let v1 = serde_json::json!({"embeddings": [[0.25], [0.75]]});
        assert_eq!(parse_cohere_response(&v1).unwrap().len(), 2);

        let bad = serde_json::json!({"embeddings": {"float": [["x"]]}});
        assert!(parse_cohere_response(&bad).is_err());
    }

    #[test]
    fn test_cohere_input_type() {
        assert_eq!(cohere_input_type(EmbedPurpose::Document), "search_document");
        assert_eq!(cohere_input_type(EmbedPurpose::Query), "search_query");
    }

    #[test]
    fn test_base_url_trims_slash() {
        assert_eq!(base_url(Some("http://gw/v1/"), OPENAI_DEFAULT_URL), "http://gw/v1");
        assert_eq!(base_url(None, OPENAI_DEFAULT_URL), OPENAI_DEFAULT_URL);
        assert_eq!(base_url(Some(""), COHERE_DEFAULT_URL), COHERE_DEFAULT_URL);
    }

    #[tokio::test]
    async fn test_disabled_embedder_fails_but_reports_dims() {
        let config = EmbeddingConfig {
            dims: Some(384),
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.dims(), 384);
        let err = embedder
            .embed(&["hello".to_string()], EmbedPurpose::Query)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Provider);
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
