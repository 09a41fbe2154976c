use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use url::Url;

pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;
pub const DEFAULT_EMBEDDING_BATCH: usize = 32;

/// Maps text to L2-normalized vectors of a fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier of the model behind the vectors.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.pop() {
            Some(vector) if vectors.is_empty() => Ok(vector),
            _ => Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: vectors.len() + 1,
            }),
        }
    }
}

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Offline embedder hashing character trigrams into buckets.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("hashing-trigram-{dimensions}"),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_sync(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct TeiConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
}

impl Default for TeiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            batch_size: DEFAULT_EMBEDDING_BATCH,
        }
    }
}

/// Client for a text-embeddings-inference server hosting one model.
pub struct TeiEmbedder {
    endpoint: Url,
    config: TeiConfig,
    client: Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
    truncate: bool,
}

impl TeiEmbedder {
    pub fn new(config: TeiConfig) -> Result<Self, EmbeddingError> {
        let endpoint = Url::parse(&format!("{}/embed", config.base_url.trim_end_matches('/')))?;
        Ok(Self {
            endpoint,
            config,
            client: Client::new(),
        })
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbedRequest {
                inputs: texts,
                normalize: true,
                truncate: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::BackendResponse {
                backend: "tei".to_string(),
                details: format!("{status} {body}"),
            });
        }

        let vectors: Vec<Vec<f32>> = response.json().await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }

        vectors
            .into_iter()
            .map(|mut vector| {
                if vector.len() != self.config.dimensions {
                    return Err(EmbeddingError::DimensionMismatch {
                        expected: self.config.dimensions,
                        actual: vector.len(),
                    });
                }
                l2_normalize(&mut vector);
                Ok(vector)
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for TeiEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            debug!(batch = batch.len(), model = %self.config.model, "embedding batch");
            vectors.extend(self.embed_chunk(batch).await?);
        }
        Ok(vectors)
    }
}
