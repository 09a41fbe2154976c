use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, IndexError, IndexLoadError};
use crate::models::{Chunk, IndexPolicy, ScoredChunk, SearchMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const VECTORS_FILE: &str = "index.bin";
pub const DOCSTORE_FILE: &str = "docstore.json";

const FORMAT_VERSION: u32 = 1;

/// Exact cosine index over chunk embeddings, persisted as raw vectors plus a
/// JSON payload store.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model_id: String,
    dimensions: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<Chunk>,
    corpus_fingerprint: Option<String>,
    built_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Docstore {
    format_version: u32,
    model_id: String,
    dimensions: usize,
    count: usize,
    vectors_sha256: String,
    corpus_fingerprint: Option<String>,
    built_at: DateTime<Utc>,
    chunks: Vec<Chunk>,
}

impl VectorIndex {
    pub fn empty(model_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimensions,
            vectors: Vec::new(),
            chunks: Vec::new(),
            corpus_fingerprint: None,
            built_at: Utc::now(),
        }
    }

    pub async fn build(chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        let dimensions = embedder.dimensions();
        let mut index = Self::empty(embedder.model_id(), dimensions);
        if chunks.is_empty() {
            warn!("building an empty index");
            return Ok(index);
        }

        info!(chunks = chunks.len(), model = %embedder.model_id(), "embedding chunks");
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await?;

        if vectors.len() != chunks.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: chunks.len(),
                actual: vectors.len(),
            }
            .into());
        }
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                actual: vector.len(),
            });
        }

        index.vectors = vectors;
        index.chunks = chunks;
        info!(vectors = index.len(), dimensions, "index built");
        Ok(index)
    }

    pub fn with_corpus_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.corpus_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn corpus_fingerprint(&self) -> Option<&str> {
        self.corpus_fingerprint.as_deref()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Whether anything has been persisted under `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(VECTORS_FILE).exists() || dir.join(DOCSTORE_FILE).exists()
    }

    pub fn check_embedder(&self, embedder: &dyn Embedder) -> Result<(), IndexLoadError> {
        if self.model_id != embedder.model_id() || self.dimensions != embedder.dimensions() {
            return Err(IndexLoadError::EmbedderMismatch {
                indexed: format!("{} ({}d)", self.model_id, self.dimensions),
                configured: format!("{} ({}d)", embedder.model_id(), embedder.dimensions()),
            });
        }
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;

        let mut bytes = Vec::with_capacity(self.len() * self.dimensions * 4);
        for vector in &self.vectors {
            for value in vector {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }

        let docstore = Docstore {
            format_version: FORMAT_VERSION,
            model_id: self.model_id.clone(),
            dimensions: self.dimensions,
            count: self.len(),
            vectors_sha256: sha256_hex(&bytes),
            corpus_fingerprint: self.corpus_fingerprint.clone(),
            built_at: self.built_at,
            chunks: self.chunks.clone(),
        };
        let json = serde_json::to_vec(&docstore)?;

        write_atomic(&dir.join(VECTORS_FILE), &bytes)?;
        write_atomic(&dir.join(DOCSTORE_FILE), &json)?;
        info!(dir = %dir.display(), vectors = self.len(), "index saved");
        Ok(())
    }

    pub fn load(dir: &Path, embedder: &dyn Embedder) -> Result<Self, IndexLoadError> {
        let vectors_path = dir.join(VECTORS_FILE);
        let docstore_path = dir.join(DOCSTORE_FILE);
        if !vectors_path.exists() || !docstore_path.exists() {
            return Err(IndexLoadError::Missing(dir.to_path_buf()));
        }

        let corrupt = |details: String| IndexLoadError::Corrupt {
            path: dir.to_path_buf(),
            details,
        };

        let docstore: Docstore = serde_json::from_slice(&fs::read(&docstore_path)?)
            .map_err(|error| corrupt(format!("{DOCSTORE_FILE}: {error}")))?;
        if docstore.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                docstore.format_version
            )));
        }
        if docstore.chunks.len() != docstore.count {
            return Err(corrupt(format!(
                "docstore lists {} chunks but declares {}",
                docstore.chunks.len(),
                docstore.count
            )));
        }

        let bytes = fs::read(&vectors_path)?;
        let expected_len = docstore
            .count
            .checked_mul(docstore.dimensions)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| {
                corrupt(format!(
                    "{} vectors of {} dimensions do not fit in memory",
                    docstore.count, docstore.dimensions
                ))
            })?;
        if bytes.len() != expected_len {
            return Err(corrupt(format!(
                "{VECTORS_FILE} has {} bytes, expected {expected_len}",
                bytes.len()
            )));
        }
        if sha256_hex(&bytes) != docstore.vectors_sha256 {
            return Err(corrupt(format!("{VECTORS_FILE} checksum mismatch")));
        }

        let vectors: Vec<Vec<f32>> = if docstore.dimensions == 0 {
            vec![Vec::new(); docstore.count]
        } else {
            bytes
                .chunks_exact(docstore.dimensions * 4)
                .map(|row| {
                    row.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect::<Vec<f32>>()
                })
                .collect()
        };

        let index = Self {
            model_id: docstore.model_id,
            dimensions: docstore.dimensions,
            vectors,
            chunks: docstore.chunks,
            corpus_fingerprint: docstore.corpus_fingerprint,
            built_at: docstore.built_at,
        };
        index.check_embedder(embedder)?;

        info!(dir = %dir.display(), vectors = index.len(), model = %index.model_id, "index loaded");
        Ok(index)
    }

    /// Load the index persisted under `dir`, or build and persist it.
    pub async fn open_or_build(
        dir: &Path,
        chunks: Vec<Chunk>,
        embedder: &dyn Embedder,
        corpus_fingerprint: Option<String>,
        policy: IndexPolicy,
    ) -> Result<Self, IndexError> {
        if policy.force_rebuild {
            info!(dir = %dir.display(), "forced index rebuild");
        } else if Self::exists(dir) {
            match Self::load(dir, embedder) {
                Ok(index) => {
                    if let (Some(stored), Some(current)) =
                        (index.corpus_fingerprint(), corpus_fingerprint.as_deref())
                    {
                        if stored != current {
                            warn!(
                                dir = %dir.display(),
                                "corpus changed since the index was built; clear the index directory or pass --rebuild to re-embed"
                            );
                        }
                    }
                    return Ok(index);
                }
                Err(error) if policy.rebuild_on_load_error => {
                    warn!(dir = %dir.display(), %error, "persisted index unusable, rebuilding");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let mut index = Self::build(chunks, embedder).await?;
        if let Some(fingerprint) = corpus_fingerprint {
            index = index.with_corpus_fingerprint(fingerprint);
        }
        index.save(dir)?;
        Ok(index)
    }

    pub fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        mode: SearchMode,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        if query_vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: query_vector.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let picked = match mode {
            SearchMode::Similarity => {
                let mut ranked = self.rank_by_similarity(query_vector);
                ranked.truncate(k);
                ranked
            }
            SearchMode::MaxMarginalRelevance { fetch_k, lambda } => {
                let mut candidates = self.rank_by_similarity(query_vector);
                candidates.truncate(fetch_k.max(k));
                self.max_marginal_relevance(&candidates, k, lambda)
            }
        };

        debug!(k, hits = picked.len(), ?mode, "index search");
        Ok(picked
            .into_iter()
            .map(|(position, similarity)| ScoredChunk {
                chunk: self.chunks[position].clone(),
                score: relevance(similarity),
            })
            .collect())
    }

    /// `(position, cosine)` for every vector, most similar first.
    fn rank_by_similarity(&self, query_vector: &[f32]) -> Vec<(usize, f32)> {
        let mut ranked: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (position, cosine_similarity(query_vector, vector)))
            .collect();
        ranked.sort_by(|left, right| right.1.total_cmp(&left.1));
        ranked
    }

    /// Greedy MMR: each pick maximizes
    /// `lambda * sim(query, c) - (1 - lambda) * max(sim(c, picked))`.
    fn max_marginal_relevance(
        &self,
        candidates: &[(usize, f32)],
        k: usize,
        lambda: f32,
    ) -> Vec<(usize, f32)> {
        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k);
        let mut remaining: Vec<(usize, f32)> = candidates.to_vec();

        while selected.len() < k && !remaining.is_empty() {
            let mut best_slot = 0;
            let mut best_score = f32::NEG_INFINITY;

            for (slot, &(position, similarity)) in remaining.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|&(chosen, _)| {
                        cosine_similarity(&self.vectors[position], &self.vectors[chosen])
                    })
                    .fold(f32::NEG_INFINITY, f32::max);
                let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
                let score = lambda * similarity - (1.0 - lambda) * redundancy;

                if score > best_score {
                    best_score = score;
                    best_slot = slot;
                }
            }

            selected.push(remaining.remove(best_slot));
        }

        selected
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Maps cosine similarity onto `[0, 1]`.
fn relevance(similarity: f32) -> f32 {
    ((1.0 + similarity) / 2.0).clamp(0.0, 1.0)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut staging = PathBuf::from(path);
    staging.set_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)
}
