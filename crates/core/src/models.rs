use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, Value>;

pub const METADATA_SOURCE: &str = "source";
pub const METADATA_PAGE: &str = "page";
pub const METADATA_TOTAL_PAGES: &str = "total_pages";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub content: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(METADATA_SOURCE).and_then(Value::as_str)
    }

    pub fn page(&self) -> Option<u64> {
        self.metadata.get(METADATA_PAGE).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: Metadata,
    /// Character offset of the window inside the parent document.
    pub start_index: usize,
}

impl Chunk {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(METADATA_SOURCE).and_then(Value::as_str)
    }

    pub fn page(&self) -> Option<u64> {
        self.metadata.get(METADATA_PAGE).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Relevance in `[0, 1]`, derived from cosine similarity.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    Similarity,
    MaxMarginalRelevance { fetch_k: usize, lambda: f32 },
}

impl SearchMode {
    pub const DEFAULT_FETCH_K: usize = 20;
    pub const DEFAULT_LAMBDA: f32 = 0.5;

    pub fn mmr() -> Self {
        SearchMode::MaxMarginalRelevance {
            fetch_k: Self::DEFAULT_FETCH_K,
            lambda: Self::DEFAULT_LAMBDA,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieverOptions {
    pub k: usize,
    pub fetch_k: usize,
    pub lambda: f32,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            k: 7,
            fetch_k: SearchMode::DEFAULT_FETCH_K,
            lambda: SearchMode::DEFAULT_LAMBDA,
        }
    }
}

impl RetrieverOptions {
    pub fn search_mode(&self) -> SearchMode {
        SearchMode::MaxMarginalRelevance {
            fetch_k: self.fetch_k.max(self.k),
            lambda: self.lambda.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexPolicy {
    /// Rebuild even when a persisted index exists.
    pub force_rebuild: bool,
    /// Rebuild instead of failing when the persisted index cannot be loaded.
    pub rebuild_on_load_error: bool,
}
