use crate::embeddings::Embedder;
use crate::error::{IndexError, IndexLoadError};
use crate::index::VectorIndex;
use crate::models::{RetrieverOptions, ScoredChunk};
use std::sync::Arc;
use tracing::debug;

/// Diversity-aware top-k search over a built index.
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    options: RetrieverOptions,
}

impl Retriever {
    /// Fails when `embedder` is not the one the index was built with.
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        options: RetrieverOptions,
    ) -> Result<Self, IndexLoadError> {
        index.check_embedder(embedder.as_ref())?;
        Ok(Self {
            index,
            embedder,
            options,
        })
    }

    pub fn options(&self) -> RetrieverOptions {
        self.options
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>, IndexError> {
        let query_vector = self.embedder.embed(query).await?;
        let hits = self
            .index
            .search(&query_vector, self.options.k, self.options.search_mode())?;
        debug!(query_len = query.len(), hits = hits.len(), "retrieved context");
        Ok(hits)
    }
}
