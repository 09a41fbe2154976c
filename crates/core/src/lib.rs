pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod prompt;
pub mod retriever;
pub mod session;

#[cfg(test)]
mod test_support;

pub use chunking::split_documents;
pub use embeddings::{
    Embedder, HashingEmbedder, TeiConfig, TeiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_EMBEDDING_MODEL,
};
pub use error::{
    ChunkingError, CorpusLoadError, EmbeddingError, GenerationError, IndexError, IndexLoadError,
    PdfParseError, QueryError, StartupError,
};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use index::VectorIndex;
pub use ingest::{discover_pdf_files, load_corpus, load_corpus_with, CorpusReport, LoadedFile};
pub use llm::{
    ChatModel, FragmentStream, GroqClient, LlmConfig, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL,
};
pub use models::{
    ChatTurn, Chunk, ChunkingConfig, Document, IndexPolicy, LoaderOptions, Metadata,
    RetrieverOptions, ScoredChunk, SearchMode,
};
pub use normalize::normalize;
pub use prompt::{build_context, build_prompt, REFUSAL_MESSAGE};
pub use retriever::Retriever;
pub use session::{
    open_retriever, open_retriever_with, AnswerRenderer, Session, StartupOptions, StartupSummary,
};
