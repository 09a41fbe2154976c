use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorpusLoadError {
    #[error("corpus directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("no pdf files found in {0}")]
    NoPdfFiles(PathBuf),

    #[error("none of the {} pdf files in {dir} could be read", skipped.len())]
    NoReadableFiles {
        dir: PathBuf,
        skipped: Vec<PdfParseError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
#[error("pdf parse error in {}: {reason}", path.display())]
pub struct PdfParseError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ChunkingError {
    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding dimension {actual} does not match {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum IndexLoadError {
    #[error("no persisted index at {0}")]
    Missing(PathBuf),

    #[error("persisted index at {} is corrupt: {details}", path.display())]
    Corrupt { path: PathBuf, details: String },

    #[error("index was built with {indexed} but the embedder is {configured}")]
    EmbedderMismatch { indexed: String, configured: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Load(#[from] IndexLoadError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("authentication rejected by {backend}: {details}")]
    Authentication { backend: String, details: String },

    #[error("rate limited by {backend}: {details}")]
    RateLimited { backend: String, details: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("{backend} returned {status}: {details}")]
    Backend {
        backend: String,
        status: u16,
        details: String,
    },

    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("could not decode stream event: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GenerationError {
    /// Whether a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::RateLimited { .. } | GenerationError::Network(_) => true,
            GenerationError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("question is empty")]
    EmptyInput,

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] IndexError),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Corpus(#[from] CorpusLoadError),

    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

