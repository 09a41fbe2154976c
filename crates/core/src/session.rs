use crate::chunking::split_documents;
use crate::embeddings::Embedder;
use crate::error::{IndexError, QueryError, StartupError};
use crate::extractor::{LopdfExtractor, PdfExtractor};
use crate::index::VectorIndex;
use crate::ingest::load_corpus_with;
use crate::llm::ChatModel;
use crate::models::{ChatTurn, ChunkingConfig, IndexPolicy, LoaderOptions, RetrieverOptions};
use crate::prompt::{build_context, build_prompt};
use crate::retriever::Retriever;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives a streamed answer as it is produced.
pub trait AnswerRenderer {
    fn fragment(&mut self, fragment: &str, answer_so_far: &str);
    fn finish(&mut self, answer: &str);
    fn error(&mut self, message: &str);
}

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub loader: LoaderOptions,
    pub chunking: ChunkingConfig,
    pub retriever: RetrieverOptions,
    pub policy: IndexPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupSummary {
    pub files: usize,
    pub skipped: usize,
    pub documents: usize,
    pub chunks: usize,
    pub indexed: usize,
}

pub async fn open_retriever(
    corpus_dir: &Path,
    index_dir: &Path,
    embedder: Arc<dyn Embedder>,
    options: &StartupOptions,
) -> Result<(Retriever, StartupSummary), StartupError> {
    open_retriever_with(corpus_dir, index_dir, embedder, options, &LopdfExtractor).await
}

/// Load the corpus, chunk it, then open or build the index behind a retriever.
///
/// The corpus is always read so a stale index can be reported; chunks are
/// only embedded when the index has to be built.
pub async fn open_retriever_with<E: PdfExtractor + ?Sized>(
    corpus_dir: &Path,
    index_dir: &Path,
    embedder: Arc<dyn Embedder>,
    options: &StartupOptions,
    extractor: &E,
) -> Result<(Retriever, StartupSummary), StartupError> {
    let corpus = load_corpus_with(corpus_dir, &options.loader, extractor)?;
    let chunks = split_documents(&corpus.documents, options.chunking)?;

    let summary = StartupSummary {
        files: corpus.files.len(),
        skipped: corpus.skipped.len(),
        documents: corpus.documents.len(),
        chunks: chunks.len(),
        indexed: 0,
    };
    info!(
        files = summary.files,
        skipped = summary.skipped,
        documents = summary.documents,
        chunks = summary.chunks,
        "corpus prepared"
    );

    let index = VectorIndex::open_or_build(
        index_dir,
        chunks,
        embedder.as_ref(),
        Some(corpus.fingerprint()),
        options.policy,
    )
    .await?;
    let summary = StartupSummary {
        indexed: index.len(),
        ..summary
    };

    let retriever =
        Retriever::new(Arc::new(index), embedder, options.retriever).map_err(IndexError::from)?;
    Ok((retriever, summary))
}

/// One user's conversation: retrieval, generation and the running history.
pub struct Session {
    retriever: Arc<Retriever>,
    model: Arc<dyn ChatModel>,
    history: Vec<ChatTurn>,
    last_prompt: Option<String>,
}

impl Session {
    pub fn new(retriever: Arc<Retriever>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            retriever,
            model,
            history: Vec::new(),
            last_prompt: None,
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    pub fn end(&mut self) {
        info!(turns = self.history.len(), "session ended");
        self.history.clear();
        self.last_prompt = None;
    }

    /// Answer one question, streaming fragments into `renderer`.
    ///
    /// The turn is recorded only when generation completes. Failures are
    /// reported to the renderer and returned; the session stays usable.
    pub async fn handle_query(
        &mut self,
        input: &str,
        renderer: &mut dyn AnswerRenderer,
    ) -> Result<String, QueryError> {
        match self.answer(input, renderer).await {
            Ok(answer) => {
                renderer.finish(&answer);
                self.history.push(ChatTurn {
                    question: input.trim().to_string(),
                    answer: answer.clone(),
                });
                Ok(answer)
            }
            Err(error) => {
                warn!(%error, "query failed");
                renderer.error(&error.to_string());
                Err(error)
            }
        }
    }

    async fn answer(
        &mut self,
        input: &str,
        renderer: &mut dyn AnswerRenderer,
    ) -> Result<String, QueryError> {
        let question = input.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyInput);
        }

        let hits = self.retriever.retrieve(question).await?;
        let prompt = build_prompt(&build_context(&hits), question);
        self.last_prompt = Some(prompt.clone());
        info!(
            hits = hits.len(),
            model = self.model.model_id(),
            "generating answer"
        );

        let mut stream = self.model.stream_generate(&prompt).await?;
        let mut answer = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            answer.push_str(&fragment);
            renderer.fragment(&fragment, &answer);
        }
        Ok(answer)
    }
}
