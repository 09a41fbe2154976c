use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use medibot_core::embeddings::DEFAULT_EMBEDDING_BATCH;
use medibot_core::{
    open_retriever, AnswerRenderer, ChatModel, ChunkingConfig, Embedder, GroqClient,
    HashingEmbedder, IndexPolicy, LlmConfig, LoaderOptions, QueryError, Retriever,
    RetrieverOptions, Session, StartupOptions, TeiConfig, TeiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL, DEFAULT_LLM_BASE_URL,
    DEFAULT_LLM_MODEL,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "medibot", version, about = "Medical question answering over a local PDF library")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder with the source PDFs
    #[arg(long, global = true, env = "MEDIBOT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Folder holding the persisted vector index
    #[arg(long, global = true, env = "MEDIBOT_INDEX_DIR", default_value = "vectorstore/db_index")]
    index_dir: PathBuf,

    /// Also pick up PDFs in nested folders
    #[arg(long, global = true, env = "MEDIBOT_RECURSIVE", default_value_t = false)]
    recursive: bool,

    /// Chunk size in characters
    #[arg(long, global = true, env = "MEDIBOT_CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true, env = "MEDIBOT_CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    #[arg(long, global = true, env = "MEDIBOT_EMBEDDER", value_enum, default_value = "tei")]
    embedder: EmbedderKind,

    /// Text-embeddings-inference server URL
    #[arg(long, global = true, env = "MEDIBOT_EMBEDDING_URL", default_value = "http://localhost:8080")]
    embedding_url: String,

    #[arg(long, global = true, env = "MEDIBOT_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, global = true, env = "MEDIBOT_EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    #[arg(long, global = true, env = "MEDIBOT_EMBEDDING_BATCH", default_value_t = DEFAULT_EMBEDDING_BATCH)]
    embedding_batch: usize,

    /// OpenAI-compatible chat API base URL
    #[arg(long, global = true, env = "MEDIBOT_LLM_URL", default_value = DEFAULT_LLM_BASE_URL)]
    llm_url: String,

    #[arg(long, global = true, env = "MEDIBOT_LLM_MODEL", default_value = DEFAULT_LLM_MODEL)]
    llm_model: String,

    #[arg(long, global = true, env = "MEDIBOT_TEMPERATURE", default_value = "0.5")]
    temperature: f32,

    /// Chat API key
    #[arg(long, global = true, env = "GROQ_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Number of passages handed to the model
    #[arg(long, global = true, env = "MEDIBOT_TOP_K", default_value = "7")]
    top_k: usize,

    /// Candidates considered before diversity re-ranking
    #[arg(long, global = true, env = "MEDIBOT_FETCH_K", default_value = "20")]
    fetch_k: usize,

    /// Relevance weight of the re-ranking, 1.0 ignores diversity
    #[arg(long, global = true, env = "MEDIBOT_MMR_LAMBDA", default_value = "0.5")]
    mmr_lambda: f32,

    #[arg(long, global = true, env = "MEDIBOT_MAX_RETRIES", default_value = "2")]
    max_retries: u32,

    /// Upper bound for one answer, in seconds
    #[arg(long, global = true, env = "MEDIBOT_TIMEOUT_SECS", default_value = "120")]
    timeout_secs: u64,

    /// Rebuild the index even if one is stored
    #[arg(long, global = true, env = "MEDIBOT_REBUILD", default_value_t = false)]
    rebuild: bool,

    /// Rebuild instead of failing when the stored index cannot be loaded
    #[arg(long, global = true, env = "MEDIBOT_REBUILD_ON_ERROR", default_value_t = false)]
    rebuild_on_error: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbedderKind {
    /// Remote text-embeddings-inference server
    Tei,
    /// Offline trigram hashing, no server needed
    Hashing,
}

#[derive(Subcommand)]
enum Command {
    /// Build or load the vector index and report what it holds.
    Index,
    /// Answer one question and exit.
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Interactive chat; `/history` shows past turns, `/exit` quits.
    Chat,
}

impl Cli {
    fn startup_options(&self) -> StartupOptions {
        StartupOptions {
            loader: LoaderOptions {
                recursive: self.recursive,
            },
            chunking: ChunkingConfig {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
            },
            retriever: RetrieverOptions {
                k: self.top_k,
                fetch_k: self.fetch_k,
                lambda: self.mmr_lambda,
            },
            policy: IndexPolicy {
                force_rebuild: self.rebuild,
                rebuild_on_load_error: self.rebuild_on_error,
            },
        }
    }

    fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        Ok(match self.embedder {
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(self.embedding_dimensions)),
            EmbedderKind::Tei => Arc::new(TeiEmbedder::new(TeiConfig {
                base_url: self.embedding_url.clone(),
                model: self.embedding_model.clone(),
                dimensions: self.embedding_dimensions,
                batch_size: self.embedding_batch,
            })?),
        })
    }

    fn chat_model(&self) -> anyhow::Result<Arc<dyn ChatModel>> {
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("no chat API key: set GROQ_API_KEY or pass --api-key")?;

        let config = LlmConfig {
            base_url: self.llm_url.clone(),
            model: self.llm_model.clone(),
            temperature: self.temperature,
            max_retries: self.max_retries,
            request_timeout: Duration::from_secs(self.timeout_secs),
            ..LlmConfig::new(api_key)
        };
        Ok(Arc::new(GroqClient::new(config)?))
    }

    async fn retriever(&self) -> anyhow::Result<Retriever> {
        let (retriever, summary) = open_retriever(
            &self.data_dir,
            &self.index_dir,
            self.embedder()?,
            &self.startup_options(),
        )
        .await
        .with_context(|| format!("failed to prepare knowledge base from {}", self.data_dir.display()))?;

        info!(
            files = summary.files,
            skipped = summary.skipped,
            chunks = summary.chunks,
            indexed = summary.indexed,
            "knowledge base ready"
        );
        Ok(retriever)
    }
}

/// Writes answer fragments to stdout as they arrive.
struct TerminalRenderer;

impl AnswerRenderer for TerminalRenderer {
    fn fragment(&mut self, fragment: &str, _answer_so_far: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(fragment.as_bytes());
        let _ = stdout.flush();
    }

    fn finish(&mut self, _answer: &str) {
        println!();
    }

    fn error(&mut self, message: &str) {
        println!();
        eprintln!("error: {message}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "medibot boot"
    );

    match &cli.command {
        Command::Index => {
            let retriever = cli.retriever().await?;
            let index = retriever.index();
            println!(
                "{} chunks indexed with {} ({} dimensions), built at {}",
                index.len(),
                index.model_id(),
                index.dimensions(),
                index.built_at().to_rfc3339()
            );
        }
        Command::Ask { question } => {
            let model = cli.chat_model()?;
            let retriever = Arc::new(cli.retriever().await?);
            let mut session = Session::new(retriever, model);

            if session
                .handle_query(&question.join(" "), &mut TerminalRenderer)
                .await
                .is_err()
            {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Chat => {
            let model = cli.chat_model()?;
            let retriever = Arc::new(cli.retriever().await?);
            let mut session = Session::new(retriever, model);
            run_chat(&mut session).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_chat(session: &mut Session) -> anyhow::Result<()> {
    println!("Ask a medical question. /history shows past turns, /exit quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/history" => {
                if session.history().is_empty() {
                    println!("(no questions yet)");
                }
                for (number, turn) in session.history().iter().enumerate() {
                    println!("[{}] Q: {}\n    A: {}", number + 1, turn.question, turn.answer);
                }
            }
            question => match session.handle_query(question, &mut TerminalRenderer).await {
                Ok(_) | Err(QueryError::EmptyInput) => {}
                Err(_) => println!("(the question was not added to the history)"),
            },
        }
    }

    session.end();
    Ok(())
}
