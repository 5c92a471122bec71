mod pages;
mod server;
mod services;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use deeprecall_core::{
    metadata_to_csv, records_to_csv, ChatCompletionsConfig, HttpEmbedderConfig,
    OcrEndpointConfig, OpenSearchConfig, Outcome, RecallError, RetrievalOptions,
    DEFAULT_CHUNK_COLLECTION, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_METADATA_COLLECTION,
};
use serde::Serialize;
use services::{BackendKind, Services, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "deeprecall", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Storage backend.
    #[arg(long, value_enum, env = "DEEPRECALL_BACKEND", default_value = "opensearch")]
    backend: BackendKind,

    /// OpenSearch base URL
    #[arg(long, env = "OPENSEARCH_URL", default_value = "https://localhost:9200")]
    opensearch_url: String,

    #[arg(long, env = "OPENSEARCH_USER")]
    opensearch_user: Option<String>,

    #[arg(long, env = "OPENSEARCH_PASSWORD", hide_env_values = true)]
    opensearch_password: Option<String>,

    /// Accept self-signed certificates from the cluster.
    #[arg(long, env = "OPENSEARCH_INSECURE", default_value_t = false)]
    insecure: bool,

    /// Index holding one metadata record per document.
    #[arg(long, env = "DEEPRECALL_METADATA_INDEX", default_value = DEFAULT_METADATA_COLLECTION)]
    metadata_index: String,

    /// Index holding one record per paragraph.
    #[arg(long, env = "DEEPRECALL_CHUNK_INDEX", default_value = DEFAULT_CHUNK_COLLECTION)]
    chunk_index: String,

    /// OpenAI-compatible chat completions URL.
    #[arg(
        long,
        env = "LLM_ENDPOINT",
        default_value = "https://api.groq.com/openai/v1/chat/completions"
    )]
    llm_endpoint: String,

    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "LLM_MODEL", default_value = "llama-3.1-8b-instant")]
    llm_model: String,

    /// OCR service URL; without it only plain-text files can be ingested.
    #[arg(long, env = "OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    #[arg(long, env = "OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    /// OpenAI-compatible embeddings URL; without it the local n-gram embedder is used.
    #[arg(long, env = "EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "all-MiniLM-L6-v2")]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Per-request timeout for every outbound call, in seconds.
    #[arg(long, env = "DEEPRECALL_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,

    /// Budget for one whole retrieval, in seconds.
    #[arg(long, env = "DEEPRECALL_RETRIEVAL_TIMEOUT_SECS")]
    retrieval_timeout_secs: Option<u64>,

    /// Conversations unused for this many seconds are forgotten.
    #[arg(long, env = "DEEPRECALL_SESSION_IDLE_SECS", default_value_t = 1800)]
    session_idle_secs: u64,

    /// Print structured outcomes as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long, env = "DEEPRECALL_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
    },
    /// Ingest a file, or every supported file under a folder.
    Ingest {
        path: String,
        /// Document id; only valid for a single file. Defaults to a content hash.
        #[arg(long)]
        doc_id: Option<String>,
    },
    /// Retrieve context for a question and answer it.
    Ask {
        query: String,
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Retrieve context for a question without generating an answer.
    Retrieve {
        query: String,
        #[arg(long, default_value = "5")]
        candidate_k: usize,
        #[arg(long, default_value = "3")]
        passage_k: usize,
    },
    /// List stored metadata records.
    List {
        /// Print as CSV.
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Show one metadata record.
    Get { doc_id: String },
    /// Remove a document's metadata and paragraphs.
    Delete { doc_id: String },
    /// Delete every metadata record.
    ClearMetadata,
    /// Drop the paragraph index.
    ClearChunks,
}

impl Cli {
    fn settings(&self) -> Settings {
        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        Settings {
            backend: self.backend,
            opensearch: OpenSearchConfig {
                endpoint: self.opensearch_url.clone(),
                username: self.opensearch_user.clone(),
                password: self.opensearch_password.clone(),
                accept_invalid_certs: self.insecure,
                request_timeout: timeout,
                ..OpenSearchConfig::default()
            },
            metadata_index: self.metadata_index.clone(),
            chunk_index: self.chunk_index.clone(),
            llm: ChatCompletionsConfig {
                endpoint: self.llm_endpoint.clone(),
                api_key: self.llm_api_key.clone(),
                model: self.llm_model.clone(),
                timeout,
                ..ChatCompletionsConfig::default()
            },
            ocr: self.ocr_endpoint.clone().map(|endpoint| OcrEndpointConfig {
                endpoint,
                api_key: self.ocr_api_key.clone(),
                timeout,
            }),
            embedding: self
                .embedding_endpoint
                .clone()
                .map(|endpoint| HttpEmbedderConfig {
                    endpoint,
                    api_key: self.embedding_api_key.clone(),
                    model: self.embedding_model.clone(),
                    dimensions: self.embedding_dimensions,
                    timeout,
                }),
            embedding_dimensions: self.embedding_dimensions,
            retrieval_timeout: self.retrieval_timeout_secs.map(Duration::from_secs),
            session_idle_ttl: Duration::from_secs(self.session_idle_secs),
        }
    }
}

/// Prints `result` as an [`Outcome`] with `--json`, otherwise through `human`.
fn emit<T: Serialize>(
    json: bool,
    result: Result<T, RecallError>,
    message: &str,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if json {
        let failed = result.is_err();
        let outcome = Outcome::from_result(result, message);
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if failed {
            std::process::exit(1);
        }
        return Ok(());
    }
    let value = result?;
    human(&value);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let services = Services::build(cli.settings())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "deeprecall boot"
    );

    match cli.command {
        Command::Serve { bind } => server::serve(Arc::new(services), &bind).await?,
        Command::Ingest { path, doc_id } => {
            ingest(&services, Path::new(&path), doc_id, cli.json).await?
        }
        Command::Ask { query, session } => {
            let answer = services
                .retrieval
                .answer(&services.sessions, &session, &query, &services.llm)
                .await;
            emit(cli.json, answer, "answered", |answer| {
                println!(
                    "document: {} ({} votes)",
                    answer.retrieval.doc_id, answer.retrieval.votes
                );
                println!("{}", answer.reply);
            })?;
        }
        Command::Retrieve {
            query,
            candidate_k,
            passage_k,
        } => {
            let options = RetrievalOptions {
                candidate_k,
                passage_k,
                ..services.retrieval.options().clone()
            };
            let retrieval = services
                .retrieval
                .retrieve_with_options(&query, &options)
                .await;
            emit(cli.json, retrieval, "retrieved", |retrieval| {
                println!("fields:");
                for (name, value) in &retrieval.fields {
                    println!("  {name}: {value}");
                }
                println!("candidates:");
                for candidate in &retrieval.candidates {
                    println!("  {} votes={}", candidate.doc_id, candidate.votes);
                }
                for hit in &retrieval.passages {
                    println!(
                        "[page {} para {}] score={:.4}\n{}",
                        hit.page_no, hit.para_no, hit.score, hit.text
                    );
                }
            })?;
        }
        Command::List { csv } => {
            let records = services.ingestion.metadata().get_all().await;
            emit(cli.json, records, "listed", |records| {
                if csv {
                    match records_to_csv(records) {
                        Ok(table) => print!("{table}"),
                        Err(error) => warn!(%error, "csv export failed"),
                    }
                } else {
                    for record in records {
                        println!("{} fields={}", record.doc_id, record.fields.len());
                    }
                }
            })?;
        }
        Command::Get { doc_id } => {
            let record = services
                .ingestion
                .metadata()
                .get_by_id(&doc_id)
                .await
                .and_then(|record| {
                    record.ok_or_else(|| RecallError::DocumentNotFound(doc_id.clone()))
                });
            emit(cli.json, record, "found", |record| match metadata_to_csv(record) {
                Ok(table) => print!("{table}"),
                Err(error) => warn!(%error, "csv export failed"),
            })?;
        }
        Command::Delete { doc_id } => {
            let report = services.ingestion.delete_document(&doc_id).await;
            emit(cli.json, report, "deleted", |report| {
                println!(
                    "deleted {doc_id}: metadata={} chunks={}",
                    report.metadata_deleted, report.chunks_deleted
                );
            })?;
        }
        Command::ClearMetadata => {
            let deleted = services.ingestion.metadata().delete_all().await;
            emit(cli.json, deleted, "cleared metadata", |deleted| {
                println!("{deleted} metadata records deleted");
            })?;
        }
        Command::ClearChunks => {
            let existed = services.ingestion.chunks().clear().await;
            emit(cli.json, existed, "cleared chunks", |existed| {
                println!("chunk index dropped (existed: {existed})");
            })?;
        }
    }

    Ok(())
}

async fn ingest(
    services: &Services,
    path: &Path,
    doc_id: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let files = if path.is_dir() {
        if doc_id.is_some() {
            anyhow::bail!("--doc-id applies to a single file, not a folder");
        }
        pages::discover_documents(path)
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        anyhow::bail!("no ingestible files found in {}", path.display());
    }

    let mut ingested = 0usize;
    for file in &files {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();

        let result = services
            .ingestion
            .ingest_file(&services.pages, &file_name, &bytes, doc_id.as_deref())
            .await;

        match result {
            Ok(report) => {
                ingested += 1;
                if json {
                    println!("{}", serde_json::to_string(&Outcome::ok(&report, "ingested"))?);
                } else {
                    println!(
                        "{} -> {} ({} paragraphs)",
                        file.display(),
                        report.record.doc_id,
                        report.chunks.indexed
                    );
                    print!("{}", metadata_to_csv(&report.record)?);
                }
            }
            Err(error) if files.len() > 1 => {
                warn!(path = %file.display(), %error, "skipped file");
                if json {
                    println!("{}", serde_json::to_string(&Outcome::<()>::failed(&error))?);
                }
            }
            Err(error) => return Err(error.into()),
        }
    }

    info!(ingested, total = files.len(), "ingestion finished");
    Ok(())
}
