use crate::pages::FilePages;
use deeprecall_core::{
    CharacterNgramEmbedder, ChatCompletionsClient, ChatCompletionsConfig, ChunkIndexer,
    ConversationLimits, DocumentBackend, FuzzyMatcher, HttpEmbedder, HttpEmbedderConfig,
    HttpPageExtractor, InMemoryBackend, IngestionPipeline, MetadataStore, OcrEndpointConfig,
    OpenSearchBackend, OpenSearchConfig, RetrievalCoordinator, RetrievalOptions, SessionPolicy,
    SessionRegistry, TextEmbedder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type SharedBackend = Arc<dyn DocumentBackend>;
pub type Llm = Arc<ChatCompletionsClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Opensearch,
    Memory,
}

/// Connection settings resolved from flags and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendKind,
    pub opensearch: OpenSearchConfig,
    pub metadata_index: String,
    pub chunk_index: String,
    pub llm: ChatCompletionsConfig,
    pub ocr: Option<OcrEndpointConfig>,
    pub embedding: Option<HttpEmbedderConfig>,
    pub embedding_dimensions: usize,
    pub retrieval_timeout: Option<Duration>,
    pub session_idle_ttl: Duration,
}

pub struct Services {
    pub ingestion: IngestionPipeline<SharedBackend, Llm, Arc<dyn TextEmbedder>>,
    pub retrieval: RetrievalCoordinator<SharedBackend, Llm>,
    pub llm: Llm,
    pub pages: FilePages,
    pub sessions: SessionRegistry,
}

impl Services {
    pub fn build(settings: Settings) -> anyhow::Result<Self> {
        let backend: SharedBackend = match settings.backend {
            BackendKind::Opensearch => {
                Arc::new(OpenSearchBackend::new(settings.opensearch.clone())?)
            }
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
        };

        let embedder: Arc<dyn TextEmbedder> = match settings.embedding {
            Some(config) => Arc::new(HttpEmbedder::new(config)?),
            None => Arc::new(CharacterNgramEmbedder {
                dimensions: settings.embedding_dimensions,
            }),
        };

        let llm = Arc::new(ChatCompletionsClient::new(settings.llm.clone())?);
        let ocr = settings.ocr.map(HttpPageExtractor::new).transpose()?;

        info!(
            backend = backend.backend_name(),
            metadata_index = %settings.metadata_index,
            chunk_index = %settings.chunk_index,
            embedding_dimensions = embedder.dimensions(),
            model = %settings.llm.model,
            ocr = ocr.is_some(),
            "services configured"
        );

        let ingestion = IngestionPipeline::new(
            MetadataStore::new(backend.clone(), settings.metadata_index.clone()),
            ChunkIndexer::new(backend.clone(), settings.chunk_index.clone()),
            llm.clone(),
            embedder,
        );
        let retrieval = RetrievalCoordinator::new(
            FuzzyMatcher::new(backend.clone(), settings.metadata_index),
            ChunkIndexer::new(backend, settings.chunk_index),
            llm.clone(),
        )
        .with_options(RetrievalOptions {
            timeout: settings.retrieval_timeout,
            ..RetrievalOptions::default()
        });

        Ok(Self {
            ingestion,
            retrieval,
            llm,
            pages: FilePages::new(ocr),
            sessions: SessionRegistry::with_policy(
                ConversationLimits::default(),
                SessionPolicy {
                    idle_ttl: settings.session_idle_ttl,
                    ..SessionPolicy::default()
                },
            ),
        })
    }
}
