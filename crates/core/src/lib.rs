pub mod chunk_index;
pub mod chunking;
pub mod conversation;
pub mod deadline;
pub mod embeddings;
pub mod error;
pub mod export;
pub mod extractor;
pub mod fuzzy;
pub mod ingest;
pub mod llm;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunk_index::{ChunkIndexer, DEFAULT_CHUNK_COLLECTION};
pub use chunking::{split_paragraphs, Paragraph};
pub use conversation::{
    ConversationLimits, ConversationWindow, EphemeralSession, Message, Role, SessionPolicy,
    SessionRegistry, SYSTEM_PROMPT,
};
pub use deadline::Deadline;
pub use embeddings::{
    CharacterNgramEmbedder, HttpEmbedder, HttpEmbedderConfig, TextEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ErrorKind, Outcome, RecallError, Result};
pub use export::{metadata_to_csv, records_to_csv};
pub use extractor::{HttpPageExtractor, OcrEndpointConfig};
pub use fuzzy::{FieldConfig, FuzzyMatcher};
pub use ingest::{content_doc_id, DeletionReport, IngestionPipeline, IngestionReport};
pub use llm::{ChatCompletionsClient, ChatCompletionsConfig};
pub use metadata::{MetadataStore, DEFAULT_METADATA_COLLECTION};
pub use models::{
    ChunkHit, ChunkKey, FieldMap, FieldValue, IndexReport, IngestionOptions, MetadataRecord,
    QueryFields, RankedDocument, RetrievalOptions, ARCHIVAL_FIELDS,
};
pub use orchestrator::{Answer, Retrieval, RetrievalCoordinator, RetrievalStage};
pub use store::{FuzzyPolicy, Fuzziness};
pub use stores::{InMemoryBackend, OpenSearchBackend, OpenSearchConfig};
pub use traits::{AnswerGenerator, DocumentBackend, FieldExtractor, MetadataExtractor, PageExtractor};
