use crate::chunk_index::ChunkIndexer;
use crate::chunking::document_text;
use crate::embeddings::TextEmbedder;
use crate::error::{RecallError, Result};
use crate::metadata::MetadataStore;
use crate::models::{prune_empty, IndexReport, IngestionOptions, MetadataRecord};
use crate::traits::{DocumentBackend, MetadataExtractor, PageExtractor};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub record: MetadataRecord,
    pub chunks: IndexReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub metadata_deleted: u64,
    pub chunks_deleted: u64,
}

/// `doc_` plus the first 16 hex digits of the content's SHA-256.
pub fn content_doc_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    format!("doc_{}", &digest[..16])
}

/// Writes a document's metadata record and paragraph chunks as one unit.
///
/// The two stores are written one after the other. When chunk indexing fails
/// after the metadata record landed, the chunks written so far and the
/// metadata record are deleted again so that no orphaned metadata stays
/// behind and the same `doc_id` can be ingested later.
pub struct IngestionPipeline<B, M, E> {
    metadata: MetadataStore<B>,
    chunks: ChunkIndexer<B>,
    extractor: M,
    embedder: E,
    options: IngestionOptions,
}

impl<B, M, E> IngestionPipeline<B, M, E>
where
    B: DocumentBackend,
    M: MetadataExtractor,
    E: TextEmbedder,
{
    pub fn new(
        metadata: MetadataStore<B>,
        chunks: ChunkIndexer<B>,
        extractor: M,
        embedder: E,
    ) -> Self {
        Self {
            metadata,
            chunks,
            extractor,
            embedder,
            options: IngestionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: IngestionOptions) -> Self {
        self.chunks = self.chunks.with_options(options.clone());
        self.options = options;
        self
    }

    pub fn metadata(&self) -> &MetadataStore<B> {
        &self.metadata
    }

    pub fn chunks(&self) -> &ChunkIndexer<B> {
        &self.chunks
    }

    pub async fn ingest_pages<S: AsRef<str> + Sync>(
        &self,
        doc_id: &str,
        pages: &[S],
    ) -> Result<IngestionReport> {
        let doc_id = doc_id.trim();
        if doc_id.is_empty() {
            return Err(RecallError::MissingDocId);
        }
        if pages.is_empty() {
            return Err(RecallError::InvalidArgument(format!(
                "document '{doc_id}' has no pages"
            )));
        }

        // Fail fast before paying for metadata extraction; insert re-checks atomically.
        let existing = self.metadata.exists(&[doc_id.to_string()]).await?;
        if !existing.is_empty() {
            return Err(RecallError::DuplicateDocId {
                collection: self.metadata.collection().to_string(),
                doc_ids: existing.into_iter().collect(),
            });
        }

        let fields = prune_empty(
            self.extractor
                .extract_metadata(&document_text(pages))
                .await?,
        );
        let mut record = MetadataRecord::new(doc_id);
        record.fields = fields;

        let record = self
            .metadata
            .insert(vec![record])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::BackendResponse {
                backend: "metadata".to_string(),
                details: "insert returned no record".to_string(),
            })?;

        // Paragraphs left over from an earlier ingestion whose metadata was
        // cleared on its own would otherwise mix with the new ones.
        let stale = match self.chunks.delete_by_doc_id(doc_id).await {
            Ok(stale) => stale,
            Err(error) => {
                self.compensate(doc_id).await;
                return Err(error);
            }
        };
        if stale > 0 {
            warn!(doc_id, stale, "removed paragraphs left from an earlier ingestion");
        }

        let chunks = match self.chunks.index(doc_id, pages, &self.embedder).await {
            Ok(report) => report,
            Err(error) => {
                self.compensate(doc_id).await;
                return Err(error);
            }
        };

        if !chunks.is_complete() && !self.options.allow_partial {
            self.compensate(doc_id).await;
            return Err(RecallError::PartialIndexFailure {
                doc_id: doc_id.to_string(),
                total: chunks.total,
                failed: chunks.failed_keys(),
            });
        }

        info!(
            doc_id,
            fields = record.fields.len(),
            paragraphs = chunks.indexed,
            failed = chunks.failed.len(),
            "ingested document"
        );
        Ok(IngestionReport { record, chunks })
    }

    /// Extracts page text from an uploaded file and ingests it. Without an
    /// explicit `doc_id` the id is derived from the file content.
    pub async fn ingest_file<P>(
        &self,
        pages: &P,
        file_name: &str,
        bytes: &[u8],
        doc_id: Option<&str>,
    ) -> Result<IngestionReport>
    where
        P: PageExtractor + ?Sized,
    {
        let doc_id = doc_id
            .map(str::trim)
            .filter(|doc_id| !doc_id.is_empty())
            .map_or_else(|| content_doc_id(bytes), str::to_string);
        let texts = pages.extract_pages(file_name, bytes).await?;
        self.ingest_pages(&doc_id, &texts).await
    }

    pub async fn delete_document(&self, doc_id: &str) -> Result<DeletionReport> {
        let report = DeletionReport {
            chunks_deleted: self.chunks.delete_by_doc_id(doc_id).await?,
            metadata_deleted: self.metadata.delete_by_id(doc_id).await?,
        };
        if report.metadata_deleted == 0 && report.chunks_deleted == 0 {
            return Err(RecallError::DocumentNotFound(doc_id.to_string()));
        }
        info!(doc_id, chunks = report.chunks_deleted, "deleted document");
        Ok(report)
    }

    async fn compensate(&self, doc_id: &str) {
        let chunks = self.chunks.delete_by_doc_id(doc_id).await;
        let metadata = self.metadata.delete_by_id(doc_id).await;
        match (chunks, metadata) {
            (Ok(chunks), Ok(metadata)) => {
                warn!(doc_id, chunks, metadata, "rolled back partially ingested document")
            }
            (chunks, metadata) => warn!(
                doc_id,
                chunk_error = ?chunks.err(),
                metadata_error = ?metadata.err(),
                "rollback of partially ingested document failed"
            ),
        }
    }
}
