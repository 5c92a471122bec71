use crate::chunking::{split_paragraphs, Paragraph};
use crate::embeddings::TextEmbedder;
use crate::error::{RecallError, Result};
use crate::models::{
    ChunkHit, ChunkRecord, FailedChunk, IndexReport, IngestionOptions, DOC_ID_FIELD,
    TIMESTAMP_FIELD,
};
use crate::store::{
    CollectionSchema, FieldType, Filter, LexicalQuery, StoreHit, StoreRecord, TermFilter,
    WriteMode,
};
use crate::traits::DocumentBackend;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_COLLECTION: &str = "deeprecall-rc-vector";

pub fn chunk_schema(dimensions: usize) -> CollectionSchema {
    CollectionSchema::new()
        .field(DOC_ID_FIELD, FieldType::Keyword)
        .field("page_no", FieldType::Integer)
        .field("para_no", FieldType::Integer)
        .field("text", FieldType::Text)
        .field("embedding", FieldType::Vector { dimensions })
        .field(TIMESTAMP_FIELD, FieldType::Date)
}

/// Paragraph-level index: one record per line of every page, with its embedding.
pub struct ChunkIndexer<B> {
    backend: B,
    collection: String,
    options: IngestionOptions,
}

impl<B: DocumentBackend> ChunkIndexer<B> {
    pub fn new(backend: B, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
            options: IngestionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: IngestionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn ensure_collection(&self, dimensions: usize) -> Result<()> {
        self.backend
            .create_collection(&self.collection, &chunk_schema(dimensions))
            .await
    }

    /// Embeds and writes every paragraph of `pages`.
    ///
    /// Record ids are derived from `(doc_id, page_no, para_no)`, so indexing the
    /// same document twice overwrites instead of duplicating. Paragraphs that fail
    /// to embed or to write are listed in the report; the rest stay indexed.
    pub async fn index<E, S>(&self, doc_id: &str, pages: &[S], embedder: &E) -> Result<IndexReport>
    where
        E: TextEmbedder + ?Sized,
        S: AsRef<str>,
    {
        if doc_id.trim().is_empty() {
            return Err(RecallError::MissingDocId);
        }

        let paragraphs = split_paragraphs(pages);
        let total = paragraphs.len();
        let mut report = IndexReport {
            doc_id: doc_id.to_string(),
            total,
            indexed: 0,
            failed: Vec::new(),
        };
        if paragraphs.is_empty() {
            return Ok(report);
        }

        self.ensure_collection(embedder.dimensions()).await?;

        let expected = embedder.dimensions();
        let embedded: Vec<(Paragraph, Result<Vec<f32>>)> = stream::iter(paragraphs)
            .map(|paragraph| async move {
                let vector = embedder.encode(&paragraph.text).await.and_then(|vector| {
                    if vector.len() == expected {
                        Ok(vector)
                    } else {
                        Err(RecallError::EmbeddingFailure {
                            page_no: paragraph.page_no,
                            para_no: paragraph.para_no,
                            details: format!(
                                "expected {expected} dimensions, got {}",
                                vector.len()
                            ),
                        })
                    }
                });
                (paragraph, vector)
            })
            .buffered(self.options.embedding_concurrency.max(1))
            .collect()
            .await;

        let now = Utc::now();
        let mut pending = Vec::with_capacity(embedded.len());
        let mut keys = HashMap::with_capacity(embedded.len());
        for (paragraph, vector) in embedded {
            match vector {
                Ok(embedding) => {
                    let record = ChunkRecord {
                        key: paragraph.key(doc_id),
                        text: paragraph.text,
                        embedding,
                        ingested_at: now,
                    };
                    let id = record.key.record_id();
                    pending.push(StoreRecord {
                        id: id.clone(),
                        body: serde_json::to_value(&record)?,
                    });
                    keys.insert(id, record.key);
                }
                Err(error) => {
                    warn!(doc_id, page_no = paragraph.page_no, para_no = paragraph.para_no, %error, "embedding failed");
                    report.failed.push(FailedChunk {
                        page_no: paragraph.page_no,
                        para_no: paragraph.para_no,
                        reason: error.to_string(),
                    });
                }
            }
        }

        for batch in pending.chunks(self.options.bulk_batch_size.max(1)) {
            let written = self
                .backend
                .bulk_write(&self.collection, batch, WriteMode::Upsert)
                .await?;
            report.indexed += written.written.len();
            for (id, reason) in written.failed.into_iter().chain(
                written
                    .conflicts
                    .into_iter()
                    .map(|id| (id, "version conflict".to_string())),
            ) {
                let Some(key) = keys.get(&id) else {
                    warn!(doc_id, record_id = %id, %reason, "backend reported an unknown record");
                    continue;
                };
                report.failed.push(FailedChunk {
                    page_no: key.page_no,
                    para_no: key.para_no,
                    reason,
                });
            }
            debug!(doc_id, batch = batch.len(), "wrote chunk batch");
        }

        report
            .failed
            .sort_by_key(|failure| (failure.page_no, failure.para_no));
        info!(
            doc_id,
            total = report.total,
            indexed = report.indexed,
            failed = report.failed.len(),
            "indexed document chunks"
        );
        Ok(report)
    }

    /// Ranked paragraphs, optionally restricted to one document and scored
    /// lexically against `query`. Searching an index that does not exist yet
    /// returns nothing.
    pub async fn search(
        &self,
        doc_id: Option<&str>,
        query: Option<&str>,
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let filter = doc_id.map(|doc_id| TermFilter::single(DOC_ID_FIELD, doc_id));
        let lexical = query
            .filter(|query| !query.trim().is_empty())
            .map(|query| LexicalQuery::new("text", query));

        match self
            .backend
            .filtered_search(&self.collection, filter.as_ref(), lexical.as_ref(), k)
            .await
        {
            Ok(hits) => Ok(hits.iter().filter_map(chunk_hit).collect()),
            Err(RecallError::IndexNotFound(_)) => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    pub async fn delete_by_doc_id(&self, doc_id: &str) -> Result<u64> {
        match self
            .backend
            .delete_by_filter(
                &self.collection,
                &Filter::Terms(TermFilter::single(DOC_ID_FIELD, doc_id)),
            )
            .await
        {
            Err(RecallError::IndexNotFound(_)) => Ok(0),
            other => other,
        }
    }

    /// Drops the whole collection. Returns whether it existed.
    pub async fn clear(&self) -> Result<bool> {
        let existed = self.backend.drop_collection(&self.collection).await?;
        info!(collection = %self.collection, existed, "dropped chunk index");
        Ok(existed)
    }
}

fn position_field(body: &Value, name: &str) -> Option<u32> {
    body.get(name)
        .and_then(Value::as_u64)
        .and_then(|number| u32::try_from(number).ok())
}

/// `None` for records that are not paragraphs of a document.
fn chunk_hit(hit: &StoreHit) -> Option<ChunkHit> {
    let page_no = position_field(&hit.source, "page_no")?;
    let para_no = position_field(&hit.source, "para_no")?;
    Some(ChunkHit {
        doc_id: hit.source.get(DOC_ID_FIELD)?.as_str()?.to_string(),
        page_no,
        para_no,
        text: hit
            .source
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        score: hit.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::stores::InMemoryBackend;
    use crate::store::{BulkReport, FuzzyPolicy, ScanCursor, ScanPage};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn indexer() -> (Arc<InMemoryBackend>, ChunkIndexer<Arc<InMemoryBackend>>) {
        let backend = Arc::new(InMemoryBackend::new());
        let indexer = ChunkIndexer::new(backend.clone(), "chunks");
        (backend, indexer)
    }

    fn embedder() -> CharacterNgramEmbedder {
        CharacterNgramEmbedder { dimensions: 16 }
    }

    #[tokio::test]
    async fn every_line_becomes_one_record() {
        let (backend, indexer) = indexer();
        let pages = ["Reactor 4 exploded.\nFire spread.", "Evacuation of Pripyat."];

        let report = indexer.index("doc_123", &pages, &embedder()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.indexed, 3);
        assert!(report.is_complete());
        assert_eq!(backend.record_count("chunks"), 3);
        let stored = backend
            .get("chunks", "doc_123_page_2_para_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["text"], "Evacuation of Pripyat.");
        assert_eq!(stored["embedding"].as_array().map(Vec::len), Some(16));
    }

    #[tokio::test]
    async fn reindexing_overwrites_instead_of_duplicating() {
        let (backend, indexer) = indexer();
        indexer.index("doc_1", &["a\nb"], &embedder()).await.unwrap();
        indexer.index("doc_1", &["a\nb"], &embedder()).await.unwrap();
        assert_eq!(backend.record_count("chunks"), 2);
    }

    #[tokio::test]
    async fn search_is_scoped_to_one_document() {
        let (_, indexer) = indexer();
        indexer
            .index("doc_a", &["nuclear reactor fire"], &embedder())
            .await
            .unwrap();
        indexer
            .index("doc_b", &["nuclear reactor design\nunrelated line"], &embedder())
            .await
            .unwrap();

        let hits = indexer
            .search(Some("doc_b"), Some("nuclear reactor"), 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc_b");
        assert_eq!((hits[0].page_no, hits[0].para_no), (1, 1));
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn search_without_query_returns_first_k_of_document() {
        let (_, indexer) = indexer();
        indexer
            .index("doc_a", &["one\ntwo\nthree\nfour"], &embedder())
            .await
            .unwrap();
        let hits = indexer.search(Some("doc_a"), None, 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn missing_index_searches_empty_and_deletes_nothing() {
        let (_, indexer) = indexer();
        assert!(indexer.search(None, Some("x"), 3).await.unwrap().is_empty());
        assert_eq!(indexer.delete_by_doc_id("doc_a").await.unwrap(), 0);
        assert!(!indexer.clear().await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let (backend, indexer) = indexer();
        indexer.index("doc_a", &["x\ny"], &embedder()).await.unwrap();
        indexer.index("doc_b", &["z"], &embedder()).await.unwrap();

        assert_eq!(indexer.delete_by_doc_id("doc_a").await.unwrap(), 2);
        assert_eq!(backend.record_count("chunks"), 1);
        assert!(indexer.clear().await.unwrap());
        assert!(!backend.collection_exists("chunks").await.unwrap());
    }

    struct FlakyEmbedder;

    #[async_trait]
    impl TextEmbedder for FlakyEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn encode(&self, text: &str) -> Result<Vec<f32>> {
            match text {
                "broken" => Err(RecallError::BackendUnavailable {
                    backend: "embeddings".to_string(),
                    details: "down".to_string(),
                }),
                "short" => Ok(vec![1.0]),
                _ => Ok(vec![0.5; 4]),
            }
        }
    }

    #[tokio::test]
    async fn embedding_failures_are_reported_per_paragraph() {
        let (backend, indexer) = indexer();
        let report = indexer
            .index("doc_x", &["fine\nbroken", "short\nfine"], &FlakyEmbedder)
            .await
            .unwrap();

        assert_eq!(report.total, 4);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failed_keys(), vec![(1, 2), (2, 1)]);
        assert_eq!(backend.record_count("chunks"), 2);
    }

    #[tokio::test]
    async fn small_batches_still_write_everything() {
        let backend = Arc::new(InMemoryBackend::new());
        let indexer = ChunkIndexer::new(backend.clone(), "chunks").with_options(IngestionOptions {
            bulk_batch_size: 2,
            embedding_concurrency: 3,
            ..IngestionOptions::default()
        });
        let page = (1..=7).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let report = indexer.index("doc_b", &[page], &embedder()).await.unwrap();
        assert_eq!(report.indexed, 7);
        assert_eq!(backend.record_count("chunks"), 7);
    }

    /// Refuses to store one record id, passing everything else through.
    struct RejectingBackend {
        inner: InMemoryBackend,
        rejected: String,
    }

    #[async_trait]
    impl DocumentBackend for RejectingBackend {
        fn backend_name(&self) -> &str {
            "rejecting"
        }

        async fn collection_exists(&self, collection: &str) -> Result<bool> {
            self.inner.collection_exists(collection).await
        }

        async fn create_collection(&self, collection: &str, schema: &CollectionSchema) -> Result<()> {
            self.inner.create_collection(collection, schema).await
        }

        async fn drop_collection(&self, collection: &str) -> Result<bool> {
            self.inner.drop_collection(collection).await
        }

        async fn bulk_write(
            &self,
            collection: &str,
            records: &[StoreRecord],
            mode: WriteMode,
        ) -> Result<BulkReport> {
            let accepted: Vec<StoreRecord> = records
                .iter()
                .filter(|record| record.id != self.rejected)
                .cloned()
                .collect();
            let mut report = self.inner.bulk_write(collection, &accepted, mode).await?;
            if accepted.len() < records.len() {
                report
                    .failed
                    .push((self.rejected.clone(), "mapper_parsing_exception".to_string()));
            }
            Ok(report)
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
            self.inner.get(collection, id).await
        }

        async fn term_query(
            &self,
            collection: &str,
            filter: &TermFilter,
            size: usize,
        ) -> Result<Vec<StoreHit>> {
            self.inner.term_query(collection, filter, size).await
        }

        async fn fuzzy_match(
            &self,
            collection: &str,
            field: &str,
            value: &str,
            policy: &FuzzyPolicy,
            size: usize,
        ) -> Result<Vec<StoreHit>> {
            self.inner
                .fuzzy_match(collection, field, value, policy, size)
                .await
        }

        async fn filtered_search(
            &self,
            collection: &str,
            filter: Option<&TermFilter>,
            lexical: Option<&LexicalQuery>,
            k: usize,
        ) -> Result<Vec<StoreHit>> {
            self.inner
                .filtered_search(collection, filter, lexical, k)
                .await
        }

        async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
            self.inner.delete_by_filter(collection, filter).await
        }

        async fn scan(
            &self,
            collection: &str,
            cursor: Option<ScanCursor>,
            page_size: usize,
        ) -> Result<ScanPage> {
            self.inner.scan(collection, cursor, page_size).await
        }
    }

    #[tokio::test]
    async fn write_failures_keep_their_paragraph_position() {
        let indexer = ChunkIndexer::new(
            RejectingBackend {
                inner: InMemoryBackend::new(),
                rejected: "doc_w_page_2_para_3".to_string(),
            },
            "chunks",
        );
        let report = indexer
            .index("doc_w", &["a\nb", "c\nd\ne"], &embedder())
            .await
            .unwrap();

        assert_eq!(report.indexed, 4);
        assert_eq!(report.failed_keys(), vec![(2, 3)]);
        assert_eq!(report.failed[0].reason, "mapper_parsing_exception");
    }

    #[test]
    fn hits_without_a_valid_position_are_skipped() {
        let hit = |page_no: Value| StoreHit {
            id: "x".to_string(),
            score: 1.0,
            source: serde_json::json!({
                "doc_id": "doc_1",
                "page_no": page_no,
                "para_no": 1,
                "text": "line",
            }),
        };
        assert_eq!(chunk_hit(&hit(Value::from(2))).map(|c| c.page_no), Some(2));
        assert!(chunk_hit(&hit(Value::from(u64::from(u32::MAX) + 1))).is_none());
        assert!(chunk_hit(&hit(Value::Null)).is_none());
    }
}
