use crate::error::{RecallError, Result};
use crate::models::{MetadataRecord, ARCHIVAL_FIELDS, DOC_ID_FIELD, TIMESTAMP_FIELD};
use crate::store::{CollectionSchema, FieldType, Filter, StoreRecord, TermFilter, WriteMode};
use crate::traits::DocumentBackend;
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub const DEFAULT_METADATA_COLLECTION: &str = "deeprecall-rc-fuzzy";

const SCAN_PAGE_SIZE: usize = 1_000;

/// One metadata record per document, keyed and deduplicated by `doc_id`.
pub struct MetadataStore<B> {
    backend: B,
    collection: String,
}

pub fn metadata_schema() -> CollectionSchema {
    ARCHIVAL_FIELDS.iter().fold(
        CollectionSchema::new().field(DOC_ID_FIELD, FieldType::Keyword),
        |schema, field| schema.field(*field, FieldType::Text),
    )
    .field(TIMESTAMP_FIELD, FieldType::Date)
}

impl<B: DocumentBackend> MetadataStore<B> {
    pub fn new(backend: B, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn ensure_collection(&self) -> Result<()> {
        self.backend
            .create_collection(&self.collection, &metadata_schema())
            .await
    }

    /// Subset of `ids` already stored. A missing collection holds nothing.
    pub async fn exists(&self, ids: &[String]) -> Result<BTreeSet<String>> {
        if ids.is_empty() || !self.backend.collection_exists(&self.collection).await? {
            return Ok(BTreeSet::new());
        }

        let filter = TermFilter::new(DOC_ID_FIELD, ids.to_vec());
        let hits = self
            .backend
            .term_query(&self.collection, &filter, ids.len())
            .await?;
        Ok(hits.iter().map(|hit| hit.doc_id()).collect())
    }

    /// Inserts every record or none of them.
    ///
    /// The write uses create-only semantics so two racing inserts of the same
    /// `doc_id` cannot both succeed; if any item is rejected, the items this call
    /// did write are removed again before the error is returned.
    pub async fn insert(&self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>> {
        if records.is_empty() {
            return Err(RecallError::InvalidArgument(
                "no documents provided".to_string(),
            ));
        }
        if records.iter().any(|record| record.doc_id.trim().is_empty()) {
            return Err(RecallError::MissingDocId);
        }

        let mut seen = BTreeSet::new();
        let repeated: Vec<String> = records
            .iter()
            .filter(|record| !seen.insert(record.doc_id.clone()))
            .map(|record| record.doc_id.clone())
            .collect();
        if !repeated.is_empty() {
            return Err(self.duplicate(repeated));
        }

        let ids: Vec<String> = records.iter().map(|record| record.doc_id.clone()).collect();
        let existing = self.exists(&ids).await?;
        if !existing.is_empty() {
            return Err(self.duplicate(existing.into_iter().collect()));
        }

        self.ensure_collection().await?;

        let now = Utc::now();
        let stamped: Vec<MetadataRecord> = records
            .into_iter()
            .map(|mut record| {
                record.ingested_at = Some(now);
                record
            })
            .collect();
        let writes: Vec<StoreRecord> = stamped
            .iter()
            .map(|record| StoreRecord {
                id: record.doc_id.clone(),
                body: record.to_source(),
            })
            .collect();

        let report = self
            .backend
            .bulk_write(&self.collection, &writes, WriteMode::CreateOnly)
            .await?;

        if !report.is_clean() {
            self.compensate(&report.written).await;
            if !report.conflicts.is_empty() {
                return Err(self.duplicate(report.conflicts));
            }
            let details = report
                .failed
                .iter()
                .map(|(id, reason)| format!("{id}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RecallError::BackendResponse {
                backend: self.backend.backend_name().to_string(),
                details,
            });
        }

        info!(
            collection = %self.collection,
            count = stamped.len(),
            "indexed metadata records"
        );
        Ok(stamped)
    }

    /// Every stored record exactly once, paging through the backend's scan cursor.
    pub async fn get_all(&self) -> Result<Vec<MetadataRecord>> {
        if !self.backend.collection_exists(&self.collection).await? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .backend
                .scan(&self.collection, cursor, SCAN_PAGE_SIZE)
                .await?;
            records.extend(
                page.records
                    .iter()
                    .filter_map(|record| MetadataRecord::from_source(&record.body)),
            );
            match page.next {
                Some(next) if !page.records.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(records)
    }

    pub async fn get_by_id(&self, doc_id: &str) -> Result<Option<MetadataRecord>> {
        if !self.backend.collection_exists(&self.collection).await? {
            return Ok(None);
        }
        let source = self.backend.get(&self.collection, doc_id).await?;
        Ok(source.as_ref().and_then(MetadataRecord::from_source))
    }

    pub async fn delete_by_id(&self, doc_id: &str) -> Result<u64> {
        if !self.backend.collection_exists(&self.collection).await? {
            return Ok(0);
        }
        self.backend
            .delete_by_filter(
                &self.collection,
                &Filter::Terms(TermFilter::single(DOC_ID_FIELD, doc_id)),
            )
            .await
    }

    /// Empties the collection, keeping its mapping.
    pub async fn delete_all(&self) -> Result<u64> {
        if !self.backend.collection_exists(&self.collection).await? {
            return Err(RecallError::IndexNotFound(self.collection.clone()));
        }
        let deleted = self
            .backend
            .delete_by_filter(&self.collection, &Filter::All)
            .await?;
        info!(collection = %self.collection, deleted, "emptied metadata index");
        Ok(deleted)
    }

    fn duplicate(&self, doc_ids: Vec<String>) -> RecallError {
        RecallError::DuplicateDocId {
            collection: self.collection.clone(),
            doc_ids,
        }
    }

    async fn compensate(&self, written: &[String]) {
        if written.is_empty() {
            return;
        }
        let filter = Filter::Terms(TermFilter::new(DOC_ID_FIELD, written.to_vec()));
        match self.backend.delete_by_filter(&self.collection, &filter).await {
            Ok(removed) => warn!(
                collection = %self.collection,
                removed,
                "rolled back partially written metadata batch"
            ),
            Err(error) => warn!(
                collection = %self.collection,
                %error,
                "failed to roll back partially written metadata batch"
            ),
        }
    }
}
