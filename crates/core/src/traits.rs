use crate::conversation::Message;
use crate::error::Result;
use crate::models::FieldMap;
use crate::store::{
    BulkReport, CollectionSchema, Filter, FuzzyPolicy, LexicalQuery, ScanCursor, ScanPage,
    StoreHit, StoreRecord, TermFilter, WriteMode,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Indexed-document backend shared by the metadata store and the chunk indexer.
///
/// Operations against a collection that was never created fail with
/// [`RecallError::IndexNotFound`](crate::RecallError::IndexNotFound), except
/// [`collection_exists`](DocumentBackend::collection_exists) and
/// [`drop_collection`](DocumentBackend::drop_collection).
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Short name used in log lines and error messages.
    fn backend_name(&self) -> &str;

    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Creates the collection; an already existing collection is left untouched.
    async fn create_collection(&self, collection: &str, schema: &CollectionSchema) -> Result<()>;

    /// Returns whether the collection existed.
    async fn drop_collection(&self, collection: &str) -> Result<bool>;

    async fn bulk_write(
        &self,
        collection: &str,
        records: &[StoreRecord],
        mode: WriteMode,
    ) -> Result<BulkReport>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    async fn term_query(
        &self,
        collection: &str,
        filter: &TermFilter,
        size: usize,
    ) -> Result<Vec<StoreHit>>;

    async fn fuzzy_match(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        policy: &FuzzyPolicy,
        size: usize,
    ) -> Result<Vec<StoreHit>>;

    /// Filter and lexical match combined in one query; with neither every record qualifies.
    async fn filtered_search(
        &self,
        collection: &str,
        filter: Option<&TermFilter>,
        lexical: Option<&LexicalQuery>,
        k: usize,
    ) -> Result<Vec<StoreHit>>;

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// One page of a full scan. Pass the previous page's cursor to continue.
    async fn scan(
        &self,
        collection: &str,
        cursor: Option<ScanCursor>,
        page_size: usize,
    ) -> Result<ScanPage>;
}

#[async_trait]
impl<T: DocumentBackend + ?Sized> DocumentBackend for Arc<T> {
    fn backend_name(&self) -> &str {
        (**self).backend_name()
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        (**self).collection_exists(collection).await
    }

    async fn create_collection(&self, collection: &str, schema: &CollectionSchema) -> Result<()> {
        (**self).create_collection(collection, schema).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool> {
        (**self).drop_collection(collection).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        records: &[StoreRecord],
        mode: WriteMode,
    ) -> Result<BulkReport> {
        (**self).bulk_write(collection, records, mode).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        (**self).get(collection, id).await
    }

    async fn term_query(
        &self,
        collection: &str,
        filter: &TermFilter,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        (**self).term_query(collection, filter, size).await
    }

    async fn fuzzy_match(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        policy: &FuzzyPolicy,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        (**self)
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
        (**self).filtered_search(collection, filter, lexical, k).await
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        (**self).delete_by_filter(collection, filter).await
    }

    async fn scan(
        &self,
        collection: &str,
        cursor: Option<ScanCursor>,
        page_size: usize,
    ) -> Result<ScanPage> {
        (**self).scan(collection, cursor, page_size).await
    }
}

/// Turns a free-text question into the metadata attributes it mentions.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(&self, text: &str) -> Result<FieldMap>;
}

/// Derives the metadata record of a whole document at ingestion time.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract_metadata(&self, document_text: &str) -> Result<FieldMap>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, turns: &[Message]) -> Result<String>;
}

/// Turns an uploaded file into its ordered page texts (OCR or similar).
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract_pages(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: FieldExtractor + ?Sized> FieldExtractor for Arc<T> {
    async fn extract_fields(&self, text: &str) -> Result<FieldMap> {
        (**self).extract_fields(text).await
    }
}

#[async_trait]
impl<T: MetadataExtractor + ?Sized> MetadataExtractor for Arc<T> {
    async fn extract_metadata(&self, document_text: &str) -> Result<FieldMap> {
        (**self).extract_metadata(document_text).await
    }
}

#[async_trait]
impl<T: AnswerGenerator + ?Sized> AnswerGenerator for Arc<T> {
    async fn generate(&self, system_prompt: &str, turns: &[Message]) -> Result<String> {
        (**self).generate(system_prompt, turns).await
    }
}

#[async_trait]
impl<T: PageExtractor + ?Sized> PageExtractor for Arc<T> {
    async fn extract_pages(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<String>> {
        (**self).extract_pages(file_name, bytes).await
    }
}
