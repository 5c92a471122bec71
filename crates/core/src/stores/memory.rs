//! In-memory [`DocumentBackend`] for tests and offline runs.
//!
//! Record bodies live in ordered maps behind a `std::sync::RwLock`. Each
//! collection also keeps a tantivy RAM index over its keyword and text fields,
//! which serves term filters, BM25 matching and fuzzy term queries. String
//! fields the collection schema does not declare are mapped as text the first
//! time they show up, which rebuilds that collection's index.
//!
//! Fuzzy matching differs from OpenSearch in two ways: `max_expansions` is not
//! enforced, and the exact prefix is required of some term in the field rather
//! than of the expanded term itself.

use crate::error::{RecallError, Result};
use crate::store::{
    BulkReport, CollectionSchema, FieldType, Filter, FuzzyPolicy, LexicalQuery, ScanCursor,
    ScanPage, StoreHit, StoreRecord, TermFilter, WriteMode,
};
use crate::traits::DocumentBackend;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tantivy::collector::TopDocs;
use tantivy::query::{
    AllQuery, BooleanQuery, ConstScoreQuery, FuzzyTermQuery, Occur, Query, RegexQuery, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value as _, STORED, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const WRITER_HEAP_BYTES: usize = 15_000_000;
/// Largest edit distance tantivy builds automata for.
const MAX_EDITS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    Keyword,
    Text,
    Ignored,
}

fn declared_mapping(kind: FieldType) -> Mapping {
    match kind {
        FieldType::Keyword | FieldType::Integer => Mapping::Keyword,
        FieldType::Text => Mapping::Text,
        FieldType::Date | FieldType::Vector { .. } => Mapping::Ignored,
    }
}

/// Mapping for an undeclared field, `None` until a non-empty value is seen.
fn dynamic_mapping(value: &Value) -> Option<Mapping> {
    match value {
        Value::String(_) => Some(Mapping::Text),
        Value::Number(_) | Value::Bool(_) => Some(Mapping::Keyword),
        Value::Array(items) => items.iter().find_map(dynamic_mapping),
        Value::Object(_) => Some(Mapping::Ignored),
        Value::Null => None,
    }
}

fn indexable_values(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.clone()),
        Value::Number(number) => out.push(number.to_string()),
        Value::Bool(flag) => out.push(flag.to_string()),
        Value::Array(items) => items.iter().for_each(|item| indexable_values(item, out)),
        Value::Null | Value::Object(_) => {}
    }
}

/// Search side of one collection. Tantivy field names are synthetic so any
/// record key can be indexed.
struct SearchIndex {
    index: Index,
    reader: IndexReader,
    id: Field,
    fields: HashMap<String, Field>,
}

impl SearchIndex {
    fn build(mappings: &BTreeMap<String, Mapping>, records: &BTreeMap<String, Value>) -> Result<Self> {
        let mut builder = Schema::builder();
        let id = builder.add_text_field("id", STRING | STORED);
        let mut fields = HashMap::new();
        for (position, (name, mapping)) in mappings.iter().enumerate() {
            let field_name = format!("f{position}");
            let field = match mapping {
                Mapping::Keyword => builder.add_text_field(&field_name, STRING),
                Mapping::Text => builder.add_text_field(&field_name, TEXT),
                Mapping::Ignored => continue,
            };
            fields.insert(name.clone(), field);
        }

        let index = Index::create_in_ram(builder.build());
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let search = Self {
            index,
            reader,
            id,
            fields,
        };

        if !records.is_empty() {
            let mut writer = search.writer()?;
            for (id, source) in records {
                writer.add_document(search.document(id, source))?;
            }
            search.commit(writer)?;
        }
        Ok(search)
    }

    fn writer(&self) -> Result<IndexWriter> {
        Ok(self.index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?)
    }

    fn commit(&self, mut writer: IndexWriter) -> Result<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    fn document(&self, id: &str, source: &Value) -> TantivyDocument {
        let mut document = TantivyDocument::default();
        document.add_text(self.id, id);
        for (name, field) in &self.fields {
            let mut values = Vec::new();
            if let Some(value) = source.get(name) {
                indexable_values(value, &mut values);
            }
            for value in values {
                document.add_text(*field, value);
            }
        }
        document
    }

    fn id_term(&self, id: &str) -> Term {
        Term::from_field_text(self.id, id)
    }

    /// Terms of `text` as the field's tokenizer produces them.
    fn analyze(&self, field: Field, text: &str) -> Result<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(field)?;
        let mut stream = analyzer.token_stream(text);
        let mut terms = Vec::new();
        while stream.advance() {
            terms.push(stream.token().text.clone());
        }
        Ok(terms)
    }

    /// `None` when the field is not indexed, so nothing can match.
    fn terms_query(&self, filter: &TermFilter) -> Option<Box<dyn Query>> {
        let field = *self.fields.get(&filter.field)?;
        let clauses = filter
            .values
            .iter()
            .map(|value| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(field, value),
                    IndexRecordOption::Basic,
                ));
                (Occur::Should, query)
            })
            .collect();
        Some(Box::new(BooleanQuery::new(clauses)))
    }

    /// Any analyzed term of the text, BM25 scored.
    fn match_query(&self, lexical: &LexicalQuery) -> Result<Option<Box<dyn Query>>> {
        let Some(&field) = self.fields.get(&lexical.field) else {
            return Ok(None);
        };
        let clauses: Vec<(Occur, Box<dyn Query>)> = self
            .analyze(field, &lexical.text)?
            .into_iter()
            .map(|term| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(field, &term),
                    IndexRecordOption::WithFreqs,
                ));
                (Occur::Should, query)
            })
            .collect();
        if clauses.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BooleanQuery::new(clauses))))
    }

    fn fuzzy_query(
        &self,
        field_name: &str,
        value: &str,
        policy: &FuzzyPolicy,
    ) -> Result<Option<Box<dyn Query>>> {
        let Some(&field) = self.fields.get(field_name) else {
            return Ok(None);
        };
        let mut clauses = Vec::new();
        for term in self.analyze(field, value)? {
            if !term.is_empty() {
                clauses.push((Occur::Should, fuzzy_term(field, &term, policy)?));
            }
        }
        if clauses.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BooleanQuery::new(clauses))))
    }

    /// Every live record matching `query` with its score, best first, ties by id.
    fn search(&self, query: &dyn Query) -> Result<Vec<(String, f64)>> {
        let searcher = self.reader.searcher();
        let limit = usize::try_from(searcher.num_docs())
            .unwrap_or(usize::MAX)
            .max(1);
        let top = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let document: TantivyDocument = searcher.doc(address)?;
            if let Some(id) = document.get_first(self.id).and_then(|value| value.as_str()) {
                hits.push((id.to_string(), f64::from(score)));
            }
        }
        hits.sort_by(|left, right| right.1.total_cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        Ok(hits)
    }
}

/// One analyzed term under `policy`: the edit budget scales with the term
/// length and the first `prefix_length` characters must match exactly.
fn fuzzy_term(field: Field, term: &str, policy: &FuzzyPolicy) -> Result<Box<dyn Query>> {
    let budget = policy
        .fuzziness
        .max_edits(term.chars().count())
        .min(usize::from(MAX_EDITS));
    let edits = u8::try_from(budget).unwrap_or(MAX_EDITS);
    let fuzzy: Box<dyn Query> = Box::new(FuzzyTermQuery::new(
        Term::from_field_text(field, term),
        edits,
        true,
    ));

    let prefix: String = term.chars().take(policy.prefix_length).collect();
    if prefix.is_empty() || edits == 0 {
        return Ok(fuzzy);
    }
    let prefixed: Box<dyn Query> = Box::new(RegexQuery::from_pattern(
        &format!("{}.*", regex::escape(&prefix)),
        field,
    )?);
    Ok(Box::new(BooleanQuery::new(vec![
        (Occur::Must, fuzzy),
        (Occur::Must, prefixed),
    ])))
}

struct Collection {
    mappings: BTreeMap<String, Mapping>,
    records: BTreeMap<String, Value>,
    search: SearchIndex,
}

impl Collection {
    fn new(schema: &CollectionSchema) -> Result<Self> {
        let mappings: BTreeMap<String, Mapping> = schema
            .fields
            .iter()
            .map(|(name, kind)| (name.clone(), declared_mapping(*kind)))
            .collect();
        let records = BTreeMap::new();
        let search = SearchIndex::build(&mappings, &records)?;
        Ok(Self {
            mappings,
            records,
            search,
        })
    }

    /// Maps keys of `source` seen for the first time. Returns whether any were added.
    fn map_new_fields(&mut self, source: &Value) -> bool {
        let Some(object) = source.as_object() else {
            return false;
        };
        let mut added = false;
        for (name, value) in object {
            if self.mappings.contains_key(name) {
                continue;
            }
            if let Some(mapping) = dynamic_mapping(value) {
                self.mappings.insert(name.clone(), mapping);
                added = true;
            }
        }
        added
    }

    fn reindex(&mut self, ids: &[String]) -> Result<()> {
        let mut writer = self.search.writer()?;
        for id in ids {
            writer.delete_term(self.search.id_term(id));
            if let Some(source) = self.records.get(id) {
                writer.add_document(self.search.document(id, source))?;
            }
        }
        self.search.commit(writer)
    }

    fn hits(&self, scored: Vec<(String, f64)>, limit: usize) -> Vec<StoreHit> {
        scored
            .into_iter()
            .filter_map(|(id, score)| {
                let source = self.records.get(&id)?.clone();
                Some(StoreHit { id, score, source })
            })
            .take(limit)
            .collect()
    }
}

pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
    queries: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            queries: AtomicUsize::new(0),
        }
    }

    /// Number of read queries served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of records in a collection, 0 if it does not exist.
    pub fn record_count(&self, collection: &str) -> usize {
        self.read()
            .map(|collections| {
                collections
                    .get(collection)
                    .map(|found| found.records.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections.write().map_err(|_| poisoned())
    }

    fn count_query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> RecallError {
    RecallError::BackendUnavailable {
        backend: "memory".to_string(),
        details: "collection lock poisoned".to_string(),
    }
}

fn missing(collection: &str) -> RecallError {
    RecallError::IndexNotFound(collection.to_string())
}

#[async_trait]
impl DocumentBackend for InMemoryBackend {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(collection))
    }

    async fn create_collection(&self, collection: &str, schema: &CollectionSchema) -> Result<()> {
        let mut collections = self.write()?;
        if !collections.contains_key(collection) {
            collections.insert(collection.to_string(), Collection::new(schema)?);
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool> {
        Ok(self.write()?.remove(collection).is_some())
    }

    async fn bulk_write(
        &self,
        collection: &str,
        records: &[StoreRecord],
        mode: WriteMode,
    ) -> Result<BulkReport> {
        let mut collections = self.write()?;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;

        let mut report = BulkReport::default();
        let mut remapped = false;
        for record in records {
            if mode == WriteMode::CreateOnly && target.records.contains_key(&record.id) {
                report.conflicts.push(record.id.clone());
                continue;
            }
            remapped |= target.map_new_fields(&record.body);
            target.records.insert(record.id.clone(), record.body.clone());
            report.written.push(record.id.clone());
        }

        if remapped {
            target.search = SearchIndex::build(&target.mappings, &target.records)?;
        } else if !report.written.is_empty() {
            target.reindex(&report.written)?;
        }
        Ok(report)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.count_query();
        let collections = self.read()?;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        Ok(target.records.get(id).cloned())
    }

    async fn term_query(
        &self,
        collection: &str,
        filter: &TermFilter,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        self.count_query();
        let collections = self.read()?;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;

        let Some(query) = target.search.terms_query(filter) else {
            return Ok(Vec::new());
        };
        let scored = target.search.search(&ConstScoreQuery::new(query, 1.0))?;
        Ok(target.hits(scored, size))
    }

    async fn fuzzy_match(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        policy: &FuzzyPolicy,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        self.count_query();
        let collections = self.read()?;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;

        let Some(query) = target.search.fuzzy_query(field, value, policy)? else {
            return Ok(Vec::new());
        };
        let scored = target.search.search(query.as_ref())?;
        Ok(target.hits(scored, size))
    }

    async fn filtered_search(
        &self,
        collection: &str,
        filter: Option<&TermFilter>,
        lexical: Option<&LexicalQuery>,
        k: usize,
    ) -> Result<Vec<StoreHit>> {
        self.count_query();
        let collections = self.read()?;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;

        let filter = match filter {
            Some(filter) => match target.search.terms_query(filter) {
                Some(query) => Some(query),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let lexical = match lexical {
            Some(lexical) => match target.search.match_query(lexical)? {
                Some(query) => Some(query),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let query: Box<dyn Query> = match (lexical, filter) {
            (Some(lexical), Some(filter)) => {
                let filter: Box<dyn Query> = Box::new(ConstScoreQuery::new(filter, 0.0));
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, lexical),
                    (Occur::Must, filter),
                ]))
            }
            (Some(lexical), None) => lexical,
            (None, Some(filter)) => Box::new(ConstScoreQuery::new(filter, 1.0)),
            (None, None) => Box::new(AllQuery),
        };

        let scored = target.search.search(query.as_ref())?;
        Ok(target.hits(scored, k))
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self.write()?;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;

        let removed: Vec<String> = match filter {
            Filter::All => target.records.keys().cloned().collect(),
            Filter::Terms(terms) => match target.search.terms_query(terms) {
                Some(query) => target
                    .search
                    .search(query.as_ref())?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect(),
                None => Vec::new(),
            },
        };
        if removed.is_empty() {
            return Ok(0);
        }

        for id in &removed {
            target.records.remove(id);
        }
        target.reindex(&removed)?;
        Ok(u64::try_from(removed.len()).unwrap_or(u64::MAX))
    }

    async fn scan(
        &self,
        collection: &str,
        cursor: Option<ScanCursor>,
        page_size: usize,
    ) -> Result<ScanPage> {
        self.count_query();
        let collections = self.read()?;
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        let page_size = page_size.max(1);

        let records: Vec<StoreRecord> = target
            .records
            .iter()
            .filter(|(id, _)| cursor.as_ref().map_or(true, |after| String::as_str(id) > after.0.as_str()))
            .take(page_size)
            .map(|(id, body)| StoreRecord {
                id: id.clone(),
                body: body.clone(),
            })
            .collect();

        let next = if records.len() == page_size {
            records.last().map(|last| ScanCursor(last.id.clone()))
        } else {
            None
        };

        Ok(ScanPage { records, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Fuzziness;
    use serde_json::json;

    async fn seeded() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let schema = CollectionSchema::new()
            .field("doc_id", FieldType::Keyword)
            .field("title", FieldType::Text);
        backend.create_collection("meta", &schema).await.unwrap();
        let records = vec![
            StoreRecord {
                id: "a".to_string(),
                body: json!({"doc_id": "a", "title": "Chernobyl disaster response"}),
            },
            StoreRecord {
                id: "b".to_string(),
                body: json!({"doc_id": "b", "title": "Indus valley civilisation"}),
            },
        ];
        backend
            .bulk_write("meta", &records, WriteMode::Upsert)
            .await
            .unwrap();
        backend
    }

    async fn paragraphs() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let schema = CollectionSchema::new()
            .field("doc_id", FieldType::Keyword)
            .field("text", FieldType::Text);
        backend.create_collection("chunks", &schema).await.unwrap();
        let lines = [
            ("d1:1", "d1", "The reactor exploded and the reactor core burned."),
            ("d1:2", "d1", "Pripyat was evacuated."),
            ("d1:3", "d1", "A reactor inspection followed."),
            ("d2:1", "d2", "The reactor of growth is irrigation."),
        ];
        let records: Vec<StoreRecord> = lines
            .iter()
            .map(|(id, doc_id, text)| StoreRecord {
                id: id.to_string(),
                body: json!({"doc_id": doc_id, "text": text}),
            })
            .collect();
        backend
            .bulk_write("chunks", &records, WriteMode::Upsert)
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn fuzzy_match_tolerates_typos_but_respects_prefix() {
        let backend = seeded().await;
        let policy = FuzzyPolicy::default();

        let hits = backend
            .fuzzy_match("meta", "title", "Chernobil", &policy, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id(), "a");

        let wrong_prefix = backend
            .fuzzy_match("meta", "title", "Xhernobyl", &policy, 10)
            .await
            .unwrap();
        assert!(wrong_prefix.is_empty());
    }

    #[tokio::test]
    async fn short_terms_require_exact_match_under_auto() {
        let backend = seeded().await;
        let policy = FuzzyPolicy {
            fuzziness: Fuzziness::Auto,
            ..FuzzyPolicy::default()
        };
        let hits = backend
            .fuzzy_match("meta", "title", "in", &policy, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn undeclared_string_fields_are_searchable() {
        let backend = seeded().await;
        backend
            .bulk_write(
                "meta",
                &[StoreRecord {
                    id: "c".to_string(),
                    body: json!({"doc_id": "c", "vessel": ["Kursk submarine"]}),
                }],
                WriteMode::Upsert,
            )
            .await
            .unwrap();

        let hits = backend
            .fuzzy_match("meta", "vessel", "Kursc", &FuzzyPolicy::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");

        let earlier = backend
            .fuzzy_match("meta", "title", "Indus", &FuzzyPolicy::default(), 10)
            .await
            .unwrap();
        assert_eq!(earlier.len(), 1);
        assert_eq!(earlier[0].id, "b");
    }

    #[tokio::test]
    async fn lexical_search_ranks_by_bm25_inside_the_filter() {
        let backend = paragraphs().await;
        let filter = TermFilter::single("doc_id", "d1");
        let lexical = LexicalQuery::new("text", "which reactor exploded");

        let hits = backend
            .filtered_search("chunks", Some(&filter), Some(&lexical), 10)
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["d1:1", "d1:3"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn filter_without_query_returns_records_in_id_order() {
        let backend = paragraphs().await;
        let filter = TermFilter::single("doc_id", "d1");
        let hits = backend
            .filtered_search("chunks", Some(&filter), None, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["d1:1", "d1:2"]);
    }

    #[tokio::test]
    async fn deleted_records_leave_the_search_index() {
        let backend = paragraphs().await;
        let deleted = backend
            .delete_by_filter("chunks", &Filter::Terms(TermFilter::single("doc_id", "d1")))
            .await
            .unwrap();
        assert_eq!(deleted, 3);

        let lexical = LexicalQuery::new("text", "reactor");
        let hits = backend
            .filtered_search("chunks", None, Some(&lexical), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "d2:1");
        assert_eq!(backend.record_count("chunks"), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_indexed_text() {
        let backend = paragraphs().await;
        backend
            .bulk_write(
                "chunks",
                &[StoreRecord {
                    id: "d2:1".to_string(),
                    body: json!({"doc_id": "d2", "text": "Wheat needs monsoon rain."}),
                }],
                WriteMode::Upsert,
            )
            .await
            .unwrap();

        let filter = TermFilter::single("doc_id", "d2");
        let stale = LexicalQuery::new("text", "irrigation");
        assert!(backend
            .filtered_search("chunks", Some(&filter), Some(&stale), 10)
            .await
            .unwrap()
            .is_empty());
        let fresh = LexicalQuery::new("text", "monsoon");
        assert_eq!(
            backend
                .filtered_search("chunks", Some(&filter), Some(&fresh), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn create_only_reports_conflicts_without_overwriting() {
        let backend = seeded().await;
        let report = backend
            .bulk_write(
                "meta",
                &[
                    StoreRecord {
                        id: "a".to_string(),
                        body: json!({"doc_id": "a", "title": "replaced"}),
                    },
                    StoreRecord {
                        id: "c".to_string(),
                        body: json!({"doc_id": "c"}),
                    },
                ],
                WriteMode::CreateOnly,
            )
            .await
            .unwrap();

        assert_eq!(report.conflicts, vec!["a".to_string()]);
        assert_eq!(report.written, vec!["c".to_string()]);
        let stored = backend.get("meta", "a").await.unwrap().unwrap();
        assert_eq!(stored["title"], "Chernobyl disaster response");
    }

    #[tokio::test]
    async fn scan_pages_through_every_record_once() {
        let backend = seeded().await;
        let first = backend.scan("meta", None, 1).await.unwrap();
        assert_eq!(first.records.len(), 1);
        let second = backend.scan("meta", first.next, 1).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_ne!(first.records[0].id, second.records[0].id);
        let third = backend.scan("meta", second.next, 1).await.unwrap();
        assert!(third.records.is_empty());
        assert!(third.next.is_none());
    }

    #[tokio::test]
    async fn operations_on_missing_collection_fail_with_index_not_found() {
        let backend = InMemoryBackend::new();
        let error = backend
            .delete_by_filter("nope", &Filter::All)
            .await
            .unwrap_err();
        assert!(matches!(error, RecallError::IndexNotFound(name) if name == "nope"));
        assert!(!backend.collection_exists("nope").await.unwrap());
    }
}
