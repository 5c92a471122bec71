use crate::error::{RecallError, Result};
use crate::models::{QueryFields, RankedDocument, ARCHIVAL_FIELDS};
use crate::store::FuzzyPolicy;
use crate::traits::DocumentBackend;
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Hits requested from the backend for each field before voting.
pub const HITS_PER_FIELD: usize = 10;

/// A metadata field that takes part in fuzzy voting.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub name: String,
    pub policy: FuzzyPolicy,
    /// Votes a document earns when this field matches.
    pub weight: u32,
}

impl FieldConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: FuzzyPolicy::default(),
            weight: 1,
        }
    }
}

/// Ranks documents by how many query fields fuzzily match their metadata.
pub struct FuzzyMatcher<B> {
    backend: B,
    collection: String,
    fields: Vec<FieldConfig>,
    hits_per_field: usize,
}

impl<B: DocumentBackend> FuzzyMatcher<B> {
    pub fn new(backend: B, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
            fields: ARCHIVAL_FIELDS.iter().map(|name| FieldConfig::new(*name)).collect(),
            hits_per_field: HITS_PER_FIELD,
        }
    }

    pub fn with_fields(mut self, fields: Vec<FieldConfig>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_hits_per_field(mut self, hits_per_field: usize) -> Self {
        self.hits_per_field = hits_per_field.max(1);
        self
    }

    /// Top `k` documents by vote count, ties broken by ascending `doc_id`.
    ///
    /// Every field with a non-blank value is queried. Configured fields use
    /// their own policy and weight, any other field the default policy and a
    /// weight of 1. Each field votes at most once per document, whatever the
    /// number of matching terms.
    pub async fn search(&self, query: &QueryFields, k: usize) -> Result<Vec<RankedDocument>> {
        let plan: Vec<(FieldConfig, &str)> = query
            .iter()
            .map(|(name, value)| (name, value.trim()))
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (self.config_for(name), value))
            .collect();

        if plan.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let per_field = try_join_all(plan.iter().map(|(config, value)| {
            self.backend.fuzzy_match(
                &self.collection,
                &config.name,
                value,
                &config.policy,
                self.hits_per_field,
            )
        }))
        .await;

        let per_field = match per_field {
            Ok(per_field) => per_field,
            Err(RecallError::IndexNotFound(_)) => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut votes: HashMap<String, u32> = HashMap::new();
        for ((config, _), hits) in plan.iter().zip(per_field) {
            let matched: BTreeSet<String> = hits.iter().map(|hit| hit.doc_id()).collect();
            debug!(field = %config.name, matched = matched.len(), "fuzzy field matched");
            for doc_id in matched {
                *votes.entry(doc_id).or_default() += config.weight;
            }
        }

        Ok(rank_votes(votes, k))
    }

    fn config_for(&self, name: &str) -> FieldConfig {
        self.fields
            .iter()
            .find(|config| config.name == name)
            .cloned()
            .unwrap_or_else(|| FieldConfig::new(name))
    }
}

fn rank_votes(votes: HashMap<String, u32>, k: usize) -> Vec<RankedDocument> {
    let mut ranked: Vec<RankedDocument> = votes
        .into_iter()
        .map(|(doc_id, votes)| RankedDocument { doc_id, votes })
        .collect();
    ranked.sort_by(|left, right| {
        right
            .votes
            .cmp(&left.votes)
            .then_with(|| left.doc_id.cmp(&right.doc_id))
    });
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::models::MetadataRecord;
    use crate::store::{
        BulkReport, CollectionSchema, Filter, LexicalQuery, ScanCursor, ScanPage, StoreHit,
        StoreRecord, TermFilter, WriteMode,
    };
    use crate::stores::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn query(pairs: &[(&str, &str)]) -> QueryFields {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    async fn seeded() -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = MetadataStore::new(backend.clone(), "meta");
        store
            .insert(vec![
                MetadataRecord::new("doc_123")
                    .with_field("title", "Chernobyl disaster")
                    .with_field("places_mentioned", vec!["Pripyat".to_string(), "Kyiv".to_string()])
                    .with_field("topics", vec!["nuclear accident".to_string()]),
                MetadataRecord::new("doc_456")
                    .with_field("title", "Fukushima disaster")
                    .with_field("topics", vec!["nuclear accident".to_string()]),
                MetadataRecord::new("doc_789")
                    .with_field("title", "Harvest festival")
                    .with_field("topics", vec!["agriculture".to_string()]),
            ])
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn more_matching_fields_rank_higher() {
        let backend = seeded().await;
        let matcher = FuzzyMatcher::new(backend, "meta");

        let ranked = matcher
            .search(
                &query(&[
                    ("title", "Chernobyl"),
                    ("places_mentioned", "Pripyat"),
                    ("topics", "nuclear"),
                ]),
                5,
            )
            .await
            .unwrap();

        assert_eq!(ranked[0].doc_id, "doc_123");
        assert_eq!(ranked[0].votes, 3);
        assert_eq!(ranked[1].doc_id, "doc_456");
        assert_eq!(ranked[1].votes, 1);
        assert_eq!(ranked.len(), 2);
    }

    #[tokio::test]
    async fn misspellings_still_match() {
        let backend = seeded().await;
        let matcher = FuzzyMatcher::new(backend, "meta");
        let ranked = matcher
            .search(&query(&[("title", "Chernobil")]), 5)
            .await
            .unwrap();
        assert_eq!(ranked.first().map(|d| d.doc_id.as_str()), Some("doc_123"));
    }

    #[tokio::test]
    async fn ties_are_broken_by_doc_id() {
        let backend = seeded().await;
        let matcher = FuzzyMatcher::new(backend, "meta");
        let ranked = matcher
            .search(&query(&[("title", "disaster")]), 5)
            .await
            .unwrap();
        let ids: Vec<_> = ranked.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["doc_123", "doc_456"]);
    }

    #[tokio::test]
    async fn field_matching_many_terms_votes_once() {
        let backend = seeded().await;
        let matcher = FuzzyMatcher::new(backend, "meta");
        let ranked = matcher
            .search(&query(&[("places_mentioned", "Pripyat Kyiv")]), 5)
            .await
            .unwrap();
        assert_eq!(ranked[0].votes, 1);
    }

    #[tokio::test]
    async fn blank_fields_issue_no_queries() {
        let backend = seeded().await;
        let before = backend.query_count();
        let matcher = FuzzyMatcher::new(backend.clone(), "meta");

        let ranked = matcher
            .search(&query(&[("title", "  "), ("topics", "")]), 5)
            .await
            .unwrap();

        assert!(ranked.is_empty());
        assert_eq!(backend.query_count(), before);
    }

    #[tokio::test]
    async fn unconfigured_fields_vote_with_default_policy() {
        let backend = seeded().await;
        MetadataStore::new(backend.clone(), "meta")
            .insert(vec![MetadataRecord::new("doc_900")
                .with_field("title", "Reactor logbook")
                .with_field("shelf_mark", "Archive box Zaporizhzhia")])
            .await
            .unwrap();
        let matcher = FuzzyMatcher::new(backend.clone(), "meta")
            .with_fields(vec![FieldConfig::new("title")]);

        let before = backend.query_count();
        let ranked = matcher
            .search(
                &query(&[("title", "logbok"), ("shelf_mark", "Zaporizhzhya")]),
                5,
            )
            .await
            .unwrap();

        assert_eq!(backend.query_count(), before + 2);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].doc_id, "doc_900");
        assert_eq!(ranked[0].votes, 2);
    }

    #[tokio::test]
    async fn weights_and_k_are_honored() {
        let backend = seeded().await;
        let matcher = FuzzyMatcher::new(backend, "meta").with_fields(vec![
            FieldConfig::new("title"),
            FieldConfig {
                weight: 3,
                ..FieldConfig::new("topics")
            },
        ]);
        let ranked = matcher
            .search(&query(&[("title", "festival"), ("topics", "nuclear")]), 1)
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].doc_id, "doc_123");
        assert_eq!(ranked[0].votes, 3);
    }

    #[tokio::test]
    async fn missing_collection_is_an_empty_corpus() {
        let matcher = FuzzyMatcher::new(Arc::new(InMemoryBackend::new()), "meta");
        let ranked = matcher.search(&query(&[("title", "x")]), 5).await.unwrap();
        assert!(ranked.is_empty());
    }

    /// Answers fuzzy queries after a per-field delay, so fields complete out of order.
    struct DelayedBackend {
        inner: Arc<InMemoryBackend>,
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl DocumentBackend for DelayedBackend {
        fn backend_name(&self) -> &str {
            "delayed"
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
            self.inner.bulk_write(collection, records, mode).await
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
            if let Some(delay) = self.delays.get(field) {
                tokio::time::sleep(*delay).await;
            }
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

    #[tokio::test(start_paused = true)]
    async fn ranking_does_not_depend_on_completion_order() {
        let backend = seeded().await;
        let fields = query(&[
            ("title", "Fukushima"),
            ("places_mentioned", "Pripyat"),
            ("topics", "nuclear"),
        ]);
        let delays = |title: u64, places: u64, topics: u64| {
            HashMap::from([
                ("title".to_string(), Duration::from_millis(title)),
                ("places_mentioned".to_string(), Duration::from_millis(places)),
                ("topics".to_string(), Duration::from_millis(topics)),
            ])
        };

        let mut rankings = Vec::new();
        for order in [delays(10, 20, 30), delays(30, 20, 10), delays(20, 30, 10)] {
            let matcher = FuzzyMatcher::new(
                DelayedBackend {
                    inner: backend.clone(),
                    delays: order,
                },
                "meta",
            );
            rankings.push(matcher.search(&fields, 5).await.unwrap());
        }

        let ids: Vec<_> = rankings[0].iter().map(|d| (d.doc_id.as_str(), d.votes)).collect();
        assert_eq!(ids, vec![("doc_123", 2), ("doc_456", 2)]);
        assert!(rankings.iter().all(|ranking| *ranking == rankings[0]));
    }
}
