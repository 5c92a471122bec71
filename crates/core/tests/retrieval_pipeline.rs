use async_trait::async_trait;
use deeprecall_core::{
    AnswerGenerator, CharacterNgramEmbedder, ChunkIndexer, FieldExtractor, FieldMap, FieldValue,
    FuzzyMatcher, InMemoryBackend, IngestionPipeline, Message, MetadataExtractor, MetadataStore,
    RecallError, Result, RetrievalCoordinator, SessionRegistry,
};
use std::sync::Arc;

const REACTOR: &str = "On April 26, 1986, Reactor No. 4 of the Chernobyl Nuclear Power Plant exploded during a safety test.";
const PRIPYAT: &str = "The nearby town of Pripyat was evacuated 36 hours later.";
const CONFINEMENT: &str = "In 2016 the New Safe Confinement was placed over the old sarcophagus.";

/// Stands in for the language model on both ingestion and query side.
struct ScriptedModel;

#[async_trait]
impl MetadataExtractor for ScriptedModel {
    async fn extract_metadata(&self, document_text: &str) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        if document_text.contains("Chernobyl") {
            fields.insert("title".into(), FieldValue::from("Chernobyl disaster response"));
            fields.insert(
                "places_mentioned".into(),
                FieldValue::List(vec!["Pripyat".into(), "Chernobyl".into()]),
            );
            fields.insert("dates_mentioned".into(), FieldValue::List(vec!["1986".into()]));
        } else {
            fields.insert("title".into(), FieldValue::from("Monsoon agriculture in Punjab"));
            fields.insert("places_mentioned".into(), FieldValue::List(vec!["Punjab".into()]));
        }
        Ok(fields)
    }
}

#[async_trait]
impl FieldExtractor for ScriptedModel {
    async fn extract_fields(&self, text: &str) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        fields.insert("scopeAndContent".into(), FieldValue::from(text));
        if text.contains("reactor") {
            fields.insert("title".into(), FieldValue::from("Chernobyl disaster"));
            fields.insert("scientificTerms".into(), FieldValue::List(vec!["reactor".into()]));
        }
        Ok(fields)
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedModel {
    async fn generate(&self, _: &str, turns: &[Message]) -> Result<String> {
        Ok(format!("seen {} turns", turns.len()))
    }
}

type Backend = Arc<InMemoryBackend>;

fn pipeline(backend: &Backend) -> IngestionPipeline<Backend, ScriptedModel, CharacterNgramEmbedder> {
    IngestionPipeline::new(
        MetadataStore::new(backend.clone(), "deeprecall-rc-fuzzy"),
        ChunkIndexer::new(backend.clone(), "deeprecall-rc-vector"),
        ScriptedModel,
        CharacterNgramEmbedder::default(),
    )
}

fn coordinator(backend: &Backend) -> RetrievalCoordinator<Backend, ScriptedModel> {
    RetrievalCoordinator::new(
        FuzzyMatcher::new(backend.clone(), "deeprecall-rc-fuzzy"),
        ChunkIndexer::new(backend.clone(), "deeprecall-rc-vector"),
        ScriptedModel,
    )
}

#[tokio::test]
async fn question_is_answered_from_the_narrowed_document() {
    let backend = Arc::new(InMemoryBackend::new());
    let ingestion = pipeline(&backend);
    ingestion
        .ingest_pages(
            "doc_123",
            &[format!("{REACTOR}\n{PRIPYAT}"), CONFINEMENT.to_string()],
        )
        .await
        .unwrap();
    ingestion
        .ingest_pages(
            "doc_456",
            &["Monsoon rains feed the wheat fields of Punjab.\nThe reactor of growth is irrigation."],
        )
        .await
        .unwrap();

    let retrieval = coordinator(&backend)
        .retrieve("which reactor exploded")
        .await
        .unwrap();

    assert_eq!(retrieval.doc_id, "doc_123");
    assert!(retrieval.votes >= 1);
    assert!(retrieval.context.starts_with(REACTOR));
    assert!(retrieval.passages.iter().all(|hit| hit.doc_id == "doc_123"));
    assert_eq!(
        (retrieval.passages[0].page_no, retrieval.passages[0].para_no),
        (1, 1)
    );
}

#[tokio::test]
async fn answers_accumulate_in_the_session_window() {
    let backend = Arc::new(InMemoryBackend::new());
    pipeline(&backend)
        .ingest_pages("doc_123", &[REACTOR])
        .await
        .unwrap();
    let coordinator = coordinator(&backend);
    let sessions = SessionRegistry::default();

    let mut replies = Vec::new();
    for _ in 0..4 {
        let answer = coordinator
            .answer(&sessions, "desk-1", "which reactor exploded", &ScriptedModel)
            .await
            .unwrap();
        replies.push(answer.reply);
    }

    assert_eq!(replies, vec!["seen 1 turns", "seen 3 turns", "seen 5 turns", "seen 5 turns"]);
    let window = sessions.session("desk-1").unwrap();
    assert_eq!(window.lock().await.len(), 6);
}

#[tokio::test]
async fn unrelated_question_against_empty_corpus_has_no_candidate() {
    let backend = Arc::new(InMemoryBackend::new());
    let error = coordinator(&backend)
        .retrieve("which reactor exploded")
        .await
        .unwrap_err();
    assert!(matches!(error, RecallError::NoCandidate));
    assert!(error.is_recoverable());
}

#[tokio::test]
async fn deleted_document_is_no_longer_retrievable() {
    let backend = Arc::new(InMemoryBackend::new());
    let ingestion = pipeline(&backend);
    ingestion.ingest_pages("doc_123", &[REACTOR]).await.unwrap();

    let deleted = ingestion.delete_document("doc_123").await.unwrap();
    assert_eq!(deleted.metadata_deleted, 1);
    assert_eq!(deleted.chunks_deleted, 1);

    let error = coordinator(&backend)
        .retrieve("which reactor exploded")
        .await
        .unwrap_err();
    assert!(matches!(error, RecallError::NoCandidate));
}

#[tokio::test]
async fn reingested_document_answers_only_from_its_new_text() {
    let backend = Arc::new(InMemoryBackend::new());
    let ingestion = pipeline(&backend);
    ingestion
        .ingest_pages("doc_123", &[format!("{REACTOR}\n{PRIPYAT}")])
        .await
        .unwrap();

    ingestion.metadata().delete_all().await.unwrap();
    let report = ingestion
        .ingest_pages("doc_123", &[format!("Chernobyl today.\n{CONFINEMENT}")])
        .await
        .unwrap();
    assert_eq!(report.chunks.indexed, 2);
    assert_eq!(backend.record_count("deeprecall-rc-vector"), 2);

    let retrieval = coordinator(&backend)
        .retrieve("which reactor exploded")
        .await
        .unwrap();
    assert_eq!(retrieval.doc_id, "doc_123");
    assert!(!retrieval.context.contains("exploded"));
    assert!(!retrieval.context.contains("Pripyat"));
}
