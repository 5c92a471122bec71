use crate::chunk_index::ChunkIndexer;
use crate::conversation::SessionRegistry;
use crate::deadline::Deadline;
use crate::error::{RecallError, Result};
use crate::fuzzy::FuzzyMatcher;
use crate::models::{ChunkHit, FieldMap, QueryFields, RankedDocument, RetrievalOptions};
use crate::traits::{AnswerGenerator, DocumentBackend, FieldExtractor};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStage {
    FieldExtraction,
    Narrow,
    DeepSearch,
    Assemble,
    Generate,
}

impl RetrievalStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStage::FieldExtraction => "field_extraction",
            RetrievalStage::Narrow => "narrow",
            RetrievalStage::DeepSearch => "deep_search",
            RetrievalStage::Assemble => "assemble",
            RetrievalStage::Generate => "generate",
        }
    }
}

impl fmt::Display for RetrievalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one two-stage retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub doc_id: String,
    pub votes: u32,
    pub candidates: Vec<RankedDocument>,
    pub fields: QueryFields,
    pub passages: Vec<ChunkHit>,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub reply: String,
    pub retrieval: Retrieval,
}

/// Flattens extracted attributes into one query string per field. Lists join with `,`.
pub fn query_fields(fields: FieldMap) -> QueryFields {
    fields
        .into_iter()
        .map(|(name, value)| (name, value.flatten(",")))
        .filter(|(name, value)| !name.trim().is_empty() && !value.is_empty())
        .collect()
}

/// Narrows the corpus to one document by fuzzy metadata voting, then searches
/// that document's paragraphs with the original question.
pub struct RetrievalCoordinator<B, X> {
    matcher: FuzzyMatcher<B>,
    chunks: ChunkIndexer<B>,
    extractor: X,
    options: RetrievalOptions,
}

impl<B, X> RetrievalCoordinator<B, X>
where
    B: DocumentBackend,
    X: FieldExtractor,
{
    pub fn new(matcher: FuzzyMatcher<B>, chunks: ChunkIndexer<B>, extractor: X) -> Self {
        Self {
            matcher,
            chunks,
            extractor,
            options: RetrievalOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RetrievalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub async fn retrieve(&self, query: &str) -> Result<Retrieval> {
        self.retrieve_with_options(query, &self.options).await
    }

    /// Same as [`retrieve`](Self::retrieve) with per-call `k` values and budget.
    pub async fn retrieve_with_options(
        &self,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Retrieval> {
        self.run(query, options, Deadline::from_timeout(options.timeout))
            .await
    }

    pub async fn retrieve_with_deadline(&self, query: &str, deadline: Deadline) -> Result<Retrieval> {
        self.run(query, &self.options, deadline).await
    }

    /// Runs every stage inside `deadline`. Any failing stage aborts the whole
    /// retrieval with that stage's error; nothing partial is returned.
    async fn run(
        &self,
        query: &str,
        options: &RetrievalOptions,
        deadline: Deadline,
    ) -> Result<Retrieval> {
        if query.trim().is_empty() {
            return Err(RecallError::InvalidArgument("query is empty".to_string()));
        }

        let stage = RetrievalStage::FieldExtraction;
        let fields = query_fields(
            deadline
                .run(stage.as_str(), self.extractor.extract_fields(query))
                .await?,
        );
        debug!(%stage, fields = fields.len(), "extracted query fields");

        let stage = RetrievalStage::Narrow;
        let candidates = deadline
            .run(
                stage.as_str(),
                self.matcher.search(&fields, options.candidate_k),
            )
            .await?;
        let Some(top) = candidates.first().cloned() else {
            debug!(%stage, "no candidate document");
            return Err(RecallError::NoCandidate);
        };
        debug!(%stage, doc_id = %top.doc_id, votes = top.votes, candidates = candidates.len(), "narrowed corpus");

        let stage = RetrievalStage::DeepSearch;
        let passages = deadline
            .run(
                stage.as_str(),
                self.chunks
                    .search(Some(&top.doc_id), Some(query), options.passage_k),
            )
            .await?;
        debug!(%stage, passages = passages.len(), "searched document paragraphs");

        let stage = RetrievalStage::Assemble;
        let context: String = passages.iter().map(|hit| hit.text.as_str()).collect();
        debug!(%stage, chars = context.len(), "assembled context");

        info!(doc_id = %top.doc_id, passages = passages.len(), "retrieval complete");
        Ok(Retrieval {
            doc_id: top.doc_id,
            votes: top.votes,
            candidates,
            fields,
            passages,
            context,
        })
    }

    /// Retrieves context for `query` and asks the generator, keeping the
    /// exchange in the caller's conversation window.
    pub async fn answer<G>(
        &self,
        sessions: &SessionRegistry,
        session_id: &str,
        query: &str,
        generator: &G,
    ) -> Result<Answer>
    where
        G: AnswerGenerator + ?Sized,
    {
        let deadline = Deadline::from_timeout(self.options.timeout);
        let retrieval = self.retrieve_with_deadline(query, deadline).await?;
        let reply = deadline
            .run(
                RetrievalStage::Generate.as_str(),
                sessions.exchange(session_id, generator, &retrieval.context, query),
            )
            .await?;
        Ok(Answer { reply, retrieval })
    }
}
