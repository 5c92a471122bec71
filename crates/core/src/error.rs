use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecallError {
    #[error("duplicate doc_id(s) already exist in index '{collection}': {doc_ids:?}")]
    DuplicateDocId {
        collection: String,
        doc_ids: Vec<String>,
    },

    #[error("every document must contain a doc_id")]
    MissingDocId,

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("index '{0}' does not exist")]
    IndexNotFound(String),

    #[error("{backend} is unavailable: {details}")]
    BackendUnavailable { backend: String, details: String },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding failed for page {page_no} paragraph {para_no}: {details}")]
    EmbeddingFailure {
        page_no: u32,
        para_no: u32,
        details: String,
    },

    #[error("no candidate document matched the query fields")]
    NoCandidate,

    #[error("{} of {total} paragraphs of '{doc_id}' could not be indexed", .failed.len())]
    PartialIndexFailure {
        doc_id: String,
        total: usize,
        failed: Vec<(u32, u32)>,
    },

    #[error("{operation} did not finish within {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("external extraction failed: {0}")]
    Extraction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search index error: {0}")]
    Search(#[from] tantivy::TantivyError),
}

/// Stable, serializable classification of a [`RecallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    DuplicateDocId,
    MissingDocId,
    DocumentNotFound,
    IndexNotFound,
    BackendUnavailable,
    BackendResponse,
    EmbeddingFailure,
    NoCandidate,
    PartialIndexFailure,
    Timeout,
    ExtractionFailed,
    InvalidArgument,
    Internal,
}

impl RecallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecallError::DuplicateDocId { .. } => ErrorKind::DuplicateDocId,
            RecallError::MissingDocId => ErrorKind::MissingDocId,
            RecallError::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            RecallError::IndexNotFound(_) => ErrorKind::IndexNotFound,
            RecallError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            RecallError::BackendResponse { .. } => ErrorKind::BackendResponse,
            RecallError::EmbeddingFailure { .. } => ErrorKind::EmbeddingFailure,
            RecallError::NoCandidate => ErrorKind::NoCandidate,
            RecallError::PartialIndexFailure { .. } => ErrorKind::PartialIndexFailure,
            RecallError::Timeout { .. } => ErrorKind::Timeout,
            RecallError::Extraction(_) => ErrorKind::ExtractionFailed,
            RecallError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RecallError::Http(error) if error.is_timeout() => ErrorKind::Timeout,
            RecallError::Http(error) if error.is_connect() => ErrorKind::BackendUnavailable,
            RecallError::Http(_) => ErrorKind::BackendResponse,
            RecallError::Url(_) => ErrorKind::InvalidArgument,
            RecallError::Serialization(_)
            | RecallError::Csv(_)
            | RecallError::Io(_)
            | RecallError::Search(_) => ErrorKind::Internal,
        }
    }

    /// Duplicate and not-found conditions are expected outcomes the caller can act on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DuplicateDocId
                | ErrorKind::MissingDocId
                | ErrorKind::DocumentNotFound
                | ErrorKind::IndexNotFound
                | ErrorKind::NoCandidate
                | ErrorKind::InvalidArgument
        )
    }
}

/// Structured result handed to outside callers: a success flag, an error kind and a message.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failed(error: &RecallError) -> Self {
        Self {
            success: false,
            error: Some(error.kind()),
            message: error.to_string(),
            data: None,
        }
    }

    pub fn from_result(result: Result<T>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(data, message),
            Err(error) => Self::failed(&error),
        }
    }
}

pub type Result<T, E = RecallError> = std::result::Result<T, E>;
