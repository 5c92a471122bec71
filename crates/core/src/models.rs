use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Backend field that carries the insertion time of metadata and chunk records.
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const DOC_ID_FIELD: &str = "doc_id";

/// Metadata attributes produced by the extraction schema, in schema order.
pub const ARCHIVAL_FIELDS: [&str; 13] = [
    "scopeAndContent",
    "generalNote",
    "genreAccessPoints",
    "culture",
    "scientificTerms",
    "entities",
    "title",
    "language",
    "topics",
    "geographic_locations",
    "dates_mentioned",
    "names_mentioned",
    "places_mentioned",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(text) => text.trim().is_empty(),
            FieldValue::List(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    /// Collapses the value into one string, joining list elements with `separator`.
    pub fn flatten(&self, separator: &str) -> String {
        match self {
            FieldValue::Text(text) => text.trim().to_string(),
            FieldValue::List(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
                .join(separator),
        }
    }

    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(FieldValue::Text(text.clone())),
            Value::Array(items) => Some(FieldValue::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text.clone()),
                        Value::Number(number) => Some(number.to_string()),
                        _ => None,
                    })
                    .collect(),
            )),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// Partial mapping of metadata attribute names to values. Absent attributes are simply missing.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Field name to single query string, as consumed by the fuzzy matcher.
pub type QueryFields = BTreeMap<String, String>;

/// Drops attributes that are blank so that "absent" is never encoded as an empty value.
pub fn prune_empty(fields: FieldMap) -> FieldMap {
    fields
        .into_iter()
        .filter(|(name, value)| !name.trim().is_empty() && !value.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRecord {
    pub doc_id: String,
    #[serde(flatten)]
    pub fields: FieldMap,
    #[serde(rename = "timestamp", skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
}

impl MetadataRecord {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            fields: FieldMap::new(),
            ingested_at: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Body stored in the backend. `doc_id` and `timestamp` always win over same-named fields.
    pub fn to_source(&self) -> Value {
        let mut body = Map::new();
        for (name, value) in &self.fields {
            body.insert(name.clone(), value.to_json());
        }
        body.insert(DOC_ID_FIELD.to_string(), Value::String(self.doc_id.clone()));
        if let Some(ingested_at) = self.ingested_at {
            body.insert(
                TIMESTAMP_FIELD.to_string(),
                Value::String(ingested_at.to_rfc3339()),
            );
        }
        Value::Object(body)
    }

    /// Decodes a stored body. Values that are neither strings nor string lists are ignored.
    pub fn from_source(source: &Value) -> Option<Self> {
        let object = source.as_object()?;
        let doc_id = object.get(DOC_ID_FIELD)?.as_str()?.to_string();
        let ingested_at = object
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .and_then(parse_timestamp);

        let fields = object
            .iter()
            .filter(|(name, _)| name.as_str() != DOC_ID_FIELD && name.as_str() != TIMESTAMP_FIELD)
            .filter_map(|(name, value)| FieldValue::from_json(value).map(|v| (name.clone(), v)))
            .collect();

        Some(Self {
            doc_id,
            fields,
            ingested_at,
        })
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Records written by older tooling carry naive ISO timestamps without an offset.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub doc_id: String,
    pub page_no: u32,
    pub para_no: u32,
}

impl ChunkKey {
    pub fn new(doc_id: impl Into<String>, page_no: u32, para_no: u32) -> Self {
        Self {
            doc_id: doc_id.into(),
            page_no,
            para_no,
        }
    }

    /// Backend record id; deterministic so that re-indexing overwrites.
    pub fn record_id(&self) -> String {
        format!("{}_page_{}_para_{}", self.doc_id, self.page_no, self.para_no)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(flatten)]
    pub key: ChunkKey,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(rename = "timestamp")]
    pub ingested_at: DateTime<Utc>,
}

/// One ranked paragraph returned by a chunk search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkHit {
    pub doc_id: String,
    pub page_no: u32,
    pub para_no: u32,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedDocument {
    pub doc_id: String,
    pub votes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedChunk {
    pub page_no: u32,
    pub para_no: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub doc_id: String,
    pub total: usize,
    pub indexed: usize,
    pub failed: Vec<FailedChunk>,
}

impl IndexReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<(u32, u32)> {
        self.failed
            .iter()
            .map(|failure| (failure.page_no, failure.para_no))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    /// Candidate documents requested from the fuzzy matcher.
    pub candidate_k: usize,
    /// Paragraphs fetched from the chosen document.
    pub passage_k: usize,
    /// Budget for one whole retrieval; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            candidate_k: 5,
            passage_k: 3,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    /// Keep a document whose chunks were only partly indexed instead of rolling it back.
    pub allow_partial: bool,
    pub embedding_concurrency: usize,
    pub bulk_batch_size: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            allow_partial: false,
            embedding_concurrency: 8,
            bulk_batch_size: 500,
        }
    }
}
