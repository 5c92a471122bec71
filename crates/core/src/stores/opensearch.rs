use crate::error::{RecallError, Result};
use crate::store::{
    BulkReport, CollectionSchema, FieldType, Filter, Fuzziness, FuzzyPolicy, LexicalQuery,
    ScanCursor, ScanPage, StoreHit, StoreRecord, TermFilter, WriteMode,
};
use crate::traits::DocumentBackend;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const BACKEND: &str = "opensearch";

#[derive(Debug, Clone)]
pub struct OpenSearchConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Local clusters commonly run with self-signed certificates.
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    pub scroll_keep_alive: String,
    /// Fields never returned in search hits (large vectors).
    pub source_excludes: Vec<String>,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost:9200".to_string(),
            username: None,
            password: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(30),
            scroll_keep_alive: "2m".to_string(),
            source_excludes: vec!["embedding".to_string()],
        }
    }
}

pub struct OpenSearchBackend {
    client: Arc<Client>,
    endpoint: Url,
    config: OpenSearchConfig,
}

impl OpenSearchBackend {
    pub fn new(config: OpenSearchConfig) -> Result<Self> {
        let mut base = config.endpoint.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client: Arc::new(client),
            endpoint,
            config,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.endpoint.join(path)?;
        Ok(self.request_to(method, url))
    }

    /// `{collection}/_doc/{id}` with every segment percent-encoded.
    fn document_url(&self, collection: &str, id: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| {
                RecallError::InvalidArgument(format!("endpoint {} cannot take a path", self.endpoint))
            })?
            .pop_if_empty()
            .extend([collection, "_doc", id]);
        Ok(url)
    }

    fn request_to(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|error| {
            if error.is_connect() {
                RecallError::BackendUnavailable {
                    backend: BACKEND.to_string(),
                    details: error.to_string(),
                }
            } else {
                RecallError::Http(error)
            }
        })
    }

    async fn search(&self, collection: &str, body: Value) -> Result<Vec<StoreHit>> {
        let request = self
            .request(Method::POST, &format!("{collection}/_search"))?
            .json(&body);
        let response = self.send(request).await?;
        let parsed = expect_success(collection, response).await?;
        Ok(parse_hits(&parsed))
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let request = match self.request(Method::DELETE, "_search/scroll") {
            Ok(request) => request.json(&json!({ "scroll_id": [scroll_id] })),
            Err(error) => {
                warn!(%error, "could not build scroll cleanup request");
                return;
            }
        };
        if let Err(error) = self.send(request).await {
            warn!(%error, "failed to clear scroll context");
        }
    }
}

async fn expect_success(collection: &str, response: Response) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    if status == StatusCode::NOT_FOUND && is_index_missing(&parsed) {
        return Err(RecallError::IndexNotFound(collection.to_string()));
    }

    Err(RecallError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{status}: {body}"),
    })
}

fn is_index_missing(body: &Value) -> bool {
    body.pointer("/error/type")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind == "index_not_found_exception")
}

fn mapping_body(schema: &CollectionSchema) -> Value {
    let mut properties = Map::new();
    for (name, kind) in &schema.fields {
        let mapping = match kind {
            FieldType::Keyword => json!({"type": "keyword"}),
            FieldType::Text => json!({"type": "text"}),
            FieldType::Integer => json!({"type": "integer"}),
            FieldType::Date => json!({"type": "date"}),
            FieldType::Vector { dimensions } => {
                json!({"type": "knn_vector", "dimension": dimensions})
            }
        };
        properties.insert(name.clone(), mapping);
    }

    let mut index_settings = json!({
        "number_of_shards": 1,
        "number_of_replicas": 0
    });
    if schema.has_vectors() {
        index_settings["knn"] = Value::Bool(true);
    }

    json!({
        "settings": { "index": index_settings },
        "mappings": { "properties": properties }
    })
}

fn bulk_payload(collection: &str, records: &[StoreRecord], mode: WriteMode) -> Result<String> {
    let action = match mode {
        WriteMode::Upsert => "index",
        WriteMode::CreateOnly => "create",
    };

    let mut lines = Vec::with_capacity(records.len() * 2);
    for record in records {
        lines.push(serde_json::to_string(&json!({
            action: {
                "_index": collection,
                "_id": record.id,
            }
        }))?);
        lines.push(serde_json::to_string(&record.body)?);
    }

    Ok(lines.join("\n") + "\n")
}

fn parse_bulk_response(body: &Value) -> BulkReport {
    let mut report = BulkReport::default();
    let items = body
        .pointer("/items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for item in items {
        let Some(result) = item.as_object().and_then(|object| object.values().next()) else {
            continue;
        };
        let id = result
            .pointer("/_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = result.pointer("/status").and_then(Value::as_u64).unwrap_or(0);

        if status == 409 {
            report.conflicts.push(id);
        } else if let Some(error) = result.pointer("/error") {
            let reason = error
                .pointer("/reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            report.failed.push((id, reason));
        } else if (200..300).contains(&status) {
            report.written.push(id);
        } else {
            report.failed.push((id, format!("status {status}")));
        }
    }

    report
}

fn parse_hits(body: &Value) -> Vec<StoreHit> {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .map(|raw| StoreHit {
                    id: raw
                        .pointer("/_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    score: raw.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0),
                    source: raw.pointer("/_source").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn terms_clause(filter: &TermFilter) -> Value {
    json!({ "terms": { filter.field.clone(): filter.values } })
}

fn fuzzy_query_body(field: &str, value: &str, policy: &FuzzyPolicy, size: usize) -> Value {
    let fuzziness = match policy.fuzziness {
        Fuzziness::Auto => json!("AUTO"),
        Fuzziness::Edits(edits) => json!(edits),
    };

    json!({
        "size": size,
        "query": {
            "match": {
                field: {
                    "query": value,
                    "fuzziness": fuzziness,
                    "prefix_length": policy.prefix_length,
                    "max_expansions": policy.max_expansions,
                }
            }
        }
    })
}

fn filtered_search_body(
    filter: Option<&TermFilter>,
    lexical: Option<&LexicalQuery>,
    k: usize,
    excludes: &[String],
) -> Value {
    let must: Vec<Value> = lexical
        .map(|lexical| vec![json!({ "match": { lexical.field.clone(): { "query": lexical.text } } })])
        .unwrap_or_default();
    let filters: Vec<Value> = filter.map(terms_clause).into_iter().collect();

    let query = if must.is_empty() && filters.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "must": must, "filter": filters } })
    };

    json!({
        "size": k,
        "_source": { "excludes": excludes },
        "query": query
    })
}

#[async_trait]
impl DocumentBackend for OpenSearchBackend {
    fn backend_name(&self) -> &str {
        BACKEND
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let response = self.send(self.request(Method::HEAD, collection)?).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RecallError::BackendResponse {
                backend: BACKEND.to_string(),
                details: status.to_string(),
            }),
        }
    }

    async fn create_collection(&self, collection: &str, schema: &CollectionSchema) -> Result<()> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        let request = self
            .request(Method::PUT, collection)?
            .json(&mapping_body(schema));
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            debug!(collection, "created index");
            return Ok(());
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let already_exists = body
            .pointer("/error/type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind == "resource_already_exists_exception");
        if already_exists {
            return Ok(());
        }

        Err(RecallError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("index setup for '{collection}' failed with {status}: {body}"),
        })
    }

    async fn drop_collection(&self, collection: &str) -> Result<bool> {
        let response = self.send(self.request(Method::DELETE, collection)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_success(collection, response).await?;
        Ok(true)
    }

    async fn bulk_write(
        &self,
        collection: &str,
        records: &[StoreRecord],
        mode: WriteMode,
    ) -> Result<BulkReport> {
        if records.is_empty() {
            return Ok(BulkReport::default());
        }

        let request = self
            .request(Method::POST, "_bulk")?
            .query(&[("refresh", "wait_for")])
            .header("Content-Type", "application/x-ndjson")
            .body(bulk_payload(collection, records, mode)?);
        let response = self.send(request).await?;
        let parsed = expect_success(collection, response).await?;
        Ok(parse_bulk_response(&parsed))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .send(self.request_to(Method::GET, self.document_url(collection, id)?))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            if is_index_missing(&body) {
                return Err(RecallError::IndexNotFound(collection.to_string()));
            }
            return Ok(None);
        }

        let parsed = expect_success(collection, response).await?;
        if parsed.pointer("/found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        Ok(parsed.pointer("/_source").cloned())
    }

    async fn term_query(
        &self,
        collection: &str,
        filter: &TermFilter,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        let body = json!({
            "size": size,
            "_source": { "excludes": self.config.source_excludes },
            "query": terms_clause(filter)
        });
        self.search(collection, body).await
    }

    async fn fuzzy_match(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        policy: &FuzzyPolicy,
        size: usize,
    ) -> Result<Vec<StoreHit>> {
        self.search(collection, fuzzy_query_body(field, value, policy, size))
            .await
    }

    async fn filtered_search(
        &self,
        collection: &str,
        filter: Option<&TermFilter>,
        lexical: Option<&LexicalQuery>,
        k: usize,
    ) -> Result<Vec<StoreHit>> {
        let body = filtered_search_body(filter, lexical, k, &self.config.source_excludes);
        self.search(collection, body).await
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let query = match filter {
            Filter::All => json!({ "match_all": {} }),
            Filter::Terms(terms) => terms_clause(terms),
        };
        let request = self
            .request(Method::POST, &format!("{collection}/_delete_by_query"))?
            .query(&[("conflicts", "proceed"), ("refresh", "true")])
            .json(&json!({ "query": query }));
        let response = self.send(request).await?;
        let parsed = expect_success(collection, response).await?;
        Ok(parsed.pointer("/deleted").and_then(Value::as_u64).unwrap_or(0))
    }

    async fn scan(
        &self,
        collection: &str,
        cursor: Option<ScanCursor>,
        page_size: usize,
    ) -> Result<ScanPage> {
        let keep_alive = self.config.scroll_keep_alive.as_str();
        let request = match &cursor {
            None => self
                .request(Method::POST, &format!("{collection}/_search"))?
                .query(&[("scroll", keep_alive)])
                .json(&json!({
                    "size": page_size,
                    "_source": { "excludes": self.config.source_excludes },
                    "sort": ["_doc"],
                    "query": { "match_all": {} }
                })),
            Some(ScanCursor(scroll_id)) => self
                .request(Method::POST, "_search/scroll")?
                .json(&json!({ "scroll": keep_alive, "scroll_id": scroll_id })),
        };

        let response = self.send(request).await?;
        let parsed = expect_success(collection, response).await?;
        let scroll_id = parsed
            .pointer("/_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let records: Vec<StoreRecord> = parse_hits(&parsed)
            .into_iter()
            .map(|hit| StoreRecord {
                id: hit.id,
                body: hit.source,
            })
            .collect();

        let exhausted = records.len() < page_size.max(1);
        let next = match scroll_id {
            Some(scroll_id) if exhausted => {
                self.clear_scroll(&scroll_id).await;
                None
            }
            Some(scroll_id) => Some(ScanCursor(scroll_id)),
            None => None,
        };

        Ok(ScanPage { records, next })
    }
}
