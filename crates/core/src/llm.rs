//! OpenAI-compatible chat-completions client.
//!
//! One client serves the three language-model collaborators: query field
//! extraction, document metadata extraction and answer generation. Any server
//! speaking the `/chat/completions` dialect works; providers differ only by
//! endpoint, key and model name.

use crate::conversation::{Message, Role};
use crate::error::{RecallError, Result};
use crate::models::{prune_empty, FieldMap, FieldValue, ARCHIVAL_FIELDS};
use crate::traits::{AnswerGenerator, FieldExtractor, MetadataExtractor};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    /// Full URL of the `/chat/completions` endpoint.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ChatCompletionsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            api_key: None,
            model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.2,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ChatCompletionsClient {
    client: Client,
    config: ChatCompletionsConfig,
}

impl ChatCompletionsClient {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub async fn complete(&self, messages: &[Message]) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": messages,
        });

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RecallError::BackendResponse {
                backend: "llm".to_string(),
                details: format!("{status}: {text}"),
            });
        }

        let payload: Value = response.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| RecallError::BackendResponse {
                backend: "llm".to_string(),
                details: "no choices in response".to_string(),
            })?;
        debug!(model = %self.config.model, chars = content.len(), "chat completion");
        Ok(content.trim().to_string())
    }

    async fn extract(&self, prompt: String) -> Result<FieldMap> {
        let reply = self
            .complete(&[Message {
                role: Role::System,
                content: prompt,
            }])
            .await?;
        parse_field_map(&reply)
    }
}

#[async_trait]
impl FieldExtractor for ChatCompletionsClient {
    async fn extract_fields(&self, text: &str) -> Result<FieldMap> {
        self.extract(query_prompt(text)).await
    }
}

#[async_trait]
impl MetadataExtractor for ChatCompletionsClient {
    async fn extract_metadata(&self, document_text: &str) -> Result<FieldMap> {
        self.extract(metadata_prompt(document_text)).await
    }
}

#[async_trait]
impl AnswerGenerator for ChatCompletionsClient {
    async fn generate(&self, system_prompt: &str, turns: &[Message]) -> Result<String> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(Message {
            role: Role::System,
            content: system_prompt.to_string(),
        });
        messages.extend_from_slice(turns);
        self.complete(&messages).await
    }
}

fn schema_sketch() -> String {
    ARCHIVAL_FIELDS
        .iter()
        .map(|field| match *field {
            "dates_mentioned" => format!("  \"{field}\": [\"YYYY\", \"YYYY-MM\", \"YYYY-MM-DD\"]"),
            "scopeAndContent" | "generalNote" | "culture" | "title" | "language" => {
                format!("  \"{field}\": \"...\"")
            }
            _ => format!("  \"{field}\": [\"...\"]"),
        })
        .collect::<Vec<_>>()
        .join(",\n")
}

fn query_prompt(text: &str) -> String {
    format!(
        "You are a metadata extraction model.\n\
         Extract key metadata fields from the given text and return a JSON object.\n\
         Only include a field if it is actually found or can be inferred with reasonable confidence.\n\
         The possible metadata fields are:\n{{\n{}\n}}\n\
         Rules:\n\
         - Always include \"scopeAndContent\" with the scope of the query.\n\
         - Omit missing or irrelevant fields entirely, including empty strings and empty lists.\n\
         - Use concise and factual extractions.\n\
         - Return valid JSON only, with no commentary.\n\n\
         Text:\n{text}",
        schema_sketch()
    )
}

fn metadata_prompt(text: &str) -> String {
    format!(
        "You are a metadata extraction model.\n\
         Extract key fields from the given text and respond in structured JSON strictly following this schema:\n\
         {{\n{}\n}}\n\
         Leave out fields you cannot fill. Return valid JSON only.\n\n\
         Text: {text}",
        schema_sketch()
    )
}

/// Markdown code fence around a JSON reply, compiled once per process.
fn code_fence() -> Result<&'static Regex> {
    static FENCE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$"))
        .as_ref()
        .map_err(|error| RecallError::Extraction(error.to_string()))
}

/// Reads the model's JSON reply into a field map, dropping blank and non-textual values.
pub fn parse_field_map(reply: &str) -> Result<FieldMap> {
    let body = code_fence()?
        .captures(reply)
        .and_then(|captures| captures.get(1))
        .map_or(reply.trim(), |inner| inner.as_str());

    let value: Value = serde_json::from_str(body)
        .map_err(|error| RecallError::Extraction(format!("model reply is not JSON: {error}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| RecallError::Extraction("model reply is not a JSON object".to_string()))?;

    Ok(prune_empty(
        object
            .iter()
            .filter_map(|(name, value)| FieldValue::from_json(value).map(|v| (name.clone(), v)))
            .collect(),
    ))
}
