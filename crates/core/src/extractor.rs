use crate::error::{RecallError, Result};
use crate::traits::PageExtractor;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExtractedText {
    Pages(Vec<String>),
    Single(String),
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    extracted_text: Option<ExtractedText>,
    #[serde(default)]
    pages: Option<Vec<OcrPage>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// OCR service reached over HTTP, typically its `/extract_text` route. The file
/// is posted as the `file` part of a multipart form.
pub struct HttpPageExtractor {
    client: Client,
    config: OcrEndpointConfig,
}

impl HttpPageExtractor {
    pub fn new(config: OcrEndpointConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

fn content_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("tif" | "tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn upload_form(file_name: &str, bytes: &[u8]) -> Result<Form> {
    let part = Part::bytes(bytes.to_vec())
        .file_name(file_name.to_string())
        .mime_str(content_type(file_name))?;
    Ok(Form::new().part("file", part))
}

#[async_trait]
impl PageExtractor for HttpPageExtractor {
    async fn extract_pages(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<String>> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .multipart(upload_form(file_name, bytes)?);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RecallError::Extraction(format!(
                "OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json().await?;
        let pages = payload_to_pages(payload, file_name)?;
        debug!(file_name, pages = pages.len(), "extracted page text");
        Ok(pages)
    }
}

fn has_text(pages: &[String]) -> bool {
    pages.iter().any(|page| !page.trim().is_empty())
}

/// Accepts `extracted_text` (one string per page, or one string), a `pages`
/// list, or a single `text` split on form feeds, in that order of preference.
///
/// Blank pages are kept so page numbers match the source file; a response is
/// only rejected when no page has any text.
fn payload_to_pages(payload: OcrResponse, file_name: &str) -> Result<Vec<String>> {
    match payload.extracted_text {
        Some(ExtractedText::Pages(pages)) if has_text(&pages) => return Ok(pages),
        Some(ExtractedText::Single(text)) if !text.trim().is_empty() => return Ok(vec![text]),
        _ => {}
    }

    if let Some(mut listed) = payload.pages {
        listed.sort_by_key(|page| page.page.unwrap_or(u32::MAX));
        let listed: Vec<String> = listed
            .into_iter()
            .map(|page| page.text.unwrap_or_default().trim().to_string())
            .collect();
        if has_text(&listed) {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = payload.text {
        let mut pages: Vec<String> = raw_text
            .split('\u{000c}')
            .map(|chunk| chunk.trim().to_string())
            .collect();
        // A trailing form feed ends the last page rather than opening a new one.
        if pages.len() > 1 && pages.last().is_some_and(String::is_empty) {
            pages.pop();
        }
        if has_text(&pages) {
            return Ok(pages);
        }
    }

    Err(RecallError::Extraction(format!(
        "OCR response had no readable text for {file_name}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn parse(body: serde_json::Value) -> Result<Vec<String>> {
        payload_to_pages(serde_json::from_value(body).unwrap(), "report.pdf")
    }

    #[test]
    fn extracted_text_pages_are_kept_verbatim() {
        let pages = parse(json!({ "extracted_text": ["a\n\nb", "c"] })).unwrap();
        assert_eq!(pages, vec!["a\n\nb".to_string(), "c".to_string()]);
    }

    #[test]
    fn extracted_text_may_be_one_string() {
        let pages = parse(json!({ "extracted_text": "only page" })).unwrap();
        assert_eq!(pages, vec!["only page".to_string()]);
    }

    #[test]
    fn page_list_is_ordered_and_blank_pages_keep_their_slot() {
        let pages = parse(json!({
            "pages": [
                { "page": 3, "text": "Page 3" },
                { "page": 2, "text": "  " },
                { "page": 1, "text": "Page 1" },
                { "page": 4 }
            ]
        }))
        .unwrap();
        assert_eq!(pages, vec!["Page 1", "", "Page 3", ""]);
    }

    #[test]
    fn fallback_text_split_by_form_feed() {
        let pages = parse(json!({ "text": "First\u{000C}\u{000C}Third\n\u{000C}" })).unwrap();
        assert_eq!(pages, vec!["First", "", "Third"]);
    }

    #[test]
    fn all_blank_pages_are_an_extraction_error() {
        let error = parse(json!({ "pages": [{ "page": 1, "text": " " }] })).unwrap_err();
        assert!(matches!(error, RecallError::Extraction(_)));
    }

    #[test]
    fn upload_types_follow_the_file_extension() {
        assert_eq!(content_type("scan.PDF"), "application/pdf");
        assert_eq!(content_type("photo.jpeg"), "image/jpeg");
        assert_eq!(content_type("notes"), "application/octet-stream");
    }

    /// Accepts one HTTP request, returns its raw bytes and answers with `reply`.
    async fn capture_one_request(listener: TcpListener, reply: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = socket.read(&mut buffer).await.unwrap();
            received.extend_from_slice(&buffer[..read]);
            if read == 0 || received.ends_with(b"--\r\n") {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
            reply.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&received).into_owned()
    }

    #[tokio::test]
    async fn file_is_posted_as_a_multipart_file_part() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(capture_one_request(
            listener,
            r#"{"extracted_text": ["page one", ""]}"#,
        ));

        let extractor = HttpPageExtractor::new(OcrEndpointConfig {
            endpoint: format!("http://{address}/extract_text"),
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let pages = extractor
            .extract_pages("scan.pdf", b"%PDF-1.4 body")
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(pages, vec!["page one", ""]);
        assert!(request.starts_with("POST /extract_text HTTP/1.1"));
        assert!(request.contains("%PDF-1.4 body"));
        let request = request.to_ascii_lowercase();
        assert!(request.contains("content-type: multipart/form-data; boundary="));
        assert!(request.contains(r#"content-disposition: form-data; name="file"; filename="scan.pdf""#));
        assert!(request.contains("content-type: application/pdf"));
    }

    #[test]
    fn empty_response_is_an_extraction_error() {
        let error = parse(json!({ "extracted_text": [] })).unwrap_err();
        assert!(matches!(error, RecallError::Extraction(_)));
    }
}
