use async_trait::async_trait;
use deeprecall_core::{HttpPageExtractor, PageExtractor, RecallError, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const TEXT_EXTENSIONS: [&str; 2] = ["txt", "md"];
const OCR_EXTENSIONS: [&str; 5] = ["pdf", "png", "jpg", "jpeg", "tiff"];

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn is_text(name: &str) -> bool {
    extension(name).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
}

fn is_supported(name: &str) -> bool {
    extension(name).is_some_and(|ext| {
        TEXT_EXTENSIONS.contains(&ext.as_str()) || OCR_EXTENSIONS.contains(&ext.as_str())
    })
}

/// Plain-text files are read directly, one page per form-feed separated
/// section; everything else goes through the OCR service when one is configured.
pub struct FilePages {
    ocr: Option<HttpPageExtractor>,
}

impl FilePages {
    pub fn new(ocr: Option<HttpPageExtractor>) -> Self {
        Self { ocr }
    }
}

pub fn text_pages(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|error| RecallError::Extraction(format!("file is not UTF-8 text: {error}")))?;
    Ok(text
        .replace("\r\n", "\n")
        .split('\u{000c}')
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl PageExtractor for FilePages {
    async fn extract_pages(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<String>> {
        if is_text(file_name) {
            return text_pages(bytes);
        }
        match &self.ocr {
            Some(ocr) => ocr.extract_pages(file_name, bytes).await,
            None => Err(RecallError::InvalidArgument(format!(
                "{file_name} needs OCR but no OCR endpoint is configured"
            ))),
        }
    }
}

/// Ingestible files under `folder`, recursively, in path order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_supported))
        .map(|entry| entry.path().to_path_buf())
        .collect();

    files.sort_unstable();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_filters_by_extension() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.PDF"), b"%PDF-1.4")?;
        fs::write(nested.join("b.txt"), b"page")?;
        fs::write(nested.join("c.docx"), b"skip")?;

        let files = discover_documents(dir.path());
        let names: Vec<_> = files
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, vec!["a.PDF", "b.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn text_files_split_on_form_feed_and_keep_blank_lines() {
        let pages = FilePages::new(None)
            .extract_pages("notes.txt", b"one\r\n\r\ntwo\x0cthree")
            .await
            .unwrap();
        assert_eq!(pages, vec!["one\n\ntwo".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn scans_without_ocr_are_rejected() {
        let error = FilePages::new(None)
            .extract_pages("scan.pdf", b"%PDF-1.4")
            .await
            .unwrap_err();
        assert!(matches!(error, RecallError::InvalidArgument(_)));
    }
}
