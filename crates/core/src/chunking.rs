use crate::models::ChunkKey;

/// One paragraph of one page, addressed by its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paragraph {
    pub page_no: u32,
    pub para_no: u32,
    pub text: String,
}

impl Paragraph {
    pub fn key(&self, doc_id: &str) -> ChunkKey {
        ChunkKey::new(doc_id, self.page_no, self.para_no)
    }
}

/// Splits every page on `\n`. Blank lines stay as empty paragraphs so that
/// paragraph numbers follow the source line layout exactly.
pub fn split_paragraphs<S: AsRef<str>>(pages: &[S]) -> Vec<Paragraph> {
    pages
        .iter()
        .enumerate()
        .flat_map(|(page_index, page)| {
            page.as_ref()
                .split('\n')
                .enumerate()
                .map(move |(para_index, text)| Paragraph {
                    page_no: (page_index + 1) as u32,
                    para_no: (para_index + 1) as u32,
                    text: text.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Text handed to the metadata extractor for a whole document.
pub fn document_text<S: AsRef<str>>(pages: &[S]) -> String {
    pages
        .iter()
        .map(|page| page.as_ref())
        .collect::<Vec<_>>()
        .join("\n\n")
}
