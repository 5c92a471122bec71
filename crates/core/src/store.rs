use serde_json::Value;

/// A document hit as returned by a backend query.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

impl StoreHit {
    /// `doc_id` stored in the body, falling back to the record id.
    pub fn doc_id(&self) -> String {
        self.source
            .pointer("/doc_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Record body plus the id it is written under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or overwrite.
    Upsert,
    /// Insert only if no record with the same id exists; existing ids are reported as conflicts.
    CreateOnly,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub written: Vec<String>,
    pub conflicts: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BulkReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: BulkReport) {
        self.written.extend(other.written);
        self.conflicts.extend(other.conflicts);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Keyword,
    Text,
    Integer,
    Date,
    Vector { dimensions: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub fields: Vec<(String, FieldType)>,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, kind)| *kind)
    }

    pub fn has_vectors(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, kind)| matches!(kind, FieldType::Vector { .. }))
    }
}

impl Default for CollectionSchema {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fuzziness {
    /// Edit distance scaled by term length: 0 up to 2 chars, 1 up to 5, 2 beyond.
    Auto,
    Edits(u8),
}

impl Fuzziness {
    pub fn max_edits(&self, term_chars: usize) -> usize {
        match self {
            Fuzziness::Auto => match term_chars {
                0..=2 => 0,
                3..=5 => 1,
                _ => 2,
            },
            Fuzziness::Edits(edits) => usize::from(*edits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyPolicy {
    pub fuzziness: Fuzziness,
    pub prefix_length: usize,
    pub max_expansions: usize,
}

impl Default for FuzzyPolicy {
    fn default() -> Self {
        Self {
            fuzziness: Fuzziness::Auto,
            prefix_length: 1,
            max_expansions: 50,
        }
    }
}

/// Exact match on one of `values` for `field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermFilter {
    pub field: String,
    pub values: Vec<String>,
}

impl TermFilter {
    pub fn new(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }

    pub fn single(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, vec![value.into()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Terms(TermFilter),
}

/// Analyzed full-text match against one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalQuery {
    pub field: String,
    pub text: String,
}

impl LexicalQuery {
    pub fn new(field: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub records: Vec<StoreRecord>,
    pub next: Option<ScanCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auto_fuzziness_scales_with_term_length() {
        assert_eq!(Fuzziness::Auto.max_edits(2), 0);
        assert_eq!(Fuzziness::Auto.max_edits(4), 1);
        assert_eq!(Fuzziness::Auto.max_edits(9), 2);
        assert_eq!(Fuzziness::Edits(1).max_edits(9), 1);
    }

    #[test]
    fn hit_doc_id_prefers_body_field() {
        let hit = StoreHit {
            id: "doc_1_page_1_para_1".to_string(),
            score: 1.0,
            source: json!({"doc_id": "doc_1"}),
        };
        assert_eq!(hit.doc_id(), "doc_1");

        let bare = StoreHit {
            id: "doc_2".to_string(),
            score: 1.0,
            source: json!({}),
        };
        assert_eq!(bare.doc_id(), "doc_2");
    }
}
