use crate::error::ChunkingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SourceFileType {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Csv,
    Txt,
    Markdown,
    Other,
}

impl SourceFileType {
    pub fn from_extension(extension: &str) -> Self {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => SourceFileType::Pdf,
            "docx" | "doc" => SourceFileType::Docx,
            "pptx" | "ppt" => SourceFileType::Pptx,
            "xlsx" | "xls" => SourceFileType::Xlsx,
            "csv" | "tsv" => SourceFileType::Csv,
            "txt" | "text" => SourceFileType::Txt,
            "md" | "markdown" => SourceFileType::Markdown,
            _ => SourceFileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFileType::Pdf => "pdf",
            SourceFileType::Docx => "docx",
            SourceFileType::Pptx => "pptx",
            SourceFileType::Xlsx => "xlsx",
            SourceFileType::Csv => "csv",
            SourceFileType::Txt => "txt",
            SourceFileType::Markdown => "markdown",
            SourceFileType::Other => "other",
        }
    }
}

impl fmt::Display for SourceFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFileType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match SourceFileType::from_extension(value) {
            SourceFileType::Other if !value.eq_ignore_ascii_case("other") => {
                Err(format!("unknown file type: {value}"))
            }
            file_type => Ok(file_type),
        }
    }
}

/// An ingested source document. Never mutated; re-ingestion supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub file_type: SourceFileType,
    pub source_path: Option<String>,
    pub title: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StructuralKind {
    Paragraph,
    Page,
    Slide,
    Table,
    Section,
}

/// Structural provenance of a chunk; each variant carries only what applies
/// to that kind of unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkStructure {
    Paragraph {
        first_paragraph: u32,
        paragraph_count: u32,
    },
    Page {
        page_number: u32,
    },
    Slide {
        slide_number: u32,
    },
    Table {
        table_name: String,
        first_row: u32,
        row_count: u32,
    },
    Section {
        heading: String,
    },
}

impl ChunkStructure {
    pub fn kind(&self) -> StructuralKind {
        match self {
            ChunkStructure::Paragraph { .. } => StructuralKind::Paragraph,
            ChunkStructure::Page { .. } => StructuralKind::Page,
            ChunkStructure::Slide { .. } => StructuralKind::Slide,
            ChunkStructure::Table { .. } => StructuralKind::Table,
            ChunkStructure::Section { .. } => StructuralKind::Section,
        }
    }

    pub fn validate(&self) -> Result<(), ChunkingError> {
        match self {
            ChunkStructure::Paragraph {
                paragraph_count, ..
            } if *paragraph_count == 0 => Err(ChunkingError::MalformedHints(
                "paragraph chunk must span at least one paragraph".to_string(),
            )),
            ChunkStructure::Page { page_number: 0 } => Err(ChunkingError::MalformedHints(
                "page numbers start at 1".to_string(),
            )),
            ChunkStructure::Slide { slide_number: 0 } => Err(ChunkingError::MalformedHints(
                "slide numbers start at 1".to_string(),
            )),
            ChunkStructure::Table {
                table_name,
                row_count,
                ..
            } if table_name.trim().is_empty() || *row_count == 0 => {
                Err(ChunkingError::MalformedHints(
                    "table chunk needs a name and at least one row".to_string(),
                ))
            }
            ChunkStructure::Section { heading } if heading.trim().is_empty() => Err(
                ChunkingError::MalformedHints("section heading is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Word position of the first word in the source document.
    pub start_offset: usize,
    /// Exclusive word position.
    pub end_offset: usize,
    pub structure: ChunkStructure,
    pub sequence_index: u32,
    pub sibling_count: u32,
}

impl Chunk {
    pub fn structural_kind(&self) -> StructuralKind {
        self.structure.kind()
    }

    pub fn word_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    Page { number: u32 },
    Slide { number: u32 },
    Table { name: String },
    Section { heading: String },
}

/// A discrete structural unit declared by the extractor, as a byte range of
/// the raw document text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuralUnit {
    pub kind: UnitKind,
    pub range: Range<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuralHints {
    pub units: Vec<StructuralUnit>,
}

impl StructuralHints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    pub file_type: SourceFileType,
    pub source_path: Option<String>,
    pub title: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
    /// Digest of the source bytes. When absent the text is hashed instead.
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl SourceMetadata {
    pub fn new(file_type: SourceFileType) -> Self {
        Self {
            file_type,
            source_path: None,
            title: None,
            ingested_at: None,
            content_hash: None,
        }
    }
}

/// Everything the extraction layer hands over for one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub document_id: String,
    pub text: String,
    pub hints: StructuralHints,
    pub metadata: SourceMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Semantic => "semantic",
            SearchType::Keyword => "keyword",
            SearchType::Hybrid => "hybrid",
        }
    }

    pub fn uses_vectors(&self) -> bool {
        matches!(self, SearchType::Semantic | SearchType::Hybrid)
    }

    pub fn uses_keywords(&self) -> bool {
        matches!(self, SearchType::Keyword | SearchType::Hybrid)
    }
}

impl FromStr for SearchType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "semantic" | "vector" => Ok(SearchType::Semantic),
            "keyword" => Ok(SearchType::Keyword),
            "hybrid" => Ok(SearchType::Hybrid),
            other => Err(format!(
                "unknown search type: {other}. Use semantic, keyword, or hybrid."
            )),
        }
    }
}

/// Inclusive bounds on the ingestion timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub file_type: Option<SourceFileType>,
    pub date_range: Option<DateRange>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.file_type.is_none() && self.date_range.is_none()
    }

    pub fn matches(&self, document: &Document) -> bool {
        let type_ok = self
            .file_type
            .map_or(true, |file_type| document.file_type == file_type);
        let date_ok = self
            .date_range
            .map_or(true, |range| range.contains(document.ingested_at));
        type_ok && date_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub search_type: SearchType,
    pub top_k: usize,
    pub filters: QueryFilters,
    /// Overrides the configured query deadline.
    pub timeout: Option<Duration>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, search_type: SearchType, top_k: usize) -> Self {
        Self {
            text: text.into(),
            search_type,
            top_k,
            filters: QueryFilters::default(),
            timeout: None,
        }
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RawScores {
    pub vector: Option<f32>,
    pub keyword: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: Option<String>,
    pub file_type: SourceFileType,
    pub sequence_index: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    pub structure: ChunkStructure,
    /// Min-max normalized over the query's vector candidates, 0 when absent.
    pub vector_score: f64,
    /// Min-max normalized over the query's keyword candidates, 0 when absent.
    pub keyword_score: f64,
    pub fused_score: f64,
    pub raw: RawScores,
    pub matched_terms: Vec<String>,
    pub context_window: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub query: String,
    pub search_type: SearchType,
    pub results: Vec<QueryResult>,
    /// Set when the vector signal was unavailable and only keywords ranked.
    pub degraded: bool,
    pub from_cache: bool,
    /// Index version the results were computed against.
    pub version: u64,
    pub vector_candidates: usize,
    pub keyword_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionResult {
    pub document_id: String,
    pub chunks_created: usize,
    pub chunks_retired: usize,
    pub version: u64,
    /// Recovered problems, such as malformed structural hints.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetireOutcome {
    pub document_id: String,
    pub chunks_retired: usize,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document(file_type: SourceFileType, day: u32) -> Document {
        Document {
            document_id: "doc".to_string(),
            file_type,
            source_path: None,
            title: "doc".to_string(),
            content_hash: String::new(),
            ingested_at: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn filters_match_type_and_inclusive_dates() {
        let filters = QueryFilters {
            file_type: Some(SourceFileType::Pdf),
            date_range: Some(DateRange {
                from: Some(Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()),
                to: None,
            }),
        };

        assert!(filters.matches(&document(SourceFileType::Pdf, 2)));
        assert!(!filters.matches(&document(SourceFileType::Pdf, 1)));
        assert!(!filters.matches(&document(SourceFileType::Txt, 3)));
        assert!(QueryFilters::default().matches(&document(SourceFileType::Txt, 3)));
    }

    #[test]
    fn structure_validation_rejects_empty_units() {
        assert!(ChunkStructure::Page { page_number: 0 }.validate().is_err());
        assert!(ChunkStructure::Table {
            table_name: " ".to_string(),
            first_row: 0,
            row_count: 3
        }
        .validate()
        .is_err());
        assert!(ChunkStructure::Slide { slide_number: 2 }.validate().is_ok());
        assert_eq!(
            ChunkStructure::Section {
                heading: "Scope".to_string()
            }
            .kind(),
            StructuralKind::Section
        );
    }

    #[test]
    fn search_type_and_file_type_parse() {
        assert_eq!("Hybrid".parse::<SearchType>(), Ok(SearchType::Hybrid));
        assert!("fuzzy".parse::<SearchType>().is_err());
        assert_eq!(".PDF".parse::<SourceFileType>(), Ok(SourceFileType::Pdf));
        assert!("exe".parse::<SourceFileType>().is_err());
    }
}
