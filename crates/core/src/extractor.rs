use crate::error::IngestError;
use crate::models::{SourceFileType, StructuralHints, StructuralUnit, UnitKind};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Text plus the structural units found while reading it. Unit ranges are
/// byte ranges into `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    pub hints: StructuralHints,
}

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError>;
}

/// Reads a file as UTF-8, falling back to Latin-1. Files that look binary are
/// refused.
pub fn read_text(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    if bytes.iter().take(1024).any(|byte| *byte == 0) {
        return Err(IngestError::InvalidArgument(format!(
            "{} looks like a binary file",
            path.display()
        )));
    }
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(error) => Ok(error.into_bytes().iter().map(|&byte| byte as char).collect()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        Ok(ExtractedDocument {
            text: read_text(path)?,
            hints: StructuralHints::none(),
        })
    }
}

/// Page-per-form-feed text, as written by most PDF-to-text tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct PagedTextExtractor;

impl PagedTextExtractor {
    pub fn parse(&self, raw: &str) -> ExtractedDocument {
        let mut units = Vec::new();
        let mut start = 0;
        for (index, page) in raw.split('\u{c}').enumerate() {
            let range = start..start + page.len();
            start = range.end + '\u{c}'.len_utf8();
            if let Some(range) = trimmed(raw, range) {
                units.push(StructuralUnit {
                    kind: UnitKind::Page {
                        number: index as u32 + 1,
                    },
                    range,
                });
            }
        }

        ExtractedDocument {
            text: raw.to_string(),
            hints: StructuralHints { units },
        }
    }
}

impl DocumentExtractor for PagedTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        Ok(self.parse(&read_text(path)?))
    }
}

/// Slides separated by `--- slide ---` lines (an optional number may follow
/// the word). Separator lines are dropped from the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlideTextExtractor;

impl SlideTextExtractor {
    pub fn parse(&self, raw: &str) -> ExtractedDocument {
        let mut slides: Vec<Vec<&str>> = vec![Vec::new()];
        for line in raw.lines() {
            if is_slide_separator(line) {
                slides.push(Vec::new());
            } else if let Some(current) = slides.last_mut() {
                current.push(line);
            }
        }
        if slides.first().is_some_and(|lines| lines.iter().all(|line| line.trim().is_empty())) {
            slides.remove(0);
        }

        let mut text = String::new();
        let mut units = Vec::new();
        for (index, lines) in slides.iter().enumerate() {
            let body = lines.join("\n");
            let body = body.trim();
            if body.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let start = text.len();
            text.push_str(body);
            units.push(StructuralUnit {
                kind: UnitKind::Slide {
                    number: index as u32 + 1,
                },
                range: start..text.len(),
            });
        }

        ExtractedDocument {
            text,
            hints: StructuralHints { units },
        }
    }
}

impl DocumentExtractor for SlideTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        Ok(self.parse(&read_text(path)?))
    }
}

/// Delimited rows (comma, tab or `|`), one table per `Sheet: name` section or
/// a single table named after the file. Rows are rewritten as
/// `cell | cell | cell` lines with empty cells dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedTableExtractor;

impl DelimitedTableExtractor {
    pub fn parse(&self, raw: &str, default_name: &str) -> ExtractedDocument {
        let delimiter = sniff_delimiter(raw);
        let mut tables: Vec<(String, Vec<String>)> = Vec::new();

        for line in raw.lines() {
            let trimmed = line.trim();
            if let Some(name) = trimmed.strip_prefix("Sheet:") {
                tables.push((name.trim().to_string(), Vec::new()));
                continue;
            }
            let cells = split_record(trimmed, delimiter);
            if cells.is_empty() {
                continue;
            }
            if tables.is_empty() {
                tables.push((default_name.to_string(), Vec::new()));
            }
            if let Some((_, rows)) = tables.last_mut() {
                rows.push(cells.join(" | "));
            }
        }

        let mut text = String::new();
        let mut units = Vec::new();
        for (name, rows) in tables {
            if rows.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let start = text.len();
            text.push_str(&rows.join("\n"));
            let name = if name.is_empty() {
                default_name.to_string()
            } else {
                name
            };
            units.push(StructuralUnit {
                kind: UnitKind::Table { name },
                range: start..text.len(),
            });
        }

        ExtractedDocument {
            text,
            hints: StructuralHints { units },
        }
    }
}

impl DocumentExtractor for DelimitedTableExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, IngestError> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        Ok(self.parse(&read_text(path)?, &name))
    }
}

fn is_slide_separator(line: &str) -> bool {
    let line = line.trim();
    let inner = line.trim_start_matches('-');
    let dashes_before = line.len() - inner.len();
    let label = inner.trim_end_matches('-');
    let dashes_after = inner.len() - label.len();
    if dashes_before < 3 || dashes_after < 3 {
        return false;
    }

    let mut words = label.split_whitespace();
    let named = words
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("slide"));
    let numbered = match words.next() {
        None => true,
        Some(number) => number.chars().all(|ch| ch.is_ascii_digit()),
    };
    named && numbered && words.next().is_none()
}

fn sniff_delimiter(raw: &str) -> char {
    let sample = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("Sheet:"))
        .unwrap_or_default();
    if sample.contains('|') {
        '|'
    } else if sample.contains('\t') {
        '\t'
    } else if sample.contains(';') && !sample.contains(',') {
        ';'
    } else {
        ','
    }
}

/// Splits one record, honouring double-quoted fields with `""` escapes.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ch if ch == delimiter && !quoted => cells.push(std::mem::take(&mut current)),
            ch => current.push(ch),
        }
    }
    cells.push(current);

    cells
        .into_iter()
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

fn trimmed(text: &str, range: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return None;
    }
    Some(range.start + leading..range.end - trailing)
}

/// Detects the format of a file. Text exports named like `report.pdf.txt`
/// take the format of their inner extension.
pub fn detect_file_type(path: &Path) -> SourceFileType {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default();
    let outer = SourceFileType::from_extension(extension);
    if outer != SourceFileType::Txt {
        return outer;
    }

    let inner = path
        .file_stem()
        .map(Path::new)
        .and_then(|stem| stem.extension())
        .and_then(|extension| extension.to_str())
        .map(SourceFileType::from_extension);
    match inner {
        Some(SourceFileType::Other) | None => outer,
        Some(inner) => inner,
    }
}

/// Maps formats to the extractor that reads them.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<SourceFileType, Arc<dyn DocumentExtractor>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("formats", &self.extractors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let plain: Arc<dyn DocumentExtractor> = Arc::new(PlainTextExtractor);
        let table: Arc<dyn DocumentExtractor> = Arc::new(DelimitedTableExtractor);
        Self::empty()
            .with(SourceFileType::Txt, Arc::clone(&plain))
            .with(SourceFileType::Markdown, Arc::clone(&plain))
            .with(SourceFileType::Docx, plain)
            .with(SourceFileType::Pdf, Arc::new(PagedTextExtractor))
            .with(SourceFileType::Pptx, Arc::new(SlideTextExtractor))
            .with(SourceFileType::Xlsx, Arc::clone(&table))
            .with(SourceFileType::Csv, table)
    }
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: BTreeMap::new(),
        }
    }

    pub fn with(mut self, file_type: SourceFileType, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractors.insert(file_type, extractor);
        self
    }

    pub fn get(&self, file_type: SourceFileType) -> Option<&dyn DocumentExtractor> {
        self.extractors.get(&file_type).map(|extractor| extractor.as_ref())
    }

    /// The detected format of `path` and its extractor. Binary formats only
    /// resolve through their text exports (`deck.pptx.txt`).
    pub fn resolve(&self, path: &Path) -> Option<(SourceFileType, &dyn DocumentExtractor)> {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)?;
        if !matches!(extension.as_str(), "txt" | "text" | "md" | "markdown" | "csv" | "tsv") {
            return None;
        }
        let file_type = detect_file_type(path);
        self.get(file_type).map(|extractor| (file_type, extractor))
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }
}
