use crate::error::ChunkingError;
use crate::models::{
    Chunk, ChunkStructure, SourceFileType, StructuralHints, StructuralUnit, UnitKind,
};
use crate::normalize::{
    count_words, normalize_text, split_lines, split_paragraphs, SentenceSplitter,
    DEFAULT_SENTENCE_BOUNDARY,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Paragraph,
    Page,
    Slide,
    Table,
}

impl ChunkStrategy {
    pub fn for_file_type(file_type: SourceFileType) -> Self {
        match file_type {
            SourceFileType::Pdf => ChunkStrategy::Page,
            SourceFileType::Pptx => ChunkStrategy::Slide,
            SourceFileType::Xlsx | SourceFileType::Csv => ChunkStrategy::Table,
            _ => ChunkStrategy::Paragraph,
        }
    }
}

/// Sizes are counted in words.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// How far from `target_size` a paragraph boundary may sit and still win
    /// over a closer sentence boundary.
    pub boundary_tolerance: usize,
    pub strategy: ChunkStrategy,
    pub sentence_boundary: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: 800,
            overlap: 160,
            min_chunk_size: 50,
            max_chunk_size: 1_000,
            boundary_tolerance: 80,
            strategy: ChunkStrategy::Paragraph,
            sentence_boundary: DEFAULT_SENTENCE_BOUNDARY.to_string(),
        }
    }
}

impl ChunkingConfig {
    /// Defaults tuned per format; PDF pages get smaller chunks.
    pub fn for_file_type(file_type: SourceFileType) -> Self {
        let base = Self::default().with_strategy(ChunkStrategy::for_file_type(file_type));
        match file_type {
            SourceFileType::Pdf => Self {
                target_size: 600,
                ..base
            },
            _ => base,
        }
    }

    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.target_size == 0 {
            return Err(ChunkingError::InvalidConfig(
                "target_size must be positive".to_string(),
            ));
        }
        if self.min_chunk_size > self.target_size || self.target_size > self.max_chunk_size {
            return Err(ChunkingError::InvalidConfig(format!(
                "expected min_chunk_size <= target_size <= max_chunk_size, got {} / {} / {}",
                self.min_chunk_size, self.target_size, self.max_chunk_size
            )));
        }
        if self.overlap >= self.target_size {
            return Err(ChunkingError::InvalidConfig(format!(
                "overlap {} must be smaller than target_size {}",
                self.overlap, self.target_size
            )));
        }
        Ok(())
    }
}

/// A chunk before document identity is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub structure: ChunkStructure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub drafts: Vec<ChunkDraft>,
    /// Set when the structural hints were rejected and paragraph grouping was
    /// used instead.
    pub fallback: Option<ChunkingError>,
}

/// Structure-aware splitter. Pure: the same text, hints and config always give
/// the same boundaries.
#[derive(Debug, Clone)]
pub struct AdaptiveChunker {
    config: ChunkingConfig,
    sentences: SentenceSplitter,
}

#[derive(Debug, Clone)]
struct Segment {
    span: Range<usize>,
    start_word: usize,
    words: usize,
    paragraph: usize,
    paragraph_end: bool,
}

struct PreparedText {
    text: String,
    base_word: usize,
    segments: Vec<Segment>,
    paragraphs: usize,
}

enum Region<'a> {
    Loose(Range<usize>),
    Unit(&'a StructuralUnit),
}

pub fn chunk(
    document_text: &str,
    hints: &StructuralHints,
    config: &ChunkingConfig,
) -> Result<ChunkPlan, ChunkingError> {
    Ok(AdaptiveChunker::new(config.clone())?.chunk(document_text, hints))
}

impl AdaptiveChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkingError> {
        config.validate()?;
        let sentences = SentenceSplitter::new(&config.sentence_boundary)
            .map_err(|error| ChunkingError::InvalidConfig(error.to_string()))?;
        Ok(Self { config, sentences })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk(&self, text: &str, hints: &StructuralHints) -> ChunkPlan {
        if self.config.strategy == ChunkStrategy::Paragraph || hints.is_empty() {
            return ChunkPlan {
                drafts: self.chunk_regions(text, vec![Region::Loose(0..text.len())]),
                fallback: None,
            };
        }

        match self.regions(text, hints) {
            Ok(regions) => ChunkPlan {
                drafts: self.chunk_regions(text, regions),
                fallback: None,
            },
            Err(error) => ChunkPlan {
                drafts: self.chunk_regions(text, vec![Region::Loose(0..text.len())]),
                fallback: Some(error),
            },
        }
    }

    /// Chunks a document and attaches identity, sequence and sibling counts.
    pub fn build_chunks(
        &self,
        document_id: &str,
        text: &str,
        hints: &StructuralHints,
    ) -> (Vec<Chunk>, Option<ChunkingError>) {
        let plan = self.chunk(text, hints);
        (finalize_chunks(document_id, plan.drafts), plan.fallback)
    }

    fn regions<'a>(
        &self,
        text: &str,
        hints: &'a StructuralHints,
    ) -> Result<Vec<Region<'a>>, ChunkingError> {
        let mut units: Vec<&StructuralUnit> = hints.units.iter().collect();
        units.sort_by_key(|unit| (unit.range.start, unit.range.end));

        let mut regions = Vec::with_capacity(units.len() * 2 + 1);
        let mut cursor = 0;
        for unit in units {
            validate_unit(text, unit)?;
            if unit.range.start < cursor {
                return Err(ChunkingError::MalformedHints(format!(
                    "unit {:?} overlaps the previous unit ending at {cursor}",
                    unit.range
                )));
            }
            if unit.range.start > cursor {
                regions.push(Region::Loose(cursor..unit.range.start));
            }
            regions.push(Region::Unit(unit));
            cursor = unit.range.end;
        }
        if cursor < text.len() {
            regions.push(Region::Loose(cursor..text.len()));
        }

        Ok(regions)
    }

    fn chunk_regions(&self, raw: &str, regions: Vec<Region<'_>>) -> Vec<ChunkDraft> {
        let mut drafts = Vec::new();
        let mut word_cursor = (0usize, 0usize);
        let mut paragraph_base = 0usize;

        for region in regions {
            let (range, unit) = match region {
                Region::Loose(range) => (range, None),
                Region::Unit(unit) => (unit.range.clone(), Some(&unit.kind)),
            };

            let base_word = word_cursor.1 + count_words(&raw[word_cursor.0..range.start]);
            word_cursor = (range.start, base_word);

            let rows = matches!(unit, Some(UnitKind::Table { .. }));
            let prepared = self.prepare(&raw[range], base_word, rows);
            if prepared.segments.is_empty() {
                continue;
            }

            match unit {
                None => {
                    for span in self.group_paragraphs(&prepared.segments) {
                        let first = prepared.segments[span.start].paragraph;
                        let last = prepared.segments[span.end - 1].paragraph;
                        let structure = ChunkStructure::Paragraph {
                            first_paragraph: (paragraph_base + first) as u32,
                            paragraph_count: (last - first + 1) as u32,
                        };
                        drafts.push(draft(&prepared, span, structure));
                    }
                }
                Some(kind) => {
                    let total: usize = prepared.segments.iter().map(|seg| seg.words).sum();
                    let spans = if total <= self.config.max_chunk_size {
                        vec![0..prepared.segments.len()]
                    } else {
                        self.window(&prepared.segments, 0..prepared.segments.len())
                    };
                    for span in spans {
                        let structure = unit_structure(kind, &span);
                        drafts.push(draft(&prepared, span, structure));
                    }
                }
            }

            paragraph_base += prepared.paragraphs;
        }

        drafts
    }

    fn prepare(&self, raw: &str, base_word: usize, rows: bool) -> PreparedText {
        let text = normalize_text(raw);
        let paragraphs = split_paragraphs(&text);
        let mut segments = Vec::new();
        let mut words_seen = 0;

        for (paragraph, range) in paragraphs.iter().enumerate() {
            let pieces = if rows {
                split_lines(&text, range.clone())
            } else {
                self.sentences.split(&text, range.clone())
            };
            let count = pieces.len();
            for (index, span) in pieces.into_iter().enumerate() {
                let words = count_words(&text[span.clone()]);
                segments.push(Segment {
                    span,
                    start_word: words_seen,
                    words,
                    paragraph,
                    paragraph_end: index + 1 == count,
                });
                words_seen += words;
            }
        }

        PreparedText {
            text,
            base_word,
            segments,
            paragraphs: paragraphs.len(),
        }
    }

    /// Groups whole paragraphs up to `target_size`, windowing the ones that
    /// exceed `max_chunk_size`. Returns segment index ranges.
    fn group_paragraphs(&self, segments: &[Segment]) -> Vec<Range<usize>> {
        let mut paragraphs: Vec<(Range<usize>, usize)> = Vec::new();
        let mut start = 0;
        for (index, segment) in segments.iter().enumerate() {
            if segment.paragraph_end {
                let words = segments[start..=index].iter().map(|seg| seg.words).sum();
                paragraphs.push((start..index + 1, words));
                start = index + 1;
            }
        }

        let mut spans: Vec<Range<usize>> = Vec::new();
        let mut current: Option<(Range<usize>, usize)> = None;

        for (paragraph, words) in paragraphs {
            if words > self.config.max_chunk_size {
                if let Some((span, _)) = current.take() {
                    spans.push(span);
                }
                spans.extend(self.window(segments, paragraph));
                continue;
            }

            if let Some((span, current_words)) = current.as_mut() {
                if *current_words + words <= self.config.target_size {
                    span.end = paragraph.end;
                    *current_words += words;
                    continue;
                }
            }

            if let Some((span, _)) = current.take() {
                spans.push(span);
            }

            let carry_start = spans
                .last()
                .filter(|last| last.end == paragraph.start)
                .map(|last| self.carry_start(segments, last.clone(), words))
                .unwrap_or(paragraph.start);
            let carried: usize = segments[carry_start..paragraph.start]
                .iter()
                .map(|seg| seg.words)
                .sum();
            current = Some((carry_start..paragraph.end, carried + words));
        }

        if let Some((span, _)) = current {
            spans.push(span);
        }

        spans
    }

    /// First segment of `previous` that can be repeated in front of a group of
    /// `next_words` words without crossing `overlap` or `max_chunk_size`.
    fn carry_start(&self, segments: &[Segment], previous: Range<usize>, next_words: usize) -> usize {
        let mut start = previous.end;
        let mut carried = 0;
        while start > previous.start + 1 {
            let words = segments[start - 1].words;
            if carried + words > self.config.overlap
                || carried + words + next_words > self.config.max_chunk_size
            {
                break;
            }
            carried += words;
            start -= 1;
        }
        start
    }

    /// Sliding window over `bounds`, cutting only between segments.
    fn window(&self, segments: &[Segment], bounds: Range<usize>) -> Vec<Range<usize>> {
        let config = &self.config;
        let mut spans = Vec::new();
        let mut start = bounds.start;
        let mut previous_end = bounds.start;

        while start < bounds.end {
            if segments[start].words > config.max_chunk_size {
                spans.push(start..start + 1);
                previous_end = start + 1;
                start += 1;
                continue;
            }

            let mut best: Option<(usize, usize)> = None;
            let mut best_paragraph: Option<(usize, usize)> = None;
            let mut total = 0;
            let mut end = start;

            while end < bounds.end && total + segments[end].words <= config.max_chunk_size {
                total += segments[end].words;
                end += 1;
                if end <= previous_end {
                    continue;
                }

                let distance = total.abs_diff(config.target_size);
                if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                    best = Some((end, distance));
                }
                let at_paragraph = segments[end - 1].paragraph_end;
                if at_paragraph
                    && distance <= config.boundary_tolerance
                    && best_paragraph.map_or(true, |(_, best_distance)| distance < best_distance)
                {
                    best_paragraph = Some((end, distance));
                }
            }

            let mut chosen = match best_paragraph.or(best) {
                Some((chosen, _)) => chosen,
                None => {
                    start = previous_end;
                    continue;
                }
            };

            if end == bounds.end && chosen < bounds.end {
                let tail: usize = segments[chosen..bounds.end].iter().map(|seg| seg.words).sum();
                if tail < config.min_chunk_size {
                    chosen = bounds.end;
                }
            }

            spans.push(start..chosen);
            if chosen == bounds.end {
                break;
            }

            previous_end = chosen;
            start = self.overlap_start(segments, start..chosen, bounds.end);
        }

        spans
    }

    fn overlap_start(&self, segments: &[Segment], span: Range<usize>, limit: usize) -> usize {
        let mut start = span.end;
        let mut carried = 0;
        while start > span.start + 1 && carried + segments[start - 1].words <= self.config.overlap {
            carried += segments[start - 1].words;
            start -= 1;
        }

        if start < span.end {
            let next = if span.end < limit {
                segments[span.end].words
            } else {
                0
            };
            if carried + next > self.config.max_chunk_size {
                return span.end;
            }
        }

        start
    }
}

fn validate_unit(text: &str, unit: &StructuralUnit) -> Result<(), ChunkingError> {
    let range = &unit.range;
    if range.start >= range.end || range.end > text.len() {
        return Err(ChunkingError::MalformedHints(format!(
            "unit range {range:?} is empty or outside a text of {} bytes",
            text.len()
        )));
    }
    if !text.is_char_boundary(range.start) || !text.is_char_boundary(range.end) {
        return Err(ChunkingError::MalformedHints(format!(
            "unit range {range:?} does not fall on character boundaries"
        )));
    }
    unit_structure(&unit.kind, &(0..1)).validate()
}

fn unit_structure(kind: &UnitKind, span: &Range<usize>) -> ChunkStructure {
    match kind {
        UnitKind::Page { number } => ChunkStructure::Page {
            page_number: *number,
        },
        UnitKind::Slide { number } => ChunkStructure::Slide {
            slide_number: *number,
        },
        UnitKind::Table { name } => ChunkStructure::Table {
            table_name: name.clone(),
            first_row: span.start as u32,
            row_count: span.len() as u32,
        },
        UnitKind::Section { heading } => ChunkStructure::Section {
            heading: heading.clone(),
        },
    }
}

fn draft(prepared: &PreparedText, span: Range<usize>, structure: ChunkStructure) -> ChunkDraft {
    let first = &prepared.segments[span.start];
    let last = &prepared.segments[span.end - 1];
    ChunkDraft {
        text: prepared.text[first.span.start..last.span.end].to_string(),
        start_offset: prepared.base_word + first.start_word,
        end_offset: prepared.base_word + last.start_word + last.words,
        structure,
    }
}

/// Second pass: identity, order and the sibling count of the finished set.
pub fn finalize_chunks(document_id: &str, drafts: Vec<ChunkDraft>) -> Vec<Chunk> {
    let total = drafts.len() as u32;
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| Chunk {
            chunk_id: make_chunk_id(document_id, draft.start_offset, draft.end_offset, &draft.text),
            document_id: document_id.to_string(),
            text: draft.text,
            start_offset: draft.start_offset,
            end_offset: draft.end_offset,
            structure: draft.structure,
            sequence_index: index as u32,
            sibling_count: total,
        })
        .collect()
}

pub fn make_chunk_id(document_id: &str, start: usize, end: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update((start as u64).to_le_bytes());
    hasher.update((end as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StructuralKind;

    fn sentence(label: &str, words: usize) -> String {
        let mut parts = vec![label.to_string()];
        parts.extend((1..words).map(|index| format!("w{index}")));
        format!("{}.", parts.join(" "))
    }

    fn paragraph(label: &str, sentences: usize, words: usize) -> String {
        (0..sentences)
            .map(|index| sentence(&format!("{label}s{index}"), words))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn config(target: usize, overlap: usize, min: usize, max: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_size: target,
            overlap,
            min_chunk_size: min,
            max_chunk_size: max,
            boundary_tolerance: 5,
            ..ChunkingConfig::default()
        }
    }

    fn overlap_words(left: &Chunk, right: &Chunk) -> usize {
        left.end_offset.saturating_sub(right.start_offset)
    }

    #[test]
    fn oversized_middle_paragraph_splits_into_two_at_sentence_boundary() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            paragraph("a", 2, 5),
            paragraph("b", 10, 10),
            paragraph("c", 2, 5)
        );
        let chunker = AdaptiveChunker::new(config(50, 10, 20, 60)).unwrap();
        let (chunks, fallback) = chunker.build_chunks("doc-1", &text, &StructuralHints::none());

        assert!(fallback.is_none());
        let middle: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| chunk.text.starts_with("bs") && !chunk.text.contains("cs"))
            .collect();
        assert_eq!(middle.len(), 2);
        for chunk in &middle {
            assert!(chunk.text.ends_with('.'));
            assert!(chunk.word_len() <= 60);
            assert!(!chunk.text.contains("as0") && !chunk.text.contains("cs0"));
        }
        assert!(middle[1].text.ends_with(&sentence("bs9", 10)));
        assert!(overlap_words(middle[0], middle[1]) <= 10);
    }

    #[test]
    fn paragraph_of_twice_the_maximum_splits_into_exactly_two() {
        let middle_paragraph = paragraph("b", 8, 10);
        let text = format!(
            "{}\n\n{}\n\n{}",
            paragraph("a", 2, 5),
            middle_paragraph,
            paragraph("c", 2, 5)
        );
        assert_eq!(count_words(&middle_paragraph), 80);
        let chunker = AdaptiveChunker::new(config(40, 0, 10, 40)).unwrap();
        let (chunks, fallback) = chunker.build_chunks("doc-1", &text, &StructuralHints::none());

        assert!(fallback.is_none());
        let middle: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| chunk.text.starts_with("bs"))
            .collect();
        assert_eq!(middle.len(), 2);
        for chunk in &middle {
            assert!(chunk.text.ends_with('.'));
            assert_eq!(chunk.word_len(), 40);
        }
        assert_eq!(middle[0].end_offset, middle[1].start_offset);
        assert_eq!(format!("{} {}", middle[0].text, middle[1].text), middle_paragraph);
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            paragraph("a", 4, 7),
            paragraph("b", 12, 9),
            paragraph("c", 3, 11)
        );
        let chunker = AdaptiveChunker::new(config(40, 8, 10, 55)).unwrap();
        let first = chunker.build_chunks("doc", &text, &StructuralHints::none()).0;
        let second = chunker.build_chunks("doc", &text, &StructuralHints::none()).0;
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn chunks_respect_size_overlap_and_monotonic_offsets() {
        let text = (0..6)
            .map(|index| paragraph(&format!("p{index}"), 3 + index, 6 + index))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunker = AdaptiveChunker::new(config(30, 6, 8, 40)).unwrap();
        let (chunks, _) = chunker.build_chunks("doc", &text, &StructuralHints::none());

        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(chunk.word_len() <= 40, "chunk too long: {}", chunk.word_len());
            assert_eq!(chunk.sibling_count as usize, chunks.len());
        }
        for pair in chunks.windows(2) {
            assert!(pair[0].start_offset < pair[1].start_offset);
            assert!(pair[0].end_offset <= pair[1].end_offset);
            let overlap = overlap_words(&pair[0], &pair[1]);
            assert!(overlap <= 6);
            assert!(overlap < pair[0].word_len());
            assert_eq!(pair[0].sequence_index + 1, pair[1].sequence_index);
        }
        assert_eq!(chunks.last().map(|chunk| chunk.end_offset), Some(count_words(&text)));
    }

    #[test]
    fn small_paragraphs_are_grouped_not_dropped() {
        let text = "Tiny one.\n\nTiny two.\n\nTiny three.";
        let chunker = AdaptiveChunker::new(config(50, 0, 10, 60)).unwrap();
        let (chunks, _) = chunker.build_chunks("doc", text, &StructuralHints::none());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(
            chunks[0].structure,
            ChunkStructure::Paragraph {
                first_paragraph: 0,
                paragraph_count: 3
            }
        );
    }

    #[test]
    fn single_sentence_longer_than_max_is_kept_whole() {
        let long = (0..80).map(|index| format!("w{index}")).collect::<Vec<_>>().join(" ");
        let text = format!("Short intro here. {long}. Tail sentence here.");
        let chunker = AdaptiveChunker::new(config(20, 0, 2, 30)).unwrap();
        let (chunks, _) = chunker.build_chunks("doc", &text, &StructuralHints::none());

        let oversized: Vec<&Chunk> = chunks.iter().filter(|chunk| chunk.word_len() > 30).collect();
        assert_eq!(oversized.len(), 1);
        assert_eq!(oversized[0].word_len(), 80);
        let total: usize = chunks.iter().map(|chunk| chunk.word_len()).sum();
        assert_eq!(total, count_words(&text));
    }

    #[test]
    fn page_units_are_chunked_independently() {
        let page_one = "Launch checklist. Fuel is loaded.";
        let page_two = "Telemetry review. Range is clear.";
        let text = format!("{page_one}\u{000c}{page_two}");
        let hints = StructuralHints {
            units: vec![
                StructuralUnit {
                    kind: UnitKind::Page { number: 1 },
                    range: 0..page_one.len(),
                },
                StructuralUnit {
                    kind: UnitKind::Page { number: 2 },
                    range: page_one.len() + '\u{000c}'.len_utf8()..text.len(),
                },
            ],
        };
        let chunker =
            AdaptiveChunker::new(config(50, 0, 1, 60).with_strategy(ChunkStrategy::Page)).unwrap();
        let (chunks, fallback) = chunker.build_chunks("doc", &text, &hints);

        assert!(fallback.is_none());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].structure, ChunkStructure::Page { page_number: 1 });
        assert_eq!(chunks[1].structure, ChunkStructure::Page { page_number: 2 });
        assert_eq!(chunks[1].start_offset, 5);
        assert_eq!(chunks[1].text, page_two);
    }

    #[test]
    fn table_units_split_on_rows() {
        let rows = (0..12)
            .map(|index| format!("row{index} a b c d"))
            .collect::<Vec<_>>()
            .join("\n");
        let hints = StructuralHints {
            units: vec![StructuralUnit {
                kind: UnitKind::Table {
                    name: "Inventory".to_string(),
                },
                range: 0..rows.len(),
            }],
        };
        let chunker =
            AdaptiveChunker::new(config(20, 0, 5, 30).with_strategy(ChunkStrategy::Table)).unwrap();
        let (chunks, _) = chunker.build_chunks("doc", &rows, &hints);

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.structural_kind(), StructuralKind::Table);
            assert!(chunk.text.starts_with("row"));
        }
        assert_eq!(
            chunks[1].structure,
            ChunkStructure::Table {
                table_name: "Inventory".to_string(),
                first_row: 4,
                row_count: 4
            }
        );
    }

    #[test]
    fn malformed_hints_fall_back_to_paragraphs() {
        let text = "First paragraph.\n\nSecond paragraph.";
        let hints = StructuralHints {
            units: vec![StructuralUnit {
                kind: UnitKind::Slide { number: 1 },
                range: 0..text.len() + 10,
            }],
        };
        let chunker =
            AdaptiveChunker::new(config(50, 0, 1, 60).with_strategy(ChunkStrategy::Slide)).unwrap();
        let (chunks, fallback) = chunker.build_chunks("doc", text, &hints);

        assert!(matches!(fallback, Some(ChunkingError::MalformedHints(_))));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].structural_kind(), StructuralKind::Paragraph);
    }

    #[test]
    fn text_outside_units_is_still_chunked() {
        let text = "Intro words here.\n\nSlide body text.";
        let start = text.find("Slide").unwrap();
        let hints = StructuralHints {
            units: vec![StructuralUnit {
                kind: UnitKind::Slide { number: 1 },
                range: start..text.len(),
            }],
        };
        let chunker =
            AdaptiveChunker::new(config(50, 0, 1, 60).with_strategy(ChunkStrategy::Slide)).unwrap();
        let (chunks, _) = chunker.build_chunks("doc", text, &hints);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].structural_kind(), StructuralKind::Paragraph);
        assert_eq!(chunks[1].structure, ChunkStructure::Slide { slide_number: 1 });
        assert_eq!(chunks[1].start_offset, 3);
    }

    #[test]
    fn chunk_ids_are_content_stable() {
        let text = paragraph("x", 6, 8);
        let chunker = AdaptiveChunker::new(config(20, 4, 5, 30)).unwrap();
        let first = chunker.build_chunks("doc", &text, &StructuralHints::none()).0;
        let again = chunker.build_chunks("doc", &text, &StructuralHints::none()).0;
        let other = chunker.build_chunks("other", &text, &StructuralHints::none()).0;
        assert_eq!(first[0].chunk_id, again[0].chunk_id);
        assert_ne!(first[0].chunk_id, other[0].chunk_id);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(AdaptiveChunker::new(config(50, 50, 10, 60)).is_err());
        assert!(AdaptiveChunker::new(config(70, 5, 10, 60)).is_err());
        let bad_pattern = ChunkingConfig {
            sentence_boundary: "([".to_string(),
            ..ChunkingConfig::default()
        };
        assert!(chunk("text", &StructuralHints::none(), &bad_pattern).is_err());
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        let plan = chunk("  \n\n ", &StructuralHints::none(), &ChunkingConfig::default()).unwrap();
        assert!(plan.drafts.is_empty());
    }
}
