use crate::error::{IngestError, Result};
use crate::keyword_index::KeywordHit;
use crate::models::{Chunk, Document, QueryResult, RawScores};
use crate::normalize::fold_term;
use crate::vector_index::VectorHit;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FusionMethod {
    /// `w_v * v + w_k * k` over min-max normalized scores.
    #[default]
    WeightedSum,
    /// `w_v / (k + rank_v) + w_k / (k + rank_k)`.
    ReciprocalRank { k: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub method: FusionMethod,
    /// Upper bound on the characters of a result's context window.
    pub context_chars: usize,
    /// A result whose document title holds every query term has its fused
    /// score multiplied by `1 + title_boost`; partial matches earn a share.
    pub title_boost: f64,
    /// Candidates without any keyword match are dropped when their raw vector
    /// similarity is below this.
    pub min_similarity: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            keyword_weight: 0.5,
            method: FusionMethod::WeightedSum,
            context_chars: 300,
            title_boost: 0.5,
            min_similarity: 0.15,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        let weights_ok = [self.vector_weight, self.keyword_weight]
            .iter()
            .all(|weight| weight.is_finite() && *weight >= 0.0);
        if !weights_ok || self.vector_weight + self.keyword_weight <= 0.0 {
            return Err(IngestError::InvalidConfig(
                "fusion weights must be non-negative and not both zero".to_string(),
            ));
        }
        if !self.title_boost.is_finite() || self.title_boost < 0.0 {
            return Err(IngestError::InvalidConfig(
                "fusion.title_boost must be a non-negative number".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(IngestError::InvalidConfig(
                "fusion.min_similarity must be in -1..=1".to_string(),
            ));
        }
        if let FusionMethod::ReciprocalRank { k } = self.method {
            if !k.is_finite() || k < 0.0 {
                return Err(IngestError::InvalidConfig(
                    "fusion reciprocal rank k must be non-negative".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Candidate<'a> {
    vector: Option<(f64, f32, usize)>,
    keyword: Option<(f64, f64, usize, &'a KeywordHit)>,
}

#[derive(Debug, Clone, Default)]
pub struct HybridRanker {
    config: FusionConfig,
}

impl HybridRanker {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Merges both candidate lists into one ranking of at most `top_k`
    /// results. Candidates `lookup` cannot resolve are skipped.
    pub fn fuse<'a, F>(
        &self,
        vector_hits: &[VectorHit],
        keyword_hits: &'a [KeywordHit],
        lookup: F,
        top_k: usize,
    ) -> Vec<QueryResult>
    where
        F: Fn(&str) -> Option<(&'a Chunk, &'a Document)>,
    {
        self.fuse_for_query(&[], vector_hits, keyword_hits, lookup, top_k)
    }

    /// [`HybridRanker::fuse`] with the folded query terms at hand, so titles
    /// that name them can lift their results.
    pub fn fuse_for_query<'a, F>(
        &self,
        query_terms: &[String],
        vector_hits: &[VectorHit],
        keyword_hits: &'a [KeywordHit],
        lookup: F,
        top_k: usize,
    ) -> Vec<QueryResult>
    where
        F: Fn(&str) -> Option<(&'a Chunk, &'a Document)>,
    {
        let vector_scale = MinMax::over(vector_hits.iter().map(|hit| hit.score as f64));
        let keyword_scale = MinMax::over(keyword_hits.iter().map(|hit| hit.score));

        let mut candidates: BTreeMap<&str, Candidate<'a>> = BTreeMap::new();
        for (rank, hit) in vector_hits.iter().enumerate() {
            candidates.entry(hit.chunk_id.as_str()).or_default().vector =
                Some((vector_scale.apply(hit.score as f64), hit.score, rank + 1));
        }
        for (rank, hit) in keyword_hits.iter().enumerate() {
            candidates.entry(hit.chunk_id.as_str()).or_default().keyword =
                Some((keyword_scale.apply(hit.score), hit.score, rank + 1, hit));
        }

        let mut ranked: Vec<(QueryResult, &'a Chunk)> = candidates
            .into_iter()
            .filter(|(_, candidate)| {
                candidate.keyword.is_some()
                    || candidate
                        .vector
                        .is_some_and(|(_, raw, _)| raw >= self.config.min_similarity)
            })
            .filter_map(|(chunk_id, candidate)| {
                let (chunk, document) = lookup(chunk_id)?;
                let mut result = self.result(chunk, document, &candidate);
                result.fused_score *=
                    1.0 + self.config.title_boost * title_match(&document.title, query_terms);
                Some((result, chunk))
            })
            .collect();

        ranked.sort_by(|(left, _), (right, _)| result_order(left, right));
        ranked.truncate(top_k);

        ranked
            .into_iter()
            .map(|(mut result, chunk)| {
                result.context_window =
                    context_window(&chunk.text, &result.matched_terms, self.config.context_chars);
                result
            })
            .collect()
    }

    fn result(&self, chunk: &Chunk, document: &Document, candidate: &Candidate<'_>) -> QueryResult {
        let vector_score = candidate.vector.map_or(0.0, |(normalized, _, _)| normalized);
        let keyword_score = candidate
            .keyword
            .map_or(0.0, |(normalized, _, _, _)| normalized);

        let fused_score = match self.config.method {
            FusionMethod::WeightedSum => {
                self.config.vector_weight * vector_score + self.config.keyword_weight * keyword_score
            }
            FusionMethod::ReciprocalRank { k } => {
                let vector = candidate
                    .vector
                    .map_or(0.0, |(_, _, rank)| 1.0 / (k + rank as f64));
                let keyword = candidate
                    .keyword
                    .map_or(0.0, |(_, _, rank, _)| 1.0 / (k + rank as f64));
                self.config.vector_weight * vector + self.config.keyword_weight * keyword
            }
        };

        QueryResult {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            source_path: document.source_path.clone(),
            file_type: document.file_type,
            sequence_index: chunk.sequence_index,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
            structure: chunk.structure.clone(),
            vector_score,
            keyword_score,
            fused_score,
            raw: RawScores {
                vector: candidate.vector.map(|(_, raw, _)| raw),
                keyword: candidate.keyword.map(|(_, raw, _, _)| raw),
            },
            matched_terms: candidate
                .keyword
                .map(|(_, _, _, hit)| hit.matched_terms.clone())
                .unwrap_or_default(),
            context_window: String::new(),
        }
    }
}

/// Share of the distinct query terms found among the title's words.
fn title_match(title: &str, query_terms: &[String]) -> f64 {
    let distinct: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    if distinct.is_empty() {
        return 0.0;
    }
    let words: HashSet<String> = title
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(fold_term)
        .collect();
    let found = distinct.iter().filter(|term| words.contains(**term)).count();
    found as f64 / distinct.len() as f64
}

fn result_order(left: &QueryResult, right: &QueryResult) -> Ordering {
    right
        .fused_score
        .total_cmp(&left.fused_score)
        .then_with(|| right.vector_score.total_cmp(&left.vector_score))
        .then_with(|| left.sequence_index.cmp(&right.sequence_index))
        .then_with(|| left.chunk_id.cmp(&right.chunk_id))
}

#[derive(Debug, Clone, Copy)]
struct MinMax {
    min: f64,
    max: f64,
}

impl MinMax {
    fn over(scores: impl Iterator<Item = f64>) -> Self {
        scores.fold(
            Self {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |scale, score| Self {
                min: scale.min.min(score),
                max: scale.max.max(score),
            },
        )
    }

    /// An all-equal candidate set maps to 1.0.
    fn apply(&self, score: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON {
            1.0
        } else {
            (score - self.min) / span
        }
    }
}

/// Up to `max_chars` characters of whole words from `text`, positioned over
/// the densest run of matched terms and marked with ellipses where cut.
pub fn context_window(text: &str, matched_terms: &[String], max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let terms: HashSet<&str> = matched_terms.iter().map(String::as_str).collect();
    let words: Vec<(usize, &str)> = text
        .split_whitespace()
        .map(|word| {
            let offset = word.as_ptr() as usize - text.as_ptr() as usize;
            (offset, word)
        })
        .collect();
    let hits: Vec<bool> = words
        .iter()
        .map(|(_, word)| {
            word.split(|ch: char| !ch.is_alphanumeric())
                .filter(|part| !part.is_empty())
                .any(|part| terms.contains(fold_term(part).as_str()))
        })
        .collect();

    let mut best = (0usize, 0usize, 0usize);
    for start in 0..words.len() {
        let (end, matches) = extend(&words, &hits, start, max_chars);
        if matches > best.2 {
            best = (start, end, matches);
        }
        if end == words.len() {
            break;
        }
    }
    if best.2 == 0 {
        let (end, _) = extend(&words, &hits, 0, max_chars);
        best = (0, end, 0);
    }

    let (start, end, _) = best;
    if end <= start {
        let head: String = text.chars().take(max_chars).collect();
        return format!("{head}...");
    }
    let from = words[start].0;
    let to = words[end - 1].0 + words[end - 1].1.len();
    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(&text[from..to]);
    if end < words.len() {
        snippet.push_str("...");
    }
    snippet
}

fn extend(words: &[(usize, &str)], hits: &[bool], start: usize, max_chars: usize) -> (usize, usize) {
    let mut used = 0;
    let mut matches = 0;
    let mut end = start;
    while end < words.len() {
        let cost = words[end].1.chars().count() + usize::from(end > start);
        if used + cost > max_chars {
            break;
        }
        used += cost;
        matches += usize::from(hits[end]);
        end += 1;
    }
    (end, matches)
}
