use crate::error::{IngestError, Result, StoreError};
use crate::normalize::{fold_term, StopwordPolicy, Token, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordConfig {
    /// Matched terms at most this many words apart earn the proximity bonus.
    pub proximity_window: u32,
    pub proximity_boost: f64,
    pub stopwords: StopwordPolicy,
    pub min_token_chars: usize,
    /// Query vocabulary: an abbreviation or term mapped to the phrases it also
    /// stands for, e.g. `"iha" -> ["insansız hava aracı"]`.
    pub expansions: BTreeMap<String, Vec<String>>,
    /// Score weight of terms added by `expansions`, relative to typed terms.
    pub expansion_weight: f64,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            proximity_window: 5,
            proximity_boost: 0.5,
            stopwords: StopwordPolicy::Default,
            min_token_chars: 2,
            expansions: BTreeMap::new(),
            expansion_weight: 0.5,
        }
    }
}

impl KeywordConfig {
    pub fn validate(&self) -> Result<()> {
        if self.proximity_window == 0 {
            return Err(IngestError::InvalidConfig(
                "keyword.proximity_window must be positive".to_string(),
            ));
        }
        if !self.proximity_boost.is_finite() || self.proximity_boost < 0.0 {
            return Err(IngestError::InvalidConfig(
                "keyword.proximity_boost must be a non-negative number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.expansion_weight) {
            return Err(IngestError::InvalidConfig(
                "keyword.expansion_weight must be in 0..=1".to_string(),
            ));
        }
        if let Some(term) = self.expansions.keys().find(|term| term.trim().is_empty()) {
            return Err(IngestError::InvalidConfig(format!(
                "keyword.expansions has an empty key {term:?}"
            )));
        }
        Ok(())
    }

    /// Folded lookup table: typed term to the extra terms it brings in.
    fn expansion_table(&self, tokenizer: &Tokenizer) -> HashMap<String, Vec<String>> {
        let mut table: HashMap<String, Vec<String>> = HashMap::new();
        for (term, phrases) in &self.expansions {
            let extra = table.entry(fold_term(term.trim())).or_default();
            for token in phrases.iter().flat_map(|phrase| tokenizer.tokenize(phrase)) {
                if !extra.contains(&token.term) {
                    extra.push(token.term);
                }
            }
        }
        table
    }

    pub fn tokenizer(&self) -> Tokenizer {
        Tokenizer::new(self.stopwords.clone(), self.min_token_chars)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Posting {
    pub chunk_id: String,
    pub term_frequency: u32,
    pub positions: Vec<u32>,
}

/// Serialized form: postings per term and token counts per chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordParts {
    pub postings: BTreeMap<String, Vec<Posting>>,
    pub chunk_lengths: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
    /// Every query token found at the query's relative positions.
    pub phrase: bool,
}

#[derive(Debug, Clone)]
pub struct KeywordIndex {
    config: KeywordConfig,
    tokenizer: Tokenizer,
    expansions: HashMap<String, Vec<String>>,
    postings: HashMap<String, Vec<Posting>>,
    chunk_lengths: HashMap<String, u32>,
    chunk_terms: HashMap<String, Vec<String>>,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new(KeywordConfig::default())
    }
}

impl KeywordIndex {
    pub fn new(config: KeywordConfig) -> Self {
        let tokenizer = config.tokenizer();
        Self {
            expansions: config.expansion_table(&tokenizer),
            tokenizer,
            config,
            postings: HashMap::new(),
            chunk_lengths: HashMap::new(),
            chunk_terms: HashMap::new(),
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &KeywordConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.chunk_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_lengths.is_empty()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunk_lengths.contains_key(chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.chunk_lengths.keys().map(String::as_str)
    }

    pub fn add_text(&mut self, chunk_id: &str, text: &str) {
        let tokens = self.tokenizer.tokenize(text);
        self.add(chunk_id, &tokens);
    }

    /// Indexes `tokens` for `chunk_id`, replacing any earlier contribution.
    pub fn add(&mut self, chunk_id: &str, tokens: &[Token]) {
        self.remove(chunk_id);

        let mut grouped: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for token in tokens {
            grouped.entry(token.term.as_str()).or_default().push(token.position);
        }

        let mut terms = Vec::with_capacity(grouped.len());
        for (term, mut positions) in grouped {
            positions.sort_unstable();
            self.postings
                .entry(term.to_string())
                .or_default()
                .push(Posting {
                    chunk_id: chunk_id.to_string(),
                    term_frequency: positions.len() as u32,
                    positions,
                });
            terms.push(term.to_string());
        }

        self.chunk_lengths
            .insert(chunk_id.to_string(), tokens.len() as u32);
        self.chunk_terms.insert(chunk_id.to_string(), terms);
    }

    pub fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(terms) = self.chunk_terms.remove(chunk_id) else {
            return false;
        };
        for term in terms {
            if let Some(postings) = self.postings.get_mut(&term) {
                postings.retain(|posting| posting.chunk_id != chunk_id);
                if postings.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        self.chunk_lengths.remove(chunk_id);
        true
    }

    pub fn search_text(&self, query: &str) -> Vec<KeywordHit> {
        let tokens = self.tokenizer.tokenize(query);
        self.search(&tokens)
    }

    /// Scores every chunk containing at least one query term or one of its
    /// configured expansions. Exact phrase matches of the typed terms rank
    /// above all other hits; the rest order by score, then id.
    pub fn search(&self, query: &[Token]) -> Vec<KeywordHit> {
        self.search_filtered(query, |_| true)
    }

    pub fn search_filtered<F>(&self, query: &[Token], keep: F) -> Vec<KeywordHit>
    where
        F: Fn(&str) -> bool,
    {
        let mut distinct: Vec<&str> = Vec::new();
        for token in query {
            if !distinct.contains(&token.term.as_str()) {
                distinct.push(token.term.as_str());
            }
        }
        let typed = distinct.len();
        for term in distinct[..typed].to_vec() {
            for extra in self.expansions.get(term).into_iter().flatten() {
                if !distinct.contains(&extra.as_str()) {
                    distinct.push(extra.as_str());
                }
            }
        }

        let total_chunks = self.chunk_lengths.len() as f64;
        let mut accumulated: HashMap<&str, Accumulator<'_>> = HashMap::new();

        for (term_index, term) in distinct.iter().enumerate() {
            let Some(postings) = self.postings.get(*term) else {
                continue;
            };
            let weight = if term_index < typed {
                1.0
            } else {
                self.config.expansion_weight
            };
            let idf = (1.0 + total_chunks / postings.len() as f64).ln() * weight;
            for posting in postings {
                if !keep(&posting.chunk_id) {
                    continue;
                }
                let length = self
                    .chunk_lengths
                    .get(&posting.chunk_id)
                    .copied()
                    .unwrap_or(posting.term_frequency)
                    .max(1) as f64;
                let entry = accumulated.entry(posting.chunk_id.as_str()).or_default();
                entry.score += posting.term_frequency as f64 / length * idf;
                entry.matched.push((term_index, &posting.positions));
            }
        }

        let mut hits: Vec<KeywordHit> = accumulated
            .into_iter()
            .map(|(chunk_id, entry)| {
                let mut score = entry.score;
                if let Some(distance) = closest_pair(&entry.matched) {
                    let window = self.config.proximity_window;
                    if distance <= window {
                        let closeness = (window - distance + 1) as f64 / window as f64;
                        score *= 1.0 + self.config.proximity_boost * closeness;
                    }
                }
                let phrase = is_phrase(query, &distinct[..typed], &entry.matched);
                let mut matched_terms: Vec<String> = entry
                    .matched
                    .iter()
                    .map(|(term_index, _)| distinct[*term_index].to_string())
                    .collect();
                matched_terms.sort();
                KeywordHit {
                    chunk_id: chunk_id.to_string(),
                    score,
                    matched_terms,
                    phrase,
                }
            })
            .collect();

        let ceiling = hits
            .iter()
            .filter(|hit| !hit.phrase)
            .map(|hit| hit.score)
            .fold(0.0, f64::max);
        for hit in hits.iter_mut().filter(|hit| hit.phrase) {
            hit.score += ceiling + 1.0;
        }

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits
    }

    pub fn to_parts(&self) -> KeywordParts {
        let postings = self
            .postings
            .iter()
            .map(|(term, postings)| {
                let mut postings = postings.clone();
                postings.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));
                (term.clone(), postings)
            })
            .collect();
        let chunk_lengths = self
            .chunk_lengths
            .iter()
            .map(|(chunk_id, length)| (chunk_id.clone(), *length))
            .collect();
        KeywordParts {
            postings,
            chunk_lengths,
        }
    }

    /// Rebuilds an index from persisted parts, rejecting postings that do not
    /// agree with the chunk table.
    pub fn from_parts(
        config: KeywordConfig,
        parts: KeywordParts,
    ) -> std::result::Result<Self, StoreError> {
        let mut index = Self::new(config);
        let mut token_totals: HashMap<&str, u32> = HashMap::new();

        for (term, postings) in &parts.postings {
            if postings.is_empty() {
                return Err(StoreError::Corruption(format!(
                    "term {term:?} has no postings"
                )));
            }
            let mut seen = HashSet::new();
            for posting in postings {
                if !parts.chunk_lengths.contains_key(&posting.chunk_id) {
                    return Err(StoreError::Corruption(format!(
                        "term {term:?} points at unknown chunk {}",
                        posting.chunk_id
                    )));
                }
                if !seen.insert(posting.chunk_id.as_str()) {
                    return Err(StoreError::Corruption(format!(
                        "term {term:?} lists chunk {} twice",
                        posting.chunk_id
                    )));
                }
                if posting.term_frequency == 0
                    || posting.term_frequency as usize != posting.positions.len()
                    || posting.positions.windows(2).any(|pair| pair[0] > pair[1])
                {
                    return Err(StoreError::Corruption(format!(
                        "posting for {term:?} in chunk {} is inconsistent",
                        posting.chunk_id
                    )));
                }
                *token_totals.entry(posting.chunk_id.as_str()).or_default() += posting.term_frequency;
                index
                    .chunk_terms
                    .entry(posting.chunk_id.clone())
                    .or_default()
                    .push(term.clone());
            }
        }

        for (chunk_id, length) in &parts.chunk_lengths {
            let counted = token_totals.get(chunk_id.as_str()).copied().unwrap_or(0);
            if counted != *length {
                return Err(StoreError::Corruption(format!(
                    "chunk {chunk_id} records {length} tokens but postings hold {counted}"
                )));
            }
            index.chunk_terms.entry(chunk_id.clone()).or_default();
        }

        index.postings = parts.postings.into_iter().collect();
        index.chunk_lengths = parts.chunk_lengths.into_iter().collect();
        Ok(index)
    }
}

#[derive(Default)]
struct Accumulator<'a> {
    score: f64,
    matched: Vec<(usize, &'a Vec<u32>)>,
}

/// Smallest distance between occurrences of two different matched terms.
fn closest_pair(matched: &[(usize, &Vec<u32>)]) -> Option<u32> {
    if matched.len() < 2 {
        return None;
    }
    let mut merged: Vec<(u32, usize)> = matched
        .iter()
        .flat_map(|(term, positions)| positions.iter().map(move |position| (*position, *term)))
        .collect();
    merged.sort_unstable();
    merged
        .windows(2)
        .filter(|pair| pair[0].1 != pair[1].1)
        .map(|pair| pair[1].0 - pair[0].0)
        .min()
}

/// `typed` holds the query's own distinct terms; expansion matches beyond
/// them never count towards a phrase.
fn is_phrase(query: &[Token], typed: &[&str], matched: &[(usize, &Vec<u32>)]) -> bool {
    let typed_matches = matched
        .iter()
        .filter(|(term_index, _)| *term_index < typed.len())
        .count();
    if query.len() < 2 || typed_matches != typed.len() {
        return false;
    }
    let positions_of = |term: &str| {
        typed
            .iter()
            .position(|candidate| *candidate == term)
            .and_then(|index| matched.iter().find(|(term_index, _)| *term_index == index))
            .map(|(_, positions)| *positions)
    };

    let first = &query[0];
    let Some(anchors) = positions_of(&first.term) else {
        return false;
    };
    anchors.iter().any(|anchor| {
        query.iter().all(|token| {
            let expected = anchor + (token.position - first.position);
            positions_of(&token.term)
                .map_or(false, |positions| positions.binary_search(&expected).is_ok())
        })
    })
}
