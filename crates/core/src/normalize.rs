//! Text cleanup, segmentation and term folding shared by the chunker and the
//! keyword index.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

/// Sentence terminator, optional closing punctuation, then whitespace.
pub const DEFAULT_SENTENCE_BOUNDARY: &str = r#"[.!?…]+["'”’»)\]]*\s+"#;

/// Folded Turkish and English function words, sorted for binary search.
const DEFAULT_STOPWORDS: [&str; 220] = [
    "about", "above", "acaba", "after", "again", "all", "also", "am", "ama", "an", "ancak",
    "and", "any", "are", "artik", "as", "at", "ayrica", "az", "bazi", "be", "because", "been",
    "before", "being", "belki", "ben", "beni", "benim", "between", "bile", "bir", "bircok",
    "biri", "birkac", "birsey", "biz", "bize", "bizim", "both", "boyle", "bu", "buna", "bunda",
    "bundan", "bunu", "bunun", "burada", "but", "by", "can", "cogu", "cok", "could", "cunku",
    "da", "daha", "de", "defa", "did", "diger", "diye", "do", "does", "doing", "dolayi", "down",
    "during", "each", "eger", "en", "fakat", "fazla", "few", "for", "from", "further", "gibi",
    "gore", "had", "hala", "halen", "hangi", "has", "hatta", "have", "having", "he", "hem",
    "hep", "hepsi", "her", "here", "hers", "hic", "him", "his", "how", "icin", "icinde", "if",
    "iki", "ile", "in", "into", "is", "ise", "iste", "it", "its", "itself", "just", "kadar",
    "kez", "ki", "kim", "kimi", "me", "mi", "more", "most", "mu", "my", "nasil", "ne", "neden",
    "nedenle", "nerede", "nereye", "nicin", "niye", "no", "nor", "not", "now", "of", "off",
    "olan", "olarak", "oldu", "oldugu", "olmak", "olsa", "olup", "olur", "on", "ona", "once",
    "onlar", "only", "onu", "onun", "or", "other", "our", "ours", "out", "over", "own",
    "sadece", "same", "sanki", "sey", "she", "should", "simdi", "siz", "sizin", "so", "some",
    "sonra", "soyle", "su", "such", "sunu", "tarafindan", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "too", "tum", "uc",
    "under", "until", "up", "uzere", "uzerinde", "ve", "very", "veya", "was", "we", "were",
    "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would",
    "ya", "yada", "yani", "yine", "you", "your", "zaten",
];

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cleans extracted text while keeping its layout signal: lines stay lines,
/// any run of blank lines becomes a single paragraph break. Only whitespace is
/// rewritten, so the word sequence is unchanged.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut paragraphs = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in unified.lines() {
        let cleaned = normalize_whitespace(line);
        if cleaned.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(cleaned);
        }
    }

    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs.join("\n\n")
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte ranges of the paragraphs of an already normalized text.
pub fn split_paragraphs(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;

    for (index, separator) in text.match_indices("\n\n") {
        push_trimmed(text, start..index, &mut ranges);
        start = index + separator.len();
    }
    push_trimmed(text, start..text.len(), &mut ranges);

    ranges
}

/// Byte ranges of the non-empty lines inside `range`; table rows are lines.
pub fn split_lines(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = range.start;

    for (offset, _) in text[range.clone()].match_indices('\n') {
        let index = range.start + offset;
        push_trimmed(text, start..index, &mut ranges);
        start = index + 1;
    }
    push_trimmed(text, start..range.end, &mut ranges);

    ranges
}

fn push_trimmed(text: &str, range: Range<usize>, out: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed_len = slice.trim().len();
    if trimmed_len > 0 {
        let start = range.start + leading;
        out.push(start..start + trimmed_len);
    }
}

/// Splits paragraphs into sentences with a configurable boundary pattern.
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    boundary: Regex,
}

impl SentenceSplitter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            boundary: Regex::new(pattern)?,
        })
    }

    pub fn split(&self, text: &str, range: Range<usize>) -> Vec<Range<usize>> {
        let mut sentences = Vec::new();
        let mut start = range.start;

        for found in self.boundary.find_iter(&text[range.clone()]) {
            let terminator_len = found.as_str().trim_end().len();
            let end = range.start + found.start() + terminator_len;
            push_trimmed(text, start..end, &mut sentences);
            start = range.start + found.end();
        }
        push_trimmed(text, start..range.end, &mut sentences);

        sentences
    }
}

/// Lowercases and strips diacritics so `Fırlatma`, `FIRLATMA` and `firlatma`
/// collide on the same term.
pub fn fold_term(word: &str) -> String {
    let mut folded = String::with_capacity(word.len());
    for ch in word.chars() {
        for lower in ch.to_lowercase() {
            if is_combining_mark(lower) {
                continue;
            }
            folded.push(fold_char(lower));
        }
    }
    folded
}

fn is_combining_mark(ch: char) -> bool {
    ('\u{0300}'..='\u{036f}').contains(&ch)
}

fn fold_char(ch: char) -> char {
    match ch {
        'ç' | 'ć' | 'č' => 'c',
        'ğ' => 'g',
        'ı' | 'í' | 'ì' | 'î' | 'ï' => 'i',
        'ö' | 'ó' | 'ò' | 'ô' | 'õ' | 'ø' => 'o',
        'ş' | 'ś' | 'š' => 's',
        'ü' | 'ú' | 'ù' | 'û' => 'u',
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        'ž' | 'ź' | 'ż' => 'z',
        other => other,
    }
}

/// Which folded terms never reach the keyword index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "words")]
pub enum StopwordPolicy {
    None,
    #[default]
    Default,
    Custom(BTreeSet<String>),
}

impl StopwordPolicy {
    pub fn is_stopword(&self, term: &str) -> bool {
        match self {
            StopwordPolicy::None => false,
            StopwordPolicy::Default => DEFAULT_STOPWORDS.binary_search(&term).is_ok(),
            StopwordPolicy::Custom(words) => words.contains(term),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub term: String,
    /// Position among all lexical tokens of the text, filtered ones included.
    pub position: u32,
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    stopwords: StopwordPolicy,
    min_token_chars: usize,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(StopwordPolicy::Default, 2)
    }
}

impl Tokenizer {
    pub fn new(stopwords: StopwordPolicy, min_token_chars: usize) -> Self {
        let stopwords = match stopwords {
            StopwordPolicy::Custom(words) => {
                StopwordPolicy::Custom(words.iter().map(|word| fold_term(word)).collect())
            }
            other => other,
        };
        Self {
            stopwords,
            min_token_chars,
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        text.split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .enumerate()
            .filter_map(|(position, word)| {
                let term = fold_term(word);
                let long_enough = term.chars().count() >= self.min_token_chars;
                if long_enough && !self.stopwords.is_stopword(&term) {
                    Some(Token {
                        term,
                        position: position as u32,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Folded, whitespace-collapsed form used for cache signatures.
    pub fn canonical_query(&self, text: &str) -> String {
        normalize_whitespace(&fold_term(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn normalize_text_keeps_paragraph_breaks_and_words() {
        let raw = "First  line\r\nsecond\tline\r\n\r\n\r\n  Next\u{a0}para  \n\n\n";
        let normalized = normalize_text(raw);
        assert_eq!(normalized, "First line\nsecond line\n\nNext para");
        assert_eq!(count_words(raw), count_words(&normalized));
    }

    #[test]
    fn paragraphs_and_lines_are_split_by_byte_ranges() {
        let text = "one two\nthree\n\nfour";
        let paragraphs = split_paragraphs(text);
        assert_eq!(paragraphs.len(), 2);
        assert_eq!(&text[paragraphs[0].clone()], "one two\nthree");
        assert_eq!(&text[paragraphs[1].clone()], "four");

        let lines = split_lines(text, paragraphs[0].clone());
        assert_eq!(lines.len(), 2);
        assert_eq!(&text[lines[1].clone()], "three");
    }

    #[test]
    fn sentences_end_at_terminators_followed_by_space() {
        let splitter = SentenceSplitter::new(DEFAULT_SENTENCE_BOUNDARY).unwrap();
        let text = "Pressure is 3.5 bar. Is it safe? \"Yes!\" he said";
        let sentences = splitter.split(text, 0..text.len());
        let parts: Vec<&str> = sentences.iter().map(|range| &text[range.clone()]).collect();
        assert_eq!(
            parts,
            vec!["Pressure is 3.5 bar.", "Is it safe?", "\"Yes!\"", "he said"]
        );
    }

    #[test]
    fn folding_handles_turkish_letters() {
        assert_eq!(fold_term("Fırlatma"), "firlatma");
        assert_eq!(fold_term("FIRLATMA"), "firlatma");
        assert_eq!(fold_term("İçerik"), "icerik");
        assert_eq!(fold_term("Şüphe"), "suphe");
        assert_eq!(fold_term("café"), "cafe");
    }

    #[test]
    fn tokenizer_keeps_original_positions_around_stopwords() {
        let tokenizer = Tokenizer::default();
        let tokens = tokenizer.tokenize("Roket ve fırlatma, a test");
        let terms: Vec<(&str, u32)> = tokens
            .iter()
            .map(|token| (token.term.as_str(), token.position))
            .collect();
        assert_eq!(terms, vec![("roket", 0), ("firlatma", 2), ("test", 4)]);
    }

    #[test]
    fn default_stopwords_are_sorted_and_folded() {
        assert!(DEFAULT_STOPWORDS.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(DEFAULT_STOPWORDS.iter().all(|word| fold_term(word) == *word));

        let tokens = Tokenizer::default().tokenize("Nasıl çünkü because the valve şöyle sızdırıyor");
        let terms: Vec<&str> = tokens.iter().map(|token| token.term.as_str()).collect();
        assert_eq!(terms, vec!["valve", "sizdiriyor"]);
    }

    #[test]
    fn custom_stopwords_are_folded() {
        let words = ["İçin".to_string()].into_iter().collect();
        let tokenizer = Tokenizer::new(StopwordPolicy::Custom(words), 1);
        let tokens = tokenizer.tokenize("için rapor");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].term, "rapor");
    }

    #[test]
    fn canonical_query_collapses_case_and_spacing() {
        let tokenizer = Tokenizer::default();
        assert_eq!(
            tokenizer.canonical_query("  Roket   FIRLATMA "),
            tokenizer.canonical_query("roket fırlatma")
        );
    }
}
