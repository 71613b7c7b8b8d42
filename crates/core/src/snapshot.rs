//! Immutable index versions and the handle that publishes them.
//!
//! Readers clone the current `Arc` and search without holding any lock.
//! Writers apply a change to a private version and swap it in, so a reader
//! sees either the whole change or none of it.

use crate::error::IndexError;
use crate::keyword_index::{KeywordConfig, KeywordIndex};
use crate::models::{Chunk, Document};
use crate::normalize::Token;
use crate::vector_index::VectorIndex;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One chunk ready to be published: its vector and keyword contribution are
/// derived from the same chunk.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexStats {
    pub version: u64,
    pub documents: usize,
    pub chunks: usize,
    pub terms: usize,
    pub dimension: Option<usize>,
    pub vector_tombstones: usize,
    pub tombstone_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    version: u64,
    documents: BTreeMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    document_chunks: BTreeMap<String, Vec<String>>,
    vectors: VectorIndex,
    keywords: KeywordIndex,
}

impl IndexSnapshot {
    pub fn empty(keyword_config: KeywordConfig) -> Self {
        Self {
            version: 0,
            documents: BTreeMap::new(),
            chunks: HashMap::new(),
            document_chunks: BTreeMap::new(),
            vectors: VectorIndex::new(),
            keywords: KeywordIndex::new(keyword_config),
        }
    }

    /// Assembles a snapshot from persisted parts. Callers check consistency
    /// with [`IndexSnapshot::verify`].
    pub fn from_parts(
        version: u64,
        documents: Vec<Document>,
        chunks: Vec<Chunk>,
        vectors: VectorIndex,
        keywords: KeywordIndex,
    ) -> Self {
        let mut document_chunks: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut ordered = chunks;
        ordered.sort_by(|left, right| {
            left.document_id
                .cmp(&right.document_id)
                .then(left.sequence_index.cmp(&right.sequence_index))
        });
        for chunk in &ordered {
            document_chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk.chunk_id.clone());
        }

        Self {
            version,
            documents: documents
                .into_iter()
                .map(|document| (document.document_id.clone(), document))
                .collect(),
            chunks: ordered
                .into_iter()
                .map(|chunk| (chunk.chunk_id.clone(), chunk))
                .collect(),
            document_chunks,
            vectors,
            keywords,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn keywords(&self) -> &KeywordIndex {
        &self.keywords
    }

    pub fn document(&self, document_id: &str) -> Option<&Document> {
        self.documents.get(document_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.chunks.get(chunk_id)
    }

    pub fn chunk_with_document(&self, chunk_id: &str) -> Option<(&Chunk, &Document)> {
        let chunk = self.chunks.get(chunk_id)?;
        let document = self.documents.get(&chunk.document_id)?;
        Some((chunk, document))
    }

    /// Chunks of every document, each document's chunks in sequence order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.document_chunks
            .values()
            .flatten()
            .filter_map(|chunk_id| self.chunks.get(chunk_id))
    }

    pub fn document_chunk_ids(&self, document_id: &str) -> &[String] {
        self.document_chunks
            .get(document_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Replaces every chunk of `document` with `entries`. All vectors are
    /// checked before anything changes. Returns how many chunks were retired.
    pub fn apply_document(
        &mut self,
        document: Document,
        entries: Vec<IndexEntry>,
    ) -> Result<usize, IndexError> {
        let mut expected = self.vectors.dimension();
        for entry in &entries {
            let actual = entry.vector.len();
            if entry.vector.is_empty() || entry.vector.iter().any(|value| !value.is_finite()) {
                return Err(IndexError::InvalidVector {
                    chunk_id: entry.chunk.chunk_id.clone(),
                    reason: "vector is empty or has non-finite values".to_string(),
                });
            }
            match expected {
                Some(dimension) if dimension != actual => {
                    return Err(IndexError::DimensionMismatch {
                        expected: dimension,
                        actual,
                    })
                }
                _ => expected = Some(actual),
            }
        }

        let retired = self.remove_document(&document.document_id);
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let chunk_id = entry.chunk.chunk_id.clone();
            self.vectors.add(&chunk_id, entry.vector)?;
            self.keywords.add(&chunk_id, &entry.tokens);
            self.chunks.insert(chunk_id.clone(), entry.chunk);
            ids.push(chunk_id);
        }
        self.document_chunks
            .insert(document.document_id.clone(), ids);
        self.documents
            .insert(document.document_id.clone(), document);
        Ok(retired)
    }

    /// Removes a document and all its chunks from both projections.
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        self.documents.remove(document_id);
        let Some(ids) = self.document_chunks.remove(document_id) else {
            return 0;
        };
        for chunk_id in &ids {
            self.vectors.remove(chunk_id);
            self.keywords.remove(chunk_id);
            self.chunks.remove(chunk_id);
        }
        ids.len()
    }

    pub fn compact(&mut self) -> usize {
        self.vectors.compact()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            version: self.version,
            documents: self.documents.len(),
            chunks: self.chunks.len(),
            terms: self.keywords.term_count(),
            dimension: self.vectors.dimension(),
            vector_tombstones: self.vectors.tombstones(),
            tombstone_ratio: self.vectors.tombstone_ratio(),
        }
    }

    /// Checks that the chunk table and both projections describe the same
    /// chunk set and that every chunk belongs to a known document.
    pub fn verify(&self) -> Result<(), String> {
        let chunk_ids: HashSet<&str> = self.chunks.keys().map(String::as_str).collect();
        let vector_ids: HashSet<&str> = self.vectors.chunk_ids().collect();
        let keyword_ids: HashSet<&str> = self.keywords.chunk_ids().collect();

        if chunk_ids != vector_ids {
            return Err(format!(
                "metadata holds {} chunks but the vector index holds {}",
                chunk_ids.len(),
                vector_ids.len()
            ));
        }
        if chunk_ids != keyword_ids {
            return Err(format!(
                "metadata holds {} chunks but the keyword index holds {}",
                chunk_ids.len(),
                keyword_ids.len()
            ));
        }
        for chunk in self.chunks.values() {
            if !self.documents.contains_key(&chunk.document_id) {
                return Err(format!(
                    "chunk {} references unknown document {}",
                    chunk.chunk_id, chunk.document_id
                ));
            }
        }
        Ok(())
    }
}

/// A mutation of the index, kept so it can be replayed onto the version it
/// superseded.
#[derive(Debug, Clone)]
pub enum IndexChange {
    Apply {
        document: Document,
        entries: Vec<IndexEntry>,
    },
    Remove {
        document_id: String,
    },
    Compact,
}

impl IndexChange {
    /// Returns the number of chunks retired, or vectors reclaimed for
    /// [`IndexChange::Compact`].
    pub fn apply_to(self, snapshot: &mut IndexSnapshot) -> Result<usize, IndexError> {
        match self {
            Self::Apply { document, entries } => snapshot.apply_document(document, entries),
            Self::Remove { document_id } => Ok(snapshot.remove_document(&document_id)),
            Self::Compact => Ok(snapshot.compact()),
        }
    }
}

/// The version replaced by the last commit and the change that turned it into
/// the published one.
#[derive(Debug, Default)]
struct WriterState {
    superseded: Option<(Arc<IndexSnapshot>, IndexChange)>,
    full_copies: u64,
}

/// Publishes snapshots.
///
/// Writers are serialized by their own mutex and build the next version off
/// the reader lock. The superseded version is recycled: once no reader holds
/// it, the last change is replayed onto it, which brings it level with the
/// published version without copying the corpus. A full copy happens only
/// when a reader still holds the superseded version. The reader lock is taken
/// for the pointer swap alone.
#[derive(Debug)]
pub struct IndexHandle {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<WriterState>,
}

impl IndexHandle {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(WriterState::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Commits that had to copy the whole published snapshot.
    pub fn full_copies(&self) -> u64 {
        self.writer.lock().full_copies
    }

    /// Applies `change` to a private copy of the current snapshot and
    /// publishes it as the next version. `published` runs before the swap
    /// lock is released, so no reader can observe the new version before it
    /// has run. Nothing is published when `change` fails.
    pub fn commit<P>(&self, change: IndexChange, published: P) -> Result<(usize, u64), IndexError>
    where
        P: FnOnce(u64),
    {
        let mut writer = self.writer.lock();
        let version = self.version() + 1;

        let mut next = match writer.superseded.take() {
            Some((previous, last_change)) => match Arc::try_unwrap(previous) {
                Ok(mut recycled) => match last_change.apply_to(&mut recycled) {
                    Ok(_) => recycled,
                    Err(_) => self.copy_current(&mut writer),
                },
                Err(_) => self.copy_current(&mut writer),
            },
            None => self.copy_current(&mut writer),
        };

        let outcome = change.clone().apply_to(&mut next)?;
        next.version = version;

        let previous = {
            let mut current = self.current.write();
            let previous = std::mem::replace(&mut *current, Arc::new(next));
            published(version);
            previous
        };
        writer.superseded = Some((previous, change));
        Ok((outcome, version))
    }

    fn copy_current(&self, writer: &mut WriterState) -> IndexSnapshot {
        writer.full_copies += 1;
        let current = self.snapshot();
        IndexSnapshot::clone(&current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkStructure, SourceFileType};
    use crate::normalize::Tokenizer;
    use chrono::Utc;

    fn document(id: &str) -> Document {
        Document {
            document_id: id.to_string(),
            file_type: SourceFileType::Txt,
            source_path: None,
            title: id.to_string(),
            content_hash: String::new(),
            ingested_at: Utc::now(),
        }
    }

    fn entry(document_id: &str, chunk_id: &str, text: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
                text: text.to_string(),
                start_offset: 0,
                end_offset: 2,
                structure: ChunkStructure::Paragraph {
                    first_paragraph: 0,
                    paragraph_count: 1,
                },
                sequence_index: 0,
                sibling_count: 1,
            },
            vector,
            tokens: Tokenizer::default().tokenize(text),
        }
    }

    fn apply(document_id: &str, entries: Vec<IndexEntry>) -> IndexChange {
        IndexChange::Apply {
            document: document(document_id),
            entries,
        }
    }

    #[test]
    fn readers_keep_their_version_across_commits() {
        let handle = IndexHandle::new(IndexSnapshot::empty(KeywordConfig::default()));
        let before = handle.snapshot();

        let (retired, version) = handle
            .commit(
                apply("d", vec![entry("d", "c1", "pump valve", vec![1.0, 0.0])]),
                |_| {},
            )
            .unwrap();

        assert_eq!(retired, 0);
        assert_eq!(version, 1);
        assert_eq!(before.version(), 0);
        assert!(before.chunk("c1").is_none());
        assert!(handle.snapshot().chunk("c1").is_some());
    }

    #[test]
    fn failed_change_publishes_nothing() {
        let handle = IndexHandle::new(IndexSnapshot::empty(KeywordConfig::default()));
        handle
            .commit(apply("d", vec![entry("d", "c1", "pump", vec![1.0, 0.0])]), |_| {})
            .unwrap();

        let mut notified = false;
        let outcome = handle.commit(
            apply("d", vec![entry("d", "c2", "valve", vec![1.0, 0.0, 0.0])]),
            |_| notified = true,
        );

        assert!(matches!(outcome, Err(IndexError::DimensionMismatch { .. })));
        assert!(!notified);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.chunk("c1").is_some());
        assert!(snapshot.chunk("c2").is_none());

        let (_, version) = handle
            .commit(apply("e", vec![entry("e", "c3", "seal", vec![0.0, 1.0])]), |_| {})
            .unwrap();
        assert_eq!(version, 2);
        assert!(handle.snapshot().chunk("c1").is_some());
        assert!(handle.snapshot().verify().is_ok());
    }

    #[test]
    fn commits_recycle_the_superseded_version() {
        let handle = IndexHandle::new(IndexSnapshot::empty(KeywordConfig::default()));
        let mut expected = IndexSnapshot::empty(KeywordConfig::default());
        let changes = vec![
            apply("a", vec![entry("a", "a1", "pump valve", vec![1.0, 0.0])]),
            apply("b", vec![entry("b", "b1", "valve seal", vec![0.0, 1.0])]),
            apply("a", vec![entry("a", "a2", "seal kit", vec![0.6, 0.8])]),
            IndexChange::Remove {
                document_id: "b".to_string(),
            },
            IndexChange::Compact,
        ];

        for change in changes {
            change.clone().apply_to(&mut expected).unwrap();
            handle.commit(change, |_| {}).unwrap();
        }

        assert_eq!(handle.full_copies(), 1);
        let published = handle.snapshot();
        assert_eq!(published.version(), 5);
        assert!(published.verify().is_ok());
        assert_eq!(published.document_chunk_ids("a"), expected.document_chunk_ids("a"));
        assert!(!published.contains_document("b"));
        assert_eq!(published.stats().chunks, expected.stats().chunks);
        assert_eq!(published.stats().vector_tombstones, 0);
        assert_eq!(
            published.keywords().search_text("seal kit"),
            expected.keywords().search_text("seal kit")
        );
    }

    #[test]
    fn held_versions_force_a_copy_and_stay_intact() {
        let handle = IndexHandle::new(IndexSnapshot::empty(KeywordConfig::default()));
        handle
            .commit(apply("a", vec![entry("a", "a1", "pump", vec![1.0, 0.0])]), |_| {})
            .unwrap();
        let reader = handle.snapshot();

        handle
            .commit(apply("b", vec![entry("b", "b1", "valve", vec![0.0, 1.0])]), |_| {})
            .unwrap();
        handle
            .commit(apply("c", vec![entry("c", "c1", "seal", vec![0.6, 0.8])]), |_| {})
            .unwrap();

        assert_eq!(handle.full_copies(), 2);
        assert_eq!(reader.version(), 1);
        assert!(reader.chunk("b1").is_none());
        assert!(reader.chunk("c1").is_none());
        let published = handle.snapshot();
        assert!(published.chunk("a1").is_some());
        assert!(published.chunk("b1").is_some());
        assert!(published.chunk("c1").is_some());
        assert!(published.verify().is_ok());
    }

    #[test]
    fn replacing_a_document_retires_old_chunks_everywhere() {
        let mut snapshot = IndexSnapshot::empty(KeywordConfig::default());
        snapshot
            .apply_document(
                document("d"),
                vec![
                    entry("d", "old-1", "pump valve", vec![1.0, 0.0]),
                    entry("d", "old-2", "valve seal", vec![0.0, 1.0]),
                ],
            )
            .unwrap();
        let retired = snapshot
            .apply_document(document("d"), vec![entry("d", "new-1", "seal kit", vec![0.6, 0.8])])
            .unwrap();

        assert_eq!(retired, 2);
        assert_eq!(snapshot.document_chunk_ids("d"), ["new-1".to_string()]);
        assert!(snapshot.keywords().search_text("pump").is_empty());
        assert_eq!(snapshot.vectors().len(), 1);
        assert!(snapshot.verify().is_ok());

        assert_eq!(snapshot.remove_document("d"), 1);
        assert!(!snapshot.contains_document("d"));
        assert_eq!(snapshot.stats().chunks, 0);
        assert_eq!(snapshot.stats().vector_tombstones, 3);
    }
}
