use crate::error::StoreError;
use crate::keyword_index::{KeywordConfig, KeywordIndex, KeywordParts};
use crate::models::{Chunk, Document};
use crate::snapshot::IndexSnapshot;
use crate::vector_index::{VectorEntry, VectorIndex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;

pub const VECTORS_FILE: &str = "vectors.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const KEYWORDS_FILE: &str = "keywords.json";

/// Stamped on each of the three files; a loadable triple shares one stamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u32,
    pub snapshot_id: Uuid,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorsFile {
    #[serde(flatten)]
    header: FileHeader,
    dimension: Option<usize>,
    entries: Vec<VectorEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(flatten)]
    header: FileHeader,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeywordsFile {
    #[serde(flatten)]
    header: FileHeader,
    keywords: KeywordParts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistReport {
    pub directory: PathBuf,
    pub snapshot_id: Uuid,
    pub version: u64,
    pub documents: usize,
    pub chunks: usize,
    pub bytes_written: u64,
}

/// Persists index snapshots as three JSON files in one directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    directory: PathBuf,
}

impl IndexStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes every file to a temporary name and renames it into place;
    /// metadata goes last.
    pub fn persist(&self, snapshot: &IndexSnapshot) -> Result<PersistReport, StoreError> {
        fs::create_dir_all(&self.directory)?;
        let header = FileHeader {
            format_version: FORMAT_VERSION,
            snapshot_id: Uuid::new_v4(),
            version: snapshot.version(),
        };

        let vectors = VectorsFile {
            header: header.clone(),
            dimension: snapshot.vectors().dimension(),
            entries: snapshot.vectors().entries(),
        };
        let keywords = KeywordsFile {
            header: header.clone(),
            keywords: snapshot.keywords().to_parts(),
        };
        let documents: Vec<Document> = snapshot.documents().cloned().collect();
        let chunks: Vec<Chunk> = snapshot.chunks().cloned().collect();
        let report_counts = (documents.len(), chunks.len());
        let metadata = MetadataFile {
            header: header.clone(),
            documents,
            chunks,
        };

        let mut bytes_written = self.write_atomic(VECTORS_FILE, &vectors)?;
        bytes_written += self.write_atomic(KEYWORDS_FILE, &keywords)?;
        bytes_written += self.write_atomic(METADATA_FILE, &metadata)?;

        info!(
            directory = %self.directory.display(),
            snapshot_id = %header.snapshot_id,
            version = header.version,
            chunks = report_counts.1,
            "index persisted"
        );

        Ok(PersistReport {
            directory: self.directory.clone(),
            snapshot_id: header.snapshot_id,
            version: header.version,
            documents: report_counts.0,
            chunks: report_counts.1,
            bytes_written,
        })
    }

    /// Returns `Ok(None)` when nothing was ever persisted here. Anything short
    /// of a complete, consistent triple is reported as corruption.
    pub fn load(&self, keyword_config: KeywordConfig) -> Result<Option<IndexSnapshot>, StoreError> {
        let present: Vec<&str> = [VECTORS_FILE, METADATA_FILE, KEYWORDS_FILE]
            .into_iter()
            .filter(|name| self.directory.join(name).is_file())
            .collect();
        if present.is_empty() {
            return Ok(None);
        }
        if present.len() < 3 {
            return Err(StoreError::Corruption(format!(
                "incomplete index in {}: only {} present",
                self.directory.display(),
                present.join(", ")
            )));
        }

        let vectors: VectorsFile = self.read(VECTORS_FILE)?;
        let metadata: MetadataFile = self.read(METADATA_FILE)?;
        let keywords: KeywordsFile = self.read(KEYWORDS_FILE)?;

        for (name, header) in [
            (VECTORS_FILE, &vectors.header),
            (KEYWORDS_FILE, &keywords.header),
        ] {
            if header != &metadata.header {
                return Err(StoreError::Corruption(format!(
                    "{name} belongs to snapshot {} v{}, metadata to {} v{}",
                    header.snapshot_id,
                    header.version,
                    metadata.header.snapshot_id,
                    metadata.header.version
                )));
            }
        }
        if metadata.header.format_version != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported format version {}",
                metadata.header.format_version
            )));
        }

        let mut seen = HashSet::new();
        for chunk in &metadata.chunks {
            if !seen.insert(chunk.chunk_id.as_str()) {
                return Err(StoreError::Corruption(format!(
                    "chunk {} is listed twice",
                    chunk.chunk_id
                )));
            }
        }

        let vector_index = VectorIndex::from_entries(vectors.dimension, vectors.entries)
            .map_err(|error| StoreError::Corruption(error.to_string()))?;
        let keyword_index = KeywordIndex::from_parts(keyword_config, keywords.keywords)?;
        let snapshot = IndexSnapshot::from_parts(
            metadata.header.version,
            metadata.documents,
            metadata.chunks,
            vector_index,
            keyword_index,
        );
        snapshot.verify().map_err(StoreError::Corruption)?;

        info!(
            directory = %self.directory.display(),
            snapshot_id = %metadata.header.snapshot_id,
            version = snapshot.version(),
            "index loaded"
        );
        Ok(Some(snapshot))
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<u64, StoreError> {
        let target = self.directory.join(name);
        let temporary = self
            .directory
            .join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(value)?;

        let written = (|| {
            let mut file = fs::File::create(&temporary)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temporary, &target)
        })();

        if let Err(error) = written {
            warn!(file = %temporary.display(), %error, "discarding partial index file");
            let _ = fs::remove_file(&temporary);
            return Err(error.into());
        }
        Ok(bytes.len() as u64)
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        let bytes = fs::read(self.directory.join(name))?;
        serde_json::from_slice(&bytes)
            .map_err(|error| StoreError::Corruption(format!("{name} is unreadable: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkStructure, SourceFileType};
    use crate::normalize::Tokenizer;
    use crate::snapshot::IndexEntry;
    use chrono::Utc;
    use tempfile::tempdir;

    fn snapshot() -> IndexSnapshot {
        let mut snapshot = IndexSnapshot::empty(KeywordConfig::default());
        let document = Document {
            document_id: "manual".to_string(),
            file_type: SourceFileType::Pdf,
            source_path: Some("docs/manual.pdf".to_string()),
            title: "manual.pdf".to_string(),
            content_hash: "abc".to_string(),
            ingested_at: Utc::now(),
        };
        let entries = [("c1", "pump pressure check", [1.0f32, 0.0]), ("c2", "valve seal kit", [0.0, 1.0])]
            .into_iter()
            .enumerate()
            .map(|(index, (id, text, vector))| IndexEntry {
                chunk: Chunk {
                    chunk_id: id.to_string(),
                    document_id: "manual".to_string(),
                    text: text.to_string(),
                    start_offset: index * 3,
                    end_offset: index * 3 + 3,
                    structure: ChunkStructure::Page {
                        page_number: index as u32 + 1,
                    },
                    sequence_index: index as u32,
                    sibling_count: 2,
                },
                vector: vector.to_vec(),
                tokens: Tokenizer::default().tokenize(text),
            })
            .collect();
        snapshot.apply_document(document, entries).unwrap();
        snapshot
    }

    #[test]
    fn missing_directory_loads_as_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::new(dir.path().join("absent"));
        assert!(store.load(KeywordConfig::default())?.is_none());
        Ok(())
    }

    #[test]
    fn round_trip_preserves_search_results() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::new(dir.path());
        let original = snapshot();

        let report = store.persist(&original)?;
        assert_eq!(report.chunks, 2);
        let loaded = store
            .load(KeywordConfig::default())?
            .ok_or("snapshot missing")?;

        assert_eq!(loaded.version(), original.version());
        assert_eq!(
            loaded.vectors().search(&[0.8, 0.6], 2)?,
            original.vectors().search(&[0.8, 0.6], 2)?
        );
        assert_eq!(
            loaded.keywords().search_text("pump seal"),
            original.keywords().search_text("pump seal")
        );
        assert_eq!(loaded.chunk("c2"), original.chunk("c2"));
        Ok(())
    }

    #[test]
    fn missing_file_is_corruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::new(dir.path());
        store.persist(&snapshot())?;
        fs::remove_file(dir.path().join(KEYWORDS_FILE))?;

        assert!(matches!(
            store.load(KeywordConfig::default()),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn mixed_snapshots_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = IndexStore::new(dir.path().join("first"));
        let second = IndexStore::new(dir.path().join("second"));
        first.persist(&snapshot())?;
        second.persist(&snapshot())?;
        fs::copy(
            dir.path().join("second").join(VECTORS_FILE),
            dir.path().join("first").join(VECTORS_FILE),
        )?;

        assert!(matches!(
            first.load(KeywordConfig::default()),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn inconsistent_chunk_sets_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::new(dir.path());
        store.persist(&snapshot())?;

        let path = dir.path().join(VECTORS_FILE);
        let mut vectors: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
        if let Some(entries) = vectors["entries"].as_array_mut() {
            entries.pop();
        }
        fs::write(&path, serde_json::to_vec(&vectors)?)?;

        assert!(matches!(
            store.load(KeywordConfig::default()),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn garbage_json_is_corruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::new(dir.path());
        store.persist(&snapshot())?;
        fs::write(dir.path().join(METADATA_FILE), b"{not json")?;

        assert!(matches!(
            store.load(KeywordConfig::default()),
            Err(StoreError::Corruption(_))
        ));
        Ok(())
    }
}
