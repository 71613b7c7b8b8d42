use crate::error::IngestError;
use crate::extractor::ExtractorRegistry;
use crate::models::{IngestionResult, SourceDocument, SourceMetadata};
use crate::orchestrator::SearchCoordinator;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_files(folder: &Path, registry: &ExtractorRegistry) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && registry.supports(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stable per location, so re-ingesting a file replaces its earlier chunks.
pub fn generate_document_id(path: &Path) -> String {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(resolved.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extracts one file into a document ready for submission.
pub fn load_source_document(
    path: &Path,
    registry: &ExtractorRegistry,
) -> Result<SourceDocument, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;
    let (file_type, extractor) = registry.resolve(path).ok_or_else(|| {
        IngestError::InvalidArgument(format!("unsupported file: {}", path.display()))
    })?;
    let extracted = extractor.extract(path)?;

    let mut metadata = SourceMetadata::new(file_type);
    metadata.source_path = Some(path.to_string_lossy().to_string());
    metadata.title = Some(name.to_string());
    metadata.content_hash = Some(digest_file(path)?);

    Ok(SourceDocument {
        document_id: generate_document_id(path),
        text: extracted.text,
        hints: extracted.hints,
        metadata,
    })
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FolderReport {
    pub documents: Vec<IngestionResult>,
    /// Files whose bytes match what is already indexed; not re-embedded.
    pub unchanged_files: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedFile>,
}

impl FolderReport {
    pub fn chunks_created(&self) -> usize {
        self.documents
            .iter()
            .map(|result| result.chunks_created)
            .sum()
    }
}

/// True when the index already holds `path` with exactly these bytes.
fn is_unchanged(coordinator: &SearchCoordinator, path: &Path) -> Result<bool, IngestError> {
    let snapshot = coordinator.snapshot();
    let Some(document) = snapshot.document(&generate_document_id(path)) else {
        return Ok(false);
    };
    Ok(document.content_hash == digest_file(path)?)
}

/// Submits every supported file under `folder`, leaving files that did not
/// change since they were indexed alone. A file that cannot be read or
/// indexed is reported and skipped; the rest still go in.
pub async fn ingest_folder(
    coordinator: &SearchCoordinator,
    folder: &Path,
    registry: &ExtractorRegistry,
) -> Result<FolderReport, IngestError> {
    let files = discover_files(folder, registry);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no supported files found in {}",
            folder.display()
        )));
    }

    let mut report = FolderReport::default();
    for path in files {
        if matches!(is_unchanged(coordinator, &path), Ok(true)) {
            debug!(path = %path.display(), "unchanged, not re-indexed");
            report.unchanged_files.push(path);
            continue;
        }

        let outcome = match load_source_document(&path, registry) {
            Ok(document) => coordinator.submit_document(document).await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(result) => {
                for error in &result.errors {
                    warn!(path = %path.display(), %error, "ingested with recovered error");
                }
                report.documents.push(result);
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "skipped file");
                report.skipped_files.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        folder = %folder.display(),
        documents = report.documents.len(),
        unchanged = report.unchanged_files.len(),
        skipped = report.skipped_files.len(),
        chunks = report.chunks_created(),
        "folder ingested"
    );
    Ok(report)
}
