use crate::embeddings::PartialEmbeddings;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("malformed structural hints: {0}")]
    MalformedHints(String),

    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),
}

/// Failures raised by a concrete embedding backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {provider}: {details}")]
    Response { provider: String, details: String },

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(
        "embedding failed for {} of {} inputs: {reason}",
        .partial.failed.len(),
        .partial.vectors.len()
    )]
    Partial {
        partial: PartialEmbeddings,
        reason: String,
    },

    #[error("embedding provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding retries exhausted after {attempts} attempts, {} inputs still failing: {reason}", .failed.len())]
    Exhausted {
        attempts: u32,
        failed: Vec<usize>,
        reason: String,
    },

    #[error("invalid embedding vector: {0}")]
    InvalidVector(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector for chunk {chunk_id}: {reason}")]
    InvalidVector { chunk_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persisted triple cannot be trusted; the index must not be served.
    #[error("index corruption: {0}")]
    Corruption(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("embedding failed for document {document_id}: {source}")]
    Embedding {
        document_id: String,
        #[source]
        source: EmbeddingError,
    },

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("query cancelled by caller")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
