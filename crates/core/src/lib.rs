pub mod cache;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod fusion;
pub mod ingest;
pub mod keyword_index;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod snapshot;
pub mod store;
pub mod vector_index;

pub use cache::{CacheConfig, CacheStats, QueryCache, QuerySignature};
pub use chunking::{chunk, AdaptiveChunker, ChunkPlan, ChunkStrategy, ChunkingConfig};
pub use config::{EngineConfig, SearchConfig};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingGateway, EmbeddingProvider, GatewayConfig,
    HttpEmbeddingProvider, RetryPolicy, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    ChunkingError, EmbeddingError, IndexError, IngestError, ProviderError, SearchError,
    StoreError,
};
pub use extractor::{
    detect_file_type, DelimitedTableExtractor, DocumentExtractor, ExtractedDocument,
    ExtractorRegistry, PagedTextExtractor, PlainTextExtractor, SlideTextExtractor,
};
pub use fusion::{FusionConfig, FusionMethod, HybridRanker};
pub use ingest::{discover_files, ingest_folder, load_source_document, FolderReport, SkippedFile};
pub use keyword_index::{KeywordConfig, KeywordIndex};
pub use models::{
    Chunk, ChunkStructure, DateRange, Document, IngestionResult, QueryFilters, QueryResponse,
    QueryResult, RetireOutcome, SearchQuery, SearchType, SourceDocument, SourceFileType,
    SourceMetadata, StructuralHints, StructuralUnit, UnitKind,
};
pub use normalize::{StopwordPolicy, Tokenizer};
pub use orchestrator::{EngineStats, SearchCoordinator};
pub use snapshot::{IndexChange, IndexEntry, IndexHandle, IndexSnapshot, IndexStats};
pub use store::{IndexStore, PersistReport};
pub use vector_index::VectorIndex;
