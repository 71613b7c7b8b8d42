use crate::cache::{CacheStats, QueryCache, QuerySignature};
use crate::chunking::AdaptiveChunker;
use crate::config::EngineConfig;
use crate::embeddings::{EmbeddingGateway, EmbeddingProvider};
use crate::error::{IndexError, IngestError, Result, SearchError};
use crate::fusion::HybridRanker;
use crate::keyword_index::KeywordHit;
use crate::models::{
    Document, IngestionResult, QueryResponse, RetireOutcome, SearchQuery, SourceDocument,
};
use crate::normalize::Tokenizer;
use crate::snapshot::{IndexChange, IndexEntry, IndexHandle, IndexSnapshot, IndexStats};
use crate::store::{IndexStore, PersistReport};
use crate::vector_index::VectorHit;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineStats {
    pub index: IndexStats,
    pub cache: CacheStats,
    pub embedding_model: String,
}

/// Owns the published index and routes documents in and queries out.
///
/// Writes for one document are serialized by a per-document lock; everything
/// expensive (chunking, embedding) happens before the index handle is touched.
pub struct SearchCoordinator {
    index: IndexHandle,
    gateway: EmbeddingGateway,
    ranker: HybridRanker,
    cache: QueryCache,
    tokenizer: Tokenizer,
    document_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: Option<IndexStore>,
    config: EngineConfig,
}

impl std::fmt::Debug for SearchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCoordinator")
            .field("version", &self.index.version())
            .field("gateway", &self.gateway)
            .field("store", &self.store)
            .finish()
    }
}

impl SearchCoordinator {
    /// An empty, memory-only engine.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let snapshot = IndexSnapshot::empty(config.keyword.clone());
        Ok(Self::assemble(provider, config, snapshot, None))
    }

    /// Loads the index persisted under `directory`, or starts empty when
    /// nothing was persisted there. A corrupt index is refused.
    pub async fn open(
        provider: Arc<dyn EmbeddingProvider>,
        config: EngineConfig,
        directory: impl AsRef<Path>,
    ) -> Result<Self> {
        config.validate()?;
        let store = IndexStore::new(directory.as_ref());
        let loader = store.clone();
        let keyword_config = config.keyword.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(keyword_config))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))??;

        let snapshot = match loaded {
            Some(snapshot) => {
                if let Some(dimension) = snapshot.vectors().dimension() {
                    if dimension != provider.dimensions() {
                        return Err(IndexError::DimensionMismatch {
                            expected: dimension,
                            actual: provider.dimensions(),
                        }
                        .into());
                    }
                }
                snapshot
            }
            None => {
                info!(directory = %store.directory().display(), "no persisted index, starting empty");
                IndexSnapshot::empty(config.keyword.clone())
            }
        };

        Ok(Self::assemble(provider, config, snapshot, Some(store)))
    }

    fn assemble(
        provider: Arc<dyn EmbeddingProvider>,
        config: EngineConfig,
        snapshot: IndexSnapshot,
        store: Option<IndexStore>,
    ) -> Self {
        let version = snapshot.version();
        Self {
            index: IndexHandle::new(snapshot),
            gateway: EmbeddingGateway::new(provider, config.gateway.clone()),
            ranker: HybridRanker::new(config.fusion.clone()),
            cache: QueryCache::new(&config.cache, version),
            tokenizer: config.keyword.tokenizer(),
            document_locks: parking_lot::Mutex::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.index.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.index.version()
    }

    /// Chunks, embeds and indexes a document, replacing any earlier version
    /// of it. Either every new chunk becomes visible or none does.
    #[instrument(skip_all, fields(document_id = %document.document_id))]
    pub async fn submit_document(&self, document: SourceDocument) -> Result<IngestionResult> {
        if document.document_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument(
                "document_id must not be empty".to_string(),
            ));
        }
        let document_id = document.document_id.clone();
        let lock = self.document_lock(&document_id);
        let guard = lock.lock().await;
        let outcome = self.index_document(document).await;
        drop(guard);
        self.release_lock(&document_id, lock);
        outcome
    }

    /// Removes every chunk of a document. Retiring an unknown document is a
    /// no-op that reports zero chunks at the current version.
    #[instrument(skip(self))]
    pub async fn retire_document(&self, document_id: &str) -> Result<RetireOutcome> {
        if document_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument(
                "document_id must not be empty".to_string(),
            ));
        }
        let lock = self.document_lock(document_id);
        let guard = lock.lock().await;
        let outcome = self.remove_document(document_id);
        drop(guard);
        self.release_lock(document_id, lock);
        outcome
    }

    async fn index_document(&self, document: SourceDocument) -> Result<IngestionResult> {
        let file_type = document.metadata.file_type;
        let chunker = AdaptiveChunker::new(self.config.chunking_for(file_type))
            .map_err(|error| IngestError::InvalidConfig(error.to_string()))?;
        let (chunks, fallback) =
            chunker.build_chunks(&document.document_id, &document.text, &document.hints);

        let mut errors = Vec::new();
        if let Some(error) = fallback {
            warn!(%error, "structural hints rejected, chunked by paragraph");
            errors.push(error.to_string());
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.gateway
                .embed_with_retry(&texts)
                .await
                .map_err(|source| IngestError::Embedding {
                    document_id: document.document_id.clone(),
                    source,
                })?
        };

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                tokens: self.tokenizer.tokenize(&chunk.text),
                chunk,
                vector,
            })
            .collect();
        let chunks_created = entries.len();
        let record = document_record(&document);

        let (chunks_retired, version) = self.index.commit(
            IndexChange::Apply {
                document: record,
                entries,
            },
            |version| self.cache.invalidate(version),
        )?;

        info!(chunks_created, chunks_retired, version, "document indexed");
        Ok(IngestionResult {
            document_id: document.document_id,
            chunks_created,
            chunks_retired,
            version,
            errors,
        })
    }

    fn remove_document(&self, document_id: &str) -> Result<RetireOutcome> {
        if !self.index.snapshot().contains_document(document_id) {
            return Ok(RetireOutcome {
                document_id: document_id.to_string(),
                chunks_retired: 0,
                version: self.index.version(),
            });
        }

        let (chunks_retired, version) = self.index.commit(
            IndexChange::Remove {
                document_id: document_id.to_string(),
            },
            |version| self.cache.invalidate(version),
        )?;
        info!(chunks_retired, version, "document retired");
        Ok(RetireOutcome {
            document_id: document_id.to_string(),
            chunks_retired,
            version,
        })
    }

    /// Runs a query against the current snapshot within the request's
    /// deadline, or the configured one.
    #[instrument(skip_all, fields(search_type = request.search_type.as_str(), top_k = request.top_k))]
    pub async fn query(&self, request: &SearchQuery) -> Result<QueryResponse, SearchError> {
        self.validate_request(request)?;
        let deadline = request.timeout.unwrap_or(self.config.search.query_timeout);
        let embedding_budget = self.config.search.embedding_budget(deadline);
        tokio::time::timeout(deadline, self.execute(request, embedding_budget))
            .await
            .map_err(|_| SearchError::QueryTimeout(deadline))?
    }

    /// Like [`SearchCoordinator::query`], abandoned as soon as `cancel`
    /// resolves.
    pub async fn query_until<C>(
        &self,
        request: &SearchQuery,
        cancel: C,
    ) -> Result<QueryResponse, SearchError>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => Err(SearchError::Cancelled),
            response = self.query(request) => response,
        }
    }

    pub async fn query_batch(
        &self,
        requests: &[SearchQuery],
    ) -> Vec<Result<QueryResponse, SearchError>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.query(request).await);
        }
        responses
    }

    /// Runs `queries` so their answers are cached. Returns how many were
    /// answered without degradation.
    pub async fn warm_up(&self, queries: &[SearchQuery]) -> usize {
        let mut warmed = 0;
        for query in queries {
            match self.query(query).await {
                Ok(response) if !response.degraded => warmed += 1,
                Ok(_) => {}
                Err(error) => warn!(query = %query.text, %error, "warm-up query failed"),
            }
        }
        info!(warmed, requested = queries.len(), "query cache warmed");
        warmed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            index: self.index.snapshot().stats(),
            cache: self.cache.stats(),
            embedding_model: self.gateway.model_name().to_string(),
        }
    }

    /// Drops retired vectors from memory. Search results are unchanged.
    pub fn compact(&self) -> Result<usize> {
        let (reclaimed, version) = self
            .index
            .commit(IndexChange::Compact, |version| self.cache.invalidate(version))?;
        info!(reclaimed, version, "index compacted");
        Ok(reclaimed)
    }

    /// Writes the current snapshot to the store the engine was opened with.
    pub async fn persist(&self) -> Result<PersistReport> {
        let Some(store) = self.store.clone() else {
            return Err(IngestError::InvalidConfig(
                "no index directory configured".to_string(),
            ));
        };
        let snapshot = self.index.snapshot();
        let report = tokio::task::spawn_blocking(move || store.persist(&snapshot))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))??;
        Ok(report)
    }

    fn validate_request(&self, request: &SearchQuery) -> Result<(), SearchError> {
        if request.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if request.top_k == 0 || request.top_k > self.config.search.max_top_k {
            return Err(SearchError::Request(format!(
                "top_k must be in 1..={}, got {}",
                self.config.search.max_top_k, request.top_k
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: &SearchQuery,
        embedding_budget: Duration,
    ) -> Result<QueryResponse, SearchError> {
        let snapshot = self.index.snapshot();
        let generation = snapshot.version();
        let signature = QuerySignature::new(request, &self.tokenizer);
        if let Some(response) = self.cache.get(&signature, generation) {
            return Ok(response);
        }

        let snapshot: &IndexSnapshot = &snapshot;
        let filters = &request.filters;
        let keep = |chunk_id: &str| {
            filters.is_empty()
                || snapshot
                    .chunk_with_document(chunk_id)
                    .is_some_and(|(_, document)| filters.matches(document))
        };
        let pool = self.config.search.candidate_pool(request.top_k);

        let mut degraded = false;
        let mut vector_hits: Vec<VectorHit> = Vec::new();
        if request.search_type.uses_vectors() {
            match self
                .vector_candidates(snapshot, &request.text, embedding_budget, pool, &keep)
                .await
            {
                Ok(hits) => vector_hits = hits,
                Err(reason) => {
                    warn!(%reason, "query embedding unavailable, ranking by keywords only");
                    degraded = true;
                }
            }
        }

        let tokens = self.tokenizer.tokenize(&request.text);
        let mut keyword_hits: Vec<KeywordHit> = Vec::new();
        if request.search_type.uses_keywords() || degraded {
            keyword_hits = snapshot.keywords().search_filtered(&tokens, &keep);
            keyword_hits.truncate(pool);
        }

        let query_terms: Vec<String> = tokens.into_iter().map(|token| token.term).collect();
        let results = self.ranker.fuse_for_query(
            &query_terms,
            &vector_hits,
            &keyword_hits,
            move |chunk_id| snapshot.chunk_with_document(chunk_id),
            request.top_k,
        );

        let response = QueryResponse {
            query: request.text.clone(),
            search_type: request.search_type,
            results,
            degraded,
            from_cache: false,
            version: generation,
            vector_candidates: vector_hits.len(),
            keyword_candidates: keyword_hits.len(),
        };
        self.cache.put(signature, generation, response.clone());
        Ok(response)
    }

    async fn vector_candidates<F>(
        &self,
        snapshot: &IndexSnapshot,
        text: &str,
        budget: Duration,
        pool: usize,
        keep: F,
    ) -> Result<Vec<VectorHit>, String>
    where
        F: Fn(&str) -> bool,
    {
        if snapshot.vectors().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self
            .gateway
            .embed_query_within(text, budget)
            .await
            .map_err(|error| error.to_string())?;
        snapshot
            .vectors()
            .search_filtered(&vector, pool, keep)
            .map_err(|error| error.to_string())
    }

    fn document_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.document_locks.lock();
        Arc::clone(
            locks
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forgets the lock once no other writer holds or awaits it.
    fn release_lock(&self, document_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.document_locks.lock();
        drop(lock);
        if locks
            .get(document_id)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(document_id);
        }
    }
}

fn document_record(document: &SourceDocument) -> Document {
    let metadata = &document.metadata;
    let title = metadata
        .title
        .clone()
        .or_else(|| {
            metadata.source_path.as_deref().and_then(|path| {
                Path::new(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
        })
        .unwrap_or_else(|| document.document_id.clone());

    let content_hash = metadata.content_hash.clone().unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(document.text.as_bytes());
        format!("{:x}", hasher.finalize())
    });

    Document {
        document_id: document.document_id.clone(),
        file_type: metadata.file_type,
        source_path: metadata.source_path.clone(),
        title,
        content_hash,
        ingested_at: metadata.ingested_at.unwrap_or_else(Utc::now),
    }
}
