use crate::cache::CacheConfig;
use crate::chunking::{ChunkStrategy, ChunkingConfig};
use crate::embeddings::GatewayConfig;
use crate::error::{IngestError, Result};
use crate::fusion::FusionConfig;
use crate::keyword_index::KeywordConfig;
use crate::models::SourceFileType;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Each index is asked for `max(min_candidates, top_k * candidate_multiplier)`
    /// hits before fusion.
    pub min_candidates: usize,
    pub candidate_multiplier: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub query_timeout: Duration,
    /// Share of the query deadline the query embedding may use. The rest is
    /// left for keyword ranking when the embedding gives up.
    pub embedding_budget_percent: u8,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            min_candidates: 50,
            candidate_multiplier: 5,
            query_timeout: Duration::from_secs(10),
            embedding_budget_percent: 60,
        }
    }
}

impl SearchConfig {
    pub fn candidate_pool(&self, top_k: usize) -> usize {
        self.min_candidates
            .max(top_k.saturating_mul(self.candidate_multiplier))
    }

    /// Time the query embedding may take under `deadline`.
    pub fn embedding_budget(&self, deadline: Duration) -> Duration {
        deadline.mul_f64(f64::from(self.embedding_budget_percent) / 100.0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_top_k == 0 || self.default_top_k > self.max_top_k {
            return Err(IngestError::InvalidConfig(format!(
                "search.default_top_k must be in 1..={}, got {}",
                self.max_top_k, self.default_top_k
            )));
        }
        if self.candidate_multiplier == 0 {
            return Err(IngestError::InvalidConfig(
                "search.candidate_multiplier must be positive".to_string(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "search.query_timeout must be positive".to_string(),
            ));
        }
        if !(1..=95).contains(&self.embedding_budget_percent) {
            return Err(IngestError::InvalidConfig(format!(
                "search.embedding_budget_percent must be in 1..=95, got {}",
                self.embedding_budget_percent
            )));
        }
        Ok(())
    }
}

/// Everything the engine needs, loadable from one JSON document. Missing
/// sections fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    /// Per-format overrides; formats without one use `chunking` with the
    /// strategy that fits the format.
    pub chunking_overrides: BTreeMap<SourceFileType, ChunkingConfig>,
    pub keyword: KeywordConfig,
    pub fusion: FusionConfig,
    pub cache: CacheConfig,
    pub gateway: GatewayConfig,
    pub search: SearchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut chunking_overrides = BTreeMap::new();
        chunking_overrides.insert(
            SourceFileType::Pdf,
            ChunkingConfig::for_file_type(SourceFileType::Pdf),
        );
        Self {
            chunking: ChunkingConfig::default(),
            chunking_overrides,
            keyword: KeywordConfig::default(),
            fusion: FusionConfig::default(),
            cache: CacheConfig::default(),
            gateway: GatewayConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            IngestError::InvalidConfig(format!("{}: {error}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn chunking_for(&self, file_type: SourceFileType) -> ChunkingConfig {
        match self.chunking_overrides.get(&file_type) {
            Some(config) => config.clone(),
            None => self
                .chunking
                .clone()
                .with_strategy(ChunkStrategy::for_file_type(file_type)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking
            .validate()
            .map_err(|error| IngestError::InvalidConfig(format!("chunking: {error}")))?;
        for (file_type, config) in &self.chunking_overrides {
            config.validate().map_err(|error| {
                IngestError::InvalidConfig(format!("chunking_overrides.{file_type}: {error}"))
            })?;
        }
        self.keyword.validate()?;
        self.fusion.validate()?;
        self.cache.validate()?;
        self.gateway.validate()?;
        self.search.validate()
    }
}
