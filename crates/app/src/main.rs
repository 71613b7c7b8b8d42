use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use deepsearch_core::ingest::generate_document_id;
use deepsearch_core::{
    ingest_folder, CharacterNgramEmbedder, DateRange, EmbeddingProvider, EngineConfig,
    ExtractorRegistry, HttpEmbeddingProvider, QueryFilters, SearchCoordinator, SearchQuery,
    SearchType, SourceFileType,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "deepsearch", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted index.
    #[arg(long, env = "DEEPSEARCH_INDEX_DIR", default_value = ".deepsearch")]
    index_dir: PathBuf,

    /// JSON engine configuration; defaults apply to anything left out.
    #[arg(long, env = "DEEPSEARCH_CONFIG")]
    config: Option<PathBuf>,

    /// OpenAI-compatible embeddings endpoint. Without it a local
    /// character-trigram embedder is used.
    #[arg(long, env = "DEEPSEARCH_EMBEDDING_URL")]
    embedding_url: Option<Url>,

    /// Embedding model name sent to the endpoint.
    #[arg(long, env = "DEEPSEARCH_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Vector size produced by the embedding model.
    #[arg(long, env = "DEEPSEARCH_EMBEDDING_DIMENSIONS", default_value = "1536")]
    embedding_dimensions: usize,

    /// Bearer token for the embeddings endpoint.
    #[arg(long, env = "DEEPSEARCH_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of text documents and persist the index.
    Ingest {
        /// Folder that contains documents recursively.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Query the index.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of results to return.
        #[arg(long, default_value = "10")]
        top_k: usize,
        /// semantic, keyword or hybrid.
        #[arg(long, default_value = "hybrid")]
        search_type: SearchType,
        /// Only return chunks of this file type.
        #[arg(long)]
        file_type: Option<SourceFileType>,
        /// Earliest ingestion date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,
        /// Latest ingestion date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        until: Option<String>,
        /// Query deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove a document and all of its chunks.
    Retire {
        /// Document id as reported at ingestion.
        #[arg(long, conflicts_with = "path", required_unless_present = "path")]
        document_id: Option<String>,
        /// Path the document was ingested from.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print index and cache statistics as JSON.
    Stats,
    /// Drop retired vectors and persist the compacted index.
    Compact,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let provider = embedding_provider(&cli)?;
    let coordinator = SearchCoordinator::open(provider, config, &cli.index_dir)
        .await
        .with_context(|| format!("opening index {}", cli.index_dir.display()))?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index_version = coordinator.version(),
        "deepsearch boot"
    );

    match cli.command {
        Command::Ingest { folder } => {
            let report = ingest_folder(&coordinator, &folder, &ExtractorRegistry::default()).await?;

            if !report.skipped_files.is_empty() {
                warn!(
                    "skipped_files={} for folder={}",
                    report.skipped_files.len(),
                    folder.display()
                );
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
            }

            let persisted = coordinator.persist().await?;
            println!(
                "{} documents, {} chunks ingested, {} unchanged at {} (index version {})",
                report.documents.len(),
                report.chunks_created(),
                report.unchanged_files.len(),
                Utc::now().to_rfc3339(),
                persisted.version
            );
        }
        Command::Search {
            query,
            top_k,
            search_type,
            file_type,
            since,
            until,
            timeout_ms,
            json,
        } => {
            let date_range = match (since, until) {
                (None, None) => None,
                (since, until) => Some(DateRange {
                    from: since.as_deref().map(|value| parse_date(value, false)).transpose()?,
                    to: until.as_deref().map(|value| parse_date(value, true)).transpose()?,
                }),
            };
            let mut search_query = SearchQuery::new(query, search_type, top_k)
                .with_filters(QueryFilters {
                    file_type,
                    date_range,
                });
            if let Some(timeout_ms) = timeout_ms {
                search_query = search_query.with_timeout(Duration::from_millis(timeout_ms));
            }

            let response = coordinator.query(&search_query).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            println!("query: {}", response.query);
            if response.degraded {
                println!("(embedding unavailable: keyword ranking only)");
            }
            for result in &response.results {
                println!(
                    "[{}] score={:.4} vector={:.4} keyword={:.4} chunk={} document_id={}",
                    result.file_type,
                    result.fused_score,
                    result.vector_score,
                    result.keyword_score,
                    result.chunk_id,
                    result.document_id
                );
                if let Some(source_path) = &result.source_path {
                    println!("  source={source_path}");
                }
                if !result.matched_terms.is_empty() {
                    println!("  matched={}", result.matched_terms.join(", "));
                }
                println!("  {}", result.context_window);
            }
        }
        Command::Retire { document_id, path } => {
            let document_id = match (document_id, path) {
                (Some(document_id), _) => document_id,
                (None, Some(path)) => generate_document_id(&path),
                (None, None) => anyhow::bail!("either --document-id or --path is required"),
            };
            let outcome = coordinator.retire_document(&document_id).await?;
            coordinator.persist().await?;
            println!(
                "{} chunks retired for {} (index version {})",
                outcome.chunks_retired, outcome.document_id, outcome.version
            );
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);
        }
        Command::Compact => {
            let reclaimed = coordinator.compact()?;
            coordinator.persist().await?;
            println!("{reclaimed} retired vectors dropped");
        }
    }

    Ok(())
}

fn embedding_provider(cli: &Cli) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let Some(url) = &cli.embedding_url else {
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    };
    let mut provider =
        HttpEmbeddingProvider::new(url.clone(), &cli.embedding_model, cli.embedding_dimensions)?;
    if let Some(api_key) = &cli.embedding_api_key {
        provider = provider.with_api_key(api_key);
    }
    Ok(Arc::new(provider))
}

/// Accepts a calendar date or a full RFC 3339 timestamp. A bare date used as
/// an upper bound covers the whole day.
fn parse_date(value: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let date: NaiveDate = value
        .parse()
        .with_context(|| format!("invalid date {value}: expected YYYY-MM-DD or RFC 3339"))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .context("invalid time of day")?;
    Ok(date.and_time(time).and_utc())
}
