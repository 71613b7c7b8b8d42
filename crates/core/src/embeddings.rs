use crate::error::{EmbeddingError, IngestError, ProviderError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// A backend able to turn texts into dense vectors, one per input, in order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        normalize_vector(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// OpenAI-compatible embeddings endpoint: `POST {model, input}` answered by
/// `data[].embedding` tagged with the input `index`.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: Url,
        model: impl Into<String>,
        dimensions: usize,
    ) -> std::result::Result<Self, ProviderError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            dimensions,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn parse_response(
        &self,
        response: EmbeddingResponse,
        expected: usize,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let mut data = response.data;
        if data.len() != expected {
            return Err(ProviderError::Response {
                provider: self.endpoint.to_string(),
                details: format!("expected {expected} embeddings, got {}", data.len()),
            });
        }

        data.sort_by_key(|datum| datum.index);
        for (position, datum) in data.iter().enumerate() {
            if datum.index != position {
                return Err(ProviderError::Response {
                    provider: self.endpoint.to_string(),
                    details: format!("missing embedding for input {position}"),
                });
            }
        }

        Ok(data.into_iter().map(|datum| datum.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Response {
                provider: self.endpoint.to_string(),
                details: format!("status {status}: {body}"),
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        self.parse_response(parsed, texts.len())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_batch_size: usize,
    /// Applies to every provider call, batch or query.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "gateway.max_batch_size must be positive".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "gateway.timeout must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::InvalidConfig(
                "gateway.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a batch where some inputs could not be embedded. `vectors` keeps
/// input order; `failed` lists the indices still missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialEmbeddings {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed: Vec<usize>,
}

impl PartialEmbeddings {
    fn pending(len: usize) -> Self {
        Self {
            vectors: vec![None; len],
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.vectors.iter().all(Option::is_some)
    }

    pub fn succeeded(&self) -> usize {
        self.vectors.iter().filter(|vector| vector.is_some()).count()
    }
}

/// Batching, timeouts, validation and normalization in front of a provider.
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    config: GatewayConfig,
}

impl std::fmt::Debug for EmbeddingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGateway")
            .field("model", &self.provider.model_name())
            .field("dimensions", &self.provider.dimensions())
            .field("config", &self.config)
            .finish()
    }
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: GatewayConfig) -> Self {
        Self { provider, config }
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut partial = PartialEmbeddings::pending(texts.len());
        let indices: Vec<usize> = (0..texts.len()).collect();
        let reason = self.embed_indices(texts, &indices, &mut partial).await;
        finish(partial, reason)
    }

    /// Re-embeds only the inputs listed in `partial.failed`.
    pub async fn retry_failed(
        &self,
        texts: &[String],
        mut partial: PartialEmbeddings,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if partial.vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidVector(format!(
                "partial result covers {} inputs, retry got {}",
                partial.vectors.len(),
                texts.len()
            )));
        }

        let failed = std::mem::take(&mut partial.failed);
        debug!(count = failed.len(), "retrying failed embeddings");
        let reason = self.embed_indices(texts, &failed, &mut partial).await;
        finish(partial, reason)
    }

    pub async fn embed_with_retry(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut attempt = 1;
        let mut outcome = self.embed_batch(texts).await;

        loop {
            match outcome {
                Err(EmbeddingError::Partial { partial, reason }) => {
                    if attempt >= self.config.retry.max_attempts {
                        return Err(EmbeddingError::Exhausted {
                            attempts: attempt,
                            failed: partial.failed,
                            reason,
                        });
                    }
                    let delay = self.config.retry.backoff(attempt);
                    warn!(
                        attempt,
                        failed = partial.failed.len(),
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "embedding batch incomplete, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    outcome = self.retry_failed(texts, partial).await;
                }
                other => return other,
            }
        }
    }

    pub async fn embed_query(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        self.embed_query_within(text, self.config.timeout).await
    }

    /// Embeds a query, giving up after `budget` or the gateway timeout,
    /// whichever is shorter.
    pub async fn embed_query_within(
        &self,
        text: &str,
        budget: Duration,
    ) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let limit = budget.min(self.config.timeout);
        let inputs = [text.to_string()];
        let vectors = tokio::time::timeout(limit, self.provider.embed(&inputs))
            .await
            .map_err(|_| EmbeddingError::Timeout(limit))??;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            EmbeddingError::Provider(ProviderError::Response {
                provider: self.provider.model_name().to_string(),
                details: "empty embedding response".to_string(),
            })
        })?;
        self.prepare(vector)
    }

    async fn embed_indices(
        &self,
        texts: &[String],
        indices: &[usize],
        partial: &mut PartialEmbeddings,
    ) -> Option<String> {
        let mut reason = None;

        for batch in indices.chunks(self.config.max_batch_size) {
            let inputs: Vec<String> = batch.iter().map(|&index| texts[index].clone()).collect();
            let response =
                tokio::time::timeout(self.config.timeout, self.provider.embed(&inputs)).await;

            let failure = match response {
                Ok(Ok(vectors)) if vectors.len() == inputs.len() => {
                    for (&index, vector) in batch.iter().zip(vectors) {
                        match self.prepare(vector) {
                            Ok(vector) => partial.vectors[index] = Some(vector),
                            Err(error) => {
                                partial.failed.push(index);
                                reason = Some(error.to_string());
                            }
                        }
                    }
                    None
                }
                Ok(Ok(vectors)) => Some(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    inputs.len()
                )),
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some(EmbeddingError::Timeout(self.config.timeout).to_string()),
            };

            if let Some(failure) = failure {
                warn!(batch = batch.len(), reason = %failure, "embedding batch failed");
                partial.failed.extend_from_slice(batch);
                reason = Some(failure);
            }
        }

        partial.failed.sort_unstable();
        reason
    }

    fn prepare(&self, mut vector: Vec<f32>) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let expected = self.provider.dimensions();
        if vector.len() != expected {
            return Err(EmbeddingError::InvalidVector(format!(
                "expected {expected} dimensions, got {}",
                vector.len()
            )));
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(EmbeddingError::InvalidVector(
                "vector contains non-finite values".to_string(),
            ));
        }
        normalize_vector(&mut vector);
        Ok(vector)
    }
}

fn finish(
    partial: PartialEmbeddings,
    reason: Option<String>,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
    if !partial.is_complete() {
        return Err(EmbeddingError::Partial {
            reason: reason.unwrap_or_else(|| "embeddings missing".to_string()),
            partial,
        });
    }
    Ok(partial.vectors.into_iter().flatten().collect())
}

/// Scales to unit length; the zero vector is left as is.
pub fn normalize_vector(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Embeds each text as `[len, 1, 0]` and fails any batch containing a
    /// text listed in `poisoned` for the first `poison_calls` calls.
    struct ScriptedProvider {
        calls: AtomicUsize,
        poison_calls: usize,
        poisoned: Vec<&'static str>,
        seen: Mutex<Vec<Vec<String>>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                poison_calls: usize::MAX,
                poisoned: Vec::new(),
                seen: Mutex::new(Vec::new()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(texts.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let poisoned = texts
                .iter()
                .any(|text| self.poisoned.contains(&text.as_str()));
            if poisoned && call < self.poison_calls {
                return Err(ProviderError::Unavailable("scripted outage".to_string()));
            }
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, 1.0, 0.0])
                .collect())
        }
    }

    fn texts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn gateway(provider: ScriptedProvider, batch: usize) -> (EmbeddingGateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let config = GatewayConfig {
            max_batch_size: batch,
            timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
        };
        (EmbeddingGateway::new(provider.clone(), config), provider)
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_one("Hydraulic pressure and flow");
        let second = embedder.embed_one("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_one("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn batches_keep_input_order_and_normalize() {
        let (gateway, provider) = gateway(ScriptedProvider::new(), 2);
        let inputs = texts(&["a", "bbb", "cc", "dddd", "e"]);
        let vectors = gateway.embed_batch(&inputs).await.unwrap();

        assert_eq!(vectors.len(), 5);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        for (text, vector) in inputs.iter().zip(&vectors) {
            let norm: f32 = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
            let expected = text.len() as f32 / ((text.len() * text.len()) as f32 + 1.0).sqrt();
            assert!((vector[0] - expected).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn failed_batch_reports_exact_indices() {
        let mut provider = ScriptedProvider::new();
        provider.poisoned = vec!["bad"];
        let (gateway, _) = gateway(provider, 2);
        let inputs = texts(&["ok", "fine", "bad", "good", "last"]);

        match gateway.embed_batch(&inputs).await {
            Err(EmbeddingError::Partial { partial, .. }) => {
                assert_eq!(partial.failed, vec![2, 3]);
                assert_eq!(partial.vectors.len(), 5);
                assert!(partial.vectors[0].is_some());
                assert!(partial.vectors[2].is_none());
                assert!(partial.vectors[4].is_some());
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_only_resends_failed_inputs() {
        let mut provider = ScriptedProvider::new();
        provider.poisoned = vec!["bad"];
        provider.poison_calls = 2;
        let (gateway, provider) = gateway(provider, 2);
        let inputs = texts(&["ok", "bad", "fine"]);

        let partial = match gateway.embed_batch(&inputs).await {
            Err(EmbeddingError::Partial { partial, .. }) => partial,
            other => panic!("expected partial failure, got {other:?}"),
        };
        assert_eq!(partial.failed, vec![0, 1]);

        let vectors = gateway.retry_failed(&inputs, partial).await.unwrap();
        assert_eq!(vectors.len(), 3);
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.last().unwrap(), &texts(&["ok", "bad"]));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut provider = ScriptedProvider::new();
        provider.poisoned = vec!["bad"];
        let (gateway, _) = gateway(provider, 8);
        let inputs = texts(&["bad", "ok"]);

        match gateway.embed_with_retry(&inputs).await {
            Err(EmbeddingError::Exhausted { attempts, failed, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(failed, vec![0, 1]);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_failures_recover_with_retry() {
        let mut provider = ScriptedProvider::new();
        provider.poisoned = vec!["flaky"];
        provider.poison_calls = 1;
        let (gateway, _) = gateway(provider, 8);
        let vectors = gateway
            .embed_with_retry(&texts(&["flaky", "ok"]))
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let mut provider = ScriptedProvider::new();
        provider.delay = Some(Duration::from_millis(200));
        let provider = Arc::new(provider);
        let gateway = EmbeddingGateway::new(
            provider,
            GatewayConfig {
                timeout: Duration::from_millis(20),
                ..GatewayConfig::default()
            },
        );

        assert!(matches!(
            gateway.embed_query("query").await,
            Err(EmbeddingError::Timeout(_))
        ));
        match gateway.embed_batch(&texts(&["one", "two"])).await {
            Err(EmbeddingError::Partial { partial, reason }) => {
                assert_eq!(partial.failed, vec![0, 1]);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let gateway = EmbeddingGateway::new(
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            GatewayConfig::default(),
        );
        assert!(gateway.prepare(vec![1.0; 4]).is_err());
        assert!(gateway.prepare(vec![f32::NAN; 8]).is_err());
        assert_eq!(gateway.prepare(vec![0.0; 8]).unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn http_response_is_reordered_by_index() {
        let provider = HttpEmbeddingProvider::new(
            Url::parse("http://localhost:9/v1/embeddings").unwrap(),
            "test-model",
            2,
        )
        .unwrap();
        let response: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        )
        .unwrap();
        let vectors = provider.parse_response(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        let short: EmbeddingResponse =
            serde_json::from_str(r#"{"data":[{"index":0,"embedding":[1.0,0.0]}]}"#).unwrap();
        assert!(provider.parse_response(short, 2).is_err());
    }
}
