//! Optional embedding-backed nearest-neighbour index.
//!
//! The index only exists when its backend answered a probe at construction time; callers
//! hold an `Option<SemanticIndex>` and fall back to lexical ranking when it is `None`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobscope_core::JobRecord;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{IndexError, ScoredDoc};

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;

    /// Cheap reachability check run once when the index is built.
    async fn probe(&self) -> Result<(), IndexError> {
        let vectors = self.embed(&["probe".to_string()]).await?;
        match vectors.first() {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(IndexError::Unavailable("backend returned no vector".into())),
        }
    }
}

/// Ollama-compatible `POST {url}/api/embed`.
pub struct OllamaEmbeddingBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingBackend {
    pub fn new(url: &str, model: &str, timeout: Duration) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_retries: 2,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbeddingBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let endpoint = format!("{}/api/embed", self.url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
            let response = match self.client.post(&endpoint).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(IndexError::Unavailable(format!(
                        "cannot reach embedding backend at {}: {e}",
                        self.url
                    )));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: EmbedResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::Backend(format!("invalid embed response: {e}")))?;
                if parsed.embeddings.len() != texts.len() {
                    return Err(IndexError::Backend(format!(
                        "expected {} embeddings, got {}",
                        texts.len(),
                        parsed.embeddings.len()
                    )));
                }
                return Ok(parsed.embeddings);
            }

            let text = response.text().await.unwrap_or_default();
            let err = IndexError::Backend(format!("embed request failed ({status}): {text}"));
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| IndexError::Unavailable("embedding failed".into())))
    }
}

/// Returns 0.0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

pub struct SemanticIndex {
    backend: Arc<dyn EmbeddingBackend>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    unavailable_logged: AtomicBool,
}

impl SemanticIndex {
    /// Probes the backend once; `None` means the capability is absent for this process.
    pub async fn connect(backend: Arc<dyn EmbeddingBackend>) -> Option<Self> {
        match backend.probe().await {
            Ok(()) => {
                info!(model = backend.model_name(), "semantic index enabled");
                Some(Self::with_backend(backend))
            }
            Err(err) => {
                warn!(error = %err, "semantic index disabled; ranking is lexical-only");
                None
            }
        }
    }

    /// Skips the probe.
    pub fn with_backend(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            vectors: RwLock::new(HashMap::new()),
            unavailable_logged: AtomicBool::new(false),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        self.backend
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Backend("backend returned no vector".into()))
    }

    pub async fn insert_vector(&self, fingerprint: &str, vector: Vec<f32>) {
        self.vectors
            .write()
            .await
            .insert(fingerprint.to_string(), vector);
    }

    /// Embeds the record and keeps the vector; the caller may persist the returned copy.
    pub async fn index(&self, record: &JobRecord) -> Result<Vec<f32>, IndexError> {
        let vector = self.embed(&record.indexable_text()).await?;
        self.insert_vector(&record.fingerprint, vector.clone()).await;
        Ok(vector)
    }

    pub async fn remove(&self, fingerprint: &str) -> bool {
        self.vectors.write().await.remove(fingerprint).is_some()
    }

    pub async fn clear(&self) {
        self.vectors.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn nearest(&self, vector: &[f32], k: usize) -> Vec<ScoredDoc> {
        if k == 0 {
            return Vec::new();
        }
        let vectors = self.vectors.read().await;
        let mut ranked = vectors
            .iter()
            .map(|(fingerprint, candidate)| ScoredDoc {
                fingerprint: fingerprint.clone(),
                score: f64::from(cosine_similarity(vector, candidate)),
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        ranked.truncate(k);
        ranked
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredDoc>, IndexError> {
        if query.trim().is_empty() || self.is_empty().await {
            return Ok(Vec::new());
        }
        let vector = self.embed(query).await?;
        Ok(self.nearest(&vector, k).await)
    }

    /// First failure is a warning, repeats go to debug.
    pub fn note_unavailable(&self, err: &IndexError) {
        if self.unavailable_logged.swap(true, AtomicOrdering::Relaxed) {
            debug!(error = %err, "semantic index still unavailable");
        } else {
            warn!(error = %err, "semantic index unavailable; degrading to lexical ranking");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::job;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic bag-of-keywords embedding over a tiny vocabulary.
    pub(crate) struct KeywordBackend {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    const VOCAB: [&str; 4] = ["python", "react", "kubernetes", "data"];

    impl KeywordBackend {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for KeywordBackend {
        fn model_name(&self) -> &str {
            "keywords"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail {
                return Err(IndexError::Unavailable("offline".into()));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    let lowered = text.to_lowercase();
                    let mut v = VOCAB
                        .iter()
                        .map(|w| if lowered.contains(w) { 1.0 } else { 0.0 })
                        .collect::<Vec<f32>>();
                    v.push(0.1);
                    v
                })
                .collect())
        }
    }

    #[test]
    fn cosine_handles_identity_orthogonality_and_bad_input() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn unreachable_backend_yields_no_index() {
        let backend = Arc::new(KeywordBackend::failing());
        assert!(SemanticIndex::connect(backend).await.is_none());
    }

    #[tokio::test]
    async fn nearest_neighbours_follow_cosine_similarity() {
        let index = SemanticIndex::connect(Arc::new(KeywordBackend::new()))
            .await
            .expect("reachable");
        index
            .index(&job("py", "Python developer", "", 9))
            .await
            .expect("embed");
        index
            .index(&job("fe", "React developer", "", 9))
            .await
            .expect("embed");

        let hits = index.search("python", 2).await.expect("search");
        assert_eq!(hits[0].fingerprint, "py");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn empty_index_does_not_call_the_backend() {
        let backend = Arc::new(KeywordBackend::new());
        let index = SemanticIndex::with_backend(backend.clone());
        assert!(index.search("python", 5).await.expect("search").is_empty());
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 0);
    }
}
