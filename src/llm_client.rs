//! The external LLM oracle: embedding generation and free-text completion.
//!
//! Both operations are out-of-scope black boxes per spec.md §1 — this module
//! only defines the contract (spec.md §6) and a thin HTTP implementation,
//! grounded on the teacher's `embedding_integration.rs` wrapping of an
//! external embedding-service provider. Failures never raise: `embed`
//! returns `None`, `generate_response` returns an empty string, and callers
//! fall through to their documented default.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Embedding + free-text generation oracle. Out of scope to implement for
/// real; production callers plug in an `HttpLlmClient` pointed at their
/// inference endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Best-effort embedding. `None` on any failure.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;

    /// Best-effort batched embedding, one slot per input, failures as `None`.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await);
        }
        out
    }

    /// Free-text completion. Returns an empty string on failure so callers
    /// can feed it straight into the tolerant JSON parser, which will
    /// correctly yield `None`.
    async fn generate_response(&self, prompt: &str, temperature: f32, max_tokens: u32) -> String;
}

/// HTTP-backed oracle, grounded on the teacher's Ollama-style embedding
/// provider (`embedding_integration.rs`).
pub struct HttpLlmClient {
    http: reqwest::Client,
    embed_url: String,
    generate_url: String,
    model_name: String,
    /// Pins the embedding dimension on the first successful call, per
    /// spec.md §4.A ("fixed across the process lifetime").
    pinned_dimension: AtomicUsize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::new(),
            embed_url: format!("{base_url}/api/embeddings"),
            generate_url: format!("{base_url}/api/generate"),
            model_name: model_name.into(),
            pinned_dimension: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model_name, "prompt": text });
        let resp = match self.http.post(&self.embed_url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("embedding request failed: {e}");
                return None;
            }
        };

        let parsed: EmbedResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!("embedding response decode failed: {e}");
                return None;
            }
        };

        let pinned = self.pinned_dimension.load(Ordering::Relaxed);
        if pinned == 0 {
            self.pinned_dimension
                .store(parsed.embedding.len(), Ordering::Relaxed);
        } else if pinned != parsed.embedding.len() {
            warn!(
                "embedding dimension mismatch: pinned {pinned}, got {}",
                parsed.embedding.len()
            );
            return None;
        }

        Some(parsed.embedding)
    }

    async fn generate_response(&self, prompt: &str, temperature: f32, max_tokens: u32) -> String {
        let body = serde_json::json!({
            "model": self.model_name,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": temperature, "num_predict": max_tokens },
        });

        let resp = match self.http.post(&self.generate_url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("generate_response request failed: {e}");
                return String::new();
            }
        };

        match resp.json::<GenerateResponse>().await {
            Ok(p) => p.response,
            Err(e) => {
                warn!("generate_response decode failed: {e}");
                String::new()
            }
        }
    }
}

/// Deterministic, hash-based oracle for tests: never fails, never calls the
/// network, and produces embeddings that are stable for a given input.
#[cfg(any(test, feature = "test-support"))]
pub struct MockLlmClient {
    pub dimension: usize,
    pub canned_response: std::sync::Mutex<Option<String>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MockLlmClient {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            canned_response: std::sync::Mutex::new(None),
        }
    }

    pub fn set_canned_response(&self, response: impl Into<String>) {
        *self.canned_response.lock().unwrap() = Some(response.into());
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl LlmClient for MockLlmClient {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        let mut v = Vec::with_capacity(self.dimension);
        let mut state = seed;
        for _ in 0..self.dimension {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            v.push(((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        Some(v)
    }

    async fn generate_response(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> String {
        self.canned_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
    }
}
