//! Sentence embeddings for retrieval.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EmbeddingConfig;

/// Text → fixed-length vector. Identical input must give identical output.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| anyhow!("embedder returned no vector"))
    }
}

/// Build the embedder selected by config: remote when a base URL is set.
pub fn from_config(cfg: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match cfg.base_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Ok(Box::new(HttpEmbedder::new(url, &cfg.model, cfg.api_key.clone())?)),
        None => Ok(Box::new(HashingEmbedder::new(cfg.dimensions))),
    }
}

// ─── Local feature hashing ──────────────────────────────────────────────────

/// Signed feature hashing over lowercased word tokens, L2-normalised.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

// ─── Remote /embeddings ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: Client::builder().timeout(Duration::from_secs(30)).build()?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Embedding {} texts via {}", texts.len(), self.endpoint);

        let mut req = self.http.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("embedding request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "embedding HTTP {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            );
        }

        let mut parsed: EmbeddingResponse = resp.json().await.context("bad embedding payload")?;
        if parsed.data.len() != texts.len() {
            anyhow::bail!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            );
        }
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

// ─── Ranking ────────────────────────────────────────────────────────────────

/// Cosine similarity; 0.0 for mismatched, empty or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let sim = dot / (na * nb);
    if sim.is_nan() {
        0.0
    } else {
        sim
    }
}

/// Indices of the `k` candidates most similar to `query`, best first.
/// Exact ties keep candidate order.
pub fn rank_top_k(query: &[f32], candidates: &[Vec<f32>], k: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, c)))
        .collect();
    // sort_by is stable.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().take(k).map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn hashing_is_deterministic_and_normalised() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_text("A man walks a dog");
        let b = e.embed_text("a man walks a DOG");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed_text("  ... ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ranking_is_stable_on_ties() {
        let q = vec![1.0, 0.0];
        let cands = vec![
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![2.0, 0.0],
            vec![1.0, 1.0],
        ];
        assert_eq!(rank_top_k(&q, &cands, 3), vec![1, 2, 3]);
        assert_eq!(rank_top_k(&q, &cands, 10).len(), 4);
    }

    #[test]
    fn related_text_ranks_first() {
        let e = HashingEmbedder::new(256);
        let docs = [
            "a red car parked on the street",
            "two dogs playing in the park",
            "a person carrying a backpack",
        ];
        let vecs: Vec<Vec<f32>> = docs.iter().map(|d| e.embed_text(d)).collect();
        let q = e.embed_text("were there any dogs in the park");
        assert_eq!(rank_top_k(&q, &vecs, 1), vec![1]);
    }

    #[tokio::test]
    async fn http_embedder_orders_by_index() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/embeddings")
                    .header("authorization", "Bearer secret")
                    .body_contains(r#""input":["first","second"]"#);
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#);
            })
            .await;

        let e = HttpEmbedder::new(&server.base_url(), "m", Some("secret".into())).unwrap();
        let out = e
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_embedder_surfaces_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(500).body("boom");
            })
            .await;

        let e = HttpEmbedder::new(&server.base_url(), "m", None).unwrap();
        assert!(e.embed("x").await.is_err());
    }

    #[tokio::test]
    async fn http_embedder_rejects_count_mismatch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"data":[{"index":0,"embedding":[1.0]}]}"#);
            })
            .await;

        let e = HttpEmbedder::new(&server.base_url(), "m", None).unwrap();
        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(e.embed_batch(&texts).await.is_err());
    }
}
