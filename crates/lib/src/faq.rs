//! Semantic FAQ index: remote question→answer table, local cache, and
//! embedding-based best-match lookup.
//!
//! The remote resource is a JSON object of question→answer pairs. The local
//! cache is refreshed whenever its SHA-256 differs from the remote body.
//! Entry embeddings are computed once per (re)load and kept alongside the
//! entries; lookups embed only the query.

use crate::embedding::Embedder;
use crate::llm::ProviderError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Similarity at or above this is a FAQ hit.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

/// One question→answer pair from the FAQ store.
#[derive(Debug, Clone, PartialEq)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FaqError {
    /// Remote unreachable and no local cache has ever been established.
    #[error("faq store unavailable: {0}")]
    Unavailable(String),
    #[error("reading faq cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing faq store: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Entry plus its cached question embedding. A `None` vector means the
/// embedding failed at warm time; the entry is skipped during scans.
struct WarmEntry {
    entry: FaqEntry,
    vector: Option<Vec<f32>>,
}

struct IndexState {
    /// SHA-256 of the cached file content, once established.
    hash: Option<[u8; 32]>,
    entries: Vec<WarmEntry>,
    loaded: bool,
}

/// FAQ index: refresh-if-stale against a remote JSON resource, cosine
/// best-match over cached entry embeddings.
pub struct FaqIndex {
    remote_url: String,
    cache_path: PathBuf,
    threshold: f32,
    fetch_timeout: Duration,
    embedder: Arc<dyn Embedder>,
    client: reqwest::Client,
    /// Serializes cache refresh (read-modify-write of the cache file).
    state: Mutex<IndexState>,
}

impl FaqIndex {
    pub fn new(
        remote_url: impl Into<String>,
        cache_path: PathBuf,
        threshold: f32,
        fetch_timeout: Duration,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            remote_url: remote_url.into(),
            cache_path,
            threshold,
            fetch_timeout,
            embedder,
            client: reqwest::Client::new(),
            state: Mutex::new(IndexState {
                hash: None,
                entries: Vec::new(),
                loaded: false,
            }),
        }
    }

    /// Fetch the remote store, compare hashes, and reload the cache when it
    /// changed (or was never loaded). When the remote is unreachable the
    /// existing cache keeps serving; only a cold start with no cache fails.
    pub async fn refresh_if_stale(&self) -> Result<(), FaqError> {
        let mut state = self.state.lock().await;

        // No remote configured: serve whatever local cache exists, or nothing.
        if self.remote_url.is_empty() {
            if !state.loaded {
                if let Ok(bytes) = tokio::fs::read(&self.cache_path).await {
                    let entries = parse_entries(&bytes)?;
                    state.entries = self.warm(entries).await;
                }
                state.loaded = true;
            }
            return Ok(());
        }

        let remote = match self.fetch_remote().await {
            Ok(bytes) => bytes,
            Err(e) => {
                if state.loaded {
                    log::warn!("faq refresh failed, serving cached entries: {}", e);
                    return Ok(());
                }
                // Cold start: fall back to a cache left by a previous run.
                match tokio::fs::read(&self.cache_path).await {
                    Ok(bytes) => {
                        log::warn!("faq remote unreachable, loading local cache: {}", e);
                        let entries = parse_entries(&bytes)?;
                        state.hash = Some(content_hash(&bytes));
                        state.entries = self.warm(entries).await;
                        state.loaded = true;
                        return Ok(());
                    }
                    Err(_) => return Err(FaqError::Unavailable(e)),
                }
            }
        };

        let remote_hash = content_hash(&remote);
        let local_hash = match state.hash {
            Some(h) => Some(h),
            None => match tokio::fs::read(&self.cache_path).await {
                Ok(bytes) => Some(content_hash(&bytes)),
                Err(_) => None,
            },
        };

        if state.loaded && local_hash == Some(remote_hash) {
            return Ok(());
        }

        if local_hash != Some(remote_hash) {
            if let Some(parent) = self.cache_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&self.cache_path, &remote).await?;
            log::info!(
                "faq cache updated ({} bytes) at {}",
                remote.len(),
                self.cache_path.display()
            );
        }

        let entries = parse_entries(&remote)?;
        log::info!("warming embeddings for {} faq entries", entries.len());
        state.entries = self.warm(entries).await;
        state.hash = Some(remote_hash);
        state.loaded = true;
        Ok(())
    }

    /// Best stored question for `query`, with its similarity score.
    /// Returns `None` below the threshold. Ties keep the first entry seen
    /// (file order).
    pub async fn best_match(&self, query: &str) -> Result<Option<(FaqEntry, f32)>, ProviderError> {
        let query_vector = self.embedder.embed(query).await?;
        let state = self.state.lock().await;
        let mut best: Option<(&FaqEntry, f32)> = None;
        for warm in &state.entries {
            let Some(ref vector) = warm.vector else {
                continue;
            };
            let score = cosine_similarity(&query_vector, vector);
            match best {
                Some((_, s)) if score <= s => {}
                _ => best = Some((&warm.entry, score)),
            }
        }
        Ok(best
            .filter(|(_, score)| *score >= self.threshold)
            .map(|(entry, score)| (entry.clone(), score)))
    }

    /// Number of entries currently loaded (failed-embedding entries included).
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn fetch_remote(&self) -> Result<Vec<u8>, String> {
        let res = self
            .client
            .get(&self.remote_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            return Err(format!("faq fetch failed: {}", res.status()));
        }
        res.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| e.to_string())
    }

    /// Embed every question once. A failed embedding never aborts the warm;
    /// the entry is kept without a vector and skipped during scans.
    async fn warm(&self, entries: Vec<FaqEntry>) -> Vec<WarmEntry> {
        let mut warmed = Vec::with_capacity(entries.len());
        for entry in entries {
            let vector = match self.embedder.embed(&entry.question).await {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!("embedding faq question failed, skipping entry: {}", e);
                    None
                }
            };
            warmed.push(WarmEntry { entry, vector });
        }
        warmed
    }
}

/// Parse the remote JSON object of question→answer pairs, preserving the
/// file's insertion order (tie-break is first-seen).
fn parse_entries(bytes: &[u8]) -> Result<Vec<FaqEntry>, serde_json::Error> {
    let map: serde_json::Map<String, Value> = serde_json::from_slice(bytes)?;
    Ok(map
        .into_iter()
        .filter_map(|(question, answer)| {
            answer.as_str().map(|a| FaqEntry {
                question,
                answer: a.to_string(),
            })
        })
        .collect())
}

fn content_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Cosine similarity: dot product over the product of magnitudes. Zero for
/// mismatched lengths or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Deterministic embedder: fixed vector per known text, error otherwise.
    struct TableEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for TableEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| ProviderError::Api("unknown text".to_string()))
        }
    }

    fn index_with(
        entries: &[(&str, &str)],
        vectors: HashMap<String, Vec<f32>>,
        dir: &std::path::Path,
    ) -> FaqIndex {
        let cache_path = dir.join("faq.json");
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(q, a)| (q.to_string(), Value::String(a.to_string())))
            .collect();
        std::fs::write(&cache_path, serde_json::to_vec(&map).unwrap()).unwrap();
        FaqIndex::new(
            // Unroutable remote: refresh must fall back to the local cache.
            "http://127.0.0.1:1/faq.json",
            cache_path,
            DEFAULT_SIMILARITY_THRESHOLD,
            Duration::from_millis(500),
            Arc::new(TableEmbedder { vectors }),
        )
    }

    #[test]
    fn cosine_identity_and_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[0.0, 1.0, 0.0])).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn parse_preserves_file_order() {
        let entries =
            parse_entries(br#"{"z first": "1", "a second": "2", "m third": "3"}"#).unwrap();
        let questions: Vec<&str> = entries.iter().map(|e| e.question.as_str()).collect();
        assert_eq!(questions, vec!["z first", "a second", "m third"]);
    }

    #[tokio::test]
    async fn verbatim_question_matches_with_similarity_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut vectors = HashMap::new();
        vectors.insert("what is your return policy?".to_string(), vec![1.0, 0.0]);
        vectors.insert("do you ship abroad?".to_string(), vec![0.0, 1.0]);
        let index = index_with(
            &[
                ("what is your return policy?", "30 days."),
                ("do you ship abroad?", "yes, worldwide."),
            ],
            vectors,
            dir.path(),
        );
        index.refresh_if_stale().await.unwrap();

        let (entry, score) = index
            .best_match("what is your return policy?")
            .await
            .unwrap()
            .expect("expected a hit");
        assert_eq!(entry.answer, "30 days.");
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn below_threshold_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut vectors = HashMap::new();
        vectors.insert("opening hours?".to_string(), vec![1.0, 0.0]);
        vectors.insert("unrelated query".to_string(), vec![0.5, 0.87]);
        let index = index_with(&[("opening hours?", "9 to 5")], vectors, dir.path());
        index.refresh_if_stale().await.unwrap();

        assert!(index.best_match("unrelated query").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tie_break_keeps_first_entry_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut vectors = HashMap::new();
        vectors.insert("first question".to_string(), vec![1.0, 0.0]);
        vectors.insert("second question".to_string(), vec![1.0, 0.0]);
        vectors.insert("query".to_string(), vec![1.0, 0.0]);
        let index = index_with(
            &[("first question", "first"), ("second question", "second")],
            vectors,
            dir.path(),
        );
        index.refresh_if_stale().await.unwrap();

        let (entry, _) = index.best_match("query").await.unwrap().unwrap();
        assert_eq!(entry.answer, "first");
    }

    #[tokio::test]
    async fn failed_candidate_embedding_does_not_abort_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut vectors = HashMap::new();
        // "broken question" has no vector: TableEmbedder errors for it.
        vectors.insert("working question".to_string(), vec![1.0, 0.0]);
        vectors.insert("query".to_string(), vec![1.0, 0.0]);
        let index = index_with(
            &[("broken question", "lost"), ("working question", "found")],
            vectors,
            dir.path(),
        );
        index.refresh_if_stale().await.unwrap();
        assert_eq!(index.len().await, 2);

        let (entry, _) = index.best_match("query").await.unwrap().unwrap();
        assert_eq!(entry.answer, "found");
    }

    #[tokio::test]
    async fn cold_start_with_no_cache_fails_hard() {
        let dir = tempfile::tempdir().unwrap();
        let index = FaqIndex::new(
            "http://127.0.0.1:1/faq.json",
            dir.path().join("missing.json"),
            DEFAULT_SIMILARITY_THRESHOLD,
            Duration::from_millis(500),
            Arc::new(TableEmbedder {
                vectors: HashMap::new(),
            }),
        );
        assert!(matches!(
            index.refresh_if_stale().await,
            Err(FaqError::Unavailable(_))
        ));
    }
}
