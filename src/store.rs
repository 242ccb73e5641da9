use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::llm::LlmProvider;
use crate::loader::ChunkMetadata;

pub const EMBEDDING_DIM: usize = 1536;
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Default, Serialize, Deserialize)]
struct IndexState {
    documents: Vec<String>,
    metadata: Vec<ChunkMetadata>,
    /// L2-normalized embeddings, so cosine similarity is a dot product.
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    embedding_model: String,
    embedding_dim: usize,
    document_count: usize,
    #[serde(flatten)]
    state: IndexState,
}

/// Exact-scan cosine similarity store over provider embeddings, persisted
/// as JSON alongside the documents it indexes.
pub struct VectorStore {
    provider: Arc<dyn LlmProvider>,
    embedding_model: String,
    index_dir: PathBuf,
    state: RwLock<IndexState>,
}

impl VectorStore {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        embedding_model: impl Into<String>,
        index_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            embedding_model: embedding_model.into(),
            index_dir: index_dir.into(),
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Embed and index `documents`, then persist the result.
    pub async fn build_index(
        &self,
        documents: Vec<String>,
        metadata: Vec<ChunkMetadata>,
    ) -> Result<()> {
        if documents.len() != metadata.len() {
            return Err(Error::Pipeline(
                "documents and metadata lists must have the same length".to_string(),
            ));
        }
        info!("building vector index for {} documents", documents.len());

        let vectors = self.embed(&documents).await?;

        {
            let mut state = self.state.write().await;
            state.documents = documents;
            state.metadata = metadata;
            state.vectors = vectors;
            info!("vector index built with {} vectors", state.vectors.len());
        }

        self.save().await
    }

    /// Restore a persisted index. Returns false when no usable index is on
    /// disk; an embedding-model mismatch loads with a warning.
    pub async fn load(&self) -> Result<bool> {
        let path = self.index_dir.join(INDEX_FILE);
        if !path.exists() {
            info!("index file not found, index not loaded");
            return Ok(false);
        }

        let contents = tokio::fs::read_to_string(&path).await?;
        let persisted: PersistedIndex = serde_json::from_str(&contents)
            .map_err(|e| Error::Pipeline(format!("index decode: {e}")))?;

        let state = persisted.state;
        if state.documents.len() != state.metadata.len()
            || state.documents.len() != state.vectors.len()
        {
            warn!("inconsistent index state, rebuild required");
            return Ok(false);
        }
        if persisted.embedding_model != self.embedding_model {
            warn!(
                "embedding model mismatch: expected {}, got {}",
                self.embedding_model, persisted.embedding_model
            );
        }

        let count = state.documents.len();
        *self.state.write().await = state;
        info!("loaded index with {count} vectors");
        Ok(true)
    }

    async fn save(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.index_dir).await?;

        let state = self.state.read().await;
        let persisted = PersistedIndex {
            embedding_model: self.embedding_model.clone(),
            embedding_dim: state.vectors.first().map_or(EMBEDDING_DIM, Vec::len),
            document_count: state.documents.len(),
            state: IndexState {
                documents: state.documents.clone(),
                metadata: state.metadata.clone(),
                vectors: state.vectors.clone(),
            },
        };
        drop(state);

        let json = serde_json::to_string(&persisted)
            .map_err(|e| Error::Pipeline(format!("index encode: {e}")))?;
        let path = self.index_dir.join(INDEX_FILE);
        tokio::fs::write(&path, json).await?;

        info!("index saved to {}", self.index_dir.display());
        Ok(())
    }

    /// Top-`k` documents by cosine similarity to `query`, optionally
    /// filtered to market-context chunks above a confidence floor. The scan
    /// over-fetches 3k candidates so filtering doesn't starve the result.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter_market_context: bool,
        min_confidence: f32,
    ) -> Result<Vec<SearchResult>> {
        if !self.is_indexed().await {
            warn!("vector store not initialized");
            return Ok(Vec::new());
        }

        // Embed outside the lock so a slow provider never blocks writers.
        let query_vec = {
            let embedded = self.embed(std::slice::from_ref(&query.to_string())).await?;
            embedded
                .into_iter()
                .next()
                .ok_or_else(|| Error::Parse("empty query embedding".to_string()))?
        };

        let state = self.state.read().await;

        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(&query_vec, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let search_k = (k * 3).min(state.documents.len());
        let mut results = Vec::new();
        for (idx, score) in scored.into_iter().take(search_k) {
            let metadata = &state.metadata[idx];
            if filter_market_context && !metadata.is_market_context {
                continue;
            }
            if metadata.confidence_score < min_confidence {
                continue;
            }

            results.push(SearchResult {
                document: state.documents[idx].clone(),
                metadata: metadata.clone(),
                score,
            });
            if results.len() >= k {
                break;
            }
        }

        info!(
            "retrieved {} similar documents (filtered from {search_k} candidates)",
            results.len()
        );
        Ok(results)
    }

    pub async fn is_indexed(&self) -> bool {
        !self.state.read().await.documents.is_empty()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Larger corpora use smaller batches to stay under provider input
        // limits.
        let batch_size = if texts.len() <= 1000 {
            texts.len().clamp(1, 100)
        } else {
            50
        };

        let mut vectors = self
            .provider
            .get_embeddings(texts, &self.embedding_model, batch_size)
            .await?;
        for vector in &mut vectors {
            normalize(vector);
        }
        Ok(vectors)
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
