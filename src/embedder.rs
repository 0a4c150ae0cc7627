//! Lazy, single-flight embedding model wrapper. Spec.md §4.1.

use crate::errors::{AppError, AppResult};
use model2vec_rs::model::StaticModel;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

pub struct Embedder {
    model_id: String,
    cache_dir: PathBuf,
    dim: usize,
    batch_size: usize,
    /// `OnceCell::get_or_try_init` is itself single-flight: concurrent first
    /// callers await the same in-flight future, and an `Err` leaves the cell
    /// empty so the next call retries — exactly spec.md §4.1's contract.
    /// Wrapped in a `Mutex` so a failed init can be swapped out for a fresh
    /// empty cell (`OnceCell` has no public "reset" once it observes `Err`
    /// from `get_or_try_init` it does reset itself, but we hold the `Mutex`
    /// to serialize that replace against concurrent reads of `model`).
    model: Mutex<Arc<OnceCell<StaticModel>>>,
}

impl Embedder {
    pub fn new(model_id: String, cache_dir: PathBuf, dim: usize, batch_size: usize) -> Self {
        Self {
            model_id,
            cache_dir,
            dim,
            batch_size: batch_size.max(1),
            model: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    async fn model(&self) -> AppResult<Arc<OnceCell<StaticModel>>> {
        let cell = self.model.lock().await.clone();
        let model_id = self.model_id.clone();
        let cache_dir = self.cache_dir.clone();
        let init_result = cell
            .get_or_try_init(|| async move {
                tracing::debug!(model = %model_id, cache_dir = %cache_dir.display(), "loading embedding model");
                let start = std::time::Instant::now();
                let loaded = tokio::task::spawn_blocking(move || {
                    StaticModel::from_pretrained(&model_id, None, None, None)
                })
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string());
                match &loaded {
                    Ok(_) => tracing::info!(elapsed = ?start.elapsed(), "embedding model loaded"),
                    Err(cause) => tracing::warn!(%cause, "embedding model load failed"),
                }
                loaded
            })
            .await;

        match init_result {
            Ok(_) => Ok(cell),
            Err(cause) => {
                // Replace the poisoned-by-convention cell so the next call retries.
                let mut guard = self.model.lock().await;
                *guard = Arc::new(OnceCell::new());
                Err(AppError::embedding_failure(&self.cache_dir, cause))
            }
        }
    }

    /// Embed a single piece of text. Empty text yields a zero vector without
    /// touching the model (spec.md §4.1 boundary behavior).
    pub async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dim]);
        }
        let cell = self.model().await?;
        let dim = self.dim;
        let model_ref: &StaticModel = cell.get().expect("initialized above");
        let vector = model_ref.encode_single(text);
        Ok(resize(vector, dim))
    }

    /// Embed many texts, preserving order, processed in groups of the
    /// configured batch size (reference: 8).
    pub async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for group in texts.chunks(self.batch_size) {
            for text in group {
                out.push(self.embed(text).await?);
            }
        }
        Ok(out)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

fn resize(mut v: Vec<f32>, dim: usize) -> Vec<f32> {
    v.resize(dim, 0.0);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_text_yields_zero_vector_without_loading_model() {
        let embedder = Embedder::new(
            "nonexistent/model-that-would-fail-to-load".to_string(),
            std::env::temp_dir(),
            384,
            8,
        );
        let v = embedder.embed("").await.unwrap();
        assert_eq!(v, vec![0.0; 384]);
        let v2 = embedder.embed("   \n\t ").await.unwrap();
        assert_eq!(v2.len(), 384);
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_output() {
        let embedder = Embedder::new("m".to_string(), std::env::temp_dir(), 384, 8);
        let out = embedder.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }
}
