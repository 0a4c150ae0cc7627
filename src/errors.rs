//! Shared error taxonomy surfaced to the transport layer.
//!
//! Every handler and store operation that can fail in a way the caller needs
//! to distinguish returns `AppError`. Leaf utility code (chunking, path math)
//! still uses `anyhow::Result` and gets wrapped into `AppError::Database` or
//! `AppError::Parse` at the point it crosses into a handler.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("embedding error: {message}")]
    Embedding {
        message: String,
        cache_dir: PathBuf,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rollback failure: insert failed ({insert_cause}); rollback also failed ({rollback_cause})")]
    RollbackFailure {
        insert_cause: String,
        rollback_cause: String,
    },
}

impl AppError {
    /// Build an `EmbeddingError` with the human-facing cache-directory
    /// paragraph spec.md §4.1 requires: names the cache dir, enumerates
    /// probable causes, and recommends concrete next steps.
    pub fn embedding_failure(cache_dir: &std::path::Path, cause: impl std::fmt::Display) -> Self {
        let message = format!(
            "failed to load the embedding model using cache directory {}: {cause}. \
             Probable causes: the HuggingFace Hub is unreachable (no network), \
             insufficient disk space in the cache directory, or a corrupted \
             cache. Recommended actions: retry the request, check network \
             connectivity, or delete the cache directory ({}) and retry.",
            cache_dir.display(),
            cache_dir.display(),
        );
        AppError::Embedding {
            message,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// Validation failures are never retried and bubble straight to the caller.
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    /// True when a delete-path database error message indicates the target
    /// row-set was already absent — spec.md §7: these are swallowed so
    /// `delete_file` stays idempotent.
    pub fn is_benign_delete_miss(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("not found") || lower.contains("does not exist") || lower.contains("no matching")
    }
}

pub type AppResult<T> = Result<T, AppError>;
