//! Request handlers: input validation, pipeline composition, and re-ingest
//! atomicity. Spec.md §4.5.

use crate::chunker::Chunker;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::errors::{AppError, AppResult};
use crate::parser;
use crate::store::{ChunkMetadata, ChunkRow, FileSummary, ListFilters, SearchFilters, StoreStatus, TypeFilter, VectorStore};
use chrono::{DateTime, Duration, Months, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::Mutex;

pub struct Handlers {
    config: Config,
    embedder: Embedder,
    store: VectorStore,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    Replace,
    Append,
    Prepend,
}

pub struct QueryResultItem {
    pub file_path: String,
    pub chunk_index: i32,
    pub text: String,
    pub score: f32,
}

pub struct IngestResult {
    pub file_path: String,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct MemorizeResult {
    pub file_path: String,
    pub label: String,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct UpdateResult {
    pub file_path: String,
    pub label: String,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
}

pub struct DeleteResult {
    pub file_path: String,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct CleanupResult {
    pub deleted_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl Handlers {
    pub fn new(config: Config, embedder: Embedder, store: VectorStore) -> Self {
        Self {
            config,
            embedder,
            store,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, file_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(file_path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn query_documents(
        &self,
        query: &str,
        limit: Option<i64>,
        type_filter: Option<&str>,
        tags: Option<&Value>,
        project: Option<String>,
        min_score: Option<f64>,
    ) -> AppResult<Vec<QueryResultItem>> {
        tracing::debug!(query, "query_documents");
        let limit = validate_limit(limit, 10, 1, 20)?;
        let type_filter = validate_type_filter(type_filter)?;
        let tags = validate_tags(tags)?;
        let min_score = validate_min_score(min_score)?;

        let vector = self.embedder.embed(query).await?;
        let filters = SearchFilters {
            query_text: Some(query.to_string()),
            limit,
            type_filter: Some(type_filter),
            tags,
            project,
            min_score,
        };
        let results = self.store.search(&vector, &filters).await?;
        Ok(results
            .into_iter()
            .map(|r| QueryResultItem {
                file_path: r.file_path,
                chunk_index: r.chunk_index,
                text: r.text,
                score: r.score,
            })
            .collect())
    }

    pub async fn ingest_file(
        &self,
        file_path: &str,
        tags: Option<&Value>,
        project: Option<String>,
        global: Option<bool>,
    ) -> AppResult<IngestResult> {
        tracing::debug!(file_path, "ingest_file");
        let tags = validate_tags(tags)?;
        parser::validate_file_path(file_path, &self.config.root_dir)?;

        let lock = self.lock_for(file_path).await;
        let _guard = lock.lock().await;

        let parsed = parser::parse_file(
            std::path::Path::new(file_path),
            &self.config.root_dir,
            self.config.max_file_bytes,
        )?;
        let metadata_size = std::fs::metadata(file_path).map(|m| m.len() as i64).unwrap_or(0);
        let file_name = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_path.to_string());
        let file_type = std::path::Path::new(file_path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "text-snippet".to_string());

        let now = Utc::now();
        let project = if global.unwrap_or(false) { None } else { project };
        let metadata = ChunkMetadata {
            file_name,
            file_size: metadata_size,
            file_type,
            language: parsed.language,
            memory_type: Some("file".to_string()),
            tags,
            project,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };

        let chunk_count = self
            .replace_source(file_path, &parsed.text, metadata, now)
            .await?;

        Ok(IngestResult {
            file_path: file_path.to_string(),
            chunk_count,
            timestamp: now,
        })
    }

    pub async fn memorize_text(
        &self,
        text: &str,
        label: Option<String>,
        language: Option<String>,
        tags: Option<&Value>,
        memory_type: Option<&str>,
        ttl: Option<&str>,
        project: Option<String>,
        global: Option<bool>,
    ) -> AppResult<MemorizeResult> {
        let tags = validate_tags(tags)?;
        let memory_type = validate_memory_type(memory_type)?.or_else(|| Some("memory".to_string()));
        let expires_at = parse_ttl(ttl)?;
        let label = label.unwrap_or_else(|| format!("snippet-{}", Utc::now().timestamp_millis()));
        parser::validate_label(&label)?;
        let file_path = format!("memory://{label}");
        tracing::debug!(file_path, "memorize_text");

        let lock = self.lock_for(&file_path).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let project = if global.unwrap_or(false) { None } else { project };
        let metadata = ChunkMetadata {
            file_name: label.clone(),
            file_size: text.chars().count() as i64,
            file_type: "text-snippet".to_string(),
            language,
            memory_type,
            tags,
            project,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        let chunk_count = self.replace_source(&file_path, text, metadata, now).await?;

        Ok(MemorizeResult {
            file_path,
            label,
            chunk_count,
            timestamp: now,
            expires_at,
        })
    }

    pub async fn update_memory(
        &self,
        label: &str,
        mode: Option<&str>,
        text: Option<&str>,
        tags: Option<&Value>,
        add_tags: Option<&Value>,
        remove_tags: Option<&Value>,
    ) -> AppResult<UpdateResult> {
        parser::validate_label(label)?;
        let file_path = format!("memory://{label}");
        tracing::debug!(file_path, "update_memory");
        let mode = validate_mode(mode)?;

        let lock = self.lock_for(&file_path).await;
        let _guard = lock.lock().await;

        let existing = self.store.get_by_file_path(&file_path).await?;
        if existing.is_empty() {
            return Err(AppError::NotFound(format!("no memory at '{file_path}'")));
        }
        let prior_metadata = existing[0].metadata.clone();
        let created_at = prior_metadata.created_at;

        let mut rows = existing;
        rows.sort_by_key(|r| r.chunk_index);
        let stored_text = rows.iter().map(|r| r.text.as_str()).collect::<Vec<_>>().join("\n");

        let new_text = match mode {
            UpdateMode::Replace => text.unwrap_or("").to_string(),
            UpdateMode::Append => format!("{stored_text}\n{}", text.unwrap_or("")),
            UpdateMode::Prepend => format!("{}\n{stored_text}", text.unwrap_or("")),
        };

        let new_tags = if let Some(tags_value) = tags {
            validate_tags(Some(tags_value))?
        } else {
            let mut merged = prior_metadata.tags.clone();
            for tag in validate_tags(add_tags)? {
                if !merged.contains(&tag) {
                    merged.push(tag);
                }
            }
            if let Some(remove_value) = remove_tags {
                let removed = validate_tags(Some(remove_value))?;
                merged.retain(|t| !removed.contains(t));
            }
            merged
        };

        let now = Utc::now();
        let metadata = ChunkMetadata {
            tags: new_tags.clone(),
            created_at,
            updated_at: now,
            ..prior_metadata
        };

        let chunk_count = self.replace_source(&file_path, &new_text, metadata, now).await?;

        Ok(UpdateResult {
            file_path,
            label: label.to_string(),
            chunk_count,
            timestamp: now,
            tags: new_tags,
        })
    }

    pub async fn delete_file(&self, file_path: &str) -> AppResult<DeleteResult> {
        parser::validate_file_path(file_path, &self.config.root_dir)?;
        tracing::debug!(file_path, "delete_file");
        self.store.delete(file_path).await?;
        Ok(DeleteResult {
            file_path: file_path.to_string(),
            deleted: true,
            timestamp: Utc::now(),
        })
    }

    pub async fn list_files(
        &self,
        type_filter: Option<&str>,
        tags: Option<&Value>,
        project: Option<String>,
        search: Option<String>,
        limit: Option<i64>,
    ) -> AppResult<Vec<FileSummary>> {
        let type_filter = if type_filter.is_some() {
            Some(validate_type_filter(type_filter)?)
        } else {
            None
        };
        let tags = validate_tags(tags)?;
        let limit = validate_limit(limit, 50, 0, usize::MAX)?;
        let filters = ListFilters {
            type_filter,
            tags,
            project,
            search,
            limit,
        };
        self.store.list_files(&filters).await
    }

    pub async fn cleanup_expired(&self) -> AppResult<CleanupResult> {
        let deleted_count = self.store.cleanup_expired().await?;
        Ok(CleanupResult {
            deleted_count,
            timestamp: Utc::now(),
        })
    }

    pub async fn status(&self) -> AppResult<StoreStatus> {
        self.store.status().await
    }

    /// Shared transactional replace: snapshot, delete, insert, rollback on
    /// failure. Spec.md §4.5 `ingest_file`/`memorize_text`/`update_memory`.
    async fn replace_source(
        &self,
        file_path: &str,
        text: &str,
        metadata: ChunkMetadata,
        timestamp: DateTime<Utc>,
    ) -> AppResult<usize> {
        let backup = match self.store.get_by_file_path(file_path).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(file_path, cause = %e, "backup snapshot failed; proceeding without one");
                Vec::new()
            }
        };

        let chunker = Chunker::new(self.config.chunk_size, self.config.chunk_overlap, self.config.min_chunk_len);
        let chunks = chunker.chunk(text);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let new_rows: Vec<ChunkRow> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkRow {
                id: uuid::Uuid::new_v4().to_string(),
                file_path: file_path.to_string(),
                chunk_index: chunk.index as i32,
                text: chunk.text,
                vector,
                timestamp,
                metadata: metadata.clone(),
            })
            .collect();

        self.store.delete(file_path).await?;

        match self.store.insert(&new_rows).await {
            Ok(()) => Ok(new_rows.len()),
            Err(insert_cause) => {
                if backup.is_empty() {
                    return Err(insert_cause);
                }
                match self.store.insert(&backup).await {
                    Ok(()) => Err(insert_cause),
                    Err(rollback_cause) => Err(AppError::RollbackFailure {
                        insert_cause: insert_cause.to_string(),
                        rollback_cause: rollback_cause.to_string(),
                    }),
                }
            }
        }
    }
}

fn ttl_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([dhmy])$").unwrap())
}

/// Validate the `tags` argument. Spec.md §4.5: non-list and non-string
/// elements are distinct rejection conditions.
fn validate_tags(value: Option<&Value>) -> AppResult<Vec<String>> {
    let Some(value) = value else { return Ok(Vec::new()) };
    let array = value
        .as_array()
        .ok_or_else(|| AppError::validation("tags must be a list"))?;

    let mut out = Vec::with_capacity(array.len());
    for item in array {
        let s = item
            .as_str()
            .ok_or_else(|| AppError::validation("every tag must be a string"))?;
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation("tags must not be empty strings"));
        }
        if !out.contains(&trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

fn validate_type_filter(value: Option<&str>) -> AppResult<TypeFilter> {
    match value.unwrap_or("all") {
        "all" => Ok(TypeFilter::All),
        "file" => Ok(TypeFilter::File),
        "memory" => Ok(TypeFilter::Memory),
        other => Err(AppError::validation(format!("unknown type '{other}'"))),
    }
}

fn validate_memory_type(value: Option<&str>) -> AppResult<Option<String>> {
    match value {
        None => Ok(None),
        Some(v) if ["file", "memory", "lesson", "note"].contains(&v) => Ok(Some(v.to_string())),
        Some(other) => Err(AppError::validation(format!("unknown memoryType '{other}'"))),
    }
}

fn validate_mode(value: Option<&str>) -> AppResult<UpdateMode> {
    match value.unwrap_or("replace") {
        "replace" => Ok(UpdateMode::Replace),
        "append" => Ok(UpdateMode::Append),
        "prepend" => Ok(UpdateMode::Prepend),
        other => Err(AppError::validation(format!("unknown update mode '{other}'"))),
    }
}

fn validate_min_score(value: Option<f64>) -> AppResult<Option<f32>> {
    match value {
        None => Ok(None),
        Some(v) if (0.0..=2.0).contains(&v) => Ok(Some(v as f32)),
        Some(v) => Err(AppError::validation(format!("minScore {v} must be in [0, 2]"))),
    }
}

fn validate_limit(value: Option<i64>, default: usize, min: usize, max: usize) -> AppResult<usize> {
    let n = match value {
        None => return Ok(default),
        Some(n) => n,
    };
    if n < 0 || (n as usize) < min || (max != usize::MAX && (n as usize) > max) {
        return Err(AppError::validation(format!("limit {n} must be in [{min}, {max}]")));
    }
    Ok(n as usize)
}

/// Parse a TTL string into an absolute expiry instant. `"permanent"` (or
/// absent) means no expiry. Otherwise `^\d+[dhmy]$`, applied via calendar
/// arithmetic for month/year units (spec.md §4.5, §8: "1m starting Jan 31
/// expires on Feb 28/29").
fn parse_ttl(value: Option<&str>) -> AppResult<Option<DateTime<Utc>>> {
    let Some(raw) = value else { return Ok(None) };
    if raw == "permanent" {
        return Ok(None);
    }
    let caps = ttl_regex()
        .captures(raw)
        .ok_or_else(|| AppError::validation(format!("invalid TTL '{raw}'; expected \\d+[dhmy] or 'permanent'")))?;
    let amount: u32 = caps[1]
        .parse()
        .map_err(|_| AppError::validation(format!("TTL amount '{}' out of range", &caps[1])))?;
    let unit = &caps[2];

    let now = Utc::now();
    let expiry = match unit {
        "d" => now + Duration::days(amount as i64),
        "h" => now + Duration::hours(amount as i64),
        "m" => now
            .checked_add_months(Months::new(amount))
            .ok_or_else(|| AppError::validation("TTL month arithmetic overflowed"))?,
        "y" => now
            .checked_add_months(Months::new(amount.saturating_mul(12)))
            .ok_or_else(|| AppError::validation("TTL year arithmetic overflowed"))?,
        other => return Err(AppError::validation(format!("unknown TTL unit '{other}'"))),
    };
    Ok(Some(expiry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_tags_rejects_non_list() {
        let v = json!("not-a-list");
        assert!(validate_tags(Some(&v)).is_err());
    }

    #[test]
    fn validate_tags_rejects_non_string_element() {
        let v = json!(["ok", 5]);
        assert!(validate_tags(Some(&v)).is_err());
    }

    #[test]
    fn validate_tags_trims_and_dedupes() {
        let v = json!([" a ", "a", "b"]);
        let tags = validate_tags(Some(&v)).unwrap();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn validate_tags_rejects_empty_string() {
        let v = json!(["  "]);
        assert!(validate_tags(Some(&v)).is_err());
    }

    #[test]
    fn ttl_permanent_means_no_expiry() {
        assert!(parse_ttl(Some("permanent")).unwrap().is_none());
        assert!(parse_ttl(None).unwrap().is_none());
    }

    #[test]
    fn ttl_rejects_fractional_or_signed() {
        assert!(parse_ttl(Some("1.5d")).is_err());
        assert!(parse_ttl(Some("-1d")).is_err());
        assert!(parse_ttl(Some("1x")).is_err());
    }

    #[test]
    fn ttl_days_adds_24h_windows() {
        let expiry = parse_ttl(Some("1d")).unwrap().unwrap();
        let delta = expiry - Utc::now();
        assert!(delta.num_hours() >= 23 && delta.num_hours() <= 24);
    }

    #[test]
    fn min_score_range_is_enforced() {
        assert!(validate_min_score(Some(-0.1)).is_err());
        assert!(validate_min_score(Some(2.1)).is_err());
        assert!(validate_min_score(Some(0.0)).unwrap() == Some(0.0));
        assert!(validate_min_score(Some(2.0)).unwrap() == Some(2.0));
    }

    #[test]
    fn query_limit_out_of_range_is_rejected() {
        assert!(validate_limit(Some(0), 10, 1, 20).is_err());
        assert!(validate_limit(Some(21), 10, 1, 20).is_err());
        assert!(validate_limit(Some(5), 10, 1, 20).unwrap() == 5);
    }

    #[test]
    fn list_files_limit_zero_means_unlimited() {
        assert_eq!(validate_limit(Some(0), 50, 0, usize::MAX).unwrap(), 0);
    }
}
