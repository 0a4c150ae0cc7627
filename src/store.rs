//! Persisted hybrid (lexical + dense) vector store. Spec.md §4.4.
//!
//! Backed by `lancedb`, a columnar vector database engine. Per design note
//! §9 ("Dynamic dispatch of Arrow-like column values"), every Arrow
//! `RecordBatch`/column access lives in this module's `row_to_batch` /
//! `batch_to_rows` boundary functions — nothing outside `store.rs` ever
//! touches an `arrow_array` type directly.

use crate::config::GroupingMode;
use crate::errors::{AppError, AppResult};
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Int32Array, Int64Array, ListArray,
    RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lance_index::scalar::FullTextSearchQuery;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::Table;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const TABLE_NAME: &str = "chunks";
const REQUIRED_METADATA_FIELDS: [&str; 4] = ["created_at", "updated_at", "memory_type", "tags"];

/// A single chunk row, the only persisted entity (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub file_path: String,
    pub chunk_index: i32,
    pub text: String,
    pub vector: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub language: Option<String>,
    pub memory_type: Option<String>,
    pub tags: Vec<String>,
    pub project: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    All,
    File,
    Memory,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub query_text: Option<String>,
    pub limit: usize,
    pub type_filter: Option<TypeFilter>,
    pub tags: Vec<String>,
    pub project: Option<String>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub file_path: String,
    pub chunk_index: i32,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub type_filter: Option<TypeFilter>,
    pub tags: Vec<String>,
    pub project: Option<String>,
    pub search: Option<String>,
    /// `0` means unlimited (spec.md §4.4 `listFiles`).
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct FileSummary {
    pub file_path: String,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub document_count: usize,
    pub chunk_count: usize,
    pub memory_usage_bytes: u64,
    pub uptime_secs: u64,
    pub fts_index_enabled: bool,
    pub search_mode: &'static str,
}

pub struct VectorStore {
    db: Connection,
    dim: usize,
    hybrid_weight: f32,
    max_distance: Option<f32>,
    grouping_mode: Option<GroupingMode>,
    fts_enabled: AtomicBool,
    table_cache: RwLock<Option<Table>>,
    started_at: std::time::Instant,
}

impl VectorStore {
    pub async fn open(
        db_dir: &Path,
        dim: usize,
        hybrid_weight: f32,
        max_distance: Option<f32>,
        grouping_mode: Option<GroupingMode>,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(db_dir)
            .map_err(|e| AppError::Database(format!("cannot create db dir {}: {e}", db_dir.display())))?;
        let uri = db_dir.to_string_lossy().to_string();
        let db = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("cannot open database at {uri}: {e}")))?;

        let store = Self {
            db,
            dim,
            hybrid_weight,
            max_distance,
            grouping_mode,
            fts_enabled: AtomicBool::new(false),
            table_cache: RwLock::new(None),
            started_at: std::time::Instant::now(),
        };
        store.initialize().await?;
        Ok(store)
    }

    fn schema(dim: i32) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("file_path", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, false)), dim),
                false,
            ),
            Field::new("timestamp", DataType::Utf8, false),
            Field::new("file_name", DataType::Utf8, false),
            Field::new("file_size", DataType::Int64, false),
            Field::new("file_type", DataType::Utf8, false),
            Field::new("language", DataType::Utf8, true),
            Field::new("memory_type", DataType::Utf8, true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, false))),
                false,
            ),
            Field::new("project", DataType::Utf8, true),
            Field::new("expires_at", DataType::Utf8, true),
            Field::new("created_at", DataType::Utf8, false),
            Field::new("updated_at", DataType::Utf8, false),
        ])
    }

    async fn table_exists(&self) -> AppResult<bool> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("cannot list tables: {e}")))?;
        Ok(names.iter().any(|n| n == TABLE_NAME))
    }

    async fn open_table(&self) -> AppResult<Table> {
        if let Some(t) = self.table_cache.read().await.as_ref() {
            return Ok(t.clone());
        }
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("cannot open table: {e}")))?;
        *self.table_cache.write().await = Some(table.clone());
        Ok(table)
    }

    async fn create_table(&self, rows: &[ChunkRow]) -> AppResult<Table> {
        let batch = self.rows_to_batch(rows)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        let table = self
            .db
            .create_table(TABLE_NAME, reader)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("cannot create table: {e}")))?;
        *self.table_cache.write().await = Some(table.clone());
        Ok(table)
    }

    async fn create_empty_table(&self) -> AppResult<Table> {
        let schema = Arc::new(Self::schema(self.dim as i32));
        let empty = RecordBatch::new_empty(schema.clone());
        let reader = RecordBatchIterator::new(vec![Ok(empty)], schema);
        let table = self
            .db
            .create_table(TABLE_NAME, reader)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("cannot create empty table: {e}")))?;
        *self.table_cache.write().await = Some(table.clone());
        Ok(table)
    }

    /// Opens (or prepares) the table, migrating the persisted schema if it
    /// predates `created_at`/`updated_at`/`memory_type`/`tags`.
    pub async fn initialize(&self) -> AppResult<()> {
        if !self.table_exists().await? {
            // Nothing to migrate; the table is created lazily on first insert.
            return Ok(());
        }

        let table = self.open_table().await?;
        let current_schema = table
            .schema()
            .await
            .map_err(|e| AppError::Database(format!("cannot read table schema: {e}")))?;

        let vector_field = current_schema
            .field_with_name("vector")
            .map_err(|e| AppError::Database(format!("persisted table has no 'vector' column: {e}")))?;
        if let DataType::FixedSizeList(_, width) = vector_field.data_type() {
            if *width as usize != self.dim {
                return Err(AppError::Database(format!(
                    "persisted table vector dimension ({width}) does not match configured dimension ({}); \
                     refusing to open. Delete or migrate the database directory to change dimensions.",
                    self.dim
                )));
            }
        } else {
            return Err(AppError::Database(
                "persisted table 'vector' column is not a FixedSizeList".to_string(),
            ));
        }

        let missing: Vec<&str> = REQUIRED_METADATA_FIELDS
            .iter()
            .copied()
            .filter(|name| current_schema.field_with_name(name).is_err())
            .collect();

        if missing.is_empty() {
            self.ensure_fts_index().await;
            return Ok(());
        }

        tracing::warn!(?missing, "legacy schema detected, migrating table");
        let rows = self.scan_all_raw(&table).await?;
        self.db
            .drop_table(TABLE_NAME)
            .await
            .map_err(|e| AppError::Database(format!("cannot drop legacy table: {e}")))?;
        *self.table_cache.write().await = None;

        if rows.is_empty() {
            // Spec.md §4.4: "A migration of an empty table simply drops it,
            // letting the table be recreated on the next insert."
            return Ok(());
        }

        self.create_table(&rows).await?;
        self.ensure_fts_index().await;
        Ok(())
    }

    /// Best-effort full-text index (re)build. Failure disables hybrid mode
    /// but never fails the caller (spec.md §4.4).
    async fn ensure_fts_index(&self) {
        let Ok(table) = self.open_table().await else {
            self.fts_enabled.store(false, Ordering::SeqCst);
            return;
        };
        match table
            .create_index(&["text"], Index::FTS(Default::default()))
            .execute()
            .await
        {
            Ok(_) => self.fts_enabled.store(true, Ordering::SeqCst),
            Err(e) => {
                tracing::warn!(cause = %e, "full-text index build failed; falling back to vector-only search");
                self.fts_enabled.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Insert rows, creating the table on first insert if absent.
    pub async fn insert(&self, rows: &[ChunkRow]) -> AppResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        for row in rows {
            if row.vector.len() != self.dim {
                return Err(AppError::Database(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    self.dim,
                    row.vector.len()
                )));
            }
        }

        let table = if self.table_exists().await? {
            self.open_table().await?
        } else {
            self.create_empty_table().await?
        };

        let batch = self.rows_to_batch(rows)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("insert failed: {e}")))?;

        self.ensure_fts_index().await;
        Ok(())
    }

    /// Delete every row for `file_path`. Missing rows are not an error.
    pub async fn delete(&self, file_path: &str) -> AppResult<()> {
        if !self.table_exists().await? {
            return Ok(());
        }
        let table = self.open_table().await?;
        let escaped = file_path.replace('\'', "''");
        table
            .delete(&format!("file_path = '{escaped}'"))
            .await
            .map_err(|e| {
                let msg = e.to_string();
                AppError::Database(msg)
            })
            .or_else(|e| {
                if let AppError::Database(msg) = &e {
                    if AppError::is_benign_delete_miss(msg) {
                        return Ok(());
                    }
                }
                Err(e)
            })?;
        self.ensure_fts_index().await;
        Ok(())
    }

    /// Full table scan, used by migration, `listFiles`, and `cleanupExpired`.
    async fn scan_all(&self) -> AppResult<Vec<ChunkRow>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let table = self.open_table().await?;
        self.scan_all_raw(&table).await
    }

    async fn scan_all_raw(&self, table: &Table) -> AppResult<Vec<ChunkRow>> {
        let mut stream = table
            .query()
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("scan failed: {e}")))?;

        let mut rows = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| AppError::Database(format!("scan stream failed: {e}")))?
        {
            rows.extend(self.batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    /// Rows for `memory://<label>`, sorted by `chunkIndex`.
    pub async fn get_by_label(&self, label: &str) -> AppResult<Vec<ChunkRow>> {
        self.get_by_file_path(&format!("memory://{label}")).await
    }

    /// All rows for an arbitrary `filePath`, sorted by `chunkIndex`. Used by
    /// the handler layer to snapshot a source before a transactional replace.
    pub async fn get_by_file_path(&self, file_path: &str) -> AppResult<Vec<ChunkRow>> {
        let mut rows = self.scan_all().await?;
        rows.retain(|r| r.file_path == file_path);
        rows.sort_by_key(|r| r.chunk_index);
        Ok(rows)
    }

    /// Groups rows by `filePath` and reports one summary per source.
    pub async fn list_files(&self, filters: &ListFilters) -> AppResult<Vec<FileSummary>> {
        let rows = self.scan_all().await?;
        let mut by_path: HashMap<String, Vec<&ChunkRow>> = HashMap::new();
        for row in &rows {
            by_path.entry(row.file_path.clone()).or_default().push(row);
        }

        let mut summaries: Vec<FileSummary> = by_path
            .into_iter()
            .filter_map(|(file_path, mut group)| {
                group.sort_by_key(|r| r.chunk_index);
                let latest = group.iter().max_by_key(|r| r.timestamp)?;
                Some(FileSummary {
                    file_path,
                    chunk_count: group.len(),
                    timestamp: latest.timestamp,
                    metadata: latest.metadata.clone(),
                })
            })
            .filter(|s| passes_list_filters(s, filters))
            .collect();

        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if filters.limit > 0 {
            summaries.truncate(filters.limit);
        }
        Ok(summaries)
    }

    /// Deletes every source whose `expiresAt` is non-null and in the past.
    /// Returns the count of distinct sources deleted.
    pub async fn cleanup_expired(&self) -> AppResult<usize> {
        let rows = self.scan_all().await?;
        let now = Utc::now();
        let mut expired_paths: Vec<String> = rows
            .iter()
            .filter(|r| r.metadata.expires_at.map(|e| e < now).unwrap_or(false))
            .map(|r| r.file_path.clone())
            .collect();
        expired_paths.sort();
        expired_paths.dedup();

        for path in &expired_paths {
            self.delete(path).await?;
        }
        Ok(expired_paths.len())
    }

    pub async fn status(&self) -> AppResult<StoreStatus> {
        let rows = self.scan_all().await?;
        let documents: std::collections::HashSet<&str> =
            rows.iter().map(|r| r.file_path.as_str()).collect();
        let fts = self.fts_enabled.load(Ordering::SeqCst);
        Ok(StoreStatus {
            document_count: documents.len(),
            chunk_count: rows.len(),
            memory_usage_bytes: resident_memory_bytes(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            fts_index_enabled: fts,
            search_mode: if fts && self.hybrid_weight > 0.0 {
                "hybrid"
            } else {
                "vector"
            },
        })
    }

    /// Hybrid search: lexical + dense candidate generation, fusion,
    /// metadata filtering, and grouping. Spec.md §4.4 steps 1-5.
    pub async fn search(&self, query_vector: &[f32], filters: &SearchFilters) -> AppResult<Vec<SearchResult>> {
        let limit = filters.limit.max(1).min(20);
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let table = self.open_table().await?;

        let use_hybrid = self.fts_enabled.load(Ordering::SeqCst)
            && filters.query_text.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false)
            && self.hybrid_weight > 0.0;

        let mut fused: HashMap<(String, i32), FusionEntry> = HashMap::new();

        if use_hybrid {
            let lexical_limit = limit * 4;
            let dense_limit = limit * 4;
            let (lexical, dense) = tokio::join!(
                self.fetch_lexical(&table, filters.query_text.as_deref().unwrap(), lexical_limit),
                self.fetch_dense(&table, query_vector, dense_limit),
            );
            let lexical = lexical?;
            let dense = dense?;

            let n = lexical.len().max(1);
            for (i, row) in lexical.into_iter().enumerate() {
                let key = (row.file_path.clone(), row.chunk_index);
                let contribution = (1.0 - (i as f32 / n as f32)) * self.hybrid_weight;
                let entry = fused.entry(key).or_insert_with(|| FusionEntry::new(row.clone()));
                entry.fused_score += contribution;
            }
            for row in dense {
                let d = dot_distance(query_vector, &row.vector);
                let similarity = (1.0 - d / 2.0).max(0.0);
                let contribution = similarity * (1.0 - self.hybrid_weight);
                let key = (row.file_path.clone(), row.chunk_index);
                let entry = fused.entry(key).or_insert_with(|| FusionEntry::new(row.clone()));
                entry.fused_score += contribution;
            }
        } else {
            let dense = self.fetch_dense(&table, query_vector, limit * 3).await?;
            for row in dense {
                let d = dot_distance(query_vector, &row.vector);
                let similarity = (1.0 - d / 2.0).max(0.0);
                let key = (row.file_path.clone(), row.chunk_index);
                let entry = fused.entry(key).or_insert_with(|| FusionEntry::new(row.clone()));
                entry.fused_score += similarity;
            }
        }

        let mut candidates: Vec<FusionEntry> = fused.into_values().collect();
        candidates.sort_by(|a, b| b.fused_score.partial_cmp(&a.fused_score).unwrap_or(std::cmp::Ordering::Equal));
        for c in &mut candidates {
            c.distance_score = 1.0 - c.fused_score;
        }

        let type_filter = filters.type_filter.unwrap_or(TypeFilter::All);
        candidates.retain(|c| passes_type_filter(&c.row.file_path, type_filter));
        if !filters.tags.is_empty() {
            candidates.retain(|c| filters.tags.iter().all(|t| c.row.metadata.tags.contains(t)));
        }
        if let Some(project) = &filters.project {
            candidates.retain(|c| c.row.metadata.project.as_deref() == Some(project.as_str()));
        }
        if let Some(min_score) = filters.min_score {
            candidates.retain(|c| c.distance_score <= min_score);
        }
        if let Some(max_distance) = self.max_distance {
            candidates.retain(|c| c.distance_score <= max_distance);
        }

        let candidates = apply_grouping(candidates, self.grouping_mode);

        candidates
            .into_iter()
            .take(limit)
            .map(|c| {
                Ok(SearchResult {
                    file_path: c.row.file_path,
                    chunk_index: c.row.chunk_index,
                    text: c.row.text,
                    score: c.distance_score,
                })
            })
            .collect()
    }

    async fn fetch_lexical(&self, table: &Table, query_text: &str, limit: usize) -> AppResult<Vec<ChunkRow>> {
        let mut stream = table
            .query()
            .full_text_search(FullTextSearchQuery::new(query_text.to_string()))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("lexical search failed: {e}")))?;

        let mut rows = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| AppError::Database(format!("lexical search stream failed: {e}")))?
        {
            rows.extend(self.batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    async fn fetch_dense(&self, table: &Table, query_vector: &[f32], limit: usize) -> AppResult<Vec<ChunkRow>> {
        let mut stream = table
            .vector_search(query_vector.to_vec())
            .map_err(|e| AppError::Database(format!("vector search setup failed: {e}")))?
            .limit(limit)
            .execute()
            .await
            .map_err(|e| AppError::Database(format!("vector search failed: {e}")))?;

        let mut rows = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| AppError::Database(format!("vector search stream failed: {e}")))?
        {
            rows.extend(self.batch_to_rows(&batch)?);
        }
        Ok(rows)
    }

    // ---- Arrow boundary -------------------------------------------------

    fn rows_to_batch(&self, rows: &[ChunkRow]) -> AppResult<RecordBatch> {
        let dim = self.dim as i32;
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let file_paths: Vec<&str> = rows.iter().map(|r| r.file_path.as_str()).collect();
        let chunk_indices: Vec<i32> = rows.iter().map(|r| r.chunk_index).collect();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();

        let mut flat: Vec<f32> = Vec::with_capacity(rows.len() * self.dim);
        for r in rows {
            flat.extend_from_slice(&r.vector);
        }
        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array: ArrayRef = Arc::new(
            FixedSizeListArray::try_new(item_field, dim, Arc::new(Float32Array::from(flat)), None)
                .map_err(|e| AppError::Database(format!("vector column build failed: {e}")))?,
        );

        let timestamps: Vec<String> = rows.iter().map(|r| r.timestamp.to_rfc3339()).collect();
        let file_names: Vec<&str> = rows.iter().map(|r| r.metadata.file_name.as_str()).collect();
        let file_sizes: Vec<i64> = rows.iter().map(|r| r.metadata.file_size).collect();
        let file_types: Vec<&str> = rows.iter().map(|r| r.metadata.file_type.as_str()).collect();
        let languages: Vec<Option<&str>> = rows.iter().map(|r| r.metadata.language.as_deref()).collect();
        let memory_types: Vec<Option<&str>> = rows.iter().map(|r| r.metadata.memory_type.as_deref()).collect();
        let projects: Vec<Option<&str>> = rows.iter().map(|r| r.metadata.project.as_deref()).collect();
        let expires_ats: Vec<Option<String>> = rows
            .iter()
            .map(|r| r.metadata.expires_at.map(|t| t.to_rfc3339()))
            .collect();
        let created_ats: Vec<String> = rows.iter().map(|r| r.metadata.created_at.to_rfc3339()).collect();
        let updated_ats: Vec<String> = rows.iter().map(|r| r.metadata.updated_at.to_rfc3339()).collect();

        let mut tags_builder = ListBuilder::new(StringBuilder::new());
        for r in rows {
            for tag in &r.metadata.tags {
                tags_builder.values().append_value(tag);
            }
            tags_builder.append(true);
        }
        let tags_array: ListArray = tags_builder.finish();

        let schema = Arc::new(Self::schema(dim));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(file_paths)),
                Arc::new(Int32Array::from(chunk_indices)),
                Arc::new(StringArray::from(texts)),
                vector_array,
                Arc::new(StringArray::from(timestamps)),
                Arc::new(StringArray::from(file_names)),
                Arc::new(Int64Array::from(file_sizes)),
                Arc::new(StringArray::from(file_types)),
                Arc::new(StringArray::from(languages)),
                Arc::new(StringArray::from(memory_types)),
                Arc::new(tags_array),
                Arc::new(StringArray::from(projects)),
                Arc::new(StringArray::from(expires_ats)),
                Arc::new(StringArray::from(created_ats)),
                Arc::new(StringArray::from(updated_ats)),
            ],
        )
        .map_err(|e| AppError::Database(format!("record batch build failed: {e}")))
    }

    fn batch_to_rows(&self, batch: &RecordBatch) -> AppResult<Vec<ChunkRow>> {
        let col = |name: &str| -> AppResult<ArrayRef> {
            batch
                .column_by_name(name)
                .cloned()
                .ok_or_else(|| AppError::Database(format!("missing column '{name}'")))
        };
        let str_col = |name: &str| -> AppResult<Option<StringArray>> {
            Ok(batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>().cloned()))
        };

        let ids = col("id")?;
        let ids = ids.as_any().downcast_ref::<StringArray>().ok_or_else(|| AppError::Database("bad id column".into()))?;
        let file_paths = col("file_path")?;
        let file_paths = file_paths
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| AppError::Database("bad file_path column".into()))?;
        let chunk_indices = col("chunk_index")?;
        let chunk_indices = chunk_indices
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| AppError::Database("bad chunk_index column".into()))?;
        let texts = col("text")?;
        let texts = texts.as_any().downcast_ref::<StringArray>().ok_or_else(|| AppError::Database("bad text column".into()))?;
        let vectors = col("vector")?;
        let vectors = vectors
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| AppError::Database("bad vector column".into()))?;
        let timestamps = col("timestamp")?;
        let timestamps = timestamps
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| AppError::Database("bad timestamp column".into()))?;
        let file_names = col("file_name")?;
        let file_names = file_names
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| AppError::Database("bad file_name column".into()))?;
        let file_sizes = col("file_size")?;
        let file_sizes = file_sizes
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| AppError::Database("bad file_size column".into()))?;
        let file_types = col("file_type")?;
        let file_types = file_types
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| AppError::Database("bad file_type column".into()))?;

        // Possibly-legacy columns: fall back to defaults per spec.md §4.4.
        let languages = str_col("language")?;
        let memory_types = str_col("memory_type")?;
        let projects = str_col("project")?;
        let expires_ats = str_col("expires_at")?;
        let created_ats = str_col("created_at")?;
        let updated_ats = str_col("updated_at")?;
        let tags_col = batch
            .column_by_name("tags")
            .and_then(|c| c.as_any().downcast_ref::<ListArray>().cloned());

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let timestamp = parse_rfc3339(timestamps.value(i));

            let vector = {
                let v = vectors.value(i);
                let floats = v
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| AppError::Database("bad vector item type".into()))?;
                floats.values().to_vec()
            };

            let tags = tags_col
                .as_ref()
                .map(|arr| {
                    let value = arr.value(i);
                    let strings = value.as_any().downcast_ref::<StringArray>();
                    strings
                        .map(|s| (0..s.len()).map(|j| s.value(j).to_string()).collect::<Vec<_>>())
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            let created_at = created_ats
                .as_ref()
                .filter(|a| a.is_valid(i))
                .map(|a| parse_rfc3339(a.value(i)))
                .unwrap_or(timestamp);
            let updated_at = updated_ats
                .as_ref()
                .filter(|a| a.is_valid(i))
                .map(|a| parse_rfc3339(a.value(i)))
                .unwrap_or(timestamp);

            rows.push(ChunkRow {
                id: ids.value(i).to_string(),
                file_path: file_paths.value(i).to_string(),
                chunk_index: chunk_indices.value(i),
                text: texts.value(i).to_string(),
                vector,
                timestamp,
                metadata: ChunkMetadata {
                    file_name: file_names.value(i).to_string(),
                    file_size: file_sizes.value(i),
                    file_type: file_types.value(i).to_string(),
                    language: opt_str(&languages, i),
                    memory_type: opt_str(&memory_types, i),
                    tags,
                    project: opt_str(&projects, i),
                    expires_at: opt_str(&expires_ats, i).map(|s| parse_rfc3339(&s)),
                    created_at,
                    updated_at,
                },
            });
        }
        Ok(rows)
    }
}

fn opt_str(col: &Option<StringArray>, i: usize) -> Option<String> {
    col.as_ref().filter(|a| a.is_valid(i)).map(|a| a.value(i).to_string())
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

struct FusionEntry {
    row: ChunkRow,
    fused_score: f32,
    distance_score: f32,
}

impl FusionEntry {
    fn new(row: ChunkRow) -> Self {
        Self {
            row,
            fused_score: 0.0,
            distance_score: 0.0,
        }
    }
}

/// Dot-product distance over L2-normalized vectors: `0` identical, `2`
/// opposite (spec.md glossary). Equivalent to LanceDB's `Dot` metric
/// definition; computed here rather than trusted from a query result column
/// so the fusion math in spec.md §4.4 step 2 is exact regardless of which
/// distance the underlying ANN index happens to return.
fn dot_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    (1.0 - (dot / (norm_a * norm_b))).clamp(0.0, 2.0)
}

fn passes_type_filter(file_path: &str, filter: TypeFilter) -> bool {
    match filter {
        TypeFilter::All => true,
        TypeFilter::Memory => file_path.starts_with("memory://"),
        TypeFilter::File => !file_path.starts_with("memory://"),
    }
}

fn passes_list_filters(summary: &FileSummary, filters: &ListFilters) -> bool {
    if let Some(type_filter) = filters.type_filter {
        if !passes_type_filter(&summary.file_path, type_filter) {
            return false;
        }
    }
    if !filters.tags.is_empty() && !filters.tags.iter().all(|t| summary.metadata.tags.contains(t)) {
        return false;
    }
    if let Some(project) = &filters.project {
        if summary.metadata.project.as_deref() != Some(project.as_str()) {
            return false;
        }
    }
    if let Some(search) = &filters.search {
        let needle = search.to_lowercase();
        let path_matches = summary.file_path.to_lowercase().contains(&needle);
        let name_matches = summary.metadata.file_name.to_lowercase().contains(&needle);
        if !path_matches && !name_matches {
            return false;
        }
    }
    true
}

/// Statistical tail trimming over the sorted distance list. Spec.md §4.4
/// step 4 and design note §9: uses population standard deviation and cuts
/// on the already-sorted list without re-sorting.
fn apply_grouping(candidates: Vec<FusionEntry>, mode: Option<GroupingMode>) -> Vec<FusionEntry> {
    let Some(mode) = mode else { return candidates };
    if candidates.len() <= 1 {
        return candidates;
    }

    let scores: Vec<f32> = candidates.iter().map(|c| c.distance_score).collect();
    let gaps: Vec<f32> = scores.windows(2).map(|w| w[1] - w[0]).collect();
    if gaps.is_empty() {
        return candidates;
    }

    let mean = gaps.iter().sum::<f32>() / gaps.len() as f32;
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f32>() / gaps.len() as f32;
    let threshold = mean + 1.5 * variance.sqrt();

    let boundaries: Vec<usize> = gaps
        .iter()
        .enumerate()
        .filter(|(_, g)| **g > threshold)
        .map(|(i, _)| i + 1)
        .collect();

    if boundaries.is_empty() {
        return candidates;
    }

    let cut = match mode {
        GroupingMode::Similar => boundaries[0],
        GroupingMode::Related => boundaries.get(1).copied().unwrap_or(candidates.len()),
    };

    let mut candidates = candidates;
    candidates.truncate(cut);
    candidates
}

/// Best-effort resident-memory approximation. Linux-only; returns `0`
/// elsewhere rather than pulling in a full system-info dependency for one
/// advisory number.
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(|s| s.to_string()))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(file_path: &str, idx: i32, vector: Vec<f32>) -> ChunkRow {
        let now = Utc::now();
        ChunkRow {
            id: format!("{file_path}:{idx}"),
            file_path: file_path.to_string(),
            chunk_index: idx,
            text: format!("chunk {idx} of {file_path}"),
            vector,
            timestamp: now,
            metadata: ChunkMetadata {
                file_name: "name".to_string(),
                file_size: 10,
                file_type: "text-snippet".to_string(),
                language: None,
                memory_type: Some("memory".to_string()),
                tags: vec!["a".to_string()],
                project: None,
                expires_at: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[test]
    fn dot_distance_identical_vectors_is_zero() {
        let v = vec![1.0, 0.0, 0.0];
        assert!(dot_distance(&v, &v) < 1e-6);
    }

    #[test]
    fn dot_distance_opposite_vectors_is_two() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((dot_distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn grouping_similar_keeps_tightest_cluster() {
        let scores = [0.10f32, 0.12, 0.13, 0.55, 0.58];
        let candidates: Vec<FusionEntry> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut e = FusionEntry::new(sample_row("f", i as i32, vec![0.0]));
                e.distance_score = *s;
                e
            })
            .collect();
        let kept = apply_grouping(candidates, Some(GroupingMode::Similar));
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn grouping_related_keeps_all_when_no_second_boundary() {
        let scores = [0.10f32, 0.12, 0.13, 0.55, 0.58];
        let candidates: Vec<FusionEntry> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut e = FusionEntry::new(sample_row("f", i as i32, vec![0.0]));
                e.distance_score = *s;
                e
            })
            .collect();
        let kept = apply_grouping(candidates, Some(GroupingMode::Related));
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn grouping_with_no_mode_returns_all() {
        let candidates = vec![FusionEntry::new(sample_row("f", 0, vec![0.0]))];
        let kept = apply_grouping(candidates, None);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn type_filter_memory_keeps_only_memory_paths() {
        assert!(passes_type_filter("memory://x", TypeFilter::Memory));
        assert!(!passes_type_filter("/abs/path", TypeFilter::Memory));
        assert!(passes_type_filter("/abs/path", TypeFilter::File));
        assert!(!passes_type_filter("memory://x", TypeFilter::File));
        assert!(passes_type_filter("memory://x", TypeFilter::All));
    }
}
