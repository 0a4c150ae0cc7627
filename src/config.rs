use std::path::PathBuf;

/// Grouping (result-tail trimming) mode. See spec.md §4.4 step 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    Similar,
    Related,
}

impl GroupingMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "similar" => Some(GroupingMode::Similar),
            "related" => Some(GroupingMode::Related),
            _ => None,
        }
    }
}

/// Process-wide configuration, sourced entirely from the environment per
/// spec.md §6. There is no on-disk config file: a single-user local backend
/// is expected to be launched with env vars set by its host process (an MCP
/// client).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory file-backed ingests must stay within (`RAG_ROOT_DIR`).
    pub root_dir: PathBuf,
    /// Directory the LanceDB table lives in (`RAG_DB_DIR`).
    pub db_dir: PathBuf,
    /// Directory the embedding model is cached in (`RAG_MODEL_CACHE_DIR`).
    pub model_cache_dir: PathBuf,
    /// HuggingFace model id for `model2vec-rs` (`RAG_MODEL_ID`).
    pub model_id: String,
    /// Fixed embedding dimension. Mismatched persisted tables are refused
    /// rather than silently re-embedded (spec.md §9 Open Question a).
    pub embedding_dim: usize,
    /// Maximum bytes a file may have to be ingested (`RAG_MAX_FILE_BYTES`).
    pub max_file_bytes: u64,
    /// Target chunk size in characters (`RAG_CHUNK_SIZE`).
    pub chunk_size: usize,
    /// Target overlap in characters between adjacent chunks (`RAG_CHUNK_OVERLAP`).
    pub chunk_overlap: usize,
    /// Minimum chunk length; shorter windows are dropped (spec.md §4.2).
    pub min_chunk_len: usize,
    /// Blend weight between lexical and dense search, in `(0, 1]` (`RAG_HYBRID_WEIGHT`).
    pub hybrid_weight: f32,
    /// Optional hard distance ceiling applied identically to `minScore` (`RAG_MAX_DISTANCE`).
    pub max_distance: Option<f32>,
    /// Optional grouping mode (`RAG_GROUPING_MODE`).
    pub grouping_mode: Option<GroupingMode>,
    /// Embedder batch size (reference: 8).
    pub embed_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            db_dir: home.join(".ragkeep").join("db"),
            model_cache_dir: home.join(".ragkeep").join("models"),
            model_id: "minishlab/potion-retrieval-32M".to_string(),
            embedding_dim: 384,
            max_file_bytes: 10 * 1024 * 1024,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_len: 50,
            hybrid_weight: 0.6,
            max_distance: None,
            grouping_mode: None,
            embed_batch_size: 8,
        }
    }
}

/// Load configuration from the process environment, falling back to
/// `Config::default()` for anything unset or unparsable.
pub fn load_config() -> Config {
    let mut cfg = Config::default();

    if let Ok(v) = std::env::var("RAG_ROOT_DIR") {
        if !v.trim().is_empty() {
            cfg.root_dir = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("RAG_DB_DIR") {
        if !v.trim().is_empty() {
            cfg.db_dir = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("RAG_MODEL_CACHE_DIR") {
        if !v.trim().is_empty() {
            cfg.model_cache_dir = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("RAG_MODEL_ID") {
        if !v.trim().is_empty() {
            cfg.model_id = v;
        }
    }
    if let Ok(v) = std::env::var("RAG_MAX_FILE_BYTES") {
        if let Ok(n) = v.parse() {
            cfg.max_file_bytes = n;
        }
    }
    if let Ok(v) = std::env::var("RAG_CHUNK_SIZE") {
        if let Ok(n) = v.parse() {
            cfg.chunk_size = n;
        }
    }
    if let Ok(v) = std::env::var("RAG_CHUNK_OVERLAP") {
        if let Ok(n) = v.parse() {
            cfg.chunk_overlap = n;
        }
    }
    if let Ok(v) = std::env::var("RAG_HYBRID_WEIGHT") {
        if let Ok(n) = v.parse::<f32>() {
            if n > 0.0 && n <= 1.0 {
                cfg.hybrid_weight = n;
            }
        }
    }
    if let Ok(v) = std::env::var("RAG_MAX_DISTANCE") {
        if let Ok(n) = v.parse() {
            cfg.max_distance = Some(n);
        }
    }
    if let Ok(v) = std::env::var("RAG_GROUPING_MODE") {
        cfg.grouping_mode = GroupingMode::parse(&v);
    }

    cfg
}
