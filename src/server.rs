//! JSON-RPC 2.0 tool registry and dispatch over newline-delimited stdio.
//! Spec.md §6.

use crate::errors::AppError;
use crate::handlers::Handlers;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub struct ServerState {
    handlers: Arc<Handlers>,
}

impl ServerState {
    pub fn new(handlers: Arc<Handlers>) -> Self {
        Self { handlers }
    }

    fn tool_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "tools": tool_definitions() }
        })
    }

    async fn tool_call(&self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.dispatch(name, &args).await {
            Ok(payload) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": payload.to_string()}], "isError": false }
            }),
            Err(e) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type": "text", "text": error_message(&e)}], "isError": true }
            }),
        }
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, AppError> {
        match name {
            "query_documents" => {
                let query = args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("query_documents requires a string 'query'"))?;
                let limit = args.get("limit").and_then(|v| v.as_i64());
                let type_filter = args.get("type").and_then(|v| v.as_str());
                let tags = args.get("tags");
                let project = args.get("project").and_then(|v| v.as_str()).map(str::to_string);
                let min_score = args.get("minScore").and_then(|v| v.as_f64());
                let results = self
                    .handlers
                    .query_documents(query, limit, type_filter, tags, project, min_score)
                    .await?;
                Ok(json!(results
                    .into_iter()
                    .map(|r| json!({
                        "filePath": r.file_path,
                        "chunkIndex": r.chunk_index,
                        "text": r.text,
                        "score": r.score,
                    }))
                    .collect::<Vec<_>>()))
            }
            "ingest_file" => {
                let file_path = args
                    .get("filePath")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("ingest_file requires a string 'filePath'"))?;
                let tags = args.get("tags");
                let project = args.get("project").and_then(|v| v.as_str()).map(str::to_string);
                let global = args.get("global").and_then(|v| v.as_bool());
                let r = self.handlers.ingest_file(file_path, tags, project, global).await?;
                Ok(json!({
                    "filePath": r.file_path,
                    "chunkCount": r.chunk_count,
                    "timestamp": r.timestamp.to_rfc3339(),
                }))
            }
            "memorize_text" => {
                let text = args
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("memorize_text requires a string 'text'"))?;
                let label = args.get("label").and_then(|v| v.as_str()).map(str::to_string);
                let language = args.get("language").and_then(|v| v.as_str()).map(str::to_string);
                let tags = args.get("tags");
                let memory_type = args.get("type").and_then(|v| v.as_str());
                let ttl = args.get("ttl").and_then(|v| v.as_str());
                let project = args.get("project").and_then(|v| v.as_str()).map(str::to_string);
                let global = args.get("global").and_then(|v| v.as_bool());
                let r = self
                    .handlers
                    .memorize_text(text, label, language, tags, memory_type, ttl, project, global)
                    .await?;
                Ok(json!({
                    "filePath": r.file_path,
                    "label": r.label,
                    "chunkCount": r.chunk_count,
                    "timestamp": r.timestamp.to_rfc3339(),
                    "expiresAt": r.expires_at.map(|t| t.to_rfc3339()),
                }))
            }
            "update_memory" => {
                let label = args
                    .get("label")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("update_memory requires a string 'label'"))?;
                let mode = args.get("mode").and_then(|v| v.as_str());
                let text = args.get("text").and_then(|v| v.as_str());
                let tags = args.get("tags");
                let add_tags = args.get("addTags");
                let remove_tags = args.get("removeTags");
                let r = self
                    .handlers
                    .update_memory(label, mode, text, tags, add_tags, remove_tags)
                    .await?;
                Ok(json!({
                    "filePath": r.file_path,
                    "label": r.label,
                    "chunkCount": r.chunk_count,
                    "timestamp": r.timestamp.to_rfc3339(),
                    "tags": r.tags,
                }))
            }
            "delete_file" => {
                let file_path = args
                    .get("filePath")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AppError::validation("delete_file requires a string 'filePath'"))?;
                let r = self.handlers.delete_file(file_path).await?;
                Ok(json!({
                    "filePath": r.file_path,
                    "deleted": r.deleted,
                    "timestamp": r.timestamp.to_rfc3339(),
                }))
            }
            "list_files" => {
                let type_filter = args.get("type").and_then(|v| v.as_str());
                let tags = args.get("tags");
                let project = args.get("project").and_then(|v| v.as_str()).map(str::to_string);
                let search = args.get("search").and_then(|v| v.as_str()).map(str::to_string);
                let limit = args.get("limit").and_then(|v| v.as_i64());
                let summaries = self
                    .handlers
                    .list_files(type_filter, tags, project, search, limit)
                    .await?;
                Ok(json!(summaries
                    .into_iter()
                    .map(|s| json!({
                        "filePath": s.file_path,
                        "chunkCount": s.chunk_count,
                        "timestamp": s.timestamp.to_rfc3339(),
                        "metadata": {
                            "fileName": s.metadata.file_name,
                            "fileSize": s.metadata.file_size,
                            "fileType": s.metadata.file_type,
                            "language": s.metadata.language,
                            "memoryType": s.metadata.memory_type,
                            "tags": s.metadata.tags,
                            "project": s.metadata.project,
                            "expiresAt": s.metadata.expires_at.map(|t| t.to_rfc3339()),
                            "createdAt": s.metadata.created_at.to_rfc3339(),
                            "updatedAt": s.metadata.updated_at.to_rfc3339(),
                        }
                    }))
                    .collect::<Vec<_>>()))
            }
            "cleanup_expired" => {
                let r = self.handlers.cleanup_expired().await?;
                Ok(json!({
                    "deletedCount": r.deleted_count,
                    "timestamp": r.timestamp.to_rfc3339(),
                }))
            }
            "status" => {
                let s = self.handlers.status().await?;
                Ok(json!({
                    "documentCount": s.document_count,
                    "chunkCount": s.chunk_count,
                    "memoryUsage": s.memory_usage_bytes,
                    "uptime": s.uptime_secs,
                    "ftsIndexEnabled": s.fts_index_enabled,
                    "searchMode": s.search_mode,
                }))
            }
            other => Err(AppError::validation(format!("unknown tool '{other}'"))),
        }
    }
}

fn error_message(e: &AppError) -> String {
    if cfg!(debug_assertions) {
        format!("{e:?}")
    } else {
        e.to_string()
    }
}

/// Reads newline-delimited JSON-RPC requests from stdin and writes replies to
/// stdout. One JSON value per line is this implementation's concrete
/// realization of spec.md §6's "length-delimited stdio" (grounded on
/// `DevsHero-NeuroSiphon/src/server.rs`'s `run_stdio_server`).
pub async fn run_stdio_server(handlers: Arc<Handlers>) -> anyhow::Result<()> {
    let state = ServerState::new(handlers);
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications carry no "id" and get no reply.
        let Some(id) = msg.get("id").cloned() else { continue };
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": "ragkeep", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));
                state.tool_call(id, &params).await
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({ "name": name, "description": description, "inputSchema": schema })
}

/// Tool registry, built once and reused across `tools/list` calls.
fn tool_definitions() -> &'static Vec<Value> {
    static CELL: OnceLock<Vec<Value>> = OnceLock::new();
    CELL.get_or_init(|| {
        vec![
            tool(
                "query_documents",
                "Hybrid lexical + dense search over ingested files and memorized text.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1, "maximum": 20, "default": 10},
                        "type": {"type": "string", "enum": ["all", "file", "memory"]},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "project": {"type": "string"},
                        "minScore": {"type": "number", "minimum": 0, "maximum": 2}
                    },
                    "required": ["query"]
                }),
            ),
            tool(
                "ingest_file",
                "Parse, chunk, embed, and persist a file from the configured root directory.",
                json!({
                    "type": "object",
                    "properties": {
                        "filePath": {"type": "string"},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "project": {"type": "string"},
                        "global": {"type": "boolean"}
                    },
                    "required": ["filePath"]
                }),
            ),
            tool(
                "memorize_text",
                "Persist a free-form text snippet as a memory://<label> source.",
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "label": {"type": "string"},
                        "language": {"type": "string"},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "type": {"type": "string", "enum": ["memory", "lesson", "note"]},
                        "ttl": {"type": "string", "description": "'permanent' or \\d+[dhmy]"},
                        "project": {"type": "string"},
                        "global": {"type": "boolean"}
                    },
                    "required": ["text"]
                }),
            ),
            tool(
                "update_memory",
                "Replace, append to, or prepend a previously memorized snippet, with tag changes.",
                json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "mode": {"type": "string", "enum": ["replace", "append", "prepend"], "default": "replace"},
                        "text": {"type": "string"},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "addTags": {"type": "array", "items": {"type": "string"}},
                        "removeTags": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["label"]
                }),
            ),
            tool(
                "delete_file",
                "Delete every chunk row for a filePath. Idempotent.",
                json!({
                    "type": "object",
                    "properties": { "filePath": {"type": "string"} },
                    "required": ["filePath"]
                }),
            ),
            tool(
                "list_files",
                "List ingested sources grouped by filePath with chunk counts and metadata.",
                json!({
                    "type": "object",
                    "properties": {
                        "type": {"type": "string", "enum": ["all", "file", "memory"]},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "project": {"type": "string"},
                        "search": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 0, "default": 50}
                    }
                }),
            ),
            tool(
                "cleanup_expired",
                "Delete every source whose expiresAt has passed.",
                json!({"type": "object", "properties": {}}),
            ),
            tool(
                "status",
                "Report document/chunk counts, approximate memory, uptime, and search mode.",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    })
}
