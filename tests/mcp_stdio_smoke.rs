use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Spawns the built binary in `mcp` mode and exercises `initialize`,
/// `tools/list`, and a `status` tool call over stdio.
///
/// `status` is chosen over a data-touching tool because it never calls the
/// embedder, so this test does not depend on network access to HuggingFace
/// Hub to download a model.
#[test]
fn mcp_stdio_smoke() {
    let bin = env!("CARGO_BIN_EXE_ragkeep");
    let db_dir = tempfile::tempdir().expect("tempdir for db");
    let root_dir = tempfile::tempdir().expect("tempdir for root");

    let mut child = Command::new(bin)
        .arg("--root")
        .arg(root_dir.path())
        .arg("mcp")
        .env("RAG_DB_DIR", db_dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ragkeep mcp");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "status", "arguments": {} }
            })
        )
        .unwrap();
    }

    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);

    let mut replies_by_id: HashMap<i64, serde_json::Value> = HashMap::new();
    for line in reader.lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&line).expect("stdout is json");
        let id = v.get("id").and_then(|x| x.as_i64()).expect("json-rpc response id");
        replies_by_id.insert(id, v);
        if replies_by_id.len() >= 3 {
            break;
        }
    }

    let _ = child.kill();

    let init = replies_by_id.get(&1).expect("initialize reply");
    assert_eq!(init["result"]["serverInfo"]["name"], "ragkeep");

    let list = replies_by_id.get(&2).expect("tools/list reply");
    let tools = list["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in [
        "query_documents",
        "ingest_file",
        "memorize_text",
        "update_memory",
        "delete_file",
        "list_files",
        "cleanup_expired",
        "status",
    ] {
        assert!(names.contains(&expected), "missing tool '{expected}' in tools/list");
    }

    let status = replies_by_id.get(&3).expect("status tool call reply");
    assert_eq!(status["result"]["isError"], false);
    let text = status["result"]["content"][0]["text"].as_str().expect("status text");
    let payload: serde_json::Value = serde_json::from_str(text).expect("status payload is json");
    assert_eq!(payload["documentCount"], 0);
    assert_eq!(payload["chunkCount"], 0);
}
