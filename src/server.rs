//! MCP stdio JSON-RPC server: speaks the same line-delimited JSON-RPC wire
//! protocol the teacher's server speaks (`initialize`, `tools/list`,
//! `tools/call`, `ping`, empty `resources/list`/`prompts/list`), generalized
//! from the teacher's fixed "code exploration megatool" catalog onto
//! [`ToolDispatcher`]'s dynamic tool registry.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::config::{load_config, project_id, Config};
use crate::embedding::{EmbeddingProvider, LocalHashEmbeddingProvider};
use crate::error::Result;
use crate::indexer::Indexer;
use crate::rate_limiter::RateLimiter;
use crate::retriever::Retriever;
use crate::scanner::ScanOptions;
use crate::tool_dispatcher::{ToolCall, ToolDispatcher};
use crate::vector_store::VectorStore;

/// The components a project root needs wired up: an opened store, an
/// embedding provider, a rate-limited indexer, a retriever, and the loaded
/// configuration they were built from. Shared by the CLI and the MCP server
/// so both speak to the same store/config for a given root.
pub struct ProjectRuntime {
    pub store: Arc<VectorStore>,
    pub indexer: Arc<Indexer>,
    pub retriever: Arc<Retriever>,
    pub config: Config,
}

/// Opens `<repo_root>/.semantica.json` (§6 process configuration object)
/// and wires up the store/indexer/retriever it describes.
pub async fn build_runtime(repo_root: &std::path::Path) -> Result<ProjectRuntime> {
    let cfg: Config = load_config(repo_root);

    let db_path = cfg.db_path(repo_root);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(VectorStore::open(&db_path).await?);

    let provider: Arc<dyn EmbeddingProvider> =
        Arc::new(LocalHashEmbeddingProvider::new(cfg.embedding.dimensions));

    let limiter = Arc::new(RateLimiter::new(
        cfg.rate_limiter.max_tokens,
        cfg.rate_limiter.refill_rate,
        cfg.rate_limiter.concurrency,
    ));

    let indexer = Arc::new(Indexer::new(
        store.clone(),
        provider.clone(),
        limiter,
        cfg.chunker.clone(),
        cfg.indexer.clone(),
    ));

    let retriever = Arc::new(Retriever::new(
        store.clone(),
        provider,
        cfg.retriever.hybrid_semantic_weight,
        cfg.retriever.hybrid_keyword_weight,
    ));

    Ok(ProjectRuntime {
        store,
        indexer,
        retriever,
        config: cfg,
    })
}

/// Wires a fresh [`ToolDispatcher`] for `repo_root`, honoring
/// `<repo_root>/.semantica.json` (§6 process configuration object).
pub async fn build_dispatcher(repo_root: PathBuf) -> Result<ToolDispatcher> {
    let rt = build_runtime(&repo_root).await?;

    let scan_options = ScanOptions {
        repo_root: repo_root.clone(),
        target: PathBuf::from("."),
        max_file_bytes: rt.config.scan.max_file_bytes,
        exclude_dir_names: rt.config.scan.exclude_dir_names.clone(),
    };

    Ok(ToolDispatcher::new(
        project_id(&repo_root),
        repo_root,
        rt.retriever,
        rt.indexer,
        scan_options,
        rt.config.retriever.default_top_k,
        rt.config.retriever.default_min_score,
        rt.config.retriever.context_default_max_tokens,
    ))
}

/// Returns `true` for roots that indicate the server started in the wrong
/// cwd (usually $HOME or the filesystem root).
fn is_dead_root(p: &std::path::Path) -> bool {
    if p.parent().is_none() || p.components().count() <= 1 {
        return true;
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        if p == std::path::Path::new(home.trim()) {
            return true;
        }
    }
    false
}

fn extract_path_from_uri(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://").unwrap_or(uri);
    let rest = if rest.starts_with('/')
        && rest.len() >= 3
        && rest.as_bytes()[1].is_ascii_alphabetic()
        && rest.as_bytes()[2] == b':'
    {
        &rest[1..]
    } else {
        rest
    };
    let s = rest.trim_end_matches('/');
    if s.is_empty() {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

/// Holds the resolved workspace root and the dispatcher built for it. The
/// dispatcher is rebuilt only when the root actually changes, since opening
/// the vector store is not free.
#[derive(Default)]
struct ServerState {
    repo_root: Option<PathBuf>,
    dispatcher: Option<ToolDispatcher>,
}

impl ServerState {
    fn capture_init_root(&mut self, params: &Value) {
        let raw_uri = params
            .get("workspaceFolders")
            .and_then(|f| f.as_array())
            .and_then(|a| a.first())
            .and_then(|f| f.get("uri").or_else(|| f.get("path")))
            .and_then(|v| v.as_str())
            .or_else(|| {
                params
                    .get("rootUri")
                    .or_else(|| params.get("rootPath"))
                    .and_then(|v| v.as_str())
            });
        if let Some(root) = raw_uri.and_then(extract_path_from_uri) {
            self.repo_root = Some(root);
        }
    }

    /// Resolves the workspace root for a `tools/call`, preferring an
    /// explicit per-call `repoPath` argument, falling back to the cached
    /// root from `initialize` or startup bootstrap.
    fn resolve_root(&mut self, args: &Value) -> std::result::Result<PathBuf, String> {
        if let Some(path) = args.get("repoPath").and_then(|v| v.as_str()) {
            let pb = PathBuf::from(path);
            self.repo_root = Some(pb.clone());
            return Ok(pb);
        }
        if let Some(root) = &self.repo_root {
            return Ok(root.clone());
        }
        let fallback = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        if is_dead_root(&fallback) {
            return Err(
                "workspace root resolved to the OS root or home directory; pass \
                 'repoPath' pointing at the project directory"
                    .to_string(),
            );
        }
        self.repo_root = Some(fallback.clone());
        Ok(fallback)
    }

    async fn ensure_dispatcher(&mut self, root: &PathBuf) -> Result<&ToolDispatcher> {
        let stale = match &self.dispatcher {
            Some(d) => d.project_root() != root.as_path(),
            None => true,
        };
        if stale {
            self.dispatcher = Some(build_dispatcher(root.clone()).await?);
        }
        Ok(self.dispatcher.as_ref().expect("just set"))
    }

    fn tool_list(&self, id: Value, dispatcher: Option<&ToolDispatcher>) -> Value {
        let tools: Vec<Value> = dispatcher
            .map(|d| {
                d.get_available_tools()
                    .into_iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.parameters,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tools } })
    }

    async fn tool_call(&mut self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let root = match self.resolve_root(&arguments) {
            Ok(r) => r,
            Err(msg) => return tool_error(id, &msg),
        };

        let dispatcher = match self.ensure_dispatcher(&root).await {
            Ok(d) => d,
            Err(e) => return tool_error(id, &e.to_string()),
        };

        let arguments = match arguments {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let call_id = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
        let result = dispatcher
            .execute(ToolCall {
                id: call_id,
                name,
                arguments,
            })
            .await;

        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{ "type": "text", "text": result.content }],
                "isError": result.error.is_some(),
            }
        })
    }
}

fn tool_error(id: Value, msg: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": { "content": [{ "type": "text", "text": msg }], "isError": true }
    })
}

/// Runs the MCP stdio loop: one JSON-RPC request per line on stdin, one
/// JSON-RPC response per line on stdout. Notifications (no `id`) are
/// processed for side effects but never answered.
pub async fn run_stdio_server(startup_root: Option<PathBuf>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    let mut state = ServerState::default();

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    let env_root = std::env::var("SEMANTICA_ROOT")
        .ok()
        .or_else(|| {
            std::env::var("PWD")
                .ok()
                .filter(|v| v.trim() != home.trim())
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    if let Some(r) = startup_root.or(env_root) {
        state.repo_root = Some(r);
    }

    info!("mcp stdio server starting");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discarding unparsable request line");
                continue;
            }
        };

        let has_id = msg.get("id").is_some();
        if !has_id {
            continue;
        }
        let id = msg.get("id").cloned().unwrap_or(json!(null));
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => {
                if let Some(p) = msg.get("params") {
                    state.capture_init_root(p);
                }
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": msg.get("params")
                            .and_then(|p| p.get("protocolVersion"))
                            .cloned()
                            .unwrap_or(json!("2024-11-05")),
                        "capabilities": { "tools": { "listChanged": true } },
                        "serverInfo": { "name": "semantica", "version": env!("CARGO_PKG_VERSION") }
                    }
                })
            }
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => {
                let dispatcher = match state.repo_root.clone() {
                    Some(root) => state.ensure_dispatcher(&root).await.ok(),
                    None => None,
                };
                state.tool_list(id, dispatcher)
            }
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                state.tool_call(id, &params).await
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {other}") }
            }),
        };

        let text = serde_json::to_string(&reply)?;
        stdout.write_all(text.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_root_detects_os_root_and_home() {
        assert!(is_dead_root(std::path::Path::new("/")));
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        assert!(is_dead_root(std::path::Path::new(&home)));
    }

    #[test]
    fn extract_path_from_uri_handles_unix_and_windows() {
        assert_eq!(
            extract_path_from_uri("file:///Users/hero/project"),
            Some(PathBuf::from("/Users/hero/project"))
        );
        assert_eq!(
            extract_path_from_uri("file:///C:/Users/hero/project"),
            Some(PathBuf::from("C:/Users/hero/project"))
        );
        assert_eq!(
            extract_path_from_uri("/plain/path/"),
            Some(PathBuf::from("/plain/path"))
        );
    }

    #[tokio::test]
    async fn build_dispatcher_succeeds_for_fresh_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn f() {}\n").unwrap();
        let dispatcher = build_dispatcher(dir.path().to_path_buf()).await.unwrap();
        assert!(!dispatcher.get_available_tools().is_empty());
    }
}
