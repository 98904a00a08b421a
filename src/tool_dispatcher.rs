//! ToolDispatcher (C7): tool-calling registry and dispatch surface for an
//! LLM client (§4.7), grounded in the teacher's MCP stdio server — same
//! catalog/registry shape, generalized from "code exploration" tools onto
//! the Retriever/Indexer/git surface this crate implements.
//!
//! Every handler returns `crate::error::Result`; none of them `unwrap`,
//! `expect`, or index without a bounds check, so the "handlers must not
//! panic" requirement is satisfied by construction rather than by wrapping
//! each call in `catch_unwind` (async closures are rarely `UnwindSafe`, and
//! the pack's own tool dispatchers rely on the same Result-only discipline).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context_builder::{self, BundleEntry, BuildOptions, OutputFormat};
use crate::error::{Error, Result};
use crate::indexer::{Indexer, ProgressCallback};
use crate::retriever::{Retriever, SearchMode, SearchOptions};
use crate::scanner::ScanOptions;
use crate::{git, inspector};

#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ToolDispatcher {
    project_id: String,
    project_root: PathBuf,
    retriever: Arc<Retriever>,
    indexer: Arc<Indexer>,
    scan_options: ScanOptions,
    default_top_k: usize,
    default_min_score: f32,
    context_default_max_tokens: u32,
}

impl ToolDispatcher {
    pub fn new(
        project_id: String,
        project_root: PathBuf,
        retriever: Arc<Retriever>,
        indexer: Arc<Indexer>,
        scan_options: ScanOptions,
        default_top_k: usize,
        default_min_score: f32,
        context_default_max_tokens: u32,
    ) -> Self {
        Self {
            project_id,
            project_root,
            retriever,
            indexer,
            scan_options,
            default_top_k,
            default_min_score,
            context_default_max_tokens,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Full declaration list, in a fixed deterministic order (§4.7
    /// `GetAvailableTools`).
    pub fn get_available_tools(&self) -> Vec<ToolDeclaration> {
        vec![
            decl("semantic_search", "Search the indexed project for semantically or lexically relevant code.", json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "mode": {"type": "string", "enum": ["semantic", "keyword", "hybrid"]},
                    "top_k": {"type": "integer"},
                    "min_score": {"type": "number"}
                },
                "required": ["query"]
            })),
            decl("find_similar_code", "Find chunks similar to the code at a given file/line range.", json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "end_line": {"type": "integer"},
                    "top_k": {"type": "integer"},
                    "exclude_self": {"type": "boolean"}
                },
                "required": ["file_path", "start_line", "end_line"]
            })),
            decl("get_relevant_context", "Assemble a token-budgeted context bundle relevant to a query.", json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_tokens": {"type": "integer"}
                },
                "required": ["query"]
            })),
            decl("index_project", "(Re)index the project in the background.", json!({
                "type": "object",
                "properties": {},
                "required": []
            })),
            decl("semantic_search_stats", "Report index size and freshness for the current project.", json!({
                "type": "object",
                "properties": {},
                "required": []
            })),
            decl("read_file", "Read a project-relative file's contents.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
            decl("list_symbols", "List the symbols (functions, classes, methods...) found in a file.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
            decl("git_status", "Show the working tree status.", json!({"type": "object", "properties": {}, "required": []})),
            decl("git_diff", "Show uncommitted changes, optionally scoped to a path.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "staged": {"type": "boolean"}},
                "required": []
            })),
            decl("git_log", "Show recent commit history, optionally scoped to a path.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "limit": {"type": "integer"}},
                "required": []
            })),
            decl("git_blame", "Show line-by-line commit attribution for a file.", json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "end_line": {"type": "integer"}
                },
                "required": ["path"]
            })),
            decl("git_show", "Show a commit's patch and metadata.", json!({
                "type": "object",
                "properties": {"revision": {"type": "string"}},
                "required": ["revision"]
            })),
            decl("git_file_history", "Show the commit history of a single file, following renames.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
            decl("git_co_changed", "List files most frequently committed alongside a given file.", json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
            decl("git_suggest_context", "Suggest related files by combining semantic search with co-change history.", json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            })),
        ]
    }

    /// Executes one tool call, never propagating a handler error — it is
    /// converted into `ToolResult.error` instead (§4.7 `Execute`).
    pub async fn execute(&self, call: ToolCall) -> ToolResult {
        let outcome = self.dispatch(&call.name, &call.arguments).await;
        match outcome {
            Ok(content) => ToolResult { tool_call_id: call.id, content, error: None },
            Err(e) => {
                error!(tool = %call.name, error = %e, "tool execution failed");
                ToolResult { tool_call_id: call.id, content: String::new(), error: Some(e.to_string()) }
            }
        }
    }

    async fn dispatch(&self, name: &str, args: &Map<String, Value>) -> Result<String> {
        match name {
            "semantic_search" => self.handle_semantic_search(args).await,
            "find_similar_code" => self.handle_find_similar_code(args).await,
            "get_relevant_context" => self.handle_get_relevant_context(args).await,
            "index_project" => self.handle_index_project(args).await,
            "semantic_search_stats" => self.handle_semantic_search_stats().await,
            "read_file" => self.handle_read_file(args).await,
            "list_symbols" => self.handle_list_symbols(args).await,
            "git_status" => git::status(&self.project_root).map_err(Into::into),
            "git_diff" => {
                let path = get_string_opt(args, "path");
                let staged = get_bool_opt(args, "staged", false);
                git::diff(&self.project_root, path.as_deref(), staged)
            }
            "git_log" => {
                let path = get_string_opt(args, "path");
                let limit = get_int_opt(args, "limit", 20)? as u32;
                git::log(&self.project_root, path.as_deref(), limit)
            }
            "git_blame" => {
                let path = get_string_req(args, "path")?;
                let start_line = get_int_opt(args, "start_line", -1)?;
                let end_line = get_int_opt(args, "end_line", -1)?;
                let range = if start_line >= 0 && end_line >= 0 {
                    (Some(start_line as u32), Some(end_line as u32))
                } else {
                    (None, None)
                };
                git::blame(&self.project_root, &path, range.0, range.1)
            }
            "git_show" => {
                let revision = get_string_req(args, "revision")?;
                git::show(&self.project_root, &revision)
            }
            "git_file_history" => {
                let path = get_string_req(args, "path")?;
                git::file_history(&self.project_root, &path)
            }
            "git_co_changed" => {
                let path = get_string_req(args, "path")?;
                let ranked = git::co_changed(&self.project_root, &path)?;
                Ok(render_co_changed(&ranked))
            }
            "git_suggest_context" => self.handle_git_suggest_context(args).await,
            other => Err(Error::Validation(format!("unknown tool: {other}"))),
        }
    }

    async fn handle_semantic_search(&self, args: &Map<String, Value>) -> Result<String> {
        let query = get_string_req(args, "query")?;
        let mode = match get_string_opt(args, "mode") {
            Some(m) => m.parse::<SearchMode>()?,
            None => SearchMode::Hybrid,
        };
        let top_k = get_int_opt(args, "top_k", self.default_top_k as i64)? as usize;
        let min_score = get_float_opt(args, "min_score", self.default_min_score as f64) as f32;

        let results = self
            .retriever
            .search(&self.project_id, &query, &SearchOptions { mode, top_k, min_score })
            .await?;
        Ok(render_scored_chunks(&results))
    }

    async fn handle_find_similar_code(&self, args: &Map<String, Value>) -> Result<String> {
        let file_path = get_string_req(args, "file_path")?;
        let start_line = get_int_opt(args, "start_line", 0)? as u32;
        let end_line = get_int_opt(args, "end_line", 0)? as u32;
        let top_k = get_int_opt(args, "top_k", self.default_top_k as i64)? as usize;
        let exclude_self = get_bool_opt(args, "exclude_self", true);

        let results = self
            .retriever
            .find_similar(&self.project_id, &file_path, start_line, end_line, top_k, self.default_min_score, exclude_self)
            .await?;
        Ok(render_scored_chunks(&results))
    }

    async fn handle_get_relevant_context(&self, args: &Map<String, Value>) -> Result<String> {
        let query = get_string_req(args, "query")?;
        let max_tokens = get_int_opt(args, "max_tokens", self.context_default_max_tokens as i64)? as u32;
        let results = self.retriever.retrieve_context(&self.project_id, &query, max_tokens).await?;

        let entries: Vec<BundleEntry> = results
            .into_iter()
            .map(|sc| BundleEntry {
                path: format!("{}:{}-{}", sc.chunk.path, sc.chunk.start_line, sc.chunk.end_line),
                content: sc.chunk.content,
            })
            .collect();
        Ok(context_builder::build(&entries, &BuildOptions { format: OutputFormat::Plain, strip_comments: false }))
    }

    /// Launches indexing in the background under an independent 30-minute
    /// deadline, unaffected by the caller's own context (§5).
    async fn handle_index_project(&self, _args: &Map<String, Value>) -> Result<String> {
        let indexer = self.indexer.clone();
        let project_id = self.project_id.clone();
        let project_root = self.project_root.clone();
        let scan_options = self.scan_options.clone();

        tokio::spawn(async move {
            let deadline = CancellationToken::new();
            let deadline_timer = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30 * 60)).await;
                deadline_timer.cancel();
            });

            let progress: ProgressCallback = Arc::new(|p| {
                info!(path = %p.path, state = ?p.state, "index progress");
            });

            match indexer.index_project(&project_id, &project_root, &scan_options, &deadline, Some(progress)).await {
                Ok(summary) => info!(project_id, ?summary, "background index_project finished"),
                Err(e) => error!(project_id, error = %e, "background index_project failed"),
            }
        });

        Ok(format!("indexing started for project {}", self.project_id))
    }

    async fn handle_semantic_search_stats(&self) -> Result<String> {
        let stats = self.retriever.get_stats(&self.project_id).await?;
        serde_json::to_string_pretty(&stats).map_err(|e| Error::Internal(e.to_string()))
    }

    async fn handle_read_file(&self, args: &Map<String, Value>) -> Result<String> {
        let path = get_string_req(args, "path")?;
        let abs = self.project_root.join(&path);
        std::fs::read_to_string(&abs).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("file not found: {path}"))
            } else {
                Error::Io(e)
            }
        })
    }

    async fn handle_list_symbols(&self, args: &Map<String, Value>) -> Result<String> {
        let path = get_string_req(args, "path")?;
        let abs = self.project_root.join(&path);
        let symbols = inspector::analyze_file(&abs).map_err(|e| Error::NotFound(e.to_string()))?;
        serde_json::to_string_pretty(&symbols).map_err(|e| Error::Internal(e.to_string()))
    }

    async fn handle_git_suggest_context(&self, args: &Map<String, Value>) -> Result<String> {
        let query = get_string_req(args, "query")?;
        let results = self
            .retriever
            .search(&self.project_id, &query, &SearchOptions { mode: SearchMode::Hybrid, top_k: self.default_top_k, min_score: self.default_min_score })
            .await?;

        let mut out = render_scored_chunks(&results);
        if let Some(top) = results.first() {
            if let Ok(ranked) = git::co_changed(&self.project_root, &top.chunk.path) {
                out.push_str("\n\nfiles frequently co-changed with ");
                out.push_str(&top.chunk.path);
                out.push_str(":\n");
                out.push_str(&render_co_changed(&ranked));
            }
        }
        Ok(out)
    }
}

fn decl(name: &'static str, description: &'static str, parameters: Value) -> ToolDeclaration {
    ToolDeclaration { name, description, parameters }
}

fn render_scored_chunks(results: &[crate::types::ScoredChunk]) -> String {
    results
        .iter()
        .map(|sc| format!("{}:{}-{} (score {:.4})\n{}", sc.chunk.path, sc.chunk.start_line, sc.chunk.end_line, sc.score, sc.chunk.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_co_changed(ranked: &[(String, u32)]) -> String {
    ranked.iter().map(|(path, count)| format!("{path} ({count})")).collect::<Vec<_>>().join("\n")
}

fn get_string_req(args: &Map<String, Value>, name: &str) -> Result<String> {
    get_string_opt(args, name).ok_or_else(|| Error::Validation(format!("{name} is required")))
}

/// Accepts a JSON string; non-string scalars are rejected rather than
/// silently stringified (§4.7 coercion rules only widen numeric inputs).
fn get_string_opt(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn get_bool_opt(args: &Map<String, Value>, name: &str, default: bool) -> bool {
    args.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// Numbers accept a JSON number, an integer-like string, or the underlying
/// integer itself (§4.7 argument coercion rules).
fn get_int_opt(args: &Map<String, Value>, name: &str, default: i64) -> Result<i64> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| Error::Validation(format!("{name} must be an integer"))),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map_err(|_| Error::Validation(format!("{name} must be an integer-like string"))),
        Some(_) => Err(Error::Validation(format!("{name} must be a number"))),
    }
}

fn get_float_opt(args: &Map<String, Value>, name: &str, default: f64) -> f64 {
    match args.get(name) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(default),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::{EmbeddingProvider, LocalHashEmbeddingProvider};
    use crate::rate_limiter::RateLimiter;
    use crate::vector_store::VectorStore;

    async fn build_dispatcher(dir: &Path) -> ToolDispatcher {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LocalHashEmbeddingProvider::new(32));
        let limiter = Arc::new(RateLimiter::new(100.0, 100.0, 4));
        let config = Config::default();
        let indexer = Arc::new(Indexer::new(store.clone(), provider.clone(), limiter, config.chunker.clone(), config.indexer.clone()));
        let retriever = Arc::new(Retriever::new(store.clone(), provider, 0.6, 0.4));
        let scan_options = ScanOptions {
            repo_root: dir.to_path_buf(),
            target: dir.to_path_buf(),
            max_file_bytes: 5 * 1024 * 1024,
            exclude_dir_names: vec![],
        };
        let _ = store;
        ToolDispatcher::new("p1".to_string(), dir.to_path_buf(), retriever, indexer, scan_options, 10, 0.0, 4000)
    }

    #[tokio::test]
    async fn unknown_tool_reports_expected_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path()).await;
        let result = dispatcher
            .execute(ToolCall { id: "1".into(), name: "nope".into(), arguments: Map::new() })
            .await;
        assert_eq!(result.error.as_deref(), Some("validation: unknown tool: nope"));
    }

    #[tokio::test]
    async fn missing_required_argument_reports_expected_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path()).await;
        let result = dispatcher
            .execute(ToolCall { id: "1".into(), name: "semantic_search".into(), arguments: Map::new() })
            .await;
        assert_eq!(result.error.as_deref(), Some("validation: query is required"));
    }

    #[tokio::test]
    async fn read_file_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let dispatcher = build_dispatcher(dir.path()).await;
        let mut args = Map::new();
        args.insert("path".into(), json!("a.txt"));
        let result = dispatcher.execute(ToolCall { id: "1".into(), name: "read_file".into(), arguments: args }).await;
        assert!(result.error.is_none());
        assert_eq!(result.content, "hello\n");
    }

    #[tokio::test]
    async fn read_file_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path()).await;
        let mut args = Map::new();
        args.insert("path".into(), json!("missing.txt"));
        let result = dispatcher.execute(ToolCall { id: "1".into(), name: "read_file".into(), arguments: args }).await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn get_available_tools_includes_full_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path()).await;
        let tools = dispatcher.get_available_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name).collect();
        for expected in ["semantic_search", "find_similar_code", "get_relevant_context", "index_project", "git_suggest_context"] {
            assert!(names.contains(&expected), "missing tool: {expected}");
        }
    }
}
