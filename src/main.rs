use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use semantica::config::project_id;
use semantica::retriever::{SearchMode, SearchOptions};
use semantica::scanner::ScanOptions;
use semantica::server::{build_runtime, run_stdio_server};

#[derive(Debug, Parser)]
#[command(name = "semantica")]
#[command(version)]
#[command(about = "Semantic indexing and retrieval backend for developer-assistant tooling")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// (Re)index the project into the vector store
    Index,
    /// Search the indexed project
    Search {
        query: String,
        #[arg(long, default_value = "hybrid")]
        mode: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
    },
    /// Report index size and freshness for the current project
    Stats,
    /// Start the MCP stdio server
    Mcp,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Mcp = &cli.cmd {
        return run_stdio_server(cli.root).await;
    }

    let repo_root = match cli.root.clone() {
        Some(r) => r,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match cli.cmd {
        Command::Mcp => unreachable!("handled above"),
        Command::Index => run_index(&repo_root).await,
        Command::Search {
            query,
            mode,
            top_k,
            min_score,
        } => run_search(&repo_root, &query, &mode, top_k, min_score).await,
        Command::Stats => run_stats(&repo_root).await,
    }
}

async fn run_index(repo_root: &std::path::Path) -> Result<()> {
    let rt = build_runtime(repo_root).await?;
    let id = project_id(repo_root);

    let scan = ScanOptions {
        repo_root: repo_root.to_path_buf(),
        target: PathBuf::from("."),
        max_file_bytes: rt.config.scan.max_file_bytes,
        exclude_dir_names: rt.config.scan.exclude_dir_names.clone(),
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar.set_message("indexing...");

    let cancel = CancellationToken::new();
    let bar_clone = bar.clone();
    let on_progress = std::sync::Arc::new(move |p: semantica::indexer::FileProgress| {
        bar_clone.set_message(format!("{:?} {} ({}/{})", p.state, p.path, p.chunks_embedded, p.chunks_total));
    });

    let summary = rt
        .indexer
        .index_project(&id, repo_root, &scan, &cancel, Some(on_progress))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    bar.finish_and_clear();
    println!(
        "scanned {} files: {} up to date, {} (re)embedded, {} partial, {} deleted, {} chunks stored",
        summary.files_scanned,
        summary.files_up_to_date,
        summary.files_embedded,
        summary.files_partial,
        summary.files_deleted,
        summary.chunks_stored
    );
    Ok(())
}

async fn run_search(
    repo_root: &std::path::Path,
    query: &str,
    mode: &str,
    top_k: usize,
    min_score: f32,
) -> Result<()> {
    let rt = build_runtime(repo_root).await?;
    let id = project_id(repo_root);

    let mode: SearchMode = mode.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
    let opts = SearchOptions {
        mode,
        top_k,
        min_score,
    };

    let results = rt
        .retriever
        .search(&id, query, &opts)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    for r in &results {
        println!(
            "{:.4}  {}:{}-{}  {}",
            r.score,
            r.chunk.path,
            r.chunk.start_line,
            r.chunk.end_line,
            r.chunk.symbol_name.as_deref().unwrap_or(r.chunk.chunk_type.as_str())
        );
    }
    if results.is_empty() {
        eprintln!("no results");
    }
    Ok(())
}

async fn run_stats(repo_root: &std::path::Path) -> Result<()> {
    let rt = build_runtime(repo_root).await?;
    let id = project_id(repo_root);
    let stats = rt.store.get_stats(&id).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
