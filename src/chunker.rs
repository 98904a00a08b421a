//! Chunker (C2): splits file bytes into bounded, overlap-stitched,
//! symbol-aware chunks with stable IDs (§4.2).

use serde::{Deserialize, Serialize};

use crate::inspector;
use crate::types::{Chunk, ChunkType, SymbolInfo};

/// Closed extension->language table (§4.2 step 1). Unknown extensions map
/// to `"unknown"`. Reuses the teacher's existing `LanguageConfig`
/// extension set rather than inventing a second table.
pub fn detect_language(path: &str) -> String {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "php" => "php",
        "rb" => "ruby",
        "kt" | "kts" => "kotlin",
        "swift" => "swift",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        _ => "unknown",
    }
    .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_chunk_tokens: u32,
    pub min_chunk_tokens: u32,
    pub overlap_tokens: u32,
    pub prefer_symbols: bool,
    pub include_context: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 512,
            min_chunk_tokens: 5,
            overlap_tokens: 50,
            prefer_symbols: true,
            include_context: false,
        }
    }
}

/// Lines are kept without their trailing newline; `tokens(line)` reuses the
/// crate-wide `runeCount/4` estimator applied to a joined slice.
fn tokens_of(lines: &[&str]) -> u32 {
    let joined = lines.join("\n");
    crate::types::estimate_tokens(&joined)
}

fn emit_block(
    project_id: &str,
    path: &str,
    lines: &[&str],
    start_line: u32,
    end_line: u32,
    language: &str,
) -> Chunk {
    let text = lines.join("\n");
    Chunk::new(
        project_id,
        path,
        text,
        start_line,
        end_line,
        ChunkType::Block,
        None,
        None,
        language,
    )
}

/// Splits `content` (already decoded to UTF-8) into ordered chunks obeying
/// the invariants of §3 and the algorithm of §4.2.
///
/// `path` is project-relative, forward-slash normalized per §3.
pub fn chunk_file(
    project_id: &str,
    path: &str,
    content: &str,
    symbols: &[SymbolInfo],
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    if content.is_empty() {
        return vec![];
    }

    let language = detect_language(path);
    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len() as u32;

    if config.prefer_symbols && !symbols.is_empty() {
        symbol_guided_chunks(project_id, path, &lines, total_lines, symbols, &language, config)
    } else {
        fixed_size_chunks(project_id, path, &lines, total_lines, &language, config)
    }
}

/// Convenience wrapper: extracts `SymbolInfo` via the symbol-graph
/// collaborator (`inspector::extract_symbols_from_source`) before chunking.
pub fn chunk_file_autodetect_symbols(
    project_id: &str,
    path: &str,
    content: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let symbols: Vec<SymbolInfo> = if config.prefer_symbols {
        inspector::extract_symbols_from_source(std::path::Path::new(path), content)
            .into_iter()
            .map(|s| SymbolInfo {
                name: s.name,
                kind: s.kind,
                // inspector::Symbol lines are 0-indexed; Chunk lines are 1-based inclusive.
                start_line: s.line + 1,
                end_line: s.line_end + 1,
            })
            .collect()
    } else {
        vec![]
    };
    chunk_file(project_id, path, content, &symbols, config)
}

fn symbol_guided_chunks(
    project_id: &str,
    path: &str,
    lines: &[&str],
    total_lines: u32,
    symbols: &[SymbolInfo],
    language: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let mut used = vec![false; (total_lines as usize) + 1];
    let mut out = Vec::new();

    let mut sorted_symbols: Vec<&SymbolInfo> = symbols
        .iter()
        .filter(|s| s.start_line >= 1 && s.end_line <= total_lines && s.start_line <= s.end_line)
        .collect();
    sorted_symbols.sort_by_key(|s| s.start_line);

    for sym in &sorted_symbols {
        let sym_lines = &lines[(sym.start_line - 1) as usize..sym.end_line as usize];
        let est_tokens = tokens_of(sym_lines);
        if est_tokens < config.min_chunk_tokens {
            continue;
        }

        if est_tokens <= config.max_chunk_tokens {
            let text = sym_lines.join("\n");
            out.push(Chunk::new(
                project_id,
                path,
                text,
                sym.start_line,
                sym.end_line,
                symbol_chunk_type(&sym.kind),
                Some(sym.name.clone()),
                Some(sym.kind.clone()),
                language,
            ));
        } else {
            out.extend(split_oversized_symbol(
                project_id,
                path,
                sym_lines,
                sym.start_line,
                language,
                config,
            ));
        }

        for l in sym.start_line..=sym.end_line {
            if (l as usize) < used.len() {
                used[l as usize] = true;
            }
        }
    }

    out.extend(sweep_unused_lines(project_id, path, lines, total_lines, &used, language, config));
    out.sort_by_key(|c| c.start_line);
    out
}

fn symbol_chunk_type(kind: &str) -> ChunkType {
    let lower = kind.to_lowercase();
    if lower.contains("class") || lower.contains("struct") || lower.contains("interface") || lower.contains("trait")
    {
        ChunkType::Class
    } else if lower.contains("method") {
        ChunkType::Method
    } else {
        ChunkType::Function
    }
}

/// A symbol whose token estimate exceeds `max_chunk_tokens` is split by
/// accumulating lines until the running sum would exceed the budget, then
/// the next chunk starts with an `overlap_tokens`-sized tail of the
/// previous one (§4.2 step 3a).
fn split_oversized_symbol(
    project_id: &str,
    path: &str,
    sym_lines: &[&str],
    sym_start_line: u32,
    language: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor < sym_lines.len() {
        let mut end = cursor;
        let mut acc: Vec<&str> = Vec::new();
        while end < sym_lines.len() {
            let mut candidate = acc.clone();
            candidate.push(sym_lines[end]);
            if tokens_of(&candidate) > config.max_chunk_tokens && !acc.is_empty() {
                break;
            }
            acc.push(sym_lines[end]);
            end += 1;
        }
        if acc.is_empty() {
            // A single line already exceeds the budget; take it anyway to
            // guarantee forward progress.
            acc.push(sym_lines[end]);
            end += 1;
        }

        let start_line = sym_start_line + cursor as u32;
        let end_line = sym_start_line + (end as u32) - 1;
        out.push(emit_block(project_id, path, &acc, start_line, end_line, language));

        if end >= sym_lines.len() {
            break;
        }

        // Next chunk begins with an overlap_tokens-sized suffix of the
        // previous chunk rather than immediately after `end`.
        let mut overlap_lines = 0usize;
        let mut overlap_tok = 0u32;
        for i in (0..acc.len()).rev() {
            let line_tok = crate::types::estimate_tokens(acc[i]);
            if overlap_tok + line_tok > config.overlap_tokens && overlap_lines > 0 {
                break;
            }
            overlap_tok += line_tok;
            overlap_lines += 1;
        }
        cursor = end.saturating_sub(overlap_lines).max(cursor + 1);
    }

    out
}

/// Lines not covered by any symbol chunk are swept in file order and
/// packed into `block` chunks respecting the min/max token bounds
/// (§4.2 step 3c). A remainder run that stays below `min_chunk_tokens`
/// is kept as-is in symbol mode (§4.2 edge cases) — merging into an
/// adjacent chunk is explicitly left underspecified by §9 open question 2.
fn sweep_unused_lines(
    project_id: &str,
    path: &str,
    lines: &[&str],
    total_lines: u32,
    used: &[bool],
    language: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut run_start: Option<u32> = None;

    let mut flush = |run_start: u32, run_end: u32, out: &mut Vec<Chunk>| {
        let slice = &lines[(run_start - 1) as usize..run_end as usize];
        for group in pack_into_budget(slice, run_start, config) {
            out.push(emit_block(project_id, path, &group.0, group.1, group.2, language));
        }
    };

    for line_no in 1..=total_lines {
        let is_used = used.get(line_no as usize).copied().unwrap_or(false);
        match (is_used, run_start) {
            (false, None) => run_start = Some(line_no),
            (true, Some(start)) => {
                flush(start, line_no - 1, &mut out);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        flush(start, total_lines, &mut out);
    }

    out
}

/// Packs a contiguous slice of lines into (lines, start, end) groups
/// bounded by `max_chunk_tokens`.
fn pack_into_budget<'a>(
    lines: &[&'a str],
    base_line: u32,
    config: &ChunkerConfig,
) -> Vec<(Vec<&'a str>, u32, u32)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < lines.len() {
        let mut end = cursor;
        let mut acc: Vec<&str> = Vec::new();
        while end < lines.len() {
            let mut candidate = acc.clone();
            candidate.push(lines[end]);
            if tokens_of(&candidate) > config.max_chunk_tokens && !acc.is_empty() {
                break;
            }
            acc.push(lines[end]);
            end += 1;
        }
        if acc.is_empty() {
            acc.push(lines[end]);
            end += 1;
        }
        let start_line = base_line + cursor as u32;
        let end_line = base_line + (end as u32) - 1;
        out.push((acc, start_line, end_line));
        cursor = end;
    }
    out
}

/// Fixed-size chunking: accumulate lines until `max_chunk_tokens`, emit,
/// restart with an `overlap_tokens`-sized tail overlap (§4.2 step 4). A
/// trailing remainder below `min_chunk_tokens` is discarded.
fn fixed_size_chunks(
    project_id: &str,
    path: &str,
    lines: &[&str],
    total_lines: u32,
    language: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut cursor = 0usize;

    while cursor < lines.len() {
        let mut end = cursor;
        let mut acc: Vec<&str> = Vec::new();
        while end < lines.len() {
            let mut candidate = acc.clone();
            candidate.push(lines[end]);
            if tokens_of(&candidate) > config.max_chunk_tokens && !acc.is_empty() {
                break;
            }
            acc.push(lines[end]);
            end += 1;
        }
        if acc.is_empty() {
            acc.push(lines[end]);
            end += 1;
        }

        let is_last = end >= lines.len();
        if is_last && tokens_of(&acc) < config.min_chunk_tokens && !out.is_empty() {
            // Trailing remainder below the minimum is discarded in fixed-size mode.
            break;
        }

        let start_line = cursor as u32 + 1;
        let end_line = end as u32;
        out.push(emit_block(project_id, path, &acc, start_line, end_line, language));

        if is_last {
            break;
        }

        let mut overlap_lines = 0usize;
        let mut overlap_tok = 0u32;
        for i in (0..acc.len()).rev() {
            let line_tok = crate::types::estimate_tokens(acc[i]);
            if overlap_tok + line_tok > config.overlap_tokens && overlap_lines > 0 {
                break;
            }
            overlap_tok += line_tok;
            overlap_lines += 1;
        }
        cursor = end.saturating_sub(overlap_lines).max(cursor + 1);
    }

    let _ = total_lines;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_no_chunks() {
        let chunks = chunk_file("p", "empty.rs", "", &[], &ChunkerConfig::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn single_symbol_yields_one_function_chunk() {
        // Scenario 2 of §8: a 20-line function, symbols provide
        // {main, function, 1, 20}.
        let content: String = (1..=20).map(|i| format!("line {i}\n")).collect();
        let symbols = vec![SymbolInfo {
            name: "main".to_string(),
            kind: "function".to_string(),
            start_line: 1,
            end_line: 20,
        }];
        let config = ChunkerConfig {
            max_chunk_tokens: 512,
            min_chunk_tokens: 5,
            overlap_tokens: 10,
            prefer_symbols: true,
            include_context: false,
        };
        let chunks = chunk_file("p", "main.go", &content, &symbols, &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].symbol_name.as_deref(), Some("main"));
        assert_eq!(chunks[0].chunk_type, ChunkType::Function);
        assert_eq!(chunks[0].token_count, crate::types::estimate_tokens(&chunks[0].content));
    }

    #[test]
    fn fixed_size_mode_overlaps_and_covers_all_lines() {
        let content: String = (1..=100).map(|i| format!("x{i}\n")).collect();
        let config = ChunkerConfig {
            max_chunk_tokens: 10,
            min_chunk_tokens: 1,
            overlap_tokens: 2,
            prefer_symbols: false,
            include_context: false,
        };
        let chunks = chunk_file("p", "f.txt", &content, &[], &config);
        assert!(chunks.len() > 1);
        // Every line number appears in at least one chunk.
        let max_end = chunks.iter().map(|c| c.end_line).max().unwrap();
        assert_eq!(max_end, 100);
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let content = "fn a() {}\nfn b() {}\n";
        let a = chunk_file("p", "x.rs", content, &[], &ChunkerConfig::default());
        let b = chunk_file("p", "x.rs", content, &[], &ChunkerConfig::default());
        assert_eq!(a.iter().map(|c| &c.id).collect::<Vec<_>>(), b.iter().map(|c| &c.id).collect::<Vec<_>>());
    }

    #[test]
    fn unknown_extension_maps_to_unknown_language() {
        assert_eq!(detect_language("foo.bar"), "unknown");
        assert_eq!(detect_language("foo.rs"), "rust");
    }
}
