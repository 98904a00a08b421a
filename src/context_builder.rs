//! ContextBuilder (C8): parses a header-delimited text stream and re-emits
//! it deterministically as `plain`, `manifest`, or `json` (§4.8).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const HEADER_PREFIX: &str = "--- File: ";
const HEADER_SUFFIX: &str = " ---";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    Manifest,
    Json,
}

/// Unknown aliases fall back to `manifest` (§4.8).
pub fn parse_format(alias: &str) -> OutputFormat {
    match alias {
        "plain" => OutputFormat::Plain,
        "json" => OutputFormat::Json,
        "manifest" => OutputFormat::Manifest,
        _ => OutputFormat::Manifest,
    }
}

/// Splits `--- File: <path> ---` headers from their bodies. Paths are
/// trimmed; bodies are trimmed of surrounding whitespace and run until the
/// next header or end of stream.
pub fn parse_bundle(input: &str) -> Vec<BundleEntry> {
    let mut entries = Vec::new();
    let mut current_path: Option<String> = None;
    let mut body_lines: Vec<&str> = Vec::new();

    let flush = |path: &Option<String>, body: &[&str], out: &mut Vec<BundleEntry>| {
        if let Some(p) = path {
            out.push(BundleEntry {
                path: p.clone(),
                content: body.join("\n").trim().to_string(),
            });
        }
    };

    for line in input.lines() {
        if let Some(path) = parse_header(line) {
            flush(&current_path, &body_lines, &mut entries);
            current_path = Some(path);
            body_lines = Vec::new();
        } else {
            body_lines.push(line);
        }
    }
    flush(&current_path, &body_lines, &mut entries);

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn parse_header(line: &str) -> Option<String> {
    let trimmed = line.trim_end();
    if trimmed.starts_with(HEADER_PREFIX) && trimmed.ends_with(HEADER_SUFFIX) {
        let inner = &trimmed[HEADER_PREFIX.len()..trimmed.len() - HEADER_SUFFIX.len()];
        Some(inner.trim().to_string())
    } else {
        None
    }
}

static LINE_COMMENT_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"//.*$").unwrap());
static LINE_COMMENT_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"#.*$").unwrap());
static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

/// Best-effort comment strip applied after parsing, before output (§4.8
/// `stripComments`). Not syntax-aware: a `//` or `#` inside a string
/// literal is stripped too, which is an accepted limitation of a
/// regex-based pass.
pub fn strip_comments(content: &str) -> String {
    let no_block = BLOCK_COMMENT.replace_all(content, "");
    no_block
        .lines()
        .map(|line| {
            let stripped = LINE_COMMENT_SLASH.replace(line, "");
            LINE_COMMENT_HASH.replace(&stripped, "").trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub format: OutputFormat,
    pub strip_comments: bool,
}

/// Re-emits `entries` in `opts.format`. Byte-for-byte deterministic given
/// the same input and options (§4.8).
pub fn build(entries: &[BundleEntry], opts: &BuildOptions) -> String {
    let processed: Vec<BundleEntry> = entries
        .iter()
        .map(|e| BundleEntry {
            path: e.path.clone(),
            content: if opts.strip_comments { strip_comments(&e.content) } else { e.content.clone() },
        })
        .collect();

    match opts.format {
        OutputFormat::Plain => render_plain(&processed),
        OutputFormat::Manifest => render_manifest(&processed),
        OutputFormat::Json => render_json(&processed),
    }
}

fn render_plain(entries: &[BundleEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{HEADER_PREFIX}{}{HEADER_SUFFIX}\n{}", e.path, e.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_json(entries: &[BundleEntry]) -> String {
    serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string())
}

/// Builds a path tree and renders it with `├─`/`└─`/`│  `/`   ` glyphs,
/// children sorted lexicographically, followed by the plain body (§4.8).
fn render_manifest(entries: &[BundleEntry]) -> String {
    #[derive(Default)]
    struct TreeNode {
        children: BTreeMap<String, TreeNode>,
    }

    let mut root = TreeNode::default();
    for e in entries {
        let mut node = &mut root;
        for segment in e.path.split('/') {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    fn render(node: &TreeNode, prefix: &str, out: &mut String) {
        let count = node.children.len();
        for (i, (name, child)) in node.children.iter().enumerate() {
            let is_last = i == count - 1;
            let connector = if is_last { "└─" } else { "├─" };
            out.push_str(prefix);
            out.push_str(connector);
            out.push_str(name);
            out.push('\n');
            let child_prefix = format!("{prefix}{}", if is_last { "   " } else { "│  " });
            render(child, &child_prefix, out);
        }
    }

    let mut tree = String::new();
    render(&root, "", &mut tree);

    format!("{}\n{}", tree.trim_end(), render_plain(entries))
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_sorts_by_path() {
        let input = "--- File: b.rs ---\nfn b() {}\n--- File: a.rs ---\nfn a() {}\n";
        let entries = parse_bundle(input);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "a.rs");
        assert_eq!(entries[1].path, "b.rs");
    }

    #[test]
    fn unknown_format_alias_falls_back_to_manifest() {
        assert_eq!(parse_format("yaml"), OutputFormat::Manifest);
        assert_eq!(parse_format("plain"), OutputFormat::Plain);
    }

    #[test]
    fn strip_comments_removes_line_and_block_comments() {
        let src = "let x = 1; // trailing\n/* block\nspanning */\nlet y = 2;\n";
        let stripped = strip_comments(src);
        assert!(!stripped.contains("trailing"));
        assert!(!stripped.contains("block"));
        assert!(stripped.contains("let y = 2;"));
    }

    #[test]
    fn output_is_deterministic_across_runs() {
        let entries = parse_bundle("--- File: a.rs ---\nfn a() {}\n--- File: b/c.rs ---\nfn c() {}\n");
        let opts = BuildOptions { format: OutputFormat::Manifest, strip_comments: false };
        let a = build(&entries, &opts);
        let b = build(&entries, &opts);
        assert_eq!(a, b);
        assert!(a.contains("└─") || a.contains("├─"));
    }

    #[test]
    fn json_format_round_trips_structure() {
        let entries = parse_bundle("--- File: a.rs ---\nfn a() {}\n");
        let opts = BuildOptions { format: OutputFormat::Json, strip_comments: false };
        let out = build(&entries, &opts);
        let parsed: Vec<BundleEntry> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0].path, "a.rs");
    }
}
