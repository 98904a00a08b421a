use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: String,

    /// 0-indexed start line
    pub line: u32,

    /// 0-indexed end line (inclusive-ish; derived from tree-sitter end position)
    pub line_end: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSymbols {
    pub file: String,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub symbols: Vec<Symbol>,
}

fn normalize_path_for_output(p: &Path) -> String {
    p.to_string_lossy().replace('\\', "/")
}

pub trait LanguageDriver: Send + Sync {
    fn name(&self) -> &'static str;
    /// Primary file extensions handled by this driver (lowercase, without dot).
    fn extensions(&self) -> &'static [&'static str];
    fn handles_path(&self, path: &Path) -> bool;
    fn language_for_path(&self, path: &Path) -> Language;

    fn find_imports(&self, _path: &Path, _source: &[u8], _root: Node, _language: Language) -> Result<Vec<String>> {
        Ok(vec![])
    }

    fn find_exports(&self, _path: &Path, _source: &[u8], _root: Node, _language: Language) -> Result<Vec<String>> {
        Ok(vec![])
    }


    fn extract_skeleton(&self, path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>>;
}

pub struct LanguageConfig {
    drivers: Vec<Box<dyn LanguageDriver>>,
    by_ext: HashMap<String, usize>,
}

impl LanguageConfig {
    fn driver_for_path(&self, path: &Path) -> Option<&dyn LanguageDriver> {
        let ext = path_ext_lower(path);
        if let Some(&idx) = self.by_ext.get(&ext) {
            let d = self.drivers.get(idx).map(|x| x.as_ref());
            if let Some(d) = d {
                if d.handles_path(path) {
                    return Some(d);
                }
            }
        }

        // Fallback for special filename-based handling (e.g. `.d.ts`).
        self.drivers.iter().find(|d| d.handles_path(path)).map(|d| d.as_ref())
    }
}

impl Default for LanguageConfig {
    fn default() -> Self {
        let mut drivers: Vec<Box<dyn LanguageDriver>> = vec![
            Box::new(RustDriver),
            Box::new(TypeScriptDriver),
            Box::new(PythonDriver),
        ];

        #[cfg(feature = "lang-go")]
        drivers.push(Box::new(GoDriver));

        #[cfg(feature = "lang-java")]
        drivers.push(Box::new(JavaDriver));

        #[cfg(feature = "lang-csharp")]
        drivers.push(Box::new(CSharpDriver));

        #[cfg(feature = "lang-php")]
        drivers.push(Box::new(PhpDriver));

        let mut cfg = Self {
            drivers,
            by_ext: HashMap::new(),
        };

        for (idx, d) in cfg.drivers.iter().enumerate() {
            for ext in d.extensions() {
                cfg.by_ext.insert(ext.to_string(), idx);
            }
        }

        cfg
    }
}

fn language_config() -> &'static LanguageConfig {
    static CFG: OnceLock<LanguageConfig> = OnceLock::new();
    CFG.get_or_init(LanguageConfig::default)
}

fn path_ext_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase()
}

struct RustDriver;
impl LanguageDriver for RustDriver {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "rs"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_rust::language()
    }

    fn find_imports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        run_query_strings(source, root, &language, r#"(use_declaration argument: (_) @path)"#, "path")
    }

    fn find_exports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let mut exports: Vec<String> = Vec::new();
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(
                function_item
                                    (visibility_modifier) @vis
                  name: (identifier) @name
              )
              (#match? @vis \"^pub\")"#,
            "name",
        )?);
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(
                struct_item
                                    (visibility_modifier) @vis
                  name: (type_identifier) @name
              )
              (#match? @vis \"^pub\")"#,
            "name",
        )?);
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(
                enum_item
                                    (visibility_modifier) @vis
                  name: (type_identifier) @name
              )
              (#match? @vis \"^pub\")"#,
            "name",
        )?);
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(
                trait_item
                                    (visibility_modifier) @vis
                  name: (type_identifier) @name
              )
              (#match? @vis \"^pub\")"#,
            "name",
        )?);
        Ok(exports)
    }


    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(function_item name: (identifier) @name) @def"#,
            "function",
            true,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(struct_item name: (type_identifier) @name) @def"#,
            "struct",
            false,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(enum_item name: (type_identifier) @name) @def"#,
            "enum",
            false,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(trait_item name: (type_identifier) @name) @def"#,
            "trait",
            false,
        )?);
        Ok(symbols)
    }
}

struct TypeScriptDriver;
impl LanguageDriver for TypeScriptDriver {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        let ext = path_ext_lower(path);
        if matches!(ext.as_str(), "ts" | "tsx" | "mts" | "cts" | "js" | "jsx" | "mjs" | "cjs") {
            return true;
        }
        file_name_lower(path).ends_with(".d.ts")
    }

    fn language_for_path(&self, path: &Path) -> Language {
        let ext = path_ext_lower(path);
        if ext == "tsx" || ext == "jsx" {
            tree_sitter_typescript::language_tsx()
        } else {
            // JS/TS share the TypeScript grammar for our purposes.
            tree_sitter_typescript::language_typescript()
        }
    }

    fn find_imports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let import_srcs = run_query_strings(source, root, &language, r#"(import_statement source: (string) @src)"#, "src")?;
        Ok(import_srcs.into_iter().map(|s| strip_string_quotes(&s)).collect())
    }

    fn find_exports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let mut exports: Vec<String> = Vec::new();

        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(export_statement declaration: (function_declaration name: (identifier) @name))"#,
            "name",
        )?);

        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(export_statement declaration: (class_declaration name: (type_identifier) @name))"#,
            "name",
        )?);

        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(export_statement declaration: (lexical_declaration (variable_declarator name: (identifier) @name)))"#,
            "name",
        )?);

        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(export_statement (export_clause (export_specifier name: (identifier) @name)))"#,
            "name",
        )?);

        Ok(exports)
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(function_declaration name: (identifier) @name) @def"#,
            "function",
            true,
        )?);

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(lexical_declaration (variable_declarator name: (identifier) @name value: (arrow_function))) @def"#,
            "function",
            true,
        )?);

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(class_declaration name: (type_identifier) @name) @def"#,
            "class",
            false,
        )?);

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(method_definition name: (property_identifier) @name) @def"#,
            "method",
            true,
        )?);

        Ok(symbols)
    }

}

struct PythonDriver;
impl LanguageDriver for PythonDriver {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "py"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_python::language()
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(function_definition name: (identifier) @name) @def"#,
            "function",
            true,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(class_definition name: (identifier) @name) @def"#,
            "class",
            false,
        )?);
        Ok(symbols)
    }

}

fn is_go_exported_ident(name: &str) -> bool {
    name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
}

#[cfg(feature = "lang-go")]
struct GoDriver;

#[cfg(feature = "lang-go")]
impl LanguageDriver for GoDriver {
    fn name(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "go"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_go::language()
    }

    fn find_imports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        out.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(import_spec (interpreted_string_literal) @src)"#,
            "src",
        )?);
        out.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(import_spec (raw_string_literal) @src)"#,
            "src",
        )?);
        Ok(out.into_iter().map(|s| strip_string_quotes(&s)).collect())
    }

    fn find_exports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let mut exports: Vec<String> = Vec::new();

        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(function_declaration name: (identifier) @name)"#,
            "name",
        )?);
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(method_declaration name: (field_identifier) @name)"#,
            "name",
        )?);
        exports.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(type_spec name: (type_identifier) @name)"#,
            "name",
        )?);

        exports.retain(|n| is_go_exported_ident(n));
        Ok(exports)
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(function_declaration name: (identifier) @name) @def"#,
            "function",
            true,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(method_declaration name: (field_identifier) @name) @def"#,
            "method",
            true,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(type_spec name: (type_identifier) @name) @def"#,
            "type",
            false,
        )?);
        Ok(symbols)
    }

}

#[cfg(feature = "lang-java")]
struct JavaDriver;

#[cfg(feature = "lang-java")]
impl LanguageDriver for JavaDriver {
    fn name(&self) -> &'static str {
        "java"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["java"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "java"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_java::language()
    }

    fn find_imports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        // import java.util.Vector;
        // import static foo.Bar.*;
        let mut out: Vec<String> = Vec::new();
        out.extend(run_query_strings(
            source,
            root,
            &language,
            r#"(import_declaration (scoped_identifier) @path)"#,
            "path",
        )?);
        Ok(out)
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(class_declaration (identifier) @name) @def"#,
            "class",
            false,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(interface_declaration (identifier) @name) @def"#,
            "interface",
            false,
        )?);
        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(enum_declaration name: (identifier) @name) @def"#,
            "enum",
            false,
        )?);

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(method_declaration (identifier) @name) @def"#,
            "method",
            true,
        )?);

        symbols.extend(run_query(
            source,
            root,
            &language,
            r#"(constructor_declaration (identifier) @name) @def"#,
            "constructor",
            true,
        )?);

        Ok(symbols)
    }

}

#[cfg(feature = "lang-csharp")]
struct CSharpDriver;

#[cfg(feature = "lang-csharp")]
impl LanguageDriver for CSharpDriver {
    fn name(&self) -> &'static str {
        "csharp"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["cs"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "cs"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_c_sharp::language()
    }

    fn find_imports(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        out.extend(run_query_strings(source, root, &language, r#"(using_directive (identifier) @path)"#, "path")?);
        out.extend(run_query_strings(source, root, &language, r#"(using_directive (qualified_name) @path)"#, "path")?);
        out.extend(run_query_strings(source, root, &language, r#"(using_directive (alias_qualified_name) @path)"#, "path")?);
        Ok(out)
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();

        symbols.extend(run_query(source, root, &language, r#"(class_declaration name: (identifier) @name) @def"#, "class", false)?);
        symbols.extend(run_query(source, root, &language, r#"(struct_declaration name: (identifier) @name) @def"#, "struct", false)?);
        symbols.extend(run_query(source, root, &language, r#"(interface_declaration name: (identifier) @name) @def"#, "interface", false)?);
        symbols.extend(run_query(source, root, &language, r#"(enum_declaration name: (identifier) @name) @def"#, "enum", false)?);

        symbols.extend(run_query(source, root, &language, r#"(method_declaration name: (identifier) @name) @def"#, "method", true)?);
        symbols.extend(run_query(source, root, &language, r#"(constructor_declaration name: (identifier) @name) @def"#, "constructor", true)?);

        Ok(symbols)
    }

}

#[cfg(feature = "lang-php")]
struct PhpDriver;

#[cfg(feature = "lang-php")]
impl LanguageDriver for PhpDriver {
    fn name(&self) -> &'static str {
        "php"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["php"]
    }

    fn handles_path(&self, path: &Path) -> bool {
        path_ext_lower(path) == "php"
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_php::LANGUAGE_PHP.into()
    }

    fn extract_skeleton(&self, _path: &Path, source: &[u8], root: Node, language: Language) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = Vec::new();

        symbols.extend(run_query(source, root, &language, r#"(class_declaration name: (name) @name) @def"#, "class", false)?);
        symbols.extend(run_query(source, root, &language, r#"(interface_declaration name: (name) @name) @def"#, "interface", false)?);
        symbols.extend(run_query(source, root, &language, r#"(trait_declaration name: (name) @name) @def"#, "trait", false)?);

        symbols.extend(run_query(source, root, &language, r#"(function_definition name: (name) @name) @def"#, "function", true)?);
        symbols.extend(run_query(source, root, &language, r#"(method_declaration name: (name) @name) @def"#, "method", true)?);

        Ok(symbols)
    }

}


fn run_query_byte_ranges(
    source: &[u8],
    root: Node,
    language: &Language,
    query_src: &str,
    cap: &str,
) -> Result<Vec<(usize, usize)>> {
    let query = Query::new(language, query_src).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();
    let mut out: Vec<(usize, usize)> = Vec::new();

    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        for cap0 in m.captures {
            let cap_name = query.capture_names()[cap0.index as usize];
            if cap_name != cap {
                continue;
            }
            out.push((cap0.node.start_byte(), cap0.node.end_byte()));
        }
    }

    Ok(out)
}

fn first_line_signature(def_text: &str) -> String {
    let mut s = def_text;
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find("\n") {
        s = &s[..i];
    }

    // Collapse whitespace for readability.
    let mut out = String::with_capacity(s.len().min(200));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }

    out.trim().trim_end_matches('{').trim().to_string()
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    let start = node.start_byte();
    let end = node.end_byte();
    std::str::from_utf8(&source[start..end]).unwrap_or("")
}

fn strip_string_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        let first = bytes[0];
        let last = bytes[t.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') || (first == b'`' && last == b'`') {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

fn run_query_strings(source: &[u8], root: Node, language: &Language, query_src: &str, cap: &str) -> Result<Vec<String>> {
    let query = Query::new(language, query_src).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();

    let mut out: Vec<String> = Vec::new();
    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        for cap0 in m.captures {
            let cap_name = query.capture_names()[cap0.index as usize];
            if cap_name != cap {
                continue;
            }
            let text = node_text(source, cap0.node).trim().to_string();
            if !text.is_empty() {
                out.push(text);
            }
        }
    }
    Ok(out)
}

fn dedup_sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v.dedup();
    v
}

fn run_query(
    source: &[u8],
    root: Node,
    language: &Language,
    query_src: &str,
    kind: &str,
    include_signature: bool,
) -> Result<Vec<Symbol>> {
    let query = Query::new(language, query_src).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();

    let mut out: Vec<Symbol> = Vec::new();

    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        let mut name_node: Option<Node> = None;
        let mut def_node: Option<Node> = None;

        for cap in m.captures {
            let cap_name = query.capture_names()[cap.index as usize];
            match cap_name {
                "name" => name_node = Some(cap.node),
                "def" => def_node = Some(cap.node),
                _ => {}
            }
        }

        let Some(name_node) = name_node else { continue };
        let def_node = def_node.unwrap_or(name_node);

        let name = node_text(source, name_node).trim().to_string();
        if name.is_empty() {
            continue;
        }

        let start = def_node.start_position();
        let end = def_node.end_position();

        let signature = if include_signature {
            let def_text = node_text(source, def_node);
            Some(first_line_signature(def_text))
        } else {
            None
        };

        out.push(Symbol {
            name,
            kind: kind.to_string(),
            line: start.row as u32,
            line_end: end.row as u32,
            signature,
        });
    }

    Ok(out)
}

/// Parse a single file and extract symbols (functions/structs/classes) using tree-sitter.
///
/// - Lines are 0-indexed.
/// - `file` is emitted as the provided path string (normalized to '/').
pub fn analyze_file(path: &Path) -> Result<FileSymbols> {
    let abs: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("Failed to get current dir")?.join(path)
    };

    let driver = language_config()
        .driver_for_path(&abs)
        .ok_or_else(|| anyhow!("Unsupported file extension: {}", abs.display()))?;
    let language = driver.language_for_path(&abs);

    let source_text = std::fs::read_to_string(&abs)
        .with_context(|| format!("Failed to read {}", abs.display()))?;
    let source = source_text.as_bytes();

    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .context("Failed to set tree-sitter language")?;

    let tree = parser
        .parse(source_text.as_str(), None)
        .ok_or_else(|| anyhow!("Failed to parse file"))?;

    let root = tree.root_node();

    let mut symbols = driver.extract_skeleton(&abs, source, root, language.clone())?;
    let mut imports = driver.find_imports(&abs, source, root, language.clone())?;
    let mut exports = driver.find_exports(&abs, source, root, language)?;

    // Stable ordering: by line then name.
    symbols.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.name.cmp(&b.name)));

    imports = dedup_sorted(imports);
    exports = dedup_sorted(exports);

    Ok(FileSymbols {
        file: normalize_path_for_output(path),
        imports,
        exports,
        symbols,
    })
}

/// Extract all top-level symbols from source text without a disk read.
///
/// Used by the vector store for:
///  1. AST-aware chunk boundary detection (group `chunk_lines` of symbols per chunk).
///  2. Symbol anchoring: store symbol names in the index so search can boost exact matches.
///
/// Returns an empty vec for unsupported file types (graceful fallback to line-chunking).
pub fn extract_symbols_from_source(path: &Path, source_text: &str) -> Vec<Symbol> {
    if is_minified_or_generated(source_text) {
        return vec![];
    }

    let abs: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => return vec![],
        }
    };

    let Some(driver) = language_config().driver_for_path(&abs) else {
        return vec![];
    };

    let language = driver.language_for_path(&abs);
    let source = source_text.as_bytes();

    let mut parser = Parser::new();
    if parser.set_language(&language).is_err() {
        return vec![];
    }

    let Some(tree) = parser.parse(source_text, None) else {
        return vec![];
    };

    let root = tree.root_node();

    match driver.extract_skeleton(&abs, source, root, language) {
        Ok(mut syms) => {
            syms.sort_by(|a, b| a.line.cmp(&b.line));
            syms
        }
        Err(_) => vec![],
    }
}

/// Cheap heuristic: skip symbol extraction on minified/generated files (single
/// huge line, or an explicit "generated" marker in the first few lines).
pub fn is_minified_or_generated(source_text: &str) -> bool {
    let mut lines = source_text.lines();
    if let Some(first) = lines.next() {
        if first.len() > 2000 {
            return true;
        }
    }
    source_text
        .lines()
        .take(5)
        .any(|l| l.contains("@generated") || l.contains("DO NOT EDIT") || l.contains("Code generated by"))
}
