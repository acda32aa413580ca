//! Extractor - locates named units and their exact source span
//!
//! This is a heuristic structural scanner, not a parser. Signatures are found
//! with line-anchored patterns and spans are closed by one of two rules:
//!
//! - **Brace-delimited**: a forward scan keeps a signed depth counter while
//!   skipping quoted literals (active quote character tracked, escapes honored)
//!   and comments, so braces inside strings or templates never move the depth.
//! - **Indentation-delimited**: the unit ends before the first later non-blank
//!   line indented no deeper than the unit's own first line.
//!
//! Non-executable units (regex literals, prompt templates, query strings) are
//! captured as single literals and annotated with type-specific metadata.
//! A candidate whose boundary cannot be closed is dropped without error.

use crate::error::{ForgeError, Result};
use crate::types::{ExtractedItem, TargetType};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// Control-flow keywords that can never name a unit
pub const RESERVED_NAMES: &[&str] = &[
    "if", "else", "for", "while", "switch", "catch", "try", "do", "with",
];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Lexical family of a source file, inferred from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    /// JavaScript, TypeScript, C-like and shell sources
    CFamily,
    Rust,
    Python,
}

impl SourceLanguage {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") | Some("pyi") => SourceLanguage::Python,
            Some("rs") => SourceLanguage::Rust,
            _ => SourceLanguage::CFamily,
        }
    }
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            CELL.get_or_init(|| Regex::new($re).expect("static extractor pattern"))
        }
    };
}

pattern!(
    js_function,
    r"(?m)^[ \t]*(?:export[ \t]+(?:default[ \t]+)?)?(?:async[ \t]+)?function[ \t]*\*?[ \t]*([A-Za-z_$][\w$]*)"
);
pattern!(
    js_binding,
    r"(?m)^[ \t]*(?:export[ \t]+)?(?:const|let|var)[ \t]+([A-Za-z_$][\w$]*)[ \t]*(?::[^=\n]*)?=[ \t]*(?:async[ \t]+)?(?:function\b|\([^)]*\)[ \t]*(?::[^=\n]*)?=>|[A-Za-z_$][\w$]*[ \t]*=>)"
);
pattern!(
    js_method,
    r"(?m)^[ \t]*(?:(?:public|private|protected|static|async|override|readonly|get|set)[ \t]+)*\*?([A-Za-z_$][\w$]*)[ \t]*(?:<[^>\n]*>)?[ \t]*\([^)\n]*\)[ \t]*(?::[^{;\n]+)?\{"
);
pattern!(
    rust_fn,
    r#"(?m)^[ \t]*(?:pub(?:\([^)\n]*\))?[ \t]+)?(?:(?:const|async|unsafe|extern(?:[ \t]+"[^"\n]*")?)[ \t]+)*fn[ \t]+([A-Za-z_][A-Za-z0-9_]*)"#
);
pattern!(py_def, r"(?m)^([ \t]*)(?:async[ \t]+)?def[ \t]+([A-Za-z_]\w*)");
pattern!(py_class, r"(?m)^([ \t]*)class[ \t]+([A-Za-z_]\w*)");
pattern!(
    c_struct,
    r"(?m)^[ \t]*(?:export[ \t]+)?(?:default[ \t]+)?(?:abstract[ \t]+)?(?:declare[ \t]+)?(?:class|interface|struct|enum)[ \t]+([A-Za-z_$][\w$]*)"
);
pattern!(
    ts_type_alias,
    r"(?m)^[ \t]*(?:export[ \t]+)?type[ \t]+([A-Za-z_$][\w$]*)[^=\n]*=[ \t]*\{"
);
pattern!(
    rust_struct,
    r"(?m)^[ \t]*(?:pub(?:\([^)\n]*\))?[ \t]+)?(?:struct|enum|union|trait)[ \t]+([A-Za-z_][A-Za-z0-9_]*)"
);
pattern!(
    regex_literal,
    r"(?m)^[ \t]*(?:export[ \t]+)?(?:(?:const|let|var)[ \t]+)?([A-Za-z_$][\w$]*)[ \t]*[=:][ \t]*(/(?:\\.|\[(?:\\.|[^\]\\\n])*\]|[^/\\\n\[*])(?:\\.|\[(?:\\.|[^\]\\\n])*\]|[^/\\\n\[])*/[dgimsuyv]*)"
);
pattern!(
    regex_call,
    r"(?m)^[ \t]*(?:export[ \t]+)?(?:(?:pub[ \t]+)?(?:static|const|let|var)[ \t]+(?:mut[ \t]+)?)?([A-Za-z_$][\w$]*)\b[^=\n;]*=[^;\n]*?\b((?:new[ \t]+)?(?:RegExp|Regex::new|re\.compile))\("
);
pattern!(
    string_binding,
    r#"(?m)^[ \t]*(?:export[ \t]+)?(?:(?:pub[ \t]+)?(?:const|let|var|static)[ \t]+)?([A-Za-z_$][\w$]*)[ \t]*(?::[^=\n]*)?=[ \t]*(?:(groq|sql|gql|cypher|dedent)[ \t]*)?(`|"""|'''|r#*"|")"#
);
pattern!(
    config_binding,
    r"(?m)^[ \t]*(?:export[ \t]+)?(?:(?:pub[ \t]+)?(?:const|let|var|static)[ \t]+)?([A-Za-z_$][\w$]*)[ \t]*(?::[^=\n]*)?=[ \t]*(?:Object\.freeze\([ \t]*)?(?:[A-Z][\w:]*[ \t]*)?\{"
);
pattern!(
    config_name,
    r"(?i)config|settings|options|defaults|params|constants"
);
pattern!(
    prompt_name,
    r"(?i)prompt|template|instruction|system|message|persona"
);
pattern!(sql_start, r"(?is)^\s*(?:select|insert|update|delete|with|create|alter|upsert)\b");
pattern!(cypher_start, r"(?is)^\s*(?:optional\s+match|match|merge|unwind|call)\b");
pattern!(sql_restriction, r"(?i)\b(?:where|having)\b");
pattern!(sql_limit, r"(?i)\blimit\b|\btop\s+\d");
pattern!(groq_restriction, r#"\*\[[^\]]*(?:==|!=|<|>|\bin\b|\bmatch\b|defined\()"#);
pattern!(groq_slice, r"\[\s*\d+\s*(?:\.\.\.?\s*\d+\s*)?\]\s*$");
pattern!(
    placeholder,
    r"\$\{\s*([^}]+?)\s*\}|\{\{\s*([\w.]+)\s*\}\}|\{([A-Za-z_]\w*)\}"
);
pattern!(object_key, r#"^\s*["']?([A-Za-z_$][\w$]*)["']?\s*:"#);

/// How a brace-family signature continues after its name.
enum Body {
    /// Index of the opening `{`
    Block(usize),
    /// Index of the first character of an expression body (`=> expr`)
    Expression(usize),
}

/// Quote- and comment-aware byte scanner
struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    lang: SourceLanguage,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str, lang: SourceLanguage) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            lang,
        }
    }

    fn line_end(&self, from: usize) -> usize {
        self.src[from..]
            .find('\n')
            .map(|p| from + p)
            .unwrap_or(self.bytes.len())
    }

    /// If a literal or comment opens at `i`, the index just past it.
    /// Unterminated literals run to the end of input.
    fn skip_opaque(&self, i: usize) -> Option<usize> {
        let b = self.bytes;
        match b[i] {
            b'"' => Some(self.skip_quoted(i, b'"')),
            b'`' if self.lang == SourceLanguage::CFamily => Some(self.skip_quoted(i, b'`')),
            b'\'' if self.lang == SourceLanguage::Rust => self.rust_char_end(i),
            b'\'' => Some(self.skip_quoted(i, b'\'')),
            b'/' if self.lang != SourceLanguage::Python && b.get(i + 1) == Some(&b'/') => {
                Some(self.line_end(i))
            }
            b'/' if self.lang != SourceLanguage::Python && b.get(i + 1) == Some(&b'*') => Some(
                self.src[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(b.len()),
            ),
            b'/' if self.lang == SourceLanguage::CFamily => self.regex_end(i),
            b'#' if self.lang == SourceLanguage::Python => Some(self.line_end(i)),
            _ => None,
        }
    }

    /// A `/` opens a regex literal where an operand is expected: after an
    /// operator, an opening bracket, a keyword like `return`, or at the start
    /// of input. The literal must close on its own line.
    fn regex_end(&self, open: usize) -> Option<usize> {
        let b = self.bytes;
        let before = self.src[..open].trim_end();
        let operand_expected = match before.as_bytes().last() {
            None => true,
            Some(c) if b"(,=:[!&|?{};+-*%<>~^".contains(c) => true,
            Some(c) if c.is_ascii_alphabetic() => {
                let word_start = before
                    .rfind(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'))
                    .map(|p| p + 1)
                    .unwrap_or(0);
                matches!(
                    &before[word_start..],
                    "return" | "typeof" | "case" | "in" | "of" | "yield" | "await" | "void"
                )
            }
            _ => false,
        };
        if !operand_expected {
            return None;
        }

        let mut j = open + 1;
        let mut in_class = false;
        while j < b.len() {
            match b[j] {
                b'\\' => {
                    j += 2;
                    continue;
                }
                b'\n' => return None,
                b'[' => in_class = true,
                b']' => in_class = false,
                b'/' if !in_class => {
                    j += 1;
                    while j < b.len() && b[j].is_ascii_alphabetic() {
                        j += 1;
                    }
                    return Some(j);
                }
                _ => {}
            }
            j += 1;
        }
        None
    }

    /// Skip a literal opened by `quote` at `open`, honoring backslash escapes.
    fn skip_quoted(&self, open: usize, quote: u8) -> usize {
        let b = self.bytes;

        if self.lang == SourceLanguage::Python && b[open..].starts_with(&[quote, quote, quote]) {
            let delim = &self.src[open..open + 3];
            return self.src[open + 3..]
                .find(delim)
                .map(|p| open + 3 + p + 3)
                .unwrap_or(b.len());
        }

        // Plain JS/Python strings cannot cross a raw newline; Rust strings can.
        let single_line = quote != b'`' && self.lang != SourceLanguage::Rust;

        let mut j = open + 1;
        while j < b.len() {
            match b[j] {
                b'\\' => {
                    j += 2;
                    continue;
                }
                c if c == quote => return j + 1,
                b'\n' if single_line => return j,
                _ => {}
            }
            j += 1;
        }
        b.len()
    }

    /// Rust `'` opens a char literal only when it closes right after one
    /// (possibly escaped) character; otherwise it is a lifetime.
    fn rust_char_end(&self, open: usize) -> Option<usize> {
        let rest = &self.src[open + 1..];
        let first = rest.chars().next()?;
        if first == '\\' {
            let tail = rest.get(2..)?;
            let close = tail.find('\'').filter(|p| *p <= 10)?;
            return Some(open + 1 + 2 + close + 1);
        }
        let width = first.len_utf8();
        if rest[width..].starts_with('\'') {
            Some(open + 1 + width + 1)
        } else {
            None
        }
    }

    /// Find where the unit's body starts, scanning from just after its name.
    /// A `;` at paren depth 0 before any body means a bodiless declaration.
    fn find_body(&self, from: usize) -> Option<Body> {
        let b = self.bytes;
        let mut parens: i64 = 0;
        let mut i = from;
        while i < b.len() {
            if let Some(next) = self.skip_opaque(i) {
                i = next;
                continue;
            }
            match b[i] {
                b'(' | b'[' => parens += 1,
                b')' | b']' => parens -= 1,
                b'{' if parens <= 0 => return Some(Body::Block(i)),
                b';' if parens <= 0 => return None,
                b'=' if parens <= 0 && b.get(i + 1) == Some(&b'>') => {
                    let mut j = i + 2;
                    while j < b.len() && b[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j >= b.len() {
                        return None;
                    }
                    return Some(if b[j] == b'{' {
                        Body::Block(j)
                    } else {
                        Body::Expression(j)
                    });
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    /// Index just past the brace closing the one at `open`.
    fn match_brace(&self, open: usize) -> Option<usize> {
        let b = self.bytes;
        let mut depth: i64 = 0;
        let mut i = open;
        while i < b.len() {
            if let Some(next) = self.skip_opaque(i) {
                i = next;
                continue;
            }
            match b[i] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                    if depth < 0 {
                        return None;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    /// End of an expression body: the first `;`, `,` or newline at depth 0.
    fn expression_end(&self, from: usize) -> Option<usize> {
        let b = self.bytes;
        let mut depth: i64 = 0;
        let mut i = from;
        while i < b.len() {
            if let Some(next) = self.skip_opaque(i) {
                i = next;
                continue;
            }
            match b[i] {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    depth -= 1;
                    if depth < 0 {
                        return trim_end(self.src, from, i);
                    }
                }
                b';' | b',' | b'\n' if depth == 0 => return trim_end(self.src, from, i),
                _ => {}
            }
            i += 1;
        }
        trim_end(self.src, from, b.len())
    }
}

fn trim_end(src: &str, from: usize, end: usize) -> Option<usize> {
    let trimmed = src[from..end].trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(from + trimmed.len())
    }
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// End of an indentation-delimited unit whose header line starts at `line_start`.
fn indentation_end(src: &str, line_start: usize, indent: usize) -> Option<usize> {
    let len = src.len();
    let header_end = src[line_start..]
        .find('\n')
        .map(|p| line_start + p)
        .unwrap_or(len);
    let mut end = header_end;
    let mut pos = header_end + 1;
    let mut saw_body = false;
    let mut open_triple: Option<&str> = None;

    while pos < len {
        let line_end = src[pos..].find('\n').map(|p| pos + p).unwrap_or(len);
        let line = &src[pos..line_end];
        // Lines inside a triple-quoted string belong to the unit whatever their indentation.
        if open_triple.is_some() || !line.trim().is_empty() {
            if open_triple.is_none() && indent_width(line) <= indent {
                break;
            }
            saw_body = true;
            end = line_end;
        }
        open_triple = triple_quote_state(line, open_triple);
        pos = line_end + 1;
    }

    if !saw_body && src[line_start..header_end].trim_end().ends_with(':') {
        return None;
    }
    if src[..end].ends_with('\r') {
        end -= 1;
    }
    Some(end)
}

/// Which triple-quote delimiter is still open after `line`, given the one
/// open before it.
fn triple_quote_state<'d>(line: &str, mut open: Option<&'d str>) -> Option<&'d str> {
    let mut rest = line;
    loop {
        match open {
            Some(delim) => match rest.find(delim) {
                Some(p) => {
                    rest = &rest[p + 3..];
                    open = None;
                }
                None => return open,
            },
            None => {
                let next = ["\"\"\"", "'''"]
                    .into_iter()
                    .filter_map(|d| rest.find(d).map(|p| (p, d)))
                    .min_by_key(|(p, _)| *p);
                match next {
                    Some((p, d)) if !rest[..p].contains('#') => {
                        rest = &rest[p + 3..];
                        open = Some(d);
                    }
                    _ => return None,
                }
            }
        }
    }
}

fn brace_unit_end(scanner: &Scanner<'_>, after_name: usize) -> Option<usize> {
    match scanner.find_body(after_name)? {
        Body::Block(open) => scanner.match_brace(open),
        Body::Expression(start) => scanner.expression_end(start),
    }
}

struct Collector<'a> {
    src: &'a str,
    file: &'a Path,
    kind: TargetType,
    seen: HashSet<(String, usize)>,
    items: Vec<ExtractedItem>,
}

impl<'a> Collector<'a> {
    fn new(src: &'a str, file: &'a Path, kind: TargetType) -> Self {
        Self {
            src,
            file,
            kind,
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, name: &str, start: usize, end: usize, metadata: BTreeMap<String, Value>) {
        if is_reserved_name(name) || end <= start || end > self.src.len() {
            return;
        }
        if !self.seen.insert((name.to_string(), start)) {
            return;
        }
        self.items.push(ExtractedItem {
            name: name.to_string(),
            kind: self.kind,
            code: self.src[start..end].to_string(),
            start,
            end,
            file: self.file.to_path_buf(),
            metadata,
        });
    }

    fn finish(mut self, drop_nested: bool) -> Vec<ExtractedItem> {
        self.items.sort_by_key(|item| (item.start, item.end));
        if !drop_nested {
            return self.items;
        }
        let spans: Vec<(usize, usize)> = self.items.iter().map(|i| (i.start, i.end)).collect();
        self.items
            .into_iter()
            .filter(|item| {
                !spans
                    .iter()
                    .any(|&(s, e)| s < item.start && item.end <= e)
            })
            .collect()
    }
}

fn meta(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Extract every unit of `kind` from `source`, in source order.
pub fn extract_source(source: &str, file: &Path, kind: TargetType) -> Vec<ExtractedItem> {
    let lang = SourceLanguage::from_path(file);
    match kind {
        TargetType::Function => extract_functions(source, file, lang),
        TargetType::Regex => extract_regexes(source, file, lang),
        TargetType::Prompt | TargetType::Query => extract_strings(source, file, lang, kind),
        TargetType::Config => extract_configs(source, file, lang),
        TargetType::Struct => extract_structs(source, file, lang),
    }
}

pub fn extract_file(path: &Path, kind: TargetType) -> Result<Vec<ExtractedItem>> {
    let source = std::fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
    Ok(extract_source(&source, path, kind))
}

/// Resolve a single unit by name; the first match in source order wins.
pub fn find_unit(source: &str, file: &Path, kind: TargetType, name: &str) -> Option<ExtractedItem> {
    extract_source(source, file, kind)
        .into_iter()
        .find(|item| item.name == name)
}

/// Read `path` and resolve `name`, reporting an [`ForgeError::ExtractionMiss`] when absent.
pub fn resolve_unit(path: &Path, kind: TargetType, name: &str) -> Result<(String, ExtractedItem)> {
    let source = std::fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
    match find_unit(&source, path, kind, name) {
        Some(item) => Ok((source, item)),
        None => Err(ForgeError::ExtractionMiss {
            name: name.to_string(),
            kind,
            file: path.to_path_buf(),
        }),
    }
}

/// Source text for a file holding only this unit, resolvable by name again.
pub fn standalone_source(item: &ExtractedItem) -> String {
    if item.meta_str("span") != Some("literal") {
        return format!("{}\n", item.code);
    }
    let tag = item
        .meta_str("tag")
        .map(|t| format!("{} ", t))
        .unwrap_or_default();
    match SourceLanguage::from_path(&item.file) {
        SourceLanguage::Python => format!("{} = {}{}\n", item.name, tag, item.code),
        SourceLanguage::Rust if item.kind == TargetType::Regex => {
            format!("let {} = {};\n", item.name, item.code)
        }
        SourceLanguage::Rust => format!("const {}: &str = {};\n", item.name, item.code),
        SourceLanguage::CFamily => format!("const {} = {}{};\n", item.name, tag, item.code),
    }
}

fn extract_functions(src: &str, file: &Path, lang: SourceLanguage) -> Vec<ExtractedItem> {
    let mut out = Collector::new(src, file, TargetType::Function);

    if lang == SourceLanguage::Python {
        for caps in py_def().captures_iter(src) {
            let (Some(whole), Some(indent), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let line_start = whole.start();
            let Some(end) = indentation_end(src, line_start, indent_width(indent.as_str())) else {
                continue;
            };
            let is_async = whole.as_str().contains("async");
            out.push(
                name.as_str(),
                line_start + indent.len(),
                end,
                meta(&[("span", json!("declaration")), ("async", json!(is_async))]),
            );
        }
        return out.finish(true);
    }

    let scanner = Scanner::new(src, lang);
    let patterns: Vec<&Regex> = match lang {
        SourceLanguage::Rust => vec![rust_fn()],
        _ => vec![js_function(), js_binding(), js_method()],
    };

    for re in patterns {
        for caps in re.captures_iter(src) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if is_reserved_name(name.as_str()) {
                continue;
            }
            let start = whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len());
            let Some(end) = brace_unit_end(&scanner, name.end()) else {
                log::trace!("dropping `{}`: no closing boundary", name.as_str());
                continue;
            };
            let is_async = whole.as_str().contains("async");
            out.push(
                name.as_str(),
                start,
                end,
                meta(&[("span", json!("declaration")), ("async", json!(is_async))]),
            );
        }
    }
    out.finish(true)
}

fn extract_structs(src: &str, file: &Path, lang: SourceLanguage) -> Vec<ExtractedItem> {
    let mut out = Collector::new(src, file, TargetType::Struct);

    if lang == SourceLanguage::Python {
        for caps in py_class().captures_iter(src) {
            let (Some(whole), Some(indent), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if let Some(end) = indentation_end(src, whole.start(), indent_width(indent.as_str())) {
                out.push(
                    name.as_str(),
                    whole.start() + indent.len(),
                    end,
                    meta(&[("span", json!("declaration"))]),
                );
            }
        }
        return out.finish(false);
    }

    let scanner = Scanner::new(src, lang);
    let patterns: Vec<&Regex> = match lang {
        SourceLanguage::Rust => vec![rust_struct()],
        _ => vec![c_struct(), ts_type_alias()],
    };
    for re in patterns {
        for caps in re.captures_iter(src) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let start = whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len());
            let end = match scanner.find_body(name.end()) {
                Some(Body::Block(open)) => scanner.match_brace(open),
                _ => None,
            };
            if let Some(end) = end {
                out.push(name.as_str(), start, end, meta(&[("span", json!("declaration"))]));
            }
        }
    }
    out.finish(false)
}

fn extract_configs(src: &str, file: &Path, lang: SourceLanguage) -> Vec<ExtractedItem> {
    let mut out = Collector::new(src, file, TargetType::Config);
    let scanner = Scanner::new(src, lang);

    for caps in config_binding().captures_iter(src) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let all_caps = name.len() > 1
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !all_caps && !config_name().is_match(name) {
            continue;
        }
        let open = whole.end() - 1;
        let Some(end) = scanner.match_brace(open) else {
            continue;
        };
        let start = whole.start() + (whole.as_str().len() - whole.as_str().trim_start().len());
        let keys = top_level_keys(&src[open..end]);
        out.push(
            name,
            start,
            end,
            meta(&[("span", json!("declaration")), ("keys", json!(keys))]),
        );
    }
    out.finish(false)
}

/// Keys declared at depth 1 of an object literal body.
fn top_level_keys(body: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut depth: i64 = 0;
    for line in body.lines() {
        if depth == 1 {
            if let Some(caps) = object_key().captures(line) {
                if let Some(key) = caps.get(1) {
                    keys.push(key.as_str().to_string());
                }
            }
        }
        for c in line.chars() {
            match c {
                '{' | '[' => depth += 1,
                '}' | ']' => depth -= 1,
                _ => {}
            }
        }
    }
    keys
}

fn extract_regexes(src: &str, file: &Path, lang: SourceLanguage) -> Vec<ExtractedItem> {
    let mut out = Collector::new(src, file, TargetType::Regex);

    for caps in regex_literal().captures_iter(src) {
        let (Some(name), Some(lit)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        // A literal must not run straight into an identifier.
        if src[lit.end()..]
            .chars()
            .next()
            .map_or(false, |c| c.is_alphanumeric() || c == '_')
        {
            continue;
        }
        let text = lit.as_str();
        let Some(last) = text.rfind('/').filter(|p| *p > 0) else {
            continue;
        };
        out.push(
            name.as_str(),
            lit.start(),
            lit.end(),
            meta(&[
                ("span", json!("literal")),
                ("form", json!("literal")),
                ("pattern", json!(&text[1..last])),
                ("flags", json!(&text[last + 1..])),
            ]),
        );
    }

    for caps in regex_call().captures_iter(src) {
        let (Some(whole), Some(name), Some(call)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let Some(parsed) = parse_regex_call(src, whole.end(), lang) else {
            continue;
        };
        out.push(
            name.as_str(),
            call.start(),
            parsed.end,
            meta(&[
                ("span", json!("literal")),
                ("form", json!("constructor")),
                ("pattern", json!(parsed.pattern)),
                ("flags", json!(parsed.flags)),
            ]),
        );
    }
    out.finish(false)
}

struct RegexCall {
    pattern: String,
    flags: String,
    /// Index just past the closing `)`
    end: usize,
}

/// Parse `("pattern"[, flags])` starting right after the `(`.
fn parse_regex_call(src: &str, after_paren: usize, lang: SourceLanguage) -> Option<RegexCall> {
    let b = src.as_bytes();
    let mut i = after_paren;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }

    let (pattern, after_lit) = if b.get(i) == Some(&b'r') {
        let mut hashes = 0;
        let mut j = i + 1;
        while b.get(j) == Some(&b'#') {
            hashes += 1;
            j += 1;
        }
        if b.get(j) != Some(&b'"') {
            return None;
        }
        let closing = format!("\"{}", "#".repeat(hashes));
        let close = src[j + 1..].find(&closing)? + j + 1;
        (src[j + 1..close].to_string(), close + closing.len())
    } else {
        let quote = *b.get(i)?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        let scanner = Scanner::new(src, lang);
        let end = scanner.skip_quoted(i, quote);
        if end <= i + 1 || b[end - 1] != quote {
            return None;
        }
        (unescape(&src[i + 1..end - 1]), end)
    };

    // Balance the remaining arguments up to the call's closing paren.
    let mut depth = 1;
    let mut j = after_lit;
    while j < b.len() {
        match b[j] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        j += 1;
    }
    if j >= b.len() {
        return None;
    }
    let args = src[after_lit..j].trim().trim_start_matches(',').trim();
    Some(RegexCall {
        pattern,
        flags: normalize_flags(args),
        end: j + 1,
    })
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('\\' | '"' | '\'' | '/')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Normalize a flags argument (`"gi"`, `re.I | re.MULTILINE`) to letter form.
fn normalize_flags(args: &str) -> String {
    let trimmed = args.trim_matches(|c| c == '"' || c == '\'' || c == ' ');
    if trimmed.chars().all(|c| c.is_ascii_lowercase()) {
        return trimmed.to_string();
    }
    let mut flags = String::new();
    for part in trimmed.split('|') {
        let flag = match part.trim().trim_start_matches("re.") {
            "I" | "IGNORECASE" => 'i',
            "M" | "MULTILINE" => 'm',
            "S" | "DOTALL" => 's',
            "X" | "VERBOSE" => 'x',
            _ => continue,
        };
        if !flags.contains(flag) {
            flags.push(flag);
        }
    }
    flags
}

/// Detect a query language from literal content (or an explicit template tag).
pub fn query_language(content: &str, tag: Option<&str>) -> Option<&'static str> {
    match tag {
        Some("groq") => return Some("groq"),
        Some("sql") => return Some("sql"),
        Some("cypher") => return Some("cypher"),
        Some("gql") => return Some("graphql"),
        _ => {}
    }
    let trimmed = content.trim_start();
    if trimmed.starts_with("*[") || trimmed.starts_with("count(*[") {
        Some("groq")
    } else if cypher_start().is_match(content) {
        Some("cypher")
    } else if sql_start().is_match(content) {
        Some("sql")
    } else {
        None
    }
}

fn query_metadata(content: &str, language: &str) -> (bool, bool) {
    match language {
        "groq" => (
            groq_restriction().is_match(content),
            groq_slice().is_match(content.trim_end()),
        ),
        "cypher" => (
            sql_restriction().is_match(content) || content.contains(": $"),
            sql_limit().is_match(content),
        ),
        _ => (
            sql_restriction().is_match(content),
            sql_limit().is_match(content),
        ),
    }
}

pub fn placeholders(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(content) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
            let name = m.as_str().trim().to_string();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

fn extract_strings(
    src: &str,
    file: &Path,
    lang: SourceLanguage,
    kind: TargetType,
) -> Vec<ExtractedItem> {
    let mut out = Collector::new(src, file, kind);
    let scanner = Scanner::new(src, lang);

    for caps in string_binding().captures_iter(src) {
        let (Some(name), Some(opener)) = (caps.get(1), caps.get(3)) else {
            continue;
        };
        let tag = caps.get(2).map(|t| t.as_str());
        let open = opener.start();
        let delim = opener.as_str();

        let (end, inner) = if delim.starts_with('r') {
            let hashes = delim.len() - 2;
            let closing = format!("\"{}", "#".repeat(hashes));
            let Some(close) = src[opener.end()..].find(&closing) else {
                continue;
            };
            let close = opener.end() + close;
            (close + closing.len(), &src[opener.end()..close])
        } else if delim.len() == 3 {
            let Some(close) = src[opener.end()..].find(delim) else {
                continue;
            };
            let close = opener.end() + close;
            (close + 3, &src[opener.end()..close])
        } else {
            let quote = delim.as_bytes()[0];
            let end = scanner.skip_quoted(open, quote);
            if end <= open + 1 || src.as_bytes()[end - 1] != quote {
                continue;
            }
            (end, &src[open + 1..end - 1])
        };

        let language = query_language(inner, tag);
        let mut metadata = meta(&[
            ("span", json!("literal")),
            ("lines", json!(inner.lines().count().max(1))),
        ]);
        if let Some(tag) = tag {
            metadata.insert("tag".to_string(), json!(tag));
        }

        match (kind, language) {
            (TargetType::Query, Some(language)) => {
                let (restricted, limited) = query_metadata(inner, language);
                metadata.insert("language".to_string(), json!(language));
                metadata.insert("has_restriction".to_string(), json!(restricted));
                metadata.insert("has_limit".to_string(), json!(limited));
            }
            (TargetType::Prompt, None) => {
                let multi_line = inner.matches('\n').count() >= 2;
                if !multi_line && !prompt_name().is_match(name.as_str()) {
                    continue;
                }
                metadata.insert("placeholders".to_string(), json!(placeholders(inner)));
                metadata.insert(
                    "words".to_string(),
                    json!(inner.split_whitespace().count()),
                );
            }
            _ => continue,
        }

        out.push(name.as_str(), open, end, metadata);
    }
    out.finish(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn js() -> PathBuf {
        PathBuf::from("src/util.js")
    }

    #[test]
    fn test_brace_function_exact_span() {
        let src = "const x = 1;\nfunction add(a, b) {\n  return a + b;\n}\n\nfunction sub(a, b) { return a - b; }\n";
        let items = extract_source(src, &js(), TargetType::Function);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "add");
        assert_eq!(items[0].code, "function add(a, b) {\n  return a + b;\n}");
        assert_eq!(&src[items[0].start..items[0].end], items[0].code);
        assert_eq!(items[1].name, "sub");
    }

    #[test]
    fn test_braces_inside_literals_do_not_truncate() {
        for injected in ["}", "}}}", "{{", "}{}"] {
            let src = format!(
                "function render(x) {{\n  const a = \"{inj}\";\n  const b = '{inj}';\n  const c = `${{x}} {inj}`;\n  return a + b + c;\n}}\nfunction after() {{ return 1; }}\n",
                inj = injected
            );
            let items = extract_source(&src, &js(), TargetType::Function);
            let render = items.iter().find(|i| i.name == "render").unwrap();
            assert!(render.code.ends_with("return a + b + c;\n}"), "{injected}: {}", render.code);
            assert!(items.iter().any(|i| i.name == "after"));
        }
    }

    #[test]
    fn test_comments_with_quotes_are_skipped() {
        let src = "function f() {\n  // don't { count this\n  /* nor } this */\n  return 1;\n}\n";
        let items = extract_source(src, &js(), TargetType::Function);
        assert_eq!(items.len(), 1);
        assert!(items[0].code.ends_with("return 1;\n}"));
    }

    #[test]
    fn test_regex_literals_inside_bodies_are_opaque() {
        let src = "function tokens(s) {\n  const open = /\\{/g;\n  if (/[}]+/.test(s)) return s.split(/\\}/);\n  const half = s.length / 2 / 1;\n  return s.match(open);\n}\nfunction after() { return 1; }\n";
        let items = extract_source(src, &js(), TargetType::Function);
        let tokens = items.iter().find(|i| i.name == "tokens").unwrap();
        assert!(tokens.code.ends_with("return s.match(open);\n}"), "{}", tokens.code);
        assert!(items.iter().any(|i| i.name == "after"));
    }

    #[test]
    fn test_keywords_rejected_and_nested_dropped() {
        let src = "function outer() {\n  if (x) {\n    y();\n  }\n  function inner() { return 2; }\n  return inner();\n}\n";
        let items = extract_source(src, &js(), TargetType::Function);
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["outer"]);
    }

    #[test]
    fn test_arrow_functions() {
        let src = "export const double = (x) => x * 2;\nconst load = async (id) => {\n  return fetch(id);\n};\n";
        let items = extract_source(src, &js(), TargetType::Function);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].code, "export const double = (x) => x * 2");
        assert!(items[1].code.ends_with("return fetch(id);\n}"));
        assert_eq!(items[1].metadata.get("async"), Some(&json!(true)));
    }

    #[test]
    fn test_unclosed_unit_dropped() {
        let src = "function ok() { return 1; }\nfunction broken() {\n  return \"never closed\";\n";
        let items = extract_source(src, &js(), TargetType::Function);
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn test_destructured_params() {
        let src = "function pick({ a, b } = {}) {\n  return a;\n}\n";
        let items = extract_source(src, &js(), TargetType::Function);
        assert_eq!(items.len(), 1);
        assert!(items[0].code.ends_with("return a;\n}"));
    }

    #[test]
    fn test_python_indentation() {
        let src = "import os\n\ndef score(x):\n    if x:\n        return 1\n\n    return 0\n\nclass A:\n    def method(self):\n        return 2\n";
        let path = PathBuf::from("m.py");
        let items = extract_source(src, &path, TargetType::Function);
        let score = items.iter().find(|i| i.name == "score").unwrap();
        assert_eq!(score.code, "def score(x):\n    if x:\n        return 1\n\n    return 0");
        let method = items.iter().find(|i| i.name == "method").unwrap();
        assert_eq!(method.code, "def method(self):\n        return 2");

        let classes = extract_source(src, &path, TargetType::Struct);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].name, "A");
    }

    #[test]
    fn test_python_docstring_at_column_zero() {
        let src = "def usage():\n    \"\"\"Print usage.\n\nOptions:\n  -v  verbose\n\"\"\"\n    return 0\n\ndef after():\n    return 1\n";
        let path = PathBuf::from("cli.py");
        let items = extract_source(src, &path, TargetType::Function);
        let usage = items.iter().find(|i| i.name == "usage").unwrap();
        assert!(usage.code.ends_with("    return 0"), "{}", usage.code);
        assert!(usage.code.contains("Options:"));
        let after = items.iter().find(|i| i.name == "after").unwrap();
        assert_eq!(after.code, "def after():\n    return 1");
    }

    #[test]
    fn test_rust_lifetimes_and_chars() {
        let src = "fn first<'a>(s: &'a str) -> char {\n    let open = '{';\n    s.chars().next().unwrap_or(open)\n}\n\ntrait T {\n    fn decl(&self);\n}\n";
        let path = PathBuf::from("lib.rs");
        let items = extract_source(src, &path, TargetType::Function);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "first");
        assert!(items[0].code.ends_with("unwrap_or(open)\n}"));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let src = "function a() { return '}'; }\nconst b = (x) => { return x; };\n";
        let first = extract_source(src, &js(), TargetType::Function);
        for _ in 0..3 {
            assert_eq!(extract_source(src, &js(), TargetType::Function), first);
        }
    }

    #[test]
    fn test_regex_literal_and_constructor() {
        let src = "const EMAIL = /^[^@\\s]+@[^@\\s]+$/i;\nconst slug = new RegExp(\"^[a-z-]+$\", \"g\");\nconst ratio = a / b / c;\n";
        let items = extract_source(src, &js(), TargetType::Regex);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "EMAIL");
        assert_eq!(items[0].code, "/^[^@\\s]+@[^@\\s]+$/i");
        assert_eq!(items[0].meta_str("flags"), Some("i"));
        assert_eq!(items[1].name, "slug");
        assert_eq!(items[1].meta_str("pattern"), Some("^[a-z-]+$"));
        assert_eq!(items[1].meta_str("flags"), Some("g"));
    }

    #[test]
    fn test_python_regex_flags() {
        let src = "WORD = re.compile(r\"\\w+\", re.I | re.MULTILINE)\n";
        let items = extract_source(src, &PathBuf::from("p.py"), TargetType::Regex);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].meta_str("pattern"), Some("\\w+"));
        assert_eq!(items[0].meta_str("flags"), Some("im"));
    }

    #[test]
    fn test_query_and_prompt_literals() {
        let src = "const ACTIVE = `*[_type == \"user\" && active][0...10]`;\nconst SUMMARY_PROMPT = `Summarize ${doc} for ${audience}.`;\nconst name = \"Bob\";\n";
        let queries = extract_source(src, &js(), TargetType::Query);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].meta_str("language"), Some("groq"));
        assert_eq!(queries[0].metadata.get("has_restriction"), Some(&json!(true)));
        assert_eq!(queries[0].metadata.get("has_limit"), Some(&json!(true)));

        let prompts = extract_source(src, &js(), TargetType::Prompt);
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "SUMMARY_PROMPT");
        assert_eq!(
            prompts[0].metadata.get("placeholders"),
            Some(&json!(["doc", "audience"]))
        );
    }

    #[test]
    fn test_config_objects() {
        let src = "export const DEFAULTS = {\n  retries: 3,\n  nested: { depth: 1 },\n  label: \"}\",\n};\nconst helper = { a: 1 };\n";
        let items = extract_source(src, &js(), TargetType::Config);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "DEFAULTS");
        assert!(items[0].code.ends_with("label: \"}\",\n}"));
        assert_eq!(
            items[0].metadata.get("keys"),
            Some(&json!(["retries", "nested", "label"]))
        );
    }

    #[test]
    fn test_standalone_source_reresolves() {
        let src = "const EMAIL = /a+b/i;\n";
        let item = extract_source(src, &js(), TargetType::Regex).remove(0);
        let standalone = standalone_source(&item);
        let again = find_unit(&standalone, &js(), TargetType::Regex, "EMAIL").unwrap();
        assert_eq!(again.code, item.code);
    }
}
