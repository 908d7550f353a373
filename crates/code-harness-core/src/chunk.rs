//! Chunking port, reference chunkers, and chunk identity.
//!
//! A [`Chunker`] turns the text of one file into [`ChunkCandidate`]s. The
//! pipeline assigns identity and provenance afterwards, so chunkers only
//! deal with line ranges and text.
//!
//! Two strategies ship with the core:
//!
//! - [`SymbolChunker`]: one chunk per top-level definition, found with
//!   per-language line patterns. Returns an empty list when a file has no
//!   recognizable definitions (or its language has no patterns).
//! - [`LineWindowChunker`]: fixed windows of lines with overlap.
//!
//! [`FallbackChunker`] composes them: the primary runs first and the
//! fallback only sees files the primary produced nothing for.
//!
//! # Identity
//!
//! A chunk's id is derived from its coordinates, never from its text:
//!
//! ```rust
//! use code_harness_core::chunk::chunk_id;
//!
//! let a = chunk_id("proj", "src/lib.rs", 1, 10);
//! assert_eq!(a, chunk_id("proj", "src/lib.rs", 1, 10));
//! assert_ne!(a, chunk_id("proj", "src/lib.rs", 2, 10));
//! ```

use std::path::Path;

use anyhow::Result;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::ChunkCandidate;

/// Hex length of chunk ids.
const CHUNK_ID_LEN: usize = 32;
/// Hex length of project ids.
const PROJECT_ID_LEN: usize = 16;

/// Produces chunk candidates from the text of a single file.
///
/// Implementations should be total for well-formed text and return an
/// empty list (not an error) when they find no structural units. An `Err`
/// tells the pipeline to skip the file and keep whatever it already has
/// in storage.
pub trait Chunker: Send + Sync {
    fn chunk(&self, content: &str, path: &str, lang: &str) -> Result<Vec<ChunkCandidate>>;
}

/// SHA-256 of arbitrary bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content hash of a chunk's text.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Deterministic chunk id from its coordinates.
pub fn chunk_id(project_id: &str, path: &str, start_line: u32, end_line: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update([0]);
    hasher.update(path.as_bytes());
    hasher.update([0]);
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(CHUNK_ID_LEN);
    id
}

/// Stable project id from the repository root path.
pub fn project_id(repo_root: &Path) -> String {
    let mut id = sha256_hex(repo_root.to_string_lossy().as_bytes());
    id.truncate(PROJECT_ID_LEN);
    id
}

// ============ Line windows ============

/// Fixed-size line windows with overlap.
#[derive(Debug, Clone)]
pub struct LineWindowChunker {
    window_lines: usize,
    overlap_lines: usize,
}

impl LineWindowChunker {
    /// `overlap_lines` is clamped below `window_lines` so windows always advance.
    pub fn new(window_lines: usize, overlap_lines: usize) -> Self {
        let window_lines = window_lines.max(1);
        Self {
            window_lines,
            overlap_lines: overlap_lines.min(window_lines - 1),
        }
    }
}

impl Default for LineWindowChunker {
    fn default() -> Self {
        Self::new(60, 10)
    }
}

impl Chunker for LineWindowChunker {
    fn chunk(&self, content: &str, _path: &str, lang: &str) -> Result<Vec<ChunkCandidate>> {
        let lines: Vec<&str> = content.lines().collect();
        Ok(window_lines(&lines, 0, self.window_lines, self.overlap_lines, None, lang))
    }
}

/// Split `lines` (whose first element is line `offset + 1`) into windows.
fn window_lines(
    lines: &[&str],
    offset: usize,
    window: usize,
    overlap: usize,
    symbol: Option<&str>,
    lang: &str,
) -> Vec<ChunkCandidate> {
    let step = window - overlap;
    let mut out = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let end = (start + window).min(lines.len());
        let slice = &lines[start..end];
        if slice.iter().any(|l| !l.trim().is_empty()) {
            out.push(ChunkCandidate {
                start_line: line_no(offset + start + 1),
                end_line: line_no(offset + end),
                content: slice.join("\n"),
                symbol: symbol.map(str::to_string),
                lang: lang.to_string(),
            });
        }
        if end == lines.len() {
            break;
        }
        start += step;
    }

    out
}

fn line_no(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ============ Top-level definitions ============

/// One chunk per top-level definition, found with line patterns.
///
/// A definition starts at an unindented line matching one of the
/// language's patterns and runs until the next definition (or end of
/// file). Leading doc comments, attributes, and decorators are attached to
/// the definition below them. Text before the first definition becomes a
/// chunk without a symbol. Definitions longer than `max_lines` are split
/// into windows that keep the symbol name.
pub struct SymbolChunker {
    patterns: Vec<(&'static str, Vec<Regex>)>,
    max_lines: usize,
}

impl SymbolChunker {
    /// Compile the built-in patterns.
    pub fn new(max_lines: usize) -> Result<Self> {
        let table: &[(&'static str, &[&str])] = &[
            (
                "rust",
                &[
                    r#"^(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|extern\s+"[^"]*")\s+)*(?:fn|struct|enum|trait|union|mod|type|static|const)\s+([A-Za-z_][A-Za-z0-9_]*)"#,
                    r"^(?:unsafe\s+)?impl(?:<[^>]*>)?\s+(?:[A-Za-z0-9_:<>, &']+\s+for\s+)?([A-Za-z_][A-Za-z0-9_]*)",
                    r"^macro_rules!\s*([A-Za-z_][A-Za-z0-9_]*)",
                ],
            ),
            ("python", &[r"^(?:async\s+)?(?:def|class)\s+([A-Za-z_][A-Za-z0-9_]*)"]),
            (
                "javascript",
                &[
                    r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
                    r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s*)?(?:function|\([^)]*\)\s*=>|[A-Za-z_$][A-Za-z0-9_$]*\s*=>)",
                ],
            ),
            (
                "typescript",
                &[
                    r"^(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|interface|type|enum)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
                    r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(?:async\s*)?(?:function|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][A-Za-z0-9_$]*\s*=>)",
                ],
            ),
            (
                "go",
                &[
                    r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)",
                    r"^type\s+([A-Za-z_][A-Za-z0-9_]*)",
                ],
            ),
        ];

        let mut patterns = Vec::with_capacity(table.len());
        for (lang, sources) in table {
            let compiled = sources
                .iter()
                .map(|s| Regex::new(s))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            patterns.push((*lang, compiled));
        }

        Ok(Self {
            patterns,
            max_lines: max_lines.max(1),
        })
    }

    fn patterns_for(&self, lang: &str) -> Option<&[Regex]> {
        self.patterns
            .iter()
            .find(|(l, _)| *l == lang)
            .map(|(_, p)| p.as_slice())
    }

    fn definition_name(patterns: &[Regex], line: &str) -> Option<String> {
        patterns
            .iter()
            .find_map(|re| re.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

fn is_leading_decoration(line: &str, lang: &str) -> bool {
    let t = line.trim_start();
    if line.len() != t.len() {
        return false;
    }
    match lang {
        "rust" => t.starts_with("///") || t.starts_with("//!") || t.starts_with("#["),
        "python" => t.starts_with('@') || t.starts_with('#'),
        "go" => t.starts_with("//"),
        _ => t.starts_with("/**") || t.starts_with("* ") || t.starts_with("*/") || t.starts_with("//") || t.starts_with('@'),
    }
}

impl Chunker for SymbolChunker {
    fn chunk(&self, content: &str, _path: &str, lang: &str) -> Result<Vec<ChunkCandidate>> {
        let Some(patterns) = self.patterns_for(lang) else {
            return Ok(Vec::new());
        };
        let lines: Vec<&str> = content.lines().collect();

        // (start index including decorations, symbol)
        let mut starts: Vec<(usize, String)> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if line.starts_with(char::is_whitespace) {
                continue;
            }
            if let Some(name) = Self::definition_name(patterns, line) {
                let mut start = i;
                let floor = starts.last().map_or(0, |(s, _)| s + 1);
                while start > floor && is_leading_decoration(lines[start - 1], lang) {
                    start -= 1;
                }
                starts.push((start, name));
            }
        }

        if starts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let first = starts[0].0;
        if lines[..first].iter().any(|l| !l.trim().is_empty()) {
            push_span(&mut out, &lines, 0, first, None, lang, self.max_lines);
        }
        for (idx, (start, name)) in starts.iter().enumerate() {
            let end = starts.get(idx + 1).map_or(lines.len(), |(s, _)| *s);
            push_span(&mut out, &lines, *start, end, Some(name), lang, self.max_lines);
        }

        Ok(out)
    }
}

/// Emit `lines[start..end]` trimmed of trailing blank lines, splitting
/// oversized spans into windows.
fn push_span(
    out: &mut Vec<ChunkCandidate>,
    lines: &[&str],
    start: usize,
    end: usize,
    symbol: Option<&str>,
    lang: &str,
    max_lines: usize,
) {
    let mut end = end;
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    let mut start = start;
    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    if start == end {
        return;
    }
    let span = &lines[start..end];
    if span.len() <= max_lines {
        out.push(ChunkCandidate {
            start_line: line_no(start + 1),
            end_line: line_no(end),
            content: span.join("\n"),
            symbol: symbol.map(str::to_string),
            lang: lang.to_string(),
        });
    } else {
        out.extend(window_lines(span, start, max_lines, 0, symbol, lang));
    }
}

// ============ Composition ============

/// Runs `primary`; if it yields no chunks, runs `fallback`.
pub struct FallbackChunker {
    primary: Box<dyn Chunker>,
    fallback: Box<dyn Chunker>,
}

impl FallbackChunker {
    pub fn new(primary: Box<dyn Chunker>, fallback: Box<dyn Chunker>) -> Self {
        Self { primary, fallback }
    }
}

impl Chunker for FallbackChunker {
    fn chunk(&self, content: &str, path: &str, lang: &str) -> Result<Vec<ChunkCandidate>> {
        let chunks = self.primary.chunk(content, path, lang)?;
        if !chunks.is_empty() {
            return Ok(chunks);
        }
        self.fallback.chunk(content, path, lang)
    }
}
