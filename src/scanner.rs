//! Repository scanner: walks a source tree, applies include/exclude globs
//! and a language allow-list, and decomposes each file into one or more
//! [`Document`]s (function/class/module-level chunks) with structural
//! metadata.
//!
//! The scanner is stateless and restartable: re-running it over the same
//! tree reproduces the same document set. A single unreadable file is
//! recorded as a non-fatal error in [`ScanStats`]; the scan never aborts on
//! a per-file failure.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::models::{
    Document, DocumentKind, DocumentMetadata, FileFingerprint, ScanError, ScanStats,
};

const SNIPPET_CHARS: usize = 240;
const MAX_IMPORTS: usize = 64;

/// One scanned file: its fingerprint plus the documents it produced.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub fingerprint: FileFingerprint,
    pub documents: Vec<Document>,
}

/// Result of one full repository scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub files: Vec<ScannedFile>,
    pub stats: ScanStats,
}

pub struct Scanner {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    languages: Vec<String>,
    max_document_chars: usize,
}

impl Scanner {
    pub fn new(root: &Path, config: &ScannerConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
            "**/.repopulse/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            root: root.to_path_buf(),
            include,
            exclude,
            languages: config.languages.clone(),
            max_document_chars: config.max_document_chars,
        })
    }

    /// Walk the tree and produce documents for every matching source file.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut stats = ScanStats::default();
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    stats.errors.push(ScanError {
                        path: e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let language = match language_for_path(path) {
                Some(lang) => lang,
                None => {
                    stats.files_skipped += 1;
                    continue;
                }
            };
            if !self.languages.is_empty() && !self.languages.iter().any(|l| l == language) {
                stats.files_skipped += 1;
                continue;
            }

            match self.scan_file(path, &rel_str, language) {
                Ok(file) => {
                    stats.files_scanned += 1;
                    files.push(file);
                }
                Err(e) => {
                    stats.errors.push(ScanError {
                        path: rel_str,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Deterministic ordering regardless of walk order
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ScanOutcome { files, stats })
    }

    fn scan_file(&self, path: &Path, rel_path: &str, language: &str) -> Result<ScannedFile> {
        let metadata = std::fs::metadata(path)?;
        let content = std::fs::read_to_string(path)?;

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let fingerprint = FileFingerprint {
            content_hash: format!("{:x}", hasher.finalize()),
            size: metadata.len(),
            modified,
        };

        let documents =
            split_into_documents(rel_path, language, &content, self.max_document_chars);

        Ok(ScannedFile {
            path: rel_path.to_string(),
            fingerprint,
            documents,
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Map a file extension to a language name. Unrecognized extensions are
/// not indexed.
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    let lang = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "rb" => "ruby",
        "cs" => "csharp",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "sh" | "bash" => "shell",
        "md" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        _ => return None,
    };
    Some(lang)
}

/// Split file text into top-level structural chunks.
///
/// A heuristic line-based splitter: top-level declaration lines open a new
/// chunk that extends to the line before the next declaration. Files with
/// no recognized declarations produce a single module-level document, so
/// every scanned file yields at least one document.
fn split_into_documents(
    rel_path: &str,
    language: &str,
    text: &str,
    max_chars: usize,
) -> Vec<Document> {
    let lines: Vec<&str> = text.lines().collect();
    let imports = collect_imports(&lines);

    // (line index, kind, name) of each top-level declaration
    let mut declarations: Vec<(usize, DocumentKind, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if let Some((kind, name)) = classify_declaration(language, line) {
            declarations.push((i, kind, name));
        }
    }

    let file_stem = Path::new(rel_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| rel_path.to_string());

    let mut chunks: Vec<(DocumentKind, String, usize, usize)> = Vec::new();

    if declarations.is_empty() {
        chunks.push((DocumentKind::Module, file_stem, 0, lines.len()));
    } else {
        // Header lines before the first declaration form a module chunk
        let first = declarations[0].0;
        if lines[..first].iter().any(|l| !l.trim().is_empty()) {
            chunks.push((DocumentKind::Module, file_stem, 0, first));
        }
        for (d, decl) in declarations.iter().enumerate() {
            let end = declarations
                .get(d + 1)
                .map(|next| next.0)
                .unwrap_or(lines.len());
            chunks.push((decl.1, decl.2.clone(), decl.0, end));
        }
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, (kind, name, start, end))| {
            let body = lines[start..end].join("\n");
            let content = truncate_chars(&body, max_chars);
            let snippet = truncate_chars(&body, SNIPPET_CHARS);
            Document {
                id: format!("{}#{}", rel_path, ordinal),
                content,
                metadata: DocumentMetadata {
                    file_path: rel_path.to_string(),
                    kind,
                    name,
                    start_line: start as u32 + 1,
                    end_line: end as u32,
                    language: language.to_string(),
                    imports: imports.clone(),
                    snippet,
                },
            }
        })
        .collect()
}

fn collect_imports(lines: &[&str]) -> Vec<String> {
    let mut imports = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        let is_import = trimmed.starts_with("use ")
            || trimmed.starts_with("import ")
            || trimmed.starts_with("from ")
            || trimmed.starts_with("#include")
            || trimmed.starts_with("require ")
            || trimmed.starts_with("require(");
        if is_import {
            imports.push(trimmed.trim_end_matches(';').to_string());
            if imports.len() >= MAX_IMPORTS {
                break;
            }
        }
    }
    imports
}

/// Recognize a top-level declaration line and extract its kind and name.
fn classify_declaration(language: &str, line: &str) -> Option<(DocumentKind, String)> {
    let function_keywords: &[&str] = match language {
        "rust" => &["fn", "async fn"],
        "python" => &["def", "async def"],
        "javascript" | "typescript" => &["function", "async function"],
        "go" => &["func"],
        "c" | "cpp" | "java" | "csharp" | "php" | "swift" | "kotlin" => &[],
        _ => return None,
    };
    let class_keywords: &[&str] = match language {
        "rust" => &["struct", "enum", "trait", "impl"],
        "python" => &["class"],
        "javascript" | "typescript" => &["class", "interface"],
        "go" => &["type"],
        _ => &[],
    };

    // Strip common visibility/export prefixes before matching keywords
    let stripped = line
        .trim_start_matches("pub(crate) ")
        .trim_start_matches("pub ")
        .trim_start_matches("export default ")
        .trim_start_matches("export ");

    for kw in function_keywords {
        if let Some(rest) = keyword_rest(stripped, kw) {
            return Some((DocumentKind::Function, declaration_name(rest)));
        }
    }
    for kw in class_keywords {
        if let Some(rest) = keyword_rest(stripped, kw) {
            return Some((DocumentKind::Class, declaration_name(rest)));
        }
    }
    None
}

fn keyword_rest<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if rest.starts_with(' ') {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn declaration_name(rest: &str) -> String {
    rest.split(|c: char| !c.is_alphanumeric() && c != '_')
        .find(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
