//! Context Provider (C3): answers "give me the K most relevant code chunks
//! and a project structure summary for these queries".
//!
//! Grounded on the harness's file walker (`ignore::WalkBuilder`, `.gitignore`
//! aware) generalized from "list Rust files" / "list modified files" into a
//! scored snippet retriever. There is no teacher vector index to lean on, so
//! ranking here is a term-overlap heuristic rather than embeddings — callers
//! only depend on the `ContextProvider` trait, so a real semantic index can
//! be swapped in later without touching the orchestrator core.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

const DEFAULT_TOP_N: usize = 20;
pub const CODING_SCORE_THRESHOLD: f64 = 0.35;
pub const ANALYSIS_SCORE_THRESHOLD: f64 = 0.30;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "cs", "rb", "c", "cpp", "h", "hpp",
];
const PROSE_EXTENSIONS: &[&str] = &["md", "mdx", "txt", "rst", "adoc"];

/// A single scored, de-duplicated snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnippet {
    pub content_id: String,
    pub chunk_index: usize,
    pub path: PathBuf,
    pub text: String,
    pub score: f64,
}

/// Opaque bundle handed to executors: a structure summary plus ranked snippets.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub structure_summary: String,
    pub snippets: Vec<ContextSnippet>,
}

impl PromptContext {
    /// Flatten into the single string executors splice into their prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Project structure\n");
        out.push_str(&self.structure_summary);
        out.push_str("\n\n# Relevant snippets\n");
        for snippet in &self.snippets {
            out.push_str(&format!(
                "\n## {} (score {:.2})\n```\n{}\n```\n",
                snippet.path.display(),
                snippet.score,
                snippet.text
            ));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ContextQuery {
    pub text: String,
    pub prioritize_files: Vec<PathBuf>,
}

/// Weighting applied per file-extension class; presets tune these.
#[derive(Debug, Clone)]
struct ExtensionWeights {
    code: f64,
    prose: f64,
}

pub trait ContextProvider: Send + Sync {
    fn query(&self, source_root: &Path, queries: &[ContextQuery], min_score: f64) -> PromptContext;

    fn for_coding(&self, source_root: &Path, queries: &[String], prioritize_files: &[PathBuf]) -> PromptContext {
        let queries: Vec<ContextQuery> = queries
            .iter()
            .map(|q| ContextQuery {
                text: q.clone(),
                prioritize_files: prioritize_files.to_vec(),
            })
            .collect();
        self.query(source_root, &queries, CODING_SCORE_THRESHOLD)
    }

    fn for_documentation(&self, source_root: &Path, queries: &[String], files: &[PathBuf]) -> PromptContext {
        let queries: Vec<ContextQuery> = queries
            .iter()
            .map(|q| ContextQuery {
                text: q.clone(),
                prioritize_files: files.to_vec(),
            })
            .collect();
        self.query(source_root, &queries, ANALYSIS_SCORE_THRESHOLD)
    }
}

/// Default implementation: walks the worktree respecting `.gitignore`, chunks
/// files by line blocks, and scores chunks by query-term overlap.
pub struct FileSystemContextProvider {
    top_n: usize,
    chunk_lines: usize,
}

impl Default for FileSystemContextProvider {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            chunk_lines: 60,
        }
    }
}

impl FileSystemContextProvider {
    pub fn new(top_n: usize, chunk_lines: usize) -> Self {
        Self { top_n, chunk_lines }
    }

    fn weights_for(&self, query: &ContextQuery) -> ExtensionWeights {
        let has_prose_hint = query
            .prioritize_files
            .iter()
            .any(|p| is_prose_file(p));
        if has_prose_hint {
            ExtensionWeights { code: 0.6, prose: 1.2 }
        } else {
            ExtensionWeights { code: 1.2, prose: 0.6 }
        }
    }

    fn walk_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(root).hidden(true).git_ignore(true).build();
        for entry in walker.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        files
    }

    fn chunk_file(&self, path: &Path) -> Vec<(usize, String)> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        contents
            .lines()
            .collect::<Vec<_>>()
            .chunks(self.chunk_lines)
            .enumerate()
            .map(|(idx, lines)| (idx, lines.join("\n")))
            .collect()
    }

    fn score(&self, query_text: &str, chunk: &str, path: &Path, weights: &ExtensionWeights) -> f64 {
        let query_terms: Vec<String> = tokenize(query_text);
        if query_terms.is_empty() {
            return 0.0;
        }
        let chunk_terms: Vec<String> = tokenize(chunk);
        let chunk_set: std::collections::HashSet<&String> = chunk_terms.iter().collect();

        let matches = query_terms.iter().filter(|t| chunk_set.contains(t)).count();
        let overlap = matches as f64 / query_terms.len() as f64;

        let ext_weight = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if CODE_EXTENSIONS.contains(&ext) => weights.code,
            Some(ext) if PROSE_EXTENSIONS.contains(&ext) => weights.prose,
            _ => 1.0,
        };

        (overlap * ext_weight).min(1.0)
    }

    fn structure_summary(&self, root: &Path, files: &[PathBuf]) -> String {
        let mut dirs: HashMap<String, usize> = HashMap::new();
        for f in files {
            if let Ok(rel) = f.strip_prefix(root) {
                let top = rel
                    .components()
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .unwrap_or_default();
                *dirs.entry(top).or_insert(0) += 1;
            }
        }
        let mut entries: Vec<(String, usize)> = dirs.into_iter().collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(name, count)| format!("- {name} ({count} files)"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ContextProvider for FileSystemContextProvider {
    fn query(&self, source_root: &Path, queries: &[ContextQuery], min_score: f64) -> PromptContext {
        let files = self.walk_files(source_root);
        let structure_summary = self.structure_summary(source_root, &files);

        // Keyed by (content_id, chunk_index), keeping the highest score.
        let mut best: HashMap<(String, usize), ContextSnippet> = HashMap::new();

        for query in queries {
            let weights = self.weights_for(query);
            let mut candidate_files: Vec<&PathBuf> = query
                .prioritize_files
                .iter()
                .filter(|p| files.contains(p))
                .collect();
            if candidate_files.is_empty() {
                candidate_files = files.iter().collect();
            }

            for path in candidate_files {
                let content_id = path.to_string_lossy().to_string();
                for (chunk_index, text) in self.chunk_file(path) {
                    let score = self.score(&query.text, &text, path, &weights);
                    if score < min_score {
                        continue;
                    }
                    let key = (content_id.clone(), chunk_index);
                    let candidate = ContextSnippet {
                        content_id: content_id.clone(),
                        chunk_index,
                        path: path.clone(),
                        text,
                        score,
                    };
                    best.entry(key)
                        .and_modify(|existing| {
                            if candidate.score > existing.score {
                                *existing = candidate.clone();
                            }
                        })
                        .or_insert(candidate);
                }
            }
        }

        let mut snippets: Vec<ContextSnippet> = best.into_values().collect();
        snippets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        snippets.truncate(self.top_n);

        PromptContext {
            structure_summary,
            snippets,
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() > 2)
        .map(String::from)
        .collect()
}

fn is_prose_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| PROSE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Extract explicit file references from step name/description text — known
/// source/doc extensions only.
pub fn extract_file_references(text: &str) -> Vec<PathBuf> {
    let pattern = Regex::new(
        r"[\w./-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|cs|rb|c|cpp|h|hpp|md|json|toml|yaml|yml)\b",
    )
    .expect("static regex compiles");
    pattern
        .find_iter(text)
        .map(|m| PathBuf::from(m.as_str()))
        .collect()
}
