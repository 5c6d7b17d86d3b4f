//! In-process keyword corpus.
//!
//! Used as the document search backend when no vector store is wired in.
//! Text files under a directory are split into paragraph chunks and ranked
//! by how many distinct query terms they contain.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ToolResult;
use crate::retrieval::{Document, VectorSearch};

const EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst"];
const MAX_CHUNK_CHARS: usize = 1200;

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

struct Chunk {
    document: Document,
    terms: HashSet<String>,
}

/// Keyword-ranked document chunks held in memory.
#[derive(Default)]
pub struct KeywordCorpus {
    chunks: Vec<Chunk>,
}

impl KeywordCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every text file under `dir`.
    pub fn load_dir(dir: &Path) -> ToolResult<Self> {
        let mut corpus = Self::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("[CORPUS] Skipping entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !entry.file_type().is_file() || !supported {
                continue;
            }

            let content = std::fs::read_to_string(path)?;
            let source = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            corpus.add_text(&source, &content);
        }
        info!("[CORPUS] Loaded {} chunk(s) from {}", corpus.len(), dir.display());
        Ok(corpus)
    }

    /// Split `content` into paragraph chunks attributed to `source`.
    pub fn add_text(&mut self, source: &str, content: &str) {
        let mut current = String::new();
        let mut index = 0;
        let paragraphs = content
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty());

        for paragraph in paragraphs {
            if !current.is_empty()
                && current.chars().count() + paragraph.chars().count() > MAX_CHUNK_CHARS
            {
                self.push_chunk(source, index, std::mem::take(&mut current));
                index += 1;
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }
        if !current.is_empty() {
            self.push_chunk(source, index, current);
        }
    }

    fn push_chunk(&mut self, source: &str, index: usize, content: String) {
        let terms = terms(&content);
        let document = Document::new(content)
            .with_metadata("source", json!(source))
            .with_metadata("chunk", json!(index));
        self.chunks.push(Chunk { document, terms });
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Rank chunks by the number of distinct query terms they share.
    pub fn rank(&self, query: &str, k: usize) -> Vec<Document> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (chunk.terms.intersection(&query_terms).count(), i))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Highest score first, earlier chunks win ties
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        debug!("[CORPUS] {} chunk(s) match '{}'", scored.len(), query);
        scored
            .into_iter()
            .take(k)
            .map(|(score, i)| {
                self.chunks[i]
                    .document
                    .clone()
                    .with_metadata("score", json!(score))
            })
            .collect()
    }
}

#[async_trait]
impl VectorSearch for KeywordCorpus {
    async fn search(&self, query: &str, k: usize) -> ToolResult<Vec<Document>> {
        Ok(self.rank(query, k))
    }
}
