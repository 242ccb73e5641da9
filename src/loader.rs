use std::path::{Path, PathBuf};

use futures::future::join_all;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// Deterministic chunking constants.
pub const CHUNK_SIZE: usize = 900;
pub const CHUNK_OVERLAP: usize = 100;
const MIN_CHUNK_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub chunk_id: String,
    pub source_file: String,
    /// 1-based ordinal of the chunk within its source file.
    pub page_number: usize,
    #[serde(default = "default_true")]
    pub is_market_context: bool,
    #[serde(default = "default_confidence")]
    pub confidence_score: f32,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f32 {
    1.0
}

/// Loads text documents from a directory and splits them into overlapping
/// chunks at sentence boundaries.
pub struct DocumentLoader {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentLoader {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_overlap: CHUNK_OVERLAP,
        }
    }

    pub fn with_sizes(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Load every `.txt`/`.md` file under `dir`, returning chunks and their
    /// metadata in parallel vectors. A missing or empty directory is not an
    /// error; the caller decides whether an empty corpus matters.
    pub async fn load_documents_with_metadata(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<(Vec<String>, Vec<ChunkMetadata>)> {
        let dir = dir.as_ref();
        if !dir.exists() {
            warn!("document directory {} does not exist", dir.display());
            return Ok((Vec::new(), Vec::new()));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("txt") | Some("md")
                )
            })
            .collect();
        files.sort();

        if files.is_empty() {
            warn!("no text documents found in {}", dir.display());
            return Ok((Vec::new(), Vec::new()));
        }
        info!("found {} documents to process", files.len());

        let reads = join_all(files.iter().map(tokio::fs::read_to_string)).await;

        let mut documents = Vec::new();
        let mut metadata = Vec::new();
        let mut chunk_counter = 0usize;
        let mut successful = 0usize;

        for (path, result) in files.iter().zip(reads) {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();

            let text = match result {
                Ok(text) => text,
                Err(e) => {
                    warn!("error reading {name}: {e}");
                    continue;
                }
            };
            if text.trim().is_empty() {
                warn!("no text in {name}");
                continue;
            }

            let chunks = self.chunk_text(&text);
            for (i, chunk) in chunks.iter().enumerate() {
                metadata.push(ChunkMetadata {
                    chunk_id: format!("chunk_{chunk_counter:04}"),
                    source_file: name.clone(),
                    page_number: i + 1,
                    is_market_context: true,
                    confidence_score: 1.0,
                });
                chunk_counter += 1;
            }
            info!("processed {name}: {} chunks", chunks.len());
            documents.extend(chunks);
            successful += 1;
        }

        info!(
            "processed {successful}/{} files, total chunks: {}",
            files.len(),
            documents.len()
        );
        Ok((documents, metadata))
    }

    /// Split text into overlapping segments at sentence boundaries. Chunks
    /// shorter than `MIN_CHUNK_LEN` are dropped.
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if text.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let sentences = split_sentences(text);
        let mut chunks = Vec::new();
        let mut current = String::new();

        let mut i = 0;
        while i < sentences.len() {
            let sentence = &sentences[i];

            if current.len() + sentence.len() + 1 > self.chunk_size && !current.is_empty() {
                chunks.push(current.trim().to_string());
                // Seed the next chunk with the tail of this one, then retry
                // the same sentence.
                current = self.overlap_tail(&chunks[chunks.len() - 1]);
                // A sentence that can never fit after a seed is taken
                // oversized to guarantee forward progress.
                if current.len() + sentence.len() + 1 > self.chunk_size {
                    if !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(sentence);
                    i += 1;
                }
            } else {
                if current.is_empty() {
                    current = sentence.clone();
                } else {
                    current.push(' ');
                    current.push_str(sentence);
                }
                i += 1;
            }
        }

        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        chunks.retain(|chunk| chunk.len() > MIN_CHUNK_LEN);
        chunks
    }

    fn overlap_tail(&self, previous: &str) -> String {
        if self.chunk_overlap == 0 {
            return String::new();
        }

        let sentences = split_sentences(previous);
        let mut tail = String::new();
        for sentence in sentences.iter().rev() {
            if tail.len() + sentence.len() + 1 > self.chunk_overlap {
                break;
            }
            if tail.is_empty() {
                tail = sentence.clone();
            } else {
                tail = format!("{sentence} {tail}");
            }
        }
        tail
    }
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentence split on terminal punctuation followed by whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if chars.peek().map_or(true, |next| next.is_whitespace()) {
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
    }

    let last = current.trim();
    if !last.is_empty() {
        sentences.push(last.to_string());
    }
    sentences
}
