//! Paragraph-boundary text chunker.
//!
//! Splits a file's text into vectorless [`ChunkRecord`]s that respect the
//! config's `max_tokens` limit. Splitting occurs on paragraph boundaries
//! (`\n\n`) to keep each chunk coherent; oversized paragraphs are hard-split
//! at the nearest newline or space.

use crate::models::{ChunkRecord, EmbeddingConfig, LocalFileInfo};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Splits a document's text into bounded-size records.
///
/// Records come back with empty vectors and an empty `id`; the pipeline
/// fills both in later stages.
pub trait Chunker: Send + Sync {
    fn chunk(&self, info: &LocalFileInfo, text: &str, config: &EmbeddingConfig)
        -> Vec<ChunkRecord>;
}

/// Default [`Chunker`]: paragraph packing up to `config.max_tokens`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParagraphChunker;

impl Chunker for ParagraphChunker {
    fn chunk(
        &self,
        info: &LocalFileInfo,
        text: &str,
        config: &EmbeddingConfig,
    ) -> Vec<ChunkRecord> {
        let config_id = config.config_id();
        split_text(text, config.max_tokens)
            .into_iter()
            .enumerate()
            .map(|(i, piece)| make_record(info, &config_id, i as i32, piece))
            .collect()
    }
}

/// Split text into pieces on paragraph boundaries, respecting `max_tokens`.
///
/// Blank input yields no pieces.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}

/// Largest byte index `<= max` that sits on a char boundary (at least one
/// full char so the split always makes progress).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.chars().next().map(char::len_utf8).unwrap_or(s.len())
    } else {
        idx
    }
}

fn make_record(info: &LocalFileInfo, config_id: &str, index: i32, text: String) -> ChunkRecord {
    let tokens = text.chars().count().div_ceil(CHARS_PER_TOKEN) as u32;
    ChunkRecord {
        id: String::new(),
        vector: Vec::new(),
        file_id: info.meta.id.clone(),
        config_id: config_id.to_string(),
        scope: info.meta.scope.clone(),
        content: text,
        file_name: info.file_name.clone(),
        file_size: u32::try_from(info.file_size).unwrap_or(u32::MAX),
        mime_type: info.mime_type.clone(),
        chunk_index: index,
        tokens: Some(tokens),
        distance: None,
        relevance: None,
    }
}
