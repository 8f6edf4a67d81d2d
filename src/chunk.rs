//! Paragraph-boundary text splitter.
//!
//! Splits a document's text into pieces that respect a configurable
//! `max_tokens` limit, preferring `\n\n` paragraph boundaries so each
//! piece stays semantically coherent. Oversized paragraphs are cut at the
//! last newline or space before the limit.
//!
//! The splitter only produces text. Ordinals and embeddings are attached by
//! the index via [`make_chunk`], which is what keeps ordinals contiguous per
//! source no matter how many documents a reader produced for that source.

use std::path::Path;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::DocumentChunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into trimmed, non-empty pieces of at most `max_tokens`.
///
/// Whitespace-only input yields no pieces.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            hard_split(para, max_chars, &mut pieces);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

fn hard_split(mut remaining: &str, max_chars: usize, out: &mut Vec<String>) {
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, max_chars);
        let cut = if limit >= remaining.len() {
            remaining.len()
        } else {
            remaining[..limit]
                .rfind(|c: char| c == '\n' || c == ' ')
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        };
        // A single char wider than the limit still has to make progress.
        let cut = if cut == 0 { first_char_len(remaining) } else { cut };

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Build an immutable [`DocumentChunk`] with a fresh UUID and SHA-256 hash.
pub fn make_chunk(
    source_path: &Path,
    ordinal: usize,
    text: String,
    embedding: Vec<f32>,
) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::new_v4().to_string(),
        source_path: source_path.to_path_buf(),
        ordinal,
        hash: content_hash(&text),
        text,
        embedding,
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
