//! Core data models used throughout the assistant.
//!
//! These types represent the chat turns, source documents, chunks, and
//! retrieval results that flow through the indexing and chat pipeline.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The set of paths designating the current retrieval corpus.
///
/// Ordered so that two sets built from the same paths compare equal and
/// iterate identically.
pub type LookupFileSet = BTreeSet<PathBuf>;

/// Who authored a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A reference to an image attached to a user message.
///
/// Either a URL (`http(s)://…` or an inline `data:` URL) or a path to a
/// local image file, such as a screen capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to a URL a chat-completions endpoint accepts.
    ///
    /// URLs pass through unchanged; local files are inlined as base64
    /// `data:` URLs.
    pub fn to_url(&self) -> Result<String> {
        let r = self.0.as_str();
        if r.starts_with("http://") || r.starts_with("https://") || r.starts_with("data:") {
            return Ok(r.to_string());
        }

        let path = Path::new(r);
        let mime = image_mime_type(path)?;
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read image: {}", r))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{}", mime, encoded))
    }
}

fn image_mime_type(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        other => bail!("Unsupported image type: '{}' ({})", other, path.display()),
    })
}

/// Content of a chat turn: plain text, or text with an attached image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Multimodal { text: String, image: ImageRef },
}

impl ChatContent {
    /// The text portion, ignoring any attached image.
    pub fn text(&self) -> &str {
        match self {
            ChatContent::Text(t) => t,
            ChatContent::Multimodal { text, .. } => text,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            ChatContent::Text(_) => None,
            ChatContent::Multimodal { image, .. } => Some(image),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: ChatContent,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn user_with_image(text: impl Into<String>, image: ImageRef) -> Self {
        Self {
            role: ChatRole::User,
            content: ChatContent::Multimodal {
                text: text.into(),
                image,
            },
        }
    }
}

/// Ordered, append-only record of a conversation.
///
/// Holds only original user queries and final assistant answers; condensed
/// queries and retrieved context never enter the history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    /// Append a completed user/assistant exchange.
    pub fn push_exchange(&mut self, user_query: &str, answer: &str) {
        self.turns.push(ChatTurn::user(user_query));
        self.turns.push(ChatTurn::assistant(answer));
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drop every turn. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.turns.len();
        self.turns.clear();
        n
    }
}

/// Raw document produced by a file reader before chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub source_path: PathBuf,
    pub file_name: String,
    pub content_type: String,
    pub text: String,
    pub modified_at: DateTime<Utc>,
}

/// A unit of indexed text. Immutable once created.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub source_path: PathBuf,
    /// 0-based position within its source, in ingestion order.
    pub ordinal: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// A chunk matched by a query, with its relevance score.
#[derive(Debug, Clone)]
pub struct RetrievedNode {
    pub chunk: Arc<DocumentChunk>,
    pub score: f32,
}
