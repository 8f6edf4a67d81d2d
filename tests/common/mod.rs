//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use llama_assistant::embedding::Embedder;
use llama_assistant::index::{DocumentIndex, IndexStats, VectorIndex};
use llama_assistant::llm::{CompletionDelta, DeltaStream, LanguageModel};
use llama_assistant::models::{ChatTurn, LookupFileSet, RetrievedNode};
use llama_assistant::pipeline::ChatSession;
use llama_assistant::reader::DirectoryReader;
use parking_lot::Mutex;

const VOCAB: &[&str] = &[
    "paris", "capital", "france", "is", "the", "of", "what", "berlin", "germany", "zebra",
    "xylophone", "quartz", "context", "question", "rust", "cargo",
];

/// One dimension per vocabulary word; anything else is ignored.
pub struct VocabEmbedder;

#[async_trait]
impl Embedder for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab"
    }
    fn dims(&self) -> usize {
        VOCAB.len()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; VOCAB.len()];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .map(str::to_lowercase)
                {
                    if let Some(i) = VOCAB.iter().position(|w| *w == word) {
                        v[i] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

/// A model that answers from a script and records every request.
pub struct ScriptedModel {
    pub rewrite: String,
    pub answer: String,
    pub fail_answer: bool,
    pub delay: Option<Duration>,
    pub requests: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedModel {
    pub fn new(rewrite: &str, answer: &str) -> Self {
        Self {
            rewrite: rewrite.to_string(),
            answer: answer.to_string(),
            fail_answer: false,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_answer: true,
            ..Self::new("rewrite", "unused")
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new("rewrite", "late")
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatTurn>> {
        self.requests.lock().clone()
    }

    /// The messages of the last non-condensation request.
    pub fn last_answer_request(&self) -> Vec<ChatTurn> {
        self.requests()
            .into_iter()
            .rev()
            .find(|r| !is_condense_request(r))
            .unwrap_or_default()
    }

    pub fn condense_calls(&self) -> usize {
        self.requests().iter().filter(|r| is_condense_request(r)).count()
    }
}

pub fn is_condense_request(messages: &[ChatTurn]) -> bool {
    messages.len() == 1
        && messages[0]
            .content
            .text()
            .starts_with("Given the chat history")
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatTurn]) -> Result<ChatTurn> {
        self.requests.lock().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if is_condense_request(messages) {
            return Ok(ChatTurn::assistant(self.rewrite.clone()));
        }
        if self.fail_answer {
            anyhow::bail!("model crashed");
        }
        Ok(ChatTurn::assistant(self.answer.clone()))
    }

    async fn complete_stream(&self, messages: &[ChatTurn]) -> Result<DeltaStream> {
        self.requests.lock().push(messages.to_vec());
        if self.fail_answer {
            anyhow::bail!("model crashed");
        }
        let parts: Vec<Result<CompletionDelta>> = self
            .answer
            .chars()
            .collect::<Vec<_>>()
            .chunks(3)
            .map(|c| Ok(CompletionDelta::text(c.iter().collect::<String>())))
            .collect();
        Ok(Box::pin(futures::stream::iter(parts)))
    }
}

/// Wraps a real index and logs every mutating call.
pub struct CountingIndex {
    inner: VectorIndex,
    log: Arc<Mutex<Vec<String>>>,
}

fn names(paths: &LookupFileSet) -> String {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl DocumentIndex for CountingIndex {
    async fn rebuild(&mut self, paths: &LookupFileSet) -> Result<IndexStats> {
        self.log.lock().push(format!("rebuild {}", names(paths)));
        self.inner.rebuild(paths).await
    }
    async fn insert(&mut self, paths: &LookupFileSet) -> Result<IndexStats> {
        self.log.lock().push(format!("insert {}", names(paths)));
        self.inner.insert(paths).await
    }
    fn clear(&mut self) {
        self.log.lock().push("clear".to_string());
        self.inner.clear()
    }
    fn is_configured(&self) -> bool {
        self.inner.is_configured()
    }
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Option<Vec<RetrievedNode>>> {
        self.inner.similarity_search(query, k).await
    }
    fn stats(&self) -> IndexStats {
        self.inner.stats()
    }
}

pub fn vector_index() -> VectorIndex {
    VectorIndex::new(
        Arc::new(VocabEmbedder),
        Arc::new(DirectoryReader::new().unwrap()),
        256,
    )
}

pub fn session() -> ChatSession {
    ChatSession::new(Box::new(vector_index()))
}

/// A session whose index records rebuild/insert/clear calls into the returned log.
pub fn counting_session() -> (ChatSession, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let index = CountingIndex {
        inner: vector_index(),
        log: Arc::clone(&log),
    };
    (ChatSession::new(Box::new(index)), log)
}

pub fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}
