//! The chat orchestrator.
//!
//! Each call to [`RagAgent::chat_completion`] runs one pass of a fixed
//! state machine over a [`ChatSession`]:
//!
//! ```text
//! Idle -> Setup -> Condensing -> Retrieving -> Responding -> Idle
//!            \__________\____________\____________\-> Failed
//! ```
//!
//! | Stage | Work |
//! |-------|------|
//! | Setup | validate the request, refresh the index if the lookup-file set changed |
//! | Condensing | rewrite history + query into a standalone question |
//! | Retrieving | top-k search with the condensed question, cutoff filter |
//! | Responding | compose the prompt, call the model, commit history |
//!
//! The agent is stateless and can be shared across conversations; all
//! mutable state (history, retained lookup set, index) lives in the session.
//! Taking the session by `&mut` serializes invocations on one conversation.
//!
//! # History commit
//!
//! History only ever receives the original user query and the final
//! assistant answer. A complete reply commits both right after the model
//! returns. A streaming reply commits when the stream is drained to its end;
//! a stream that errors or is dropped early commits nothing. A failed or
//! timed-out invocation leaves history untouched.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::compose::ContextComposer;
use crate::condense::HistoryCondenser;
use crate::config::{Config, RefreshPolicy};
use crate::embedding::create_embedder;
use crate::error::{AgentError, Result};
use crate::index::{DocumentIndex, IndexStats, VectorIndex};
use crate::llm::{CompletionDelta, DeltaStream, LanguageModel, OpenAiCompatibleModel};
use crate::models::{ChatHistory, ChatTurn, ImageRef, LookupFileSet};
use crate::progress::IndexProgressReporter;
use crate::reader::DirectoryReader;
use crate::retriever::Retriever;

/// Where the pipeline is in its current (or last) invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Setup,
    Condensing,
    Retrieving,
    Responding,
    Failed,
}

/// One chat invocation as submitted by a caller.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub query: String,
    pub image: Option<ImageRef>,
    pub lookup_files: LookupFileSet,
    pub streaming: bool,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_lookup_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<std::path::PathBuf>,
    {
        self.lookup_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Scratch state for a single pass, created in Setup and dropped at the end.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub query_str: String,
    pub image: Option<ImageRef>,
    pub streaming: bool,
}

/// What the Setup stage did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Lookup set equal to the retained one; index untouched.
    Unchanged,
    /// Lookup set became empty; index cleared.
    Cleared,
    Rebuilt(IndexStats),
    /// Only newly added paths were inserted.
    Extended(IndexStats),
}

/// Per-conversation state.
pub struct ChatSession {
    history: Arc<Mutex<ChatHistory>>,
    retained: LookupFileSet,
    index: Box<dyn DocumentIndex>,
    stage: Stage,
}

impl ChatSession {
    pub fn new(index: Box<dyn DocumentIndex>) -> Self {
        Self {
            history: Arc::new(Mutex::new(ChatHistory::new())),
            retained: LookupFileSet::new(),
            index,
            stage: Stage::Idle,
        }
    }

    /// Session backed by a [`VectorIndex`] over the configured embedder.
    pub fn from_config(
        config: &Config,
        progress: Arc<dyn IndexProgressReporter>,
    ) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = VectorIndex::new(
            embedder,
            Arc::new(DirectoryReader::new()?),
            config.chunking.max_tokens,
        )
        .with_batch_size(config.embedding.batch_size)
        .with_progress(progress);
        Ok(Self::new(Box::new(index)))
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> ChatHistory {
        self.history.lock().clone()
    }

    /// Forget the conversation. Returns how many turns were dropped.
    pub fn clear_chat_history(&self) -> usize {
        let n = self.history.lock().clear();
        tracing::debug!(turns = n, "chat history cleared");
        n
    }

    /// The lookup-file set the index was last built from.
    pub fn lookup_files(&self) -> &LookupFileSet {
        &self.retained
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = ?self.stage, to = ?stage, "pipeline stage");
        self.stage = stage;
    }
}

/// Either the whole answer or a stream of deltas.
#[derive(Debug)]
pub enum AgentResponse {
    Complete(ChatTurn),
    Streaming(StreamingReply),
}

impl AgentResponse {
    /// The full answer text, draining the stream if there is one.
    pub async fn into_text(self) -> Result<String> {
        match self {
            AgentResponse::Complete(turn) => Ok(turn.content.text().to_string()),
            AgentResponse::Streaming(reply) => reply.collect_text().await,
        }
    }
}

/// A streamed answer that records the exchange in history once fully read.
pub struct StreamingReply {
    inner: DeltaStream,
    history: Arc<Mutex<ChatHistory>>,
    query: String,
    answer: String,
    finished: bool,
}

impl StreamingReply {
    fn new(inner: DeltaStream, history: Arc<Mutex<ChatHistory>>, query: String) -> Self {
        Self {
            inner,
            history,
            query,
            answer: String::new(),
            finished: false,
        }
    }

    /// Text received so far.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Drain the stream and return the complete answer.
    pub async fn collect_text(mut self) -> Result<String> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.answer)
    }
}

impl std::fmt::Debug for StreamingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingReply")
            .field("query", &self.query)
            .field("answer", &self.answer)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for StreamingReply {
    type Item = Result<CompletionDelta>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(delta))) => {
                if let Some(text) = &delta.content {
                    this.answer.push_str(text);
                }
                Poll::Ready(Some(Ok(delta)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(AgentError::ModelInference(e))))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.history.lock().push_exchange(&this.query, &this.answer);
                tracing::debug!(chars = this.answer.len(), "streamed answer committed");
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The RAG orchestrator.
pub struct RagAgent {
    llm: Arc<dyn LanguageModel>,
    condenser: HistoryCondenser,
    composer: ContextComposer,
    retriever: Retriever,
    timeout: Duration,
    refresh: RefreshPolicy,
}

impl RagAgent {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            condenser: HistoryCondenser,
            composer: ContextComposer,
            retriever: Retriever::default(),
            timeout: Duration::from_secs(60),
            refresh: RefreshPolicy::default(),
        }
    }

    /// Agent talking to the configured OpenAI-compatible endpoint.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let llm = Arc::new(OpenAiCompatibleModel::from_config(&config.llm)?);
        Ok(Self::with_config(llm, config))
    }

    /// Agent over a caller-supplied model, tuned by `config`.
    pub fn with_config(llm: Arc<dyn LanguageModel>, config: &Config) -> Self {
        Self::new(llm)
            .with_retriever(Retriever::new(
                config.retrieval.top_k,
                config.retrieval.similarity_cutoff,
            ))
            .with_timeout(config.agent.timeout())
            .with_refresh_policy(config.retrieval.refresh)
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_refresh_policy(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    /// Bring the session's index in line with `files`.
    ///
    /// Equal sets are a no-op. An empty set clears the index. Otherwise the
    /// index is cleared and rebuilt, except under the incremental policy
    /// when `files` strictly grows the retained set: then only the added
    /// paths are inserted. The retained set changes only on success, except
    /// that a failed rebuild resets it to empty to match the cleared index.
    pub async fn update_index(
        &self,
        session: &mut ChatSession,
        files: LookupFileSet,
    ) -> Result<RefreshOutcome> {
        if files == session.retained {
            return Ok(RefreshOutcome::Unchanged);
        }

        let outcome = if files.is_empty() {
            session.index.clear();
            RefreshOutcome::Cleared
        } else if self.refresh == RefreshPolicy::Incremental
            && !session.retained.is_empty()
            && session.retained.is_subset(&files)
            && session.index.is_configured()
        {
            let added: LookupFileSet = files.difference(&session.retained).cloned().collect();
            let stats = session
                .index
                .insert(&added)
                .await
                .map_err(AgentError::IndexBuild)?;
            RefreshOutcome::Extended(stats)
        } else {
            session.index.clear();
            match session.index.rebuild(&files).await {
                Ok(stats) => RefreshOutcome::Rebuilt(stats),
                Err(e) => {
                    // The index is now empty; keep the retained set in step with it.
                    session.retained = LookupFileSet::new();
                    return Err(AgentError::IndexBuild(e));
                }
            }
        };

        tracing::info!(files = files.len(), ?outcome, "lookup files changed");
        session.retained = files;
        Ok(outcome)
    }

    /// Run one invocation against `session`.
    pub async fn chat_completion(
        &self,
        session: &mut ChatSession,
        request: ChatRequest,
    ) -> Result<AgentResponse> {
        let outcome = tokio::time::timeout(self.timeout, self.run(session, request)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.timeout)),
        };

        match &result {
            Ok(_) => session.enter(Stage::Idle),
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "chat invocation failed");
                session.enter(Stage::Failed);
            }
        }
        result
    }

    async fn run(&self, session: &mut ChatSession, request: ChatRequest) -> Result<AgentResponse> {
        session.enter(Stage::Setup);
        if request.query.trim().is_empty() {
            return Err(AgentError::Configuration("query must not be empty".into()));
        }
        if request.image.as_ref().is_some_and(|i| i.as_str().trim().is_empty()) {
            return Err(AgentError::Configuration("image reference must not be empty".into()));
        }
        let ctx = InvocationContext {
            query_str: request.query,
            image: request.image,
            streaming: request.streaming,
        };
        self.update_index(session, request.lookup_files).await?;

        session.enter(Stage::Condensing);
        let retrieval_enabled = session.index.is_configured();
        let history = session.history();
        let condensed = self
            .condenser
            .condense(self.llm.as_ref(), &history, &ctx.query_str, retrieval_enabled)
            .await?;

        session.enter(Stage::Retrieving);
        let nodes = if retrieval_enabled {
            self.retriever
                .retrieve(session.index.as_ref(), &condensed)
                .await?
        } else {
            Vec::new()
        };

        session.enter(Stage::Responding);
        let prompt = self.composer.compose(&ctx.query_str, &nodes);
        let message = match ctx.image {
            Some(image) => ChatTurn::user_with_image(prompt, image),
            None => ChatTurn::user(prompt),
        };
        let mut messages = history.turns().to_vec();
        messages.push(message);

        if ctx.streaming {
            let stream = self
                .llm
                .complete_stream(&messages)
                .await
                .map_err(AgentError::ModelInference)?;
            Ok(AgentResponse::Streaming(StreamingReply::new(
                stream,
                Arc::clone(&session.history),
                ctx.query_str,
            )))
        } else {
            let answer = self
                .llm
                .complete(&messages)
                .await
                .map_err(AgentError::ModelInference)?;
            session
                .history
                .lock()
                .push_exchange(&ctx.query_str, answer.content.text());
            Ok(AgentResponse::Complete(answer))
        }
    }
}
