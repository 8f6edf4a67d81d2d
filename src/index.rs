//! Document index: the retrieval corpus behind a chat session.
//!
//! [`VectorIndex`] reads lookup files through a [`FileReader`], splits them
//! with the paragraph chunker, embeds every chunk, and answers similarity
//! queries by brute-force cosine scoring.
//!
//! # Atomicity
//!
//! [`rebuild`](DocumentIndex::rebuild) and [`insert`](DocumentIndex::insert)
//! do all reading and embedding into a staging buffer first. The live corpus
//! is swapped (or extended) only after every file succeeded, so a failure
//! leaves the previous corpus exactly as it was.
//!
//! # Ordinals
//!
//! Every chunk gets a 0-based ordinal that is unique within its source path.
//! A rebuild restarts numbering at 0; an insert continues after the highest
//! ordinal already present for that source.
//!
//! # Configured vs. empty
//!
//! A cleared index is *unconfigured*: [`similarity_search`](DocumentIndex::similarity_search)
//! returns `Ok(None)`. An index built from files that produced no text is
//! configured but empty and returns `Ok(Some(vec![]))`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::chunk::{content_hash, make_chunk, split_text};
use crate::embedding::{cosine_similarity, embed_one, Embedder};
use crate::models::{DocumentChunk, LookupFileSet, RetrievedNode, SourceDocument};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};
use crate::reader::FileReader;

/// Size of the live corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub sources: usize,
    pub chunks: usize,
}

/// A searchable corpus built from lookup files.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Replace the whole corpus with chunks read from `paths`.
    async fn rebuild(&mut self, paths: &LookupFileSet) -> Result<IndexStats>;

    /// Add chunks read from `paths`, keeping everything already indexed.
    async fn insert(&mut self, paths: &LookupFileSet) -> Result<IndexStats>;

    /// Drop the corpus. The index is unconfigured afterwards.
    fn clear(&mut self);

    fn is_configured(&self) -> bool;

    /// Up to `k` chunks ranked by descending similarity to `query`, or
    /// `None` when no corpus is configured.
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Option<Vec<RetrievedNode>>>;

    fn stats(&self) -> IndexStats;
}

#[derive(Default)]
struct Corpus {
    chunks: Vec<Arc<DocumentChunk>>,
    /// Next free ordinal per source.
    next_ordinal: HashMap<PathBuf, usize>,
    /// Hash of each source's full text at ingestion, used to skip re-inserts.
    source_hashes: HashMap<PathBuf, String>,
}

impl Corpus {
    fn extend(&mut self, staged: Staged) {
        for chunk in staged.chunks {
            let next = self.next_ordinal.entry(chunk.source_path.clone()).or_insert(0);
            *next = (*next).max(chunk.ordinal + 1);
            self.chunks.push(Arc::new(chunk));
        }
        self.source_hashes.extend(staged.source_hashes);
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            sources: self.next_ordinal.len(),
            chunks: self.chunks.len(),
        }
    }
}

/// Chunks built from one read, not yet visible to searches.
struct Staged {
    chunks: Vec<DocumentChunk>,
    source_hashes: HashMap<PathBuf, String>,
}

/// In-memory vector index over lookup files.
pub struct VectorIndex {
    corpus: Option<Corpus>,
    embedder: Arc<dyn Embedder>,
    reader: Arc<dyn FileReader>,
    max_tokens: usize,
    batch_size: usize,
    recursive: bool,
    progress: Arc<dyn IndexProgressReporter>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>, reader: Arc<dyn FileReader>, max_tokens: usize) -> Self {
        Self {
            corpus: None,
            embedder,
            reader,
            max_tokens,
            batch_size: 64,
            recursive: true,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Walk directories one level deep only.
    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Chunk count per source path, in path order.
    pub fn source_chunk_counts(&self) -> BTreeMap<PathBuf, usize> {
        let mut counts = BTreeMap::new();
        if let Some(corpus) = &self.corpus {
            for chunk in &corpus.chunks {
                *counts.entry(chunk.source_path.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    async fn read(&self, paths: &LookupFileSet) -> Result<Vec<SourceDocument>> {
        self.progress.report(IndexProgressEvent::Reading { paths: paths.len() });
        let reader = Arc::clone(&self.reader);
        let paths: Vec<PathBuf> = paths.iter().cloned().collect();
        let recursive = self.recursive;
        tokio::task::spawn_blocking(move || reader.read(&paths, recursive)).await?
    }

    /// Chunk and embed `docs`, numbering each source from `start` onwards.
    async fn stage(
        &self,
        docs: Vec<SourceDocument>,
        start: &HashMap<PathBuf, usize>,
    ) -> Result<Staged> {
        let mut pending: Vec<(PathBuf, String)> = Vec::new();
        let mut source_hashes = HashMap::new();
        for doc in docs {
            source_hashes.insert(doc.source_path.clone(), content_hash(&doc.text));
            for piece in split_text(&doc.text, self.max_tokens) {
                pending.push((doc.source_path.clone(), piece));
            }
        }

        let total = pending.len() as u64;
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(pending.len());
        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let embedded = self.embedder.embed(&texts).await?;
            if embedded.len() != texts.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks",
                    embedded.len(),
                    texts.len()
                );
            }
            vectors.extend(embedded);
            self.progress.report(IndexProgressEvent::Embedding {
                n: vectors.len() as u64,
                total,
            });
        }

        let mut next = start.clone();
        let chunks = pending
            .into_iter()
            .zip(vectors)
            .map(|((source, text), vector)| {
                let slot = next.entry(source.clone()).or_insert(0);
                let ordinal = *slot;
                *slot += 1;
                make_chunk(&source, ordinal, text, vector)
            })
            .collect();

        Ok(Staged {
            chunks,
            source_hashes,
        })
    }

    fn report_ready(&self) -> IndexStats {
        let stats = self.stats();
        self.progress.report(IndexProgressEvent::Ready {
            sources: stats.sources,
            chunks: stats.chunks,
        });
        stats
    }
}

#[async_trait]
impl DocumentIndex for VectorIndex {
    async fn rebuild(&mut self, paths: &LookupFileSet) -> Result<IndexStats> {
        let docs = self.read(paths).await?;
        let staged = self.stage(docs, &HashMap::new()).await?;

        let mut corpus = Corpus::default();
        corpus.extend(staged);
        self.corpus = Some(corpus);

        let stats = self.report_ready();
        tracing::info!(sources = stats.sources, chunks = stats.chunks, "index rebuilt");
        Ok(stats)
    }

    async fn insert(&mut self, paths: &LookupFileSet) -> Result<IndexStats> {
        let mut docs = self.read(paths).await?;

        let (start, known) = match &self.corpus {
            Some(c) => (c.next_ordinal.clone(), c.source_hashes.clone()),
            None => Default::default(),
        };
        docs.retain(|doc| {
            let unchanged = known.get(&doc.source_path) == Some(&content_hash(&doc.text));
            if unchanged {
                tracing::debug!(path = %doc.source_path.display(), "already indexed, skipping");
            }
            !unchanged
        });

        let staged = self.stage(docs, &start).await?;
        self.corpus.get_or_insert_with(Corpus::default).extend(staged);

        let stats = self.report_ready();
        tracing::info!(sources = stats.sources, chunks = stats.chunks, "index extended");
        Ok(stats)
    }

    fn clear(&mut self) {
        if self.corpus.take().is_some() {
            tracing::debug!("index cleared");
        }
    }

    fn is_configured(&self) -> bool {
        self.corpus.is_some()
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Option<Vec<RetrievedNode>>> {
        let Some(corpus) = &self.corpus else {
            return Ok(None);
        };
        if corpus.chunks.is_empty() || k == 0 {
            return Ok(Some(Vec::new()));
        }

        let query_vec = embed_one(self.embedder.as_ref(), query).await?;
        let mut nodes: Vec<RetrievedNode> = corpus
            .chunks
            .iter()
            .map(|chunk| RetrievedNode {
                score: cosine_similarity(&query_vec, &chunk.embedding),
                chunk: Arc::clone(chunk),
            })
            .collect();

        nodes.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.source_path.cmp(&b.chunk.source_path))
                .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
        });
        nodes.truncate(k);
        Ok(Some(nodes))
    }

    fn stats(&self) -> IndexStats {
        self.corpus.as_ref().map(Corpus::stats).unwrap_or_default()
    }
}
