//! Top-k retrieval with a similarity floor.

use crate::error::{AgentError, Result};
use crate::index::DocumentIndex;
use crate::models::RetrievedNode;

/// Fetches the most relevant chunks for a query and drops weak matches.
#[derive(Debug, Clone, Copy)]
pub struct Retriever {
    pub top_k: usize,
    pub similarity_cutoff: f32,
}

impl Default for Retriever {
    fn default() -> Self {
        Self {
            top_k: 3,
            similarity_cutoff: 0.3,
        }
    }
}

impl Retriever {
    pub fn new(top_k: usize, similarity_cutoff: f32) -> Self {
        Self {
            top_k,
            similarity_cutoff,
        }
    }

    /// Up to `top_k` nodes in descending score order, none scoring below the
    /// cutoff. An unconfigured index yields an empty sequence.
    pub async fn retrieve(&self, index: &dyn DocumentIndex, query: &str) -> Result<Vec<RetrievedNode>> {
        let ranked = index
            .similarity_search(query, self.top_k)
            .await
            .map_err(AgentError::Retrieval)?;

        let Some(ranked) = ranked else {
            return Ok(Vec::new());
        };
        let kept: Vec<RetrievedNode> = ranked
            .into_iter()
            .filter(|node| node.score >= self.similarity_cutoff)
            .collect();

        tracing::debug!(
            kept = kept.len(),
            top_k = self.top_k,
            cutoff = self.similarity_cutoff,
            "retrieved context"
        );
        Ok(kept)
    }
}
