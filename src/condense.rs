//! History condensation: rewrite history plus a new question into one
//! standalone query before retrieval.

use crate::error::{AgentError, Result};
use crate::llm::LanguageModel;
use crate::models::{ChatHistory, ChatTurn};

/// Render history as `role: text` lines. Attached images are omitted.
pub fn transcript(history: &ChatHistory) -> String {
    history
        .turns()
        .iter()
        .map(|turn| format!("{}: {}\n", turn.role.as_str(), turn.content.text()))
        .collect()
}

/// Fill the condensation prompt.
pub fn condense_prompt(history: &ChatHistory, query: &str) -> String {
    format!(
        "Given the chat history:\n'''{}'''\n\n\
         And the user asked the following question:{}\nRewrite to a standalone question:\n",
        transcript(history),
        query
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryCondenser;

impl HistoryCondenser {
    /// Produce the query used for retrieval.
    ///
    /// With no history and no index there is nothing to condense against,
    /// so `query` comes back unchanged without a model call. Otherwise the
    /// model rewrites the question once (never streamed) and the result is
    /// `"Context:\n{rewrite}\nQuestion: {query}"`.
    pub async fn condense(
        &self,
        llm: &dyn LanguageModel,
        history: &ChatHistory,
        query: &str,
        retrieval_enabled: bool,
    ) -> Result<String> {
        if history.is_empty() && !retrieval_enabled {
            return Ok(query.to_string());
        }

        let prompt = condense_prompt(history, query);
        let reply = llm
            .complete(&[ChatTurn::user(prompt)])
            .await
            .map_err(AgentError::ModelInference)?;
        let rewrite = reply.content.text();

        Ok(format!("Context:\n{}\nQuestion: {}", rewrite, query))
    }
}
