//! Context composition: splice retrieved chunks into the answer prompt.

use crate::models::RetrievedNode;

/// Render one node with the metadata the model gets to see.
pub fn render_node(node: &RetrievedNode) -> String {
    format!(
        "file_path: {}\npage_index: {}\n\n{}",
        node.chunk.source_path.display(),
        node.chunk.ordinal,
        node.chunk.text
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextComposer;

impl ContextComposer {
    /// Build the final prompt. With no nodes the query is returned as is.
    pub fn compose(&self, query: &str, nodes: &[RetrievedNode]) -> String {
        if nodes.is_empty() {
            return query.to_string();
        }

        let node_context: String = nodes
            .iter()
            .map(|node| format!("\n{}\n\n", render_node(node)))
            .collect();

        format!(
            "Information that might help:\n-----\n{}\n-----\n\
             Please write a response to the following question, using the above information if relevant:\n{}\n",
            node_context, query
        )
    }
}
