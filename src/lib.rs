//! # Llama Assistant
//!
//! Conversational retrieval-augmented chat over your own files, backed by a
//! local language model.
//!
//! Every question runs through four stages: the index is refreshed when the
//! lookup files change, the chat history and question are condensed into a
//! standalone query, the most relevant chunks are retrieved, and the model
//! answers from a prompt that carries them, optionally with an attached image.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Lookup     │──▶│ VectorIndex │◀──│  Retriever   │
//! │ files      │   │ chunk+embed │   │ top-k+cutoff │
//! └────────────┘   └─────────────┘   └──────┬───────┘
//!                                           │
//!  ┌───────────┐   ┌───────────┐   ┌────────▼──────┐   ┌───────┐
//!  │ history + │──▶│ Condenser │──▶│   Composer    │──▶│  LLM  │
//!  │ question  │   └───────────┘   └───────────────┘   └───┬───┘
//!  └───────────┘                                           │
//!                      ┌───────────────────┬───────────────┘
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │   HTTP   │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use llama_assistant::config::Config;
//! use llama_assistant::pipeline::{ChatRequest, ChatSession, RagAgent};
//! use llama_assistant::progress::NoProgress;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let agent = RagAgent::from_config(&config)?;
//! let mut session = ChatSession::from_config(&config, Arc::new(NoProgress))?;
//!
//! let request = ChatRequest::new("What is the capital of France?")
//!     .with_lookup_files(["notes/geo.txt"]);
//! let answer = agent.chat_completion(&mut session, request).await?.into_text().await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed pipeline errors |
//! | [`models`] | Chat turns, history, documents, chunks |
//! | [`extract`] | PDF / DOCX / PPTX text extraction |
//! | [`reader`] | Lookup-file reader |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Language-model provider abstraction |
//! | [`progress`] | Indexing progress on stderr |
//! | [`index`] | Vector index over lookup files |
//! | [`retriever`] | Top-k retrieval with similarity cutoff |
//! | [`condense`] | History condensation |
//! | [`compose`] | Context prompt composition |
//! | [`pipeline`] | The orchestrator and chat sessions |
//! | [`server`] | Local HTTP API |

pub mod chunk;
pub mod compose;
pub mod condense;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod retriever;
pub mod server;
