//! Hierarchical, LLM-augmented memory engine for a conversational agent.
//!
//! Ingests a chat-message stream and builds a queryable, persistent
//! knowledge graph across three tiers:
//! - a bounded perceptual buffer of raw message blocks,
//! - a bounded short-term set of LLM-extracted structured memories,
//! - a persistent long-term property graph with semantic search, activation
//!   decay, and an LLM-driven graph-operation DSL.
//!
//! [`coordinator::MemoryEngine`] is the crate's entry point; everything else
//! is a component it wires together.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph_ops;
pub mod graph_store;
pub mod json_repair;
pub mod llm_client;
pub mod long_term;
pub mod perceptual;
pub mod persistence;
pub mod retrieval;
pub mod short_term;
pub mod types;
pub mod vector_store;

pub use config::MemoryConfig;
pub use coordinator::MemoryEngine;
pub use error::{MemoryError, MemoryResult};
pub use llm_client::{HttpLlmClient, LlmClient};
pub use types::Message;

#[cfg(any(test, feature = "test-support"))]
pub use llm_client::MockLlmClient;
