//! Core data model for the three-tier memory pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a perceptual block.
pub type BlockId = Uuid;
/// Unique identifier for a short-term memory entry.
pub type ShortTermId = Uuid;
/// Unique identifier for a long-term memory (subgraph).
pub type MemoryId = Uuid;
/// Unique identifier for a graph node.
pub type NodeId = Uuid;
/// Unique identifier for a graph edge.
pub type EdgeId = Uuid;

/// A single chat message, opaque beyond the fields the pipeline needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub user_id: String,
    pub user_name: String,
    pub platform: String,
    pub chat_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// A contiguous group of raw messages held in the perceptual tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: BlockId,
    pub combined_text: String,
    pub embedding: Option<Vec<f32>>,
    pub message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_recalled_at: Option<DateTime<Utc>>,
    pub recall_count: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryBlock {
    /// `true` once `recall_count` has crossed the activation threshold and
    /// `metadata["needs_transfer"]` has been set by a recall.
    pub fn needs_transfer(&self) -> bool {
        self.metadata
            .get("needs_transfer")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// The kind of fact a short-term or long-term memory represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Event,
    Fact,
    Opinion,
    Relation,
}

impl MemoryType {
    /// Tolerant parse for LLM-produced labels (case-insensitive, default to Fact).
    pub fn parse_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "event" => MemoryType::Event,
            "opinion" => MemoryType::Opinion,
            "relation" => MemoryType::Relation,
            _ => MemoryType::Fact,
        }
    }
}

/// A structured, LLM-extracted memory held in the short-term tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub id: ShortTermId,
    pub content: String,
    pub subject: String,
    pub topic: String,
    pub object: String,
    pub memory_type: MemoryType,
    pub importance: f32,
    pub attributes: HashMap<String, String>,
    pub embedding: Option<Vec<f32>>,
    pub source_block_ids: Vec<BlockId>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
}

/// A node type in the long-term knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Subject,
    Topic,
    Object,
    Attribute,
    Event,
    Other,
}

/// A typed node in the long-term knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: NodeId,
    pub content: String,
    pub node_type: NodeType,
    pub embedding: Option<Vec<f32>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryNode {
    pub fn has_vector(&self) -> bool {
        self.metadata
            .get("has_vector")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_placeholder(&self) -> bool {
        self.metadata
            .get("placeholder")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// A labeled, directed relationship between two graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub id: EdgeId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub relation: String,
    pub edge_type: String,
    pub importance: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Status of a long-term memory: visible to active retrieval, or soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Forgotten,
}

/// A long-term memory: a subgraph of nodes and edges plus activation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub memory_type: MemoryType,
    pub importance: f32,
    pub activation: f32,
    pub status: MemoryStatus,
    pub nodes: Vec<NodeId>,
    pub edges: Vec<EdgeId>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
}

impl Memory {
    pub fn new(memory_type: MemoryType, importance: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            memory_type,
            importance,
            activation: 1.0,
            status: MemoryStatus::Active,
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    pub fn is_forgotten(&self) -> bool {
        self.status == MemoryStatus::Forgotten
    }
}

/// Result of a long-term retrieval: the memory plus why it matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}
