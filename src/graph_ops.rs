//! The graph-operation DSL and its executor — component G, "the hardest
//! piece". LLM output becomes a `Vec<GraphOperation>`; the executor resolves
//! caller-supplied placeholder ids to real UUIDs and applies each operation
//! to the graph store in list order.
//!
//! Grounded on the teacher's tagged-enum-plus-generic-map shape used across
//! `agent-agency-contracts` (`working_spec.rs`, `execution_artifacts.rs`) for
//! heterogeneous LLM-produced records: one arm per operation kind, with a
//! `parameters: Map<String, Value>` escape hatch for forward-compatibility.

use crate::error::MemoryError;
use crate::graph_store::GraphStore;
use crate::llm_client::LlmClient;
use crate::types::{Memory, MemoryNode, MemoryType, NodeId, NodeType};
use crate::vector_store::VectorStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const ALIAS_KEY_PATTERNS: [&str; 6] = ["alias", "placeholder", "temp_id", "register_as", "memory_id", "node_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    CreateMemory,
    UpdateMemory,
    MergeMemories,
    CreateNode,
    UpdateNode,
    MergeNodes,
    CreateEdge,
    UpdateEdge,
    DeleteEdge,
}

/// One entry of the LLM-produced operation list, per spec.md §4.G.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOperation {
    pub operation_type: OperationType,
    /// Caller-supplied placeholder id for CREATE_* ops; may also be used by
    /// UPDATE_*/MERGE_*/*_EDGE ops to name the target.
    pub target_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchStats {
    pub created_memory: u32,
    pub updated_memory: u32,
    pub merged_memories: u32,
    pub created_node: u32,
    pub updated_node: u32,
    pub merged_nodes: u32,
    pub created_edge: u32,
    pub updated_edge: u32,
    pub deleted_edge: u32,
    pub failed: u32,
}

/// Substitutes any string value matching a registered placeholder,
/// recursively through objects and arrays.
fn resolve_value(value: &Value, map: &HashMap<String, Uuid>) -> Value {
    match value {
        Value::String(s) => map
            .get(s)
            .map(|id| Value::String(id.to_string()))
            .unwrap_or_else(|| value.clone()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, map)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| resolve_value(v, map)).collect()),
        other => other.clone(),
    }
}

/// Scan `params` for keys matching one of [`ALIAS_KEY_PATTERNS`] and
/// register their string values as additional aliases for `real_id`.
fn collect_aliases(value: &Value, real_id: Uuid, map: &mut HashMap<String, Uuid>) {
    match value {
        Value::Object(obj) => {
            for (k, v) in obj {
                let lower = k.to_ascii_lowercase();
                if ALIAS_KEY_PATTERNS.iter().any(|p| lower.contains(p)) {
                    if let Some(s) = v.as_str() {
                        map.insert(s.to_string(), real_id);
                    }
                }
                collect_aliases(v, real_id, map);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_aliases(v, real_id, map);
            }
        }
        _ => {}
    }
}

fn resolve_id(raw: &str, map: &HashMap<String, Uuid>) -> Option<Uuid> {
    map.get(raw).copied().or_else(|| Uuid::parse_str(raw).ok())
}

/// Like [`resolve_id`] but mints and registers a fresh UUID for unresolved
/// strings instead of failing — used for edge endpoints, where the graph
/// store itself is willing to auto-create a placeholder node.
fn resolve_or_mint(raw: &str, map: &mut HashMap<String, Uuid>) -> Uuid {
    if let Some(id) = map.get(raw) {
        return *id;
    }
    if let Ok(id) = Uuid::parse_str(raw) {
        return id;
    }
    let id = Uuid::new_v4();
    map.insert(raw.to_string(), id);
    id
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn param_f32(params: &Map<String, Value>, key: &str) -> Option<f32> {
    params.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

pub struct GraphOpExecutor {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    embed_batch_size: usize,
    op_retry_limit: u32,
    pending_embeds: Mutex<Vec<(NodeId, String)>>,
}

impl GraphOpExecutor {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        llm: Arc<dyn LlmClient>,
        embed_batch_size: usize,
        op_retry_limit: u32,
    ) -> Self {
        Self {
            graph,
            vectors,
            llm,
            embed_batch_size,
            op_retry_limit,
            pending_embeds: Mutex::new(Vec::new()),
        }
    }

    /// Execute a batch of operations in list order against a fresh
    /// placeholder map (never shared across concurrent batches). Individual
    /// op failures are logged and skipped; the batch itself never errors.
    pub async fn execute_batch(&self, ops: Vec<GraphOperation>, source_stm_id: Option<Uuid>) -> BatchStats {
        let mut map: HashMap<String, Uuid> = HashMap::new();
        let mut stats = BatchStats::default();

        for op in ops {
            match self.execute_one(op, &mut map, source_stm_id).await {
                Ok(kind) => apply_stat(&mut stats, kind),
                Err(e) => {
                    warn!("graph operation failed, skipping: {e}");
                    stats.failed += 1;
                }
            }
        }

        self.flush_pending_embeds().await;
        stats
    }

    async fn execute_one(
        &self,
        op: GraphOperation,
        map: &mut HashMap<String, Uuid>,
        source_stm_id: Option<Uuid>,
    ) -> Result<StatKind, MemoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_execute(&op, map, source_stm_id).await {
                Ok(kind) => return Ok(kind),
                Err(e) if attempt <= self.op_retry_limit && is_retryable(&e) => {
                    warn!("op {:?} failed (attempt {attempt}), retrying: {e}", op.operation_type);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_execute(
        &self,
        op: &GraphOperation,
        map: &mut HashMap<String, Uuid>,
        source_stm_id: Option<Uuid>,
    ) -> Result<StatKind, MemoryError> {
        let params = Value::Object(op.parameters.clone());
        let resolved = resolve_value(&params, map);
        let params = resolved.as_object().cloned().unwrap_or_default();

        match op.operation_type {
            OperationType::CreateMemory => {
                let target = op
                    .target_id
                    .clone()
                    .ok_or_else(|| MemoryError::Validation("CREATE_MEMORY missing target_id".into()))?;
                let memory_type = param_str(&params, "memory_type")
                    .map(MemoryType::parse_loose)
                    .unwrap_or(MemoryType::Fact);
                let importance = param_f32(&params, "importance").unwrap_or(0.5);

                let real_id = Uuid::new_v4();
                let mut memory = Memory::new(memory_type, importance);
                memory.id = real_id;
                if let Some(stm_id) = source_stm_id {
                    memory
                        .metadata
                        .insert("transferred_from_stm".to_string(), Value::String(stm_id.to_string()));
                }
                self.graph.add_memory(memory)?;

                map.insert(target, real_id);
                collect_aliases(&Value::Object(params), real_id, map);
                Ok(StatKind::CreatedMemory)
            }

            OperationType::UpdateMemory => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("UPDATE_MEMORY missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                let updated_importance = param_f32(&params, "importance");
                let updated_fields = params.get("updated_fields").cloned();

                self.graph.update_memory(&target_id, |memory| {
                    if let Some(importance) = updated_importance {
                        memory.importance = importance;
                    }
                    if let Some(Value::Object(fields)) = updated_fields {
                        for (k, v) in fields {
                            memory.metadata.insert(k, v);
                        }
                    }
                })?;
                Ok(StatKind::UpdatedMemory)
            }

            OperationType::MergeMemories => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("MERGE_MEMORIES missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                let source_ids: Vec<Uuid> = params
                    .get("source_ids")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(Value::as_str).filter_map(|s| resolve_id(s, map)).collect())
                    .unwrap_or_default();
                if source_ids.is_empty() {
                    return Err(MemoryError::Validation("MERGE_MEMORIES missing source_ids".into()));
                }
                self.graph.merge_memories(&target_id, &source_ids)?;
                Ok(StatKind::MergedMemories)
            }

            OperationType::CreateNode => {
                let target = op
                    .target_id
                    .clone()
                    .ok_or_else(|| MemoryError::Validation("CREATE_NODE missing target_id".into()))?;
                let content = param_str(&params, "content")
                    .ok_or_else(|| MemoryError::Validation("CREATE_NODE missing content".into()))?
                    .to_string();
                let memory_id_raw = param_str(&params, "memory_id")
                    .ok_or_else(|| MemoryError::Validation("CREATE_NODE missing memory_id".into()))?;
                let memory_id = resolve_id(memory_id_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved memory_id {memory_id_raw}")))?;
                let node_type = param_str(&params, "node_type")
                    .map(parse_node_type)
                    .unwrap_or(NodeType::Other);

                let real_id = Uuid::new_v4();
                let node = MemoryNode {
                    id: real_id,
                    content: content.clone(),
                    node_type,
                    embedding: None,
                    metadata: Default::default(),
                };
                self.graph.add_node(node, &memory_id)?;

                map.insert(target, real_id);
                collect_aliases(&Value::Object(params), real_id, map);
                self.enqueue_embed(real_id, content).await;
                Ok(StatKind::CreatedNode)
            }

            OperationType::UpdateNode => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("UPDATE_NODE missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                let content = param_str(&params, "content").map(str::to_string);
                self.graph.update_node(&target_id, content)?;
                Ok(StatKind::UpdatedNode)
            }

            OperationType::MergeNodes => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("MERGE_NODES missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                let source_ids: Vec<Uuid> = params
                    .get("source_ids")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(Value::as_str).filter_map(|s| resolve_id(s, map)).collect())
                    .unwrap_or_default();
                if source_ids.is_empty() {
                    return Err(MemoryError::Validation("MERGE_NODES missing source_ids".into()));
                }
                for src_id in source_ids {
                    self.graph.merge_nodes(&src_id, &target_id)?;
                }
                Ok(StatKind::MergedNodes)
            }

            OperationType::CreateEdge => {
                let memory_id_raw = param_str(&params, "memory_id")
                    .ok_or_else(|| MemoryError::Validation("CREATE_EDGE missing memory_id".into()))?;
                let memory_id = resolve_id(memory_id_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved memory_id {memory_id_raw}")))?;
                let source_raw = param_str(&params, "source_node_id")
                    .ok_or_else(|| MemoryError::Validation("CREATE_EDGE missing source_node_id".into()))?;
                let target_raw = param_str(&params, "target_node_id")
                    .ok_or_else(|| MemoryError::Validation("CREATE_EDGE missing target_node_id".into()))?;
                let source_id = resolve_or_mint(source_raw, map);
                let target_id = resolve_or_mint(target_raw, map);
                let relation = param_str(&params, "relation").unwrap_or("related_to").to_string();
                let edge_type = param_str(&params, "edge_type").unwrap_or("fact").to_string();
                let importance = param_f32(&params, "importance").unwrap_or(0.5);

                self.graph
                    .add_edge(&memory_id, source_id, target_id, relation, edge_type, importance)?;
                Ok(StatKind::CreatedEdge)
            }

            OperationType::UpdateEdge => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("UPDATE_EDGE missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                let relation = param_str(&params, "relation").map(str::to_string);
                let importance = param_f32(&params, "importance");
                self.graph.update_edge(&target_id, relation, importance)?;
                Ok(StatKind::UpdatedEdge)
            }

            OperationType::DeleteEdge => {
                let target_raw = op
                    .target_id
                    .as_deref()
                    .ok_or_else(|| MemoryError::Validation("DELETE_EDGE missing target_id".into()))?;
                let target_id = resolve_id(target_raw, map)
                    .ok_or_else(|| MemoryError::Validation(format!("unresolved target {target_raw}")))?;
                self.graph.remove_edge(&target_id)?;
                Ok(StatKind::DeletedEdge)
            }
        }
    }

    async fn enqueue_embed(&self, node_id: NodeId, content: String) {
        let mut pending = self.pending_embeds.lock().await;
        pending.push((node_id, content));
        let should_flush = pending.len() >= self.embed_batch_size;
        drop(pending);
        if should_flush {
            self.flush_pending_embeds().await;
        }
    }

    /// Flush the embedding queue: batch-embed all pending node contents,
    /// write vectors to B, and mark `has_vector=true` on C's node metadata.
    pub async fn flush_pending_embeds(&self) {
        let batch: Vec<(NodeId, String)> = {
            let mut pending = self.pending_embeds.lock().await;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }

        let texts: Vec<String> = batch.iter().map(|(_, c)| c.clone()).collect();
        let embeddings = self.llm.embed_batch(&texts).await;

        for ((node_id, _), embedding) in batch.into_iter().zip(embeddings) {
            if let Some(embedding) = embedding {
                self.vectors.add_node(node_id, embedding.clone());
                if let Err(e) = self.graph.set_node_embedding(&node_id, embedding) {
                    warn!("failed to record embedding for node {node_id}: {e}");
                }
            } else {
                debug!("embedding unavailable for node {node_id}, left unembedded");
            }
        }
    }
}

fn parse_node_type(s: &str) -> NodeType {
    match s.to_ascii_lowercase().as_str() {
        "subject" => NodeType::Subject,
        "topic" => NodeType::Topic,
        "object" => NodeType::Object,
        "attribute" => NodeType::Attribute,
        "event" => NodeType::Event,
        _ => NodeType::Other,
    }
}

fn is_retryable(e: &MemoryError) -> bool {
    !matches!(e, MemoryError::Validation(_))
}

enum StatKind {
    CreatedMemory,
    UpdatedMemory,
    MergedMemories,
    CreatedNode,
    UpdatedNode,
    MergedNodes,
    CreatedEdge,
    UpdatedEdge,
    DeletedEdge,
}

fn apply_stat(stats: &mut BatchStats, kind: StatKind) {
    match kind {
        StatKind::CreatedMemory => stats.created_memory += 1,
        StatKind::UpdatedMemory => stats.updated_memory += 1,
        StatKind::MergedMemories => stats.merged_memories += 1,
        StatKind::CreatedNode => stats.created_node += 1,
        StatKind::UpdatedNode => stats.updated_node += 1,
        StatKind::MergedNodes => stats.merged_nodes += 1,
        StatKind::CreatedEdge => stats.created_edge += 1,
        StatKind::UpdatedEdge => stats.updated_edge += 1,
        StatKind::DeletedEdge => stats.deleted_edge += 1,
    }
}
