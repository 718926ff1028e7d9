//! The long-term property graph: memories (subgraphs), nodes, and edges.
//!
//! Replaces the teacher's Postgres-backed `KnowledgeGraphEngine`
//! (`graph_engine.rs`) with an in-process store, since this pipeline's
//! persistence tier (component D) is a JSON snapshot rather than a
//! database. The public operation shape — upsert-like `add_*`, `merge_*`,
//! identity-preserving `merge_memories` — is kept from the teacher.
//!
//! A single `RwLock` guards all four maps together so that a multi-map
//! mutation (e.g. `add_edge` auto-creating a placeholder node and updating
//! the reverse index) is atomic relative to readers, per spec.md §5
//! ("single owner with an internal write lock; reads snapshot-consistent").

use crate::error::{MemoryError, MemoryResult};
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    memories: HashMap<MemoryId, Memory>,
    nodes: HashMap<NodeId, MemoryNode>,
    edges: HashMap<EdgeId, MemoryEdge>,
    /// Reverse index: node -> set of memories referencing it.
    node_to_memories: HashMap<NodeId, HashSet<MemoryId>>,
}

pub struct GraphStore {
    inner: RwLock<Inner>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Rebuild from loaded collections (used by persistence on load). The
    /// reverse index is always rebuilt wholesale, never trusted from disk.
    pub fn from_parts(memories: Vec<Memory>, nodes: Vec<MemoryNode>, edges: Vec<MemoryEdge>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap();
            for n in nodes {
                inner.nodes.insert(n.id, n);
            }
            for e in edges {
                inner.edges.insert(e.id, e);
            }
            for m in memories {
                for node_id in &m.nodes {
                    inner.node_to_memories.entry(*node_id).or_default().insert(m.id);
                }
                inner.memories.insert(m.id, m);
            }
        }
        store
    }

    // ---- Memory operations -------------------------------------------------

    pub fn add_memory(&self, memory: Memory) -> MemoryResult<MemoryId> {
        let mut inner = self.inner.write().unwrap();
        if inner.memories.contains_key(&memory.id) {
            return Err(MemoryError::Validation(format!(
                "duplicate memory id {}",
                memory.id
            )));
        }
        let id = memory.id;
        for node_id in &memory.nodes {
            inner.node_to_memories.entry(*node_id).or_default().insert(id);
        }
        inner.memories.insert(id, memory);
        Ok(id)
    }

    pub fn get_memory_by_id(&self, id: &MemoryId) -> Option<Memory> {
        self.inner.read().unwrap().memories.get(id).cloned()
    }

    pub fn get_all_memories(&self) -> Vec<Memory> {
        self.inner.read().unwrap().memories.values().cloned().collect()
    }

    /// Remove a memory and any nodes/edges left orphaned (no longer
    /// referenced by any other memory).
    pub fn remove_memory(&self, id: &MemoryId) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let memory = inner
            .memories
            .remove(id)
            .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?;

        for node_id in &memory.nodes {
            if let Some(set) = inner.node_to_memories.get_mut(node_id) {
                set.remove(id);
                if set.is_empty() {
                    inner.node_to_memories.remove(node_id);
                    inner.nodes.remove(node_id);
                }
            }
        }
        for edge_id in &memory.edges {
            inner.edges.remove(edge_id);
        }
        Ok(())
    }

    pub fn update_memory(
        &self,
        id: &MemoryId,
        update: impl FnOnce(&mut Memory),
    ) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let memory = inner
            .memories
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?;
        update(memory);
        memory.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Identity-preserving merge: every source's nodes/edges are reparented
    /// to `target_id` (reverse index updated), source `Memory` objects are
    /// deleted, and `target`'s importance/activation become the max across
    /// all inputs.
    pub fn merge_memories(&self, target_id: &MemoryId, src_ids: &[MemoryId]) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.memories.contains_key(target_id) {
            return Err(MemoryError::NotFound(format!("memory {target_id}")));
        }

        let mut max_importance = inner.memories[target_id].importance;
        let mut max_activation = inner.memories[target_id].activation;

        for src_id in src_ids {
            if src_id == target_id {
                continue;
            }
            let Some(src) = inner.memories.remove(src_id) else {
                continue;
            };
            max_importance = max_importance.max(src.importance);
            max_activation = max_activation.max(src.activation);

            for node_id in &src.nodes {
                if let Some(set) = inner.node_to_memories.get_mut(node_id) {
                    set.remove(src_id);
                    set.insert(*target_id);
                }
            }
            let target = inner.memories.get_mut(target_id).unwrap();
            for node_id in src.nodes {
                if !target.nodes.contains(&node_id) {
                    target.nodes.push(node_id);
                }
            }
            for edge_id in src.edges {
                if !target.edges.contains(&edge_id) {
                    target.edges.push(edge_id);
                }
            }
        }

        let target = inner.memories.get_mut(target_id).unwrap();
        target.importance = max_importance;
        target.activation = max_activation;
        target.updated_at = chrono::Utc::now();
        Ok(())
    }

    // ---- Node operations ----------------------------------------------------

    pub fn add_node(&self, node: MemoryNode, memory_id: &MemoryId) -> MemoryResult<NodeId> {
        let mut inner = self.inner.write().unwrap();
        if !inner.memories.contains_key(memory_id) {
            return Err(MemoryError::NotFound(format!("memory {memory_id}")));
        }
        let id = node.id;
        inner.nodes.insert(id, node);
        inner.node_to_memories.entry(id).or_default().insert(*memory_id);
        if let Some(memory) = inner.memories.get_mut(memory_id) {
            if !memory.nodes.contains(&id) {
                memory.nodes.push(id);
            }
        }
        Ok(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<MemoryNode> {
        self.inner.read().unwrap().nodes.get(id).cloned()
    }

    pub fn update_node(&self, id: &NodeId, content: Option<String>) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(format!("node {id}")))?;
        if let Some(content) = content {
            node.content = content;
        }
        Ok(())
    }

    pub fn set_node_embedding(&self, id: &NodeId, embedding: Vec<f32>) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(format!("node {id}")))?;
        node.embedding = Some(embedding);
        node.metadata
            .insert("has_vector".to_string(), serde_json::Value::Bool(true));
        Ok(())
    }

    /// Transfer `src_id`'s edges to `dst_id`, delete `src_id`, update the
    /// reverse index and every owning memory's node list.
    pub fn merge_nodes(&self, src_id: &NodeId, dst_id: &NodeId) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.nodes.contains_key(dst_id) {
            return Err(MemoryError::NotFound(format!("node {dst_id}")));
        }
        let Some(_src_node) = inner.nodes.remove(src_id) else {
            return Err(MemoryError::NotFound(format!("node {src_id}")));
        };

        for edge in inner.edges.values_mut() {
            if edge.source_id == *src_id {
                edge.source_id = *dst_id;
            }
            if edge.target_id == *src_id {
                edge.target_id = *dst_id;
            }
        }

        let owning = inner.node_to_memories.remove(src_id).unwrap_or_default();
        for memory_id in &owning {
            inner.node_to_memories.entry(*dst_id).or_default().insert(*memory_id);
            if let Some(memory) = inner.memories.get_mut(memory_id) {
                memory.nodes.retain(|n| n != src_id);
                if !memory.nodes.contains(dst_id) {
                    memory.nodes.push(*dst_id);
                }
            }
        }
        Ok(())
    }

    // ---- Edge operations ----------------------------------------------------

    /// Add an edge, auto-creating placeholder endpoint nodes (type `Event`,
    /// `metadata.placeholder = true`) when `source_id`/`target_id` don't yet
    /// exist, per spec.md §4.C.
    pub fn add_edge(
        &self,
        memory_id: &MemoryId,
        source_id: NodeId,
        target_id: NodeId,
        relation: String,
        edge_type: String,
        importance: f32,
    ) -> MemoryResult<EdgeId> {
        let mut inner = self.inner.write().unwrap();
        if !inner.memories.contains_key(memory_id) {
            return Err(MemoryError::NotFound(format!("memory {memory_id}")));
        }

        for node_id in [source_id, target_id] {
            if !inner.nodes.contains_key(&node_id) {
                debug!("auto-creating placeholder node {node_id} for dangling edge endpoint");
                let mut metadata = HashMap::new();
                metadata.insert("placeholder".to_string(), serde_json::Value::Bool(true));
                let placeholder = MemoryNode {
                    id: node_id,
                    content: String::new(),
                    node_type: NodeType::Event,
                    embedding: None,
                    metadata,
                };
                inner.nodes.insert(node_id, placeholder);
                inner.node_to_memories.entry(node_id).or_default().insert(*memory_id);
                let memory = inner.memories.get_mut(memory_id).unwrap();
                if !memory.nodes.contains(&node_id) {
                    memory.nodes.push(node_id);
                }
            }
        }

        let edge = MemoryEdge {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            relation,
            edge_type,
            importance,
            metadata: HashMap::new(),
        };
        let id = edge.id;
        inner.edges.insert(id, edge);
        let memory = inner.memories.get_mut(memory_id).unwrap();
        memory.edges.push(id);
        Ok(id)
    }

    pub fn get_edge(&self, id: &EdgeId) -> Option<MemoryEdge> {
        self.inner.read().unwrap().edges.get(id).cloned()
    }

    pub fn update_edge(
        &self,
        id: &EdgeId,
        relation: Option<String>,
        importance: Option<f32>,
    ) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let edge = inner
            .edges
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(format!("edge {id}")))?;
        if let Some(relation) = relation {
            edge.relation = relation;
        }
        if let Some(importance) = importance {
            edge.importance = importance;
        }
        Ok(())
    }

    pub fn remove_edge(&self, id: &EdgeId) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .edges
            .remove(id)
            .ok_or_else(|| MemoryError::NotFound(format!("edge {id}")))?;
        for memory in inner.memories.values_mut() {
            memory.edges.retain(|e| e != id);
        }
        Ok(())
    }

    // ---- Queries --------------------------------------------------------

    /// Neighbor memories of `memory_id`: memories that share at least one
    /// node, via an edge whose endpoint belongs to both.
    pub fn neighbor_memories(&self, memory_id: &MemoryId) -> Vec<MemoryId> {
        let inner = self.inner.read().unwrap();
        let Some(memory) = inner.memories.get(memory_id) else {
            return Vec::new();
        };
        let mut neighbors = HashSet::new();
        for node_id in &memory.nodes {
            if let Some(set) = inner.node_to_memories.get(node_id) {
                for candidate in set {
                    if candidate != memory_id {
                        neighbors.insert(*candidate);
                    }
                }
            }
        }
        neighbors.into_iter().collect()
    }

    pub fn node_to_memories(&self, node_id: &NodeId) -> Vec<MemoryId> {
        self.inner
            .read()
            .unwrap()
            .node_to_memories
            .get(node_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn memory_count(&self) -> usize {
        self.inner.read().unwrap().memories.len()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().unwrap().edges.len()
    }

    /// Check the invariants spec.md §4.C requires after every mutation.
    /// Exposed for tests and for the diagnostic surface to call directly.
    pub fn check_invariants(&self) -> MemoryResult<()> {
        let inner = self.inner.read().unwrap();

        for edge in inner.edges.values() {
            if !inner.nodes.contains_key(&edge.source_id) {
                return Err(MemoryError::Graph(format!(
                    "edge {} has dangling source {}",
                    edge.id, edge.source_id
                )));
            }
            if !inner.nodes.contains_key(&edge.target_id) {
                return Err(MemoryError::Graph(format!(
                    "edge {} has dangling target {}",
                    edge.id, edge.target_id
                )));
            }
        }

        for node_id in inner.nodes.keys() {
            let referenced = inner
                .node_to_memories
                .get(node_id)
                .map(|set| !set.is_empty())
                .unwrap_or(false);
            let actually_referenced = inner
                .memories
                .values()
                .any(|m| m.nodes.contains(node_id));
            if referenced != actually_referenced {
                return Err(MemoryError::Graph(format!(
                    "reverse index out of sync for node {node_id}"
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn snapshot(&self) -> (Vec<Memory>, Vec<MemoryNode>, Vec<MemoryEdge>) {
        let inner = self.inner.read().unwrap();
        (
            inner.memories.values().cloned().collect(),
            inner.nodes.values().cloned().collect(),
            inner.edges.values().cloned().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_memory() -> Memory {
        Memory::new(MemoryType::Fact, 0.5)
    }

    #[test]
    fn add_edge_auto_creates_placeholder_endpoints() {
        let store = GraphStore::new();
        let memory = new_memory();
        let memory_id = store.add_memory(memory).unwrap();

        let src = Uuid::new_v4();
        let dst = Uuid::new_v4();
        let edge_id = store
            .add_edge(&memory_id, src, dst, "self".into(), "event".into(), 0.5)
            .unwrap();

        let edge = store.get_edge(&edge_id).unwrap();
        assert_eq!(edge.source_id, src);
        assert_eq!(edge.target_id, dst);
        assert!(store.get_node(&src).unwrap().is_placeholder());
        assert!(store.get_node(&dst).unwrap().is_placeholder());
        store.check_invariants().unwrap();
    }

    #[test]
    fn remove_memory_orphans_are_deleted() {
        let store = GraphStore::new();
        let memory = new_memory();
        let memory_id = store.add_memory(memory).unwrap();
        let node = MemoryNode {
            id: Uuid::new_v4(),
            content: "x".into(),
            node_type: NodeType::Subject,
            embedding: None,
            metadata: HashMap::new(),
        };
        let node_id = store.add_node(node, &memory_id).unwrap();

        store.remove_memory(&memory_id).unwrap();
        assert!(store.get_node(&node_id).is_none());
        assert!(store.node_to_memories(&node_id).is_empty());
    }

    #[test]
    fn merge_memories_is_identity_preserving() {
        let store = GraphStore::new();
        let mut target = new_memory();
        target.importance = 0.3;
        target.activation = 0.4;
        let target_id = store.add_memory(target).unwrap();

        let mut src = new_memory();
        src.importance = 0.9;
        src.activation = 0.8;
        let src_id = store.add_memory(src).unwrap();
        let node = MemoryNode {
            id: Uuid::new_v4(),
            content: "shared".into(),
            node_type: NodeType::Topic,
            embedding: None,
            metadata: HashMap::new(),
        };
        let node_id = store.add_node(node, &src_id).unwrap();

        store.merge_memories(&target_id, &[src_id]).unwrap();

        assert!(store.get_memory_by_id(&src_id).is_none());
        let target = store.get_memory_by_id(&target_id).unwrap();
        assert_eq!(target.importance, 0.9);
        assert_eq!(target.activation, 0.8);
        assert!(target.nodes.contains(&node_id));
        assert!(store.node_to_memories(&node_id).contains(&target_id));
    }

    #[test]
    fn merge_nodes_transfers_edges_and_reverse_index() {
        let store = GraphStore::new();
        let memory_id = store.add_memory(new_memory()).unwrap();
        let a = MemoryNode {
            id: Uuid::new_v4(),
            content: "a".into(),
            node_type: NodeType::Subject,
            embedding: None,
            metadata: HashMap::new(),
        };
        let b = MemoryNode {
            id: Uuid::new_v4(),
            content: "b".into(),
            node_type: NodeType::Subject,
            embedding: None,
            metadata: HashMap::new(),
        };
        let a_id = store.add_node(a, &memory_id).unwrap();
        let b_id = store.add_node(b, &memory_id).unwrap();
        let edge_id = store
            .add_edge(&memory_id, a_id, b_id, "rel".into(), "fact".into(), 0.5)
            .unwrap();

        store.merge_nodes(&a_id, &b_id).unwrap();

        assert!(store.get_node(&a_id).is_none());
        let edge = store.get_edge(&edge_id).unwrap();
        assert_eq!(edge.source_id, b_id);
        let memory = store.get_memory_by_id(&memory_id).unwrap();
        assert!(!memory.nodes.contains(&a_id));
        assert!(memory.nodes.contains(&b_id));
        store.check_invariants().unwrap();
    }

    #[test]
    fn no_duplicate_memory_ids() {
        let store = GraphStore::new();
        let memory = new_memory();
        let id = memory.id;
        store.add_memory(memory.clone()).unwrap();
        assert!(store.add_memory(memory).is_err());
        let _ = id;
    }
}
