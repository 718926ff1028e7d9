//! In-process approximate nearest-neighbor substitute over node embeddings.
//!
//! Brute-force cosine top-k is adequate at this crate's target scale
//! (thousands of nodes, not millions); see DESIGN.md for the tradeoff
//! record. `DashMap` gives the single-writer/many-readers contract spec.md
//! §4.B asks for without an explicit lock, grounded on the teacher's use of
//! `dashmap` for `entity_cache`/`relationship_cache` in `graph_engine.rs`.

use crate::types::NodeId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct Entry {
    embedding: Vec<f32>,
    /// Insertion sequence, used to break score ties deterministically.
    seq: u64,
}

/// Secondary index over node embeddings. The node itself remains the
/// source of truth (graph_store owns node content); deleting a node must
/// also delete it here.
#[derive(Default)]
pub struct VectorStore {
    entries: DashMap<NodeId, Entry>,
    seq: AtomicU64,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a node's embedding.
    pub fn add_node(&self, node_id: NodeId, embedding: Vec<f32>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(node_id, Entry { embedding, seq });
    }

    /// Atomic-per-item batch upsert.
    pub fn add_nodes_batch(&self, nodes: Vec<(NodeId, Vec<f32>)>) {
        for (id, emb) in nodes {
            self.add_node(id, emb);
        }
    }

    /// Remove a node's embedding. Idempotent.
    pub fn delete_node(&self, node_id: &NodeId) {
        self.entries.remove(node_id);
    }

    /// Cosine-similarity top-k, descending, scores in [0,1] (remapped from
    /// [-1,1]), ties broken by insertion order. Nodes without an embedding
    /// cannot appear here by construction.
    pub fn search_top_k(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        let mut scored: Vec<(NodeId, f32, u64)> = self
            .entries
            .iter()
            .map(|entry| {
                let sim = cosine_similarity(query, &entry.embedding);
                let normalized = (sim + 1.0) / 2.0;
                (*entry.key(), normalized, entry.seq)
            })
            .collect();

        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.2.cmp(&b.2),
            other => other,
        });
        scored.truncate(k);
        debug!("vector search returned {} of {} candidates", scored.len(), self.entries.len());
        scored.into_iter().map(|(id, s, _)| (id, s)).collect()
    }

    /// All node ids currently carrying an embedding, for reconciliation
    /// against the graph store.
    pub fn list_known_ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
