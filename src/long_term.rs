//! Long-term tier: graph-operation planning, similarity search with bounded
//! graph expansion, and activation decay.
//!
//! The batch/retry shape is grounded on the teacher's `parallel-workers`
//! decomposition pattern (split into bounded batches, process members
//! concurrently, aggregate); the decay formula replaces the teacher's SQL
//! `POWER(factor, days)` column expression (absent here since there's no
//! database) with an in-process precomputed power table for days 1..30.

use crate::config::LongTermConfig;
use crate::error::MemoryError;
use crate::graph_ops::{BatchStats, GraphOpExecutor, GraphOperation};
use crate::graph_store::GraphStore;
use crate::json_repair::tolerant_parse;
use crate::llm_client::LlmClient;
use crate::types::{Memory, MemoryId, ShortTermId, ShortTermMemory};
use crate::vector_store::VectorStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct TransferStats {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub merged: u32,
    pub failed: u32,
    pub transferred_memory_ids: Vec<ShortTermId>,
}

/// FIFO-eviction cache (not access-order LRU, per spec.md §4.H:
/// "evict-oldest-on-overflow, purely a speed-up").
struct SimilarityCache {
    cap: usize,
    order: VecDeque<ShortTermId>,
    entries: HashMap<ShortTermId, Vec<Memory>>,
}

impl SimilarityCache {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, id: &ShortTermId) -> Option<Vec<Memory>> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, id: ShortTermId, memories: Vec<Memory>) {
        if !self.entries.contains_key(&id) {
            self.order.push_back(id);
        }
        self.entries.insert(id, memories);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

pub struct LongTermManager {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    executor: Arc<GraphOpExecutor>,
    config: LongTermConfig,
    cache: Mutex<SimilarityCache>,
}

impl LongTermManager {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<GraphOpExecutor>,
        config: LongTermConfig,
    ) -> Self {
        let cap = config.similarity_cache_cap;
        Self {
            graph,
            vectors,
            llm,
            executor,
            config,
            cache: Mutex::new(SimilarityCache::new(cap)),
        }
    }

    /// Process a batch of short-term memories into graph operations,
    /// `batch_size` at a time, each batch's members concurrently.
    pub async fn transfer_from_short_term(&self, stms: Vec<ShortTermMemory>) -> TransferStats {
        let mut stats = TransferStats::default();

        for chunk in stms.chunks(self.config.batch_size.max(1)) {
            let results = futures::future::join_all(chunk.iter().cloned().map(|stm| self.process_single(stm))).await;
            for (stm_id, outcome) in results {
                stats.processed += 1;
                stats.transferred_memory_ids.push(stm_id);
                match outcome {
                    Ok(batch_stats) => {
                        stats.created += batch_stats.created_memory + batch_stats.created_node + batch_stats.created_edge;
                        stats.updated += batch_stats.updated_memory + batch_stats.updated_node + batch_stats.updated_edge
                            + batch_stats.deleted_edge;
                        stats.merged += batch_stats.merged_memories + batch_stats.merged_nodes;
                        stats.failed += batch_stats.failed;
                    }
                    Err(_) => stats.failed += 1,
                }
            }
        }

        self.executor.flush_pending_embeds().await;
        stats
    }

    /// Retry the whole single-STM pipeline (search, prompt, plan, execute)
    /// up to `op_retry_limit` times with linear backoff, per spec.md §7
    /// error kind 6.
    async fn process_single(&self, stm: ShortTermMemory) -> (ShortTermId, Result<BatchStats, MemoryError>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.process_single_attempt(&stm).await {
                Ok(stats) => return (stm.id, Ok(stats)),
                Err(e) if attempt <= self.config.op_retry_limit => {
                    warn!("short-term transfer attempt {attempt} failed for {}: {e}", stm.id);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!("short-term transfer permanently failed for {}: {e}", stm.id);
                    return (stm.id, Err(e));
                }
            }
        }
    }

    async fn process_single_attempt(&self, stm: &ShortTermMemory) -> Result<BatchStats, MemoryError> {
        let candidates = self.search_similar(stm).await;
        let prompt = Self::graph_op_prompt(stm, &candidates);
        let raw = self.llm.generate_response(&prompt, 0.2, 1024).await;
        let ops = Self::parse_operations(&raw);
        Ok(self.executor.execute_batch(ops, Some(stm.id)).await)
    }

    fn graph_op_prompt(stm: &ShortTermMemory, candidates: &[Memory]) -> String {
        let candidate_list = candidates
            .iter()
            .map(|m| format!("- id={} type={:?} importance={}", m.id, m.memory_type, m.importance))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Short-term memory to integrate: \"{}\" (subject={}, topic={}, object={}).\n\
             Candidate related long-term memories:\n{candidate_list}\n\n\
             Produce a JSON list of graph operations (CREATE_MEMORY, UPDATE_MEMORY, MERGE_MEMORIES, \
             CREATE_NODE, UPDATE_NODE, MERGE_NODES, CREATE_EDGE, UPDATE_EDGE, DELETE_EDGE) to integrate it.",
            stm.content, stm.subject, stm.topic, stm.object
        )
    }

    fn parse_operations(raw: &str) -> Vec<GraphOperation> {
        let Some(value) = tolerant_parse(raw) else {
            warn!("graph-op planner output unparseable, no operations applied");
            return Vec::new();
        };
        let Some(array) = value.as_array() else {
            warn!("graph-op planner output was not a JSON array");
            return Vec::new();
        };
        array
            .iter()
            .filter_map(|entry| match serde_json::from_value::<GraphOperation>(entry.clone()) {
                Ok(op) => Some(op),
                Err(e) => {
                    warn!("skipping malformed graph operation: {e}");
                    None
                }
            })
            .collect()
    }

    /// Top-K by embedding similarity via B, plus single-hop graph expansion
    /// bounded to `max_expansion_per_seed` neighbors per seed memory.
    async fn search_similar(&self, stm: &ShortTermMemory) -> Vec<Memory> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&stm.id) {
                return cached;
            }
        }

        let Some(ref embedding) = stm.embedding else {
            return Vec::new();
        };

        let hits = self.vectors.search_top_k(embedding, self.config.search_top_k);
        let mut memory_ids: Vec<MemoryId> = Vec::new();
        let mut seen: HashSet<MemoryId> = HashSet::new();
        for (node_id, _score) in &hits {
            for memory_id in self.graph.node_to_memories(node_id) {
                if seen.insert(memory_id) {
                    memory_ids.push(memory_id);
                }
            }
        }

        let seeds: Vec<MemoryId> = memory_ids.clone();
        for seed in seeds {
            let neighbors = self.graph.neighbor_memories(&seed);
            for neighbor in neighbors.into_iter().take(self.config.max_expansion_per_seed) {
                if seen.insert(neighbor) {
                    memory_ids.push(neighbor);
                }
            }
        }

        let memories: Vec<Memory> = memory_ids
            .into_iter()
            .take(self.config.search_top_k.max(1) + self.config.max_expansion_per_seed * 2)
            .filter_map(|id| self.graph.get_memory_by_id(&id))
            .filter(|m| !m.is_forgotten())
            .collect();

        let mut cache = self.cache.lock().await;
        cache.insert(stm.id, memories.clone());
        memories
    }

    /// Apply exponential activation decay to every non-forgotten memory,
    /// using a precomputed `factor^days` table for days 1..30 and direct
    /// exponentiation beyond that. Never increases activation (monotone).
    pub fn apply_long_term_decay(&self) -> Result<(), MemoryError> {
        let factor = self.config.decay_factor;
        let table: Vec<f64> = (1..=30).map(|d| factor.powi(d)).collect();
        let now = Utc::now();

        for memory in self.graph.get_all_memories() {
            if memory.is_forgotten() {
                continue;
            }
            let days = (now - memory.last_accessed_at).num_days().max(0);
            let decay = if days == 0 {
                1.0
            } else if (days as usize) <= table.len() {
                table[days as usize - 1]
            } else {
                factor.powi(days as i32)
            };
            let new_activation = (memory.activation as f64 * decay) as f32;
            self.graph.update_memory(&memory.id, |m| {
                m.activation = new_activation;
                m.metadata
                    .insert("activation_last_decayed_at".to_string(), serde_json::json!(now.to_rfc3339()));
            })?;
        }
        debug!("applied long-term decay across {} memories", self.graph.memory_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlmClient;
    use crate::types::{MemoryStatus, MemoryType};
    use chrono::Duration as ChronoDuration;

    fn manager() -> LongTermManager {
        let graph = Arc::new(GraphStore::new());
        let vectors = Arc::new(VectorStore::new());
        let llm = Arc::new(MockLlmClient::new(4));
        let executor = Arc::new(GraphOpExecutor::new(graph.clone(), vectors.clone(), llm.clone(), 10, 2));
        LongTermManager::new(graph, vectors, llm, executor, LongTermConfig::default())
    }

    #[test]
    fn decay_matches_closed_form_after_ten_days() {
        let lt = manager();
        let mut memory = Memory::new(MemoryType::Fact, 0.9);
        memory.activation = 1.0;
        memory.last_accessed_at = Utc::now() - ChronoDuration::days(10);
        let id = lt.graph.add_memory(memory).unwrap();

        lt.apply_long_term_decay().unwrap();

        let updated = lt.graph.get_memory_by_id(&id).unwrap();
        let expected = 0.95f64.powi(10) as f32;
        assert!((updated.activation - expected).abs() < 1e-6);
    }

    #[test]
    fn decay_never_increases_activation() {
        let lt = manager();
        let mut memory = Memory::new(MemoryType::Fact, 0.5);
        memory.activation = 0.3;
        let id = lt.graph.add_memory(memory).unwrap();

        lt.apply_long_term_decay().unwrap();
        let updated = lt.graph.get_memory_by_id(&id).unwrap();
        assert!(updated.activation <= 0.3);
    }

    #[test]
    fn decay_skips_forgotten_memories() {
        let lt = manager();
        let mut memory = Memory::new(MemoryType::Fact, 0.5);
        memory.status = MemoryStatus::Forgotten;
        memory.activation = 0.8;
        let id = lt.graph.add_memory(memory).unwrap();

        lt.apply_long_term_decay().unwrap();
        let updated = lt.graph.get_memory_by_id(&id).unwrap();
        assert_eq!(updated.activation, 0.8);
    }

    #[tokio::test]
    async fn transfer_from_short_term_aggregates_counts() {
        let llm = Arc::new(MockLlmClient::new(4));
        llm.set_canned_response(
            r#"[{"operation_type": "CREATE_MEMORY", "target_id": "TEMP_1",
                "parameters": {"memory_type": "fact", "importance": 0.6}, "reason": "r", "confidence": 0.8}]"#,
        );
        let graph = Arc::new(GraphStore::new());
        let vectors = Arc::new(VectorStore::new());
        let executor = Arc::new(GraphOpExecutor::new(graph.clone(), vectors.clone(), llm.clone(), 10, 2));
        let lt = LongTermManager::new(graph, vectors, llm, executor, LongTermConfig::default());

        let stm = ShortTermMemory {
            id: uuid::Uuid::new_v4(),
            content: "likes tea".into(),
            subject: "alice".into(),
            topic: "preferences".into(),
            object: "tea".into(),
            memory_type: crate::types::MemoryType::Fact,
            importance: 0.7,
            attributes: Default::default(),
            embedding: None,
            source_block_ids: vec![],
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_count: 0,
        };

        let stats = lt.transfer_from_short_term(vec![stm]).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.failed, 0);
    }
}
