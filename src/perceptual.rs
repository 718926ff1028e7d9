//! Perceptual tier: a fixed-capacity FIFO buffer of raw-message blocks.
//!
//! Grounded on the teacher's locking discipline in `graph_engine.rs`
//! (a single `RwLock`/`Mutex`-guarded collection per concern). spec.md's
//! Open Question about concurrent `recall_count` increments is resolved
//! here, per SPEC_FULL.md, with one canonical per-manager `Mutex` guarding
//! the whole block list — every recall's counter bump is therefore atomic
//! relative to every other recall.

use crate::config::PerceptualConfig;
use crate::llm_client::LlmClient;
use crate::types::{BlockId, Message, MemoryBlock};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

struct State {
    pending: Vec<Message>,
    blocks: VecDeque<MemoryBlock>,
}

pub struct PerceptualManager {
    config: PerceptualConfig,
    llm: Arc<dyn LlmClient>,
    state: Mutex<State>,
}

impl PerceptualManager {
    pub fn new(config: PerceptualConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            state: Mutex::new(State {
                pending: Vec::new(),
                blocks: VecDeque::new(),
            }),
        }
    }

    pub fn from_blocks(config: PerceptualConfig, llm: Arc<dyn LlmClient>, blocks: Vec<MemoryBlock>) -> Self {
        Self {
            config,
            llm,
            state: Mutex::new(State {
                pending: Vec::new(),
                blocks: blocks.into_iter().collect(),
            }),
        }
    }

    /// Buffer `msg`; once `block_size` messages have accumulated, form a
    /// `MemoryBlock`, embed it best-effort, and push it onto the FIFO,
    /// dropping the oldest block if capacity is exceeded.
    pub async fn add_message(&self, msg: Message) -> Option<BlockId> {
        let mut state = self.state.lock().await;
        state.pending.push(msg);

        if state.pending.len() < self.config.block_size {
            return None;
        }

        let drained: Vec<Message> = state.pending.drain(..).collect();
        let combined_text = drained
            .iter()
            .map(|m| format!("{}: {}", m.user_name, m.text))
            .collect::<Vec<_>>()
            .join("\n");
        let message_ids: Vec<String> = drained.iter().map(|m| m.chat_id.clone()).collect();

        drop(state);
        let embedding = self.llm.embed(&combined_text).await;
        let mut state = self.state.lock().await;

        let block_id = Uuid::new_v4();
        let block = MemoryBlock {
            id: block_id,
            combined_text,
            embedding,
            message_ids,
            created_at: Utc::now(),
            last_recalled_at: None,
            recall_count: 0,
            metadata: Default::default(),
        };
        state.blocks.push_back(block);

        while state.blocks.len() > self.config.max_blocks {
            state.blocks.pop_front();
        }

        Some(block_id)
    }

    /// Cosine-score query against every embedded block, return the top-k
    /// above `recall_similarity_threshold`. Each returned block's
    /// `recall_count` is incremented and `last_recalled_at` updated; once a
    /// block crosses `activation_threshold` its `needs_transfer` flag is set.
    pub async fn recall_blocks(&self, query_embedding: Option<&[f32]>) -> Vec<MemoryBlock> {
        let Some(query) = query_embedding else {
            return Vec::new();
        };
        let mut state = self.state.lock().await;

        let mut scored: Vec<(usize, f32)> = state
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                b.embedding
                    .as_ref()
                    .map(|e| (i, cosine_similarity(query, e)))
            })
            .filter(|(_, score)| *score >= self.config.recall_similarity_threshold)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.recall_top_k);

        let mut result = Vec::with_capacity(scored.len());
        for (idx, _) in scored {
            let block = &mut state.blocks[idx];
            block.recall_count += 1;
            block.last_recalled_at = Some(Utc::now());
            if block.recall_count >= self.config.activation_threshold {
                block
                    .metadata
                    .insert("needs_transfer".to_string(), serde_json::Value::Bool(true));
            }
            result.push(block.clone());
        }
        debug!("recall_blocks returned {} of {} blocks", result.len(), state.blocks.len());
        result
    }

    /// Called by the coordinator after a block has been successfully
    /// promoted. Idempotent: removing an id that's already gone is a no-op.
    pub async fn remove_block(&self, id: &BlockId) {
        let mut state = self.state.lock().await;
        state.blocks.retain(|b| b.id != *id);
    }

    /// Clear `needs_transfer` immediately so the caller's background
    /// promotion task can't be scheduled twice for the same block.
    pub async fn clear_needs_transfer(&self, id: &BlockId) {
        let mut state = self.state.lock().await;
        if let Some(block) = state.blocks.iter_mut().find(|b| b.id == *id) {
            block.metadata.remove("needs_transfer");
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<MemoryBlock> {
        self.state.lock().await.blocks.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlmClient;

    fn msg(text: &str) -> Message {
        Message {
            user_id: "u1".into(),
            user_name: "alice".into(),
            platform: "test".into(),
            chat_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn forms_block_once_block_size_reached() {
        let llm = Arc::new(MockLlmClient::new(4));
        let config = PerceptualConfig {
            block_size: 2,
            ..PerceptualConfig::default()
        };
        let manager = PerceptualManager::new(config, llm);

        assert!(manager.add_message(msg("hello")).await.is_none());
        let block_id = manager.add_message(msg("world")).await;
        assert!(block_id.is_some());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn caps_buffer_at_max_blocks() {
        let llm = Arc::new(MockLlmClient::new(4));
        let config = PerceptualConfig {
            block_size: 1,
            max_blocks: 2,
            ..PerceptualConfig::default()
        };
        let manager = PerceptualManager::new(config, llm);

        for i in 0..5 {
            manager.add_message(msg(&format!("msg {i}"))).await;
        }
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn recall_increments_count_and_flags_transfer() {
        let llm = Arc::new(MockLlmClient::new(3));
        let config = PerceptualConfig {
            block_size: 1,
            activation_threshold: 2,
            recall_similarity_threshold: -1.0,
            ..PerceptualConfig::default()
        };
        let manager = PerceptualManager::new(config, llm);
        manager.add_message(msg("topic A")).await;

        let query = vec![1.0, 0.0, 0.0];
        let first = manager.recall_blocks(Some(&query)).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].recall_count, 1);
        assert!(!first[0].needs_transfer());

        let second = manager.recall_blocks(Some(&query)).await;
        assert_eq!(second[0].recall_count, 2);
        assert!(second[0].needs_transfer());
    }

    #[tokio::test]
    async fn remove_block_is_idempotent() {
        let llm = Arc::new(MockLlmClient::new(3));
        let config = PerceptualConfig {
            block_size: 1,
            ..PerceptualConfig::default()
        };
        let manager = PerceptualManager::new(config, llm);
        let id = manager.add_message(msg("hi")).await.unwrap();

        manager.remove_block(&id).await;
        manager.remove_block(&id).await;
        assert!(manager.is_empty().await);
    }
}
