//! Short-term tier: a bounded set of LLM-extracted structured memories.
//!
//! The extract/decide state machine is grounded on the teacher's oracle-call
//! shape in `embedding_integration.rs` (best-effort, never raises) combined
//! with the tolerant-JSON contract from [`crate::json_repair`]. The overflow
//! policy implements both strategies spec.md's Open Questions leave
//! ambiguous, selected via [`crate::config::OverflowStrategy`].

use crate::config::{OverflowStrategy, ShortTermConfig};
use crate::json_repair::tolerant_parse;
use crate::llm_client::LlmClient;
use crate::types::{MemoryType, ShortTermId, ShortTermMemory};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
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

/// The decide step's parsed decision. Unparseable or target-missing output
/// defaults to `CreateNew` per spec.md §4.F step 4.
#[derive(Debug, Clone)]
enum Decision {
    CreateNew,
    Merge { target_id: ShortTermId, merged_content: Option<String>, importance: Option<f32> },
    Update { target_id: ShortTermId, merged_content: Option<String> },
    Discard,
    KeepSeparate,
}

pub struct ShortTermManager {
    config: ShortTermConfig,
    llm: Arc<dyn LlmClient>,
    memories: Mutex<Vec<ShortTermMemory>>,
}

impl ShortTermManager {
    pub fn new(config: ShortTermConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            memories: Mutex::new(Vec::new()),
        }
    }

    pub fn from_memories(config: ShortTermConfig, llm: Arc<dyn LlmClient>, memories: Vec<ShortTermMemory>) -> Self {
        Self {
            config,
            llm,
            memories: Mutex::new(memories),
        }
    }

    fn extract_prompt(block_text: &str) -> String {
        format!(
            "Extract a single structured memory from the following text. Respond with JSON only: \
             {{\"content\": string, \"subject\": string, \"topic\": string, \"object\": string, \
             \"memory_type\": \"event\"|\"fact\"|\"opinion\"|\"relation\", \"importance\": number in [0,1], \
             \"attributes\": object<string,string>}}.\n\nText:\n{block_text}"
        )
    }

    fn decide_prompt(content: &str, candidates: &[&ShortTermMemory]) -> String {
        let candidate_list = candidates
            .iter()
            .map(|c| format!("- id={} content={}", c.id, c.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "A new memory candidate: \"{content}\".\nExisting related memories:\n{candidate_list}\n\n\
             Decide whether to merge, update, discard, keep_separate, or create_new. Respond with JSON only: \
             {{\"operation\": \"merge\"|\"update\"|\"create_new\"|\"discard\"|\"keep_separate\", \
             \"target_memory_id\": string?, \"merged_content\": string?, \"updated_importance\": number?, \
             \"reasoning\": string, \"confidence\": number}}."
        )
    }

    fn parse_extraction(raw: &str) -> Option<(String, String, String, String, MemoryType, f32, HashMap<String, String>)> {
        let value = tolerant_parse(raw)?;
        let content = value.get("content")?.as_str()?.to_string();
        let subject = value.get("subject").and_then(Value::as_str).unwrap_or_default().to_string();
        let topic = value.get("topic").and_then(Value::as_str).unwrap_or_default().to_string();
        let object = value.get("object").and_then(Value::as_str).unwrap_or_default().to_string();
        let memory_type = value
            .get("memory_type")
            .and_then(Value::as_str)
            .map(MemoryType::parse_loose)
            .unwrap_or(MemoryType::Fact);
        let importance = value
            .get("importance")
            .and_then(Value::as_f64)
            .map(|v| v.clamp(0.0, 1.0) as f32)
            .unwrap_or(0.5);
        let attributes = value
            .get("attributes")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Some((content, subject, topic, object, memory_type, importance, attributes))
    }

    fn parse_decision(raw: &str) -> Decision {
        let Some(value) = tolerant_parse(raw) else {
            return Decision::CreateNew;
        };
        let op = value
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("create_new")
            .to_ascii_lowercase();
        let target_id = value
            .get("target_memory_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let merged_content = value
            .get("merged_content")
            .and_then(Value::as_str)
            .map(str::to_string);
        let importance = value
            .get("updated_importance")
            .and_then(Value::as_f64)
            .map(|v| v.clamp(0.0, 1.0) as f32);

        match (op.as_str(), target_id) {
            ("merge", Some(target_id)) => Decision::Merge { target_id, merged_content, importance },
            ("update", Some(target_id)) => Decision::Update { target_id, merged_content },
            ("discard", _) => Decision::Discard,
            ("keep_separate", _) => Decision::KeepSeparate,
            _ => Decision::CreateNew,
        }
    }

    /// Run the extract/embed/decide state machine for a single promoted
    /// block. Returns `None` if the block was dropped (unparseable
    /// extraction) or discarded by the decider.
    pub async fn process_block(&self, block_text: &str, source_block_id: uuid::Uuid) -> Option<ShortTermId> {
        let extraction_raw = self
            .llm
            .generate_response(&Self::extract_prompt(block_text), 0.2, 512)
            .await;
        let Some((content, subject, topic, object, memory_type, importance, attributes)) =
            Self::parse_extraction(&extraction_raw)
        else {
            warn!("short-term extraction unparseable, dropping block");
            return None;
        };

        let embedding = self.llm.embed(&content).await;

        let mut memories = self.memories.lock().await;
        let top_k: Vec<(usize, f32)> = if let Some(ref emb) = embedding {
            let mut scored: Vec<(usize, f32)> = memories
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.embedding.as_ref().map(|e| (i, cosine_similarity(emb, e))))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(self.config.decide_top_k);
            scored
        } else {
            Vec::new()
        };
        let candidates: Vec<&ShortTermMemory> = top_k.iter().map(|(i, _)| &memories[*i]).collect();

        let decision = if candidates.is_empty() {
            Decision::CreateNew
        } else {
            let raw = self
                .llm
                .generate_response(&Self::decide_prompt(&content, &candidates), 0.2, 256)
                .await;
            Self::parse_decision(&raw)
        };

        let now = Utc::now();
        match decision {
            Decision::Discard => {
                debug!("short-term decider discarded new candidate");
                None
            }
            Decision::Merge { target_id, merged_content, importance: updated_importance } => {
                if let Some(target) = memories.iter_mut().find(|m| m.id == target_id) {
                    if let Some(merged) = merged_content {
                        target.content = merged;
                    }
                    target.source_block_ids.push(source_block_id);
                    target.embedding = embedding;
                    if let Some(imp) = updated_importance {
                        target.importance = imp;
                    }
                    target.last_accessed_at = now;
                    Some(target_id)
                } else {
                    Some(self.push_new(&mut memories, content, subject, topic, object, memory_type, importance, attributes, embedding, source_block_id))
                }
            }
            Decision::Update { target_id, merged_content } => {
                if let Some(target) = memories.iter_mut().find(|m| m.id == target_id) {
                    if let Some(merged) = merged_content {
                        target.content = merged;
                    }
                    target.source_block_ids.push(source_block_id);
                    target.last_accessed_at = now;
                    Some(target_id)
                } else {
                    Some(self.push_new(&mut memories, content, subject, topic, object, memory_type, importance, attributes, embedding, source_block_id))
                }
            }
            Decision::CreateNew | Decision::KeepSeparate => {
                Some(self.push_new(&mut memories, content, subject, topic, object, memory_type, importance, attributes, embedding, source_block_id))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_new(
        &self,
        memories: &mut Vec<ShortTermMemory>,
        content: String,
        subject: String,
        topic: String,
        object: String,
        memory_type: MemoryType,
        importance: f32,
        attributes: HashMap<String, String>,
        embedding: Option<Vec<f32>>,
        source_block_id: uuid::Uuid,
    ) -> ShortTermId {
        let now = Utc::now();
        let id = Uuid::new_v4();
        memories.push(ShortTermMemory {
            id,
            content,
            subject,
            topic,
            object,
            memory_type,
            importance,
            attributes,
            embedding,
            source_block_ids: vec![source_block_id],
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        });
        id
    }

    pub async fn search(&self, query_embedding: Option<&[f32]>, k: usize, threshold: f32) -> Vec<ShortTermMemory> {
        let Some(query) = query_embedding else {
            return Vec::new();
        };
        let mut memories = self.memories.lock().await;
        let mut scored: Vec<(usize, f32)> = memories
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.embedding.as_ref().map(|e| (i, cosine_similarity(query, e))))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let now = Utc::now();
        let mut result = Vec::with_capacity(scored.len());
        for (idx, _) in scored {
            let m = &mut memories[idx];
            m.last_accessed_at = now;
            m.access_count += 1;
            result.push(m.clone());
        }
        result
    }

    /// Entries eligible for transfer, per the configured overflow strategy.
    /// `EvictSubThreshold` additionally evicts the oldest sub-threshold
    /// entries in place to keep `|F| <= cleanup_keep_ratio * max_memories`.
    pub async fn get_memories_for_transfer(&self) -> Vec<ShortTermMemory> {
        let mut memories = self.memories.lock().await;
        match self.config.overflow_strategy {
            OverflowStrategy::TransferAllWhenFull => {
                if memories.len() >= self.config.max_memories {
                    memories.clone()
                } else {
                    memories
                        .iter()
                        .filter(|m| m.importance >= self.config.transfer_importance_threshold)
                        .cloned()
                        .collect()
                }
            }
            OverflowStrategy::EvictSubThreshold => {
                let transfer: Vec<ShortTermMemory> = memories
                    .iter()
                    .filter(|m| m.importance >= self.config.transfer_importance_threshold)
                    .cloned()
                    .collect();

                if self.config.enable_force_cleanup {
                    let cap = (self.config.max_memories as f32 * self.config.cleanup_keep_ratio) as usize;
                    let mut sub_threshold_idx: Vec<usize> = memories
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| m.importance < self.config.transfer_importance_threshold)
                        .map(|(i, _)| i)
                        .collect();
                    sub_threshold_idx.sort_by_key(|&i| memories[i].created_at);

                    if sub_threshold_idx.len() > cap {
                        let evict_count = sub_threshold_idx.len() - cap;
                        let mut to_evict: Vec<ShortTermId> = sub_threshold_idx[..evict_count]
                            .iter()
                            .map(|&i| memories[i].id)
                            .collect();
                        to_evict.sort();
                        memories.retain(|m| !to_evict.contains(&m.id));
                        debug!("evicted {} sub-threshold short-term entries", evict_count);
                    }
                }
                transfer
            }
        }
    }

    pub async fn clear_transferred_memories(&self, ids: &[ShortTermId]) {
        let mut memories = self.memories.lock().await;
        memories.retain(|m| !ids.contains(&m.id));
    }

    pub async fn len(&self) -> usize {
        self.memories.lock().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.config.max_memories
    }

    pub async fn occupancy(&self) -> f32 {
        if self.config.max_memories == 0 {
            return 0.0;
        }
        self.len().await as f32 / self.config.max_memories as f32
    }

    pub async fn snapshot(&self) -> Vec<ShortTermMemory> {
        self.memories.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlmClient;

    #[tokio::test]
    async fn process_block_creates_entry_on_valid_extraction() {
        let llm = Arc::new(MockLlmClient::new(4));
        llm.set_canned_response(
            r#"{"content": "likes tea", "subject": "alice", "topic": "preferences", "object": "tea",
                "memory_type": "fact", "importance": 0.8, "attributes": {}}"#,
        );
        let manager = ShortTermManager::new(ShortTermConfig::default(), llm);
        let id = manager.process_block("alice: I like tea", Uuid::new_v4()).await;
        assert!(id.is_some());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn unparseable_extraction_drops_block() {
        let llm = Arc::new(MockLlmClient::new(4));
        llm.set_canned_response("not json");
        let manager = ShortTermManager::new(ShortTermConfig::default(), llm);
        let id = manager.process_block("garbled", Uuid::new_v4()).await;
        assert!(id.is_none());
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn transfer_all_when_full_strategy_returns_everything_once_full() {
        let llm = Arc::new(MockLlmClient::new(4));
        let config = ShortTermConfig {
            max_memories: 2,
            overflow_strategy: OverflowStrategy::TransferAllWhenFull,
            transfer_importance_threshold: 0.9,
            ..ShortTermConfig::default()
        };
        let manager = ShortTermManager::new(config, llm.clone());
        llm.set_canned_response(
            r#"{"content": "a", "subject": "s", "topic": "t", "object": "o", "memory_type": "fact", "importance": 0.1, "attributes": {}}"#,
        );
        manager.process_block("msg1", Uuid::new_v4()).await;
        manager.process_block("msg2", Uuid::new_v4()).await;

        let transfer = manager.get_memories_for_transfer().await;
        assert_eq!(transfer.len(), 2);
    }

    #[tokio::test]
    async fn evict_sub_threshold_keeps_below_cap() {
        let llm = Arc::new(MockLlmClient::new(4));
        let config = ShortTermConfig {
            max_memories: 2,
            cleanup_keep_ratio: 0.5,
            transfer_importance_threshold: 0.9,
            ..ShortTermConfig::default()
        };
        let manager = ShortTermManager::new(config, llm.clone());
        llm.set_canned_response(
            r#"{"content": "a", "subject": "s", "topic": "t", "object": "o", "memory_type": "fact", "importance": 0.1, "attributes": {}}"#,
        );
        manager.process_block("msg1", Uuid::new_v4()).await;
        manager.process_block("msg2", Uuid::new_v4()).await;
        manager.process_block("msg3", Uuid::new_v4()).await;

        manager.get_memories_for_transfer().await;
        assert!(manager.len().await <= 1);
    }
}
