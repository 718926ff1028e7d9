//! Unified retrieval: parallel perceptual/short-term search, an LLM judge
//! deciding whether long-term search is needed, and weighted multi-query
//! long-term retrieval when it is.
//!
//! The parallel-then-judge shape is grounded on the teacher's
//! `orchestration/arbiter.rs` pattern of fanning out independent probes and
//! combining them behind a single decision point.

use crate::graph_store::GraphStore;
use crate::json_repair::tolerant_parse;
use crate::llm_client::LlmClient;
use crate::perceptual::PerceptualManager;
use crate::short_term::ShortTermManager;
use crate::types::{MemoryBlock, MemoryId, ScoredMemory, ShortTermMemory};
use crate::vector_store::VectorStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const RETRIEVAL_STM_TOP_K: usize = 5;
const RETRIEVAL_STM_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Serialize)]
pub struct JudgeDecision {
    pub is_sufficient: bool,
    pub confidence: f32,
    pub reasoning: String,
    pub additional_queries: Vec<String>,
    pub missing_aspects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub perceptual_blocks: Vec<MemoryBlock>,
    pub short_term_memories: Vec<ShortTermMemory>,
    pub long_term_memories: Vec<ScoredMemory>,
    pub judge_decision: Option<JudgeDecision>,
}

fn parse_judge(raw: &str) -> Option<JudgeDecision> {
    let value = tolerant_parse(raw)?;
    let is_sufficient = value.get("is_sufficient")?.as_bool()?;
    let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0) as f32;
    let reasoning = value.get("reasoning").and_then(Value::as_str).unwrap_or_default().to_string();
    let additional_queries = value
        .get("additional_queries")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let missing_aspects = value
        .get("missing_aspects")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    Some(JudgeDecision {
        is_sufficient,
        confidence,
        reasoning,
        additional_queries,
        missing_aspects,
    })
}

pub struct RetrievalCoordinator {
    perceptual: Arc<PerceptualManager>,
    short_term: Arc<ShortTermManager>,
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    confidence_threshold: f32,
    long_term_top_k: usize,
}

impl RetrievalCoordinator {
    pub fn new(
        perceptual: Arc<PerceptualManager>,
        short_term: Arc<ShortTermManager>,
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        llm: Arc<dyn LlmClient>,
        confidence_threshold: f32,
        long_term_top_k: usize,
    ) -> Self {
        Self {
            perceptual,
            short_term,
            graph,
            vectors,
            llm,
            confidence_threshold,
            long_term_top_k,
        }
    }

    /// Runs E and F searches concurrently, optionally consults the judge,
    /// and falls through to a direct long-term top-K search when
    /// `use_judge` is false.
    pub async fn search_memories(
        &self,
        query: &str,
        use_judge: bool,
        recent_chat_history: &[String],
        on_needs_transfer: impl Fn(MemoryBlock) + Send,
    ) -> SearchResult {
        let query_embedding = self.llm.embed(query).await;

        let (blocks, short_term_memories) = tokio::join!(
            self.perceptual.recall_blocks(query_embedding.as_deref()),
            self.short_term
                .search(query_embedding.as_deref(), RETRIEVAL_STM_TOP_K, RETRIEVAL_STM_THRESHOLD)
        );

        for block in &blocks {
            if block.needs_transfer() {
                self.perceptual.clear_needs_transfer(&block.id).await;
                on_needs_transfer(block.clone());
            }
        }

        if !use_judge {
            let long_term_memories = self
                .weighted_multi_query(&[(query.to_string(), 1.0)])
                .await;
            return SearchResult {
                perceptual_blocks: blocks,
                short_term_memories,
                long_term_memories,
                judge_decision: None,
            };
        }

        let judge_prompt = Self::judge_prompt(query, &blocks, &short_term_memories, recent_chat_history);
        let raw = self.llm.generate_response(&judge_prompt, 0.0, 512).await;
        let judge_decision = parse_judge(&raw).unwrap_or(JudgeDecision {
            is_sufficient: false,
            confidence: 0.0,
            reasoning: "unparseable judge response, defaulting to insufficient".into(),
            additional_queries: Vec::new(),
            missing_aspects: Vec::new(),
        });

        let long_term_memories = if judge_decision.is_sufficient && judge_decision.confidence >= self.confidence_threshold {
            debug!("judge deemed perceptual+short-term sufficient, skipping long-term search");
            Vec::new()
        } else {
            let mut weighted_queries = vec![(query.to_string(), 1.0f32)];
            for (i, extra) in judge_decision.additional_queries.iter().enumerate() {
                let weight = (1.0 - 0.2 * (i as f32 + 1.0)).max(0.3);
                weighted_queries.push((extra.clone(), weight));
            }
            self.weighted_multi_query(&weighted_queries).await
        };

        SearchResult {
            perceptual_blocks: blocks,
            short_term_memories,
            long_term_memories,
            judge_decision: Some(judge_decision),
        }
    }

    fn judge_prompt(
        query: &str,
        blocks: &[MemoryBlock],
        short_term: &[ShortTermMemory],
        recent_chat_history: &[String],
    ) -> String {
        let block_summaries: Vec<&str> = blocks.iter().map(|b| b.combined_text.as_str()).collect();
        let stm_summaries: Vec<&str> = short_term.iter().map(|m| m.content.as_str()).collect();
        format!(
            "Query: \"{query}\"\nRecent chat history: {recent_chat_history:?}\n\
             Perceptual blocks found: {block_summaries:?}\nShort-term memories found: {stm_summaries:?}\n\n\
             Decide whether this context is sufficient to answer the query, or whether long-term memory \
             search is needed. Respond with JSON only: {{\"is_sufficient\": bool, \"confidence\": number, \
             \"reasoning\": string, \"additional_queries\": [string], \"missing_aspects\": [string]}}."
        )
    }

    /// Embed and search each weighted query independently, merge by memory
    /// id keeping the max weighted score, return descending, truncated to
    /// `long_term_top_k`.
    async fn weighted_multi_query(&self, queries: &[(String, f32)]) -> Vec<ScoredMemory> {
        let mut best: HashMap<MemoryId, ScoredMemory> = HashMap::new();

        for (text, weight) in queries {
            let Some(embedding) = self.llm.embed(text).await else {
                continue;
            };
            let hits = self.vectors.search_top_k(&embedding, self.long_term_top_k);
            for (node_id, score) in hits {
                for memory_id in self.graph.node_to_memories(&node_id) {
                    let Some(memory) = self.graph.get_memory_by_id(&memory_id) else {
                        continue;
                    };
                    if memory.is_forgotten() {
                        continue;
                    }
                    let weighted = score * weight;
                    best.entry(memory_id)
                        .and_modify(|existing| {
                            if weighted > existing.score {
                                existing.score = weighted;
                            }
                        })
                        .or_insert(ScoredMemory { memory, score: weighted });
                }
            }
        }

        let mut results: Vec<ScoredMemory> = best.into_values().collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.long_term_top_k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerceptualConfig, ShortTermConfig};
    use crate::llm_client::MockLlmClient;

    fn coordinator() -> RetrievalCoordinator {
        let llm = Arc::new(MockLlmClient::new(4));
        let perceptual = Arc::new(PerceptualManager::new(PerceptualConfig::default(), llm.clone()));
        let short_term = Arc::new(ShortTermManager::new(ShortTermConfig::default(), llm.clone()));
        let graph = Arc::new(GraphStore::new());
        let vectors = Arc::new(VectorStore::new());
        RetrievalCoordinator::new(perceptual, short_term, graph, vectors, llm, 0.6, 5)
    }

    #[tokio::test]
    async fn judge_sufficient_skips_long_term_search() {
        let llm = Arc::new(MockLlmClient::new(4));
        llm.set_canned_response(
            r#"{"is_sufficient": true, "confidence": 0.9, "reasoning": "ok", "additional_queries": [], "missing_aspects": []}"#,
        );

        let perceptual = Arc::new(PerceptualManager::new(PerceptualConfig::default(), llm.clone()));
        let short_term = Arc::new(ShortTermManager::new(ShortTermConfig::default(), llm.clone()));
        let graph = Arc::new(GraphStore::new());
        let vectors = Arc::new(VectorStore::new());
        let coord = RetrievalCoordinator::new(perceptual, short_term, graph, vectors, llm, 0.6, 5);

        let result = coord
            .search_memories("what does alice like", true, &[], |_| {})
            .await;
        assert!(result.long_term_memories.is_empty());
        assert!(result.judge_decision.unwrap().is_sufficient);
    }

    #[tokio::test]
    async fn no_judge_runs_direct_long_term_search() {
        let coord = coordinator();
        let result = coord.search_memories("anything", false, &[], |_| {}).await;
        assert!(result.judge_decision.is_none());
    }
}
