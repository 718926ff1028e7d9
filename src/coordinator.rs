//! Component J: the unified coordinator — wires every tier together and
//! exposes the pipeline's only public surface.
//!
//! The shutdown-signal shape (`watch<bool>` plus a joinable background
//! task) is grounded on the teacher's task-lifecycle pattern in
//! `orchestration/src/arbiter.rs`; `tokio_util::CancellationToken` isn't part of
//! the teacher's dependency stack, so a boolean watch channel does the
//! equivalent job without adding a crate.

use crate::config::MemoryConfig;
use crate::error::MemoryResult;
use crate::graph_ops::GraphOpExecutor;
use crate::graph_store::GraphStore;
use crate::llm_client::LlmClient;
use crate::long_term::{LongTermManager, TransferStats};
use crate::perceptual::PerceptualManager;
use crate::persistence::PersistenceManager;
use crate::retrieval::{RetrievalCoordinator, SearchResult};
use crate::short_term::ShortTermManager;
use crate::types::Message;
use crate::vector_store::VectorStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct MemoryEngine {
    config: MemoryConfig,
    perceptual: Arc<PerceptualManager>,
    short_term: Arc<ShortTermManager>,
    graph: Arc<GraphStore>,
    executor: Arc<GraphOpExecutor>,
    long_term: Arc<LongTermManager>,
    retrieval: Arc<RetrievalCoordinator>,
    persistence: Arc<PersistenceManager>,
    shutdown_tx: watch::Sender<bool>,
    wakeup: Arc<Notify>,
    auto_transfer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryEngine {
    pub async fn new(config: MemoryConfig, llm: Arc<dyn LlmClient>) -> MemoryResult<Self> {
        let persistence = Arc::new(PersistenceManager::new(config.data_dir.clone()));
        persistence.ensure_data_dir().await?;

        let graph = Arc::new(persistence.load_graph().await);
        let short_term_memories = persistence.load_short_term().await;
        let perceptual_blocks = persistence.load_perceptual().await;

        let short_term = Arc::new(ShortTermManager::from_memories(
            config.short_term.clone(),
            llm.clone(),
            short_term_memories,
        ));
        let perceptual = Arc::new(PerceptualManager::from_blocks(
            config.perceptual.clone(),
            llm.clone(),
            perceptual_blocks,
        ));

        let vectors = Arc::new(VectorStore::new());
        backfill_missing_embeddings(&graph, &vectors, &llm).await;

        let executor = Arc::new(GraphOpExecutor::new(
            graph.clone(),
            vectors.clone(),
            llm.clone(),
            config.long_term.embed_batch_size,
            config.long_term.op_retry_limit,
        ));
        let long_term = Arc::new(LongTermManager::new(
            graph.clone(),
            vectors.clone(),
            llm.clone(),
            executor.clone(),
            config.long_term.clone(),
        ));
        let retrieval = Arc::new(RetrievalCoordinator::new(
            perceptual.clone(),
            short_term.clone(),
            graph.clone(),
            vectors.clone(),
            llm.clone(),
            config.judge.confidence_threshold,
            config.long_term.search_top_k,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wakeup = Arc::new(Notify::new());

        let handle = spawn_auto_transfer_loop(
            short_term.clone(),
            long_term.clone(),
            persistence.clone(),
            graph.clone(),
            config.long_term.auto_transfer_interval_secs,
            shutdown_rx,
            wakeup.clone(),
        );

        Ok(Self {
            config,
            perceptual,
            short_term,
            graph,
            executor,
            long_term,
            retrieval,
            persistence,
            shutdown_tx,
            wakeup,
            auto_transfer_handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub async fn add_message(&self, msg: Message) -> MemoryResult<()> {
        if let Some(_block_id) = self.perceptual.add_message(msg).await {
            self.persistence.save_perceptual(self.perceptual.snapshot().await).await?;
        }
        Ok(())
    }

    pub async fn search_memories(
        &self,
        query: &str,
        use_judge: bool,
        recent_chat_history: &[String],
    ) -> SearchResult {
        let short_term = self.short_term.clone();
        let perceptual = self.perceptual.clone();

        self.retrieval
            .search_memories(query, use_judge, recent_chat_history, move |block| {
                let short_term = short_term.clone();
                let perceptual = perceptual.clone();
                tokio::spawn(async move {
                    if short_term
                        .process_block(&block.combined_text, block.id)
                        .await
                        .is_some()
                    {
                        perceptual.remove_block(&block.id).await;
                    }
                });
            })
            .await
    }

    /// If F isn't full, a no-op returning `{transferred: 0}`; otherwise
    /// hands F's entire current contents to H and clears what transferred.
    pub async fn manual_transfer(&self) -> MemoryResult<TransferStats> {
        if self.short_term.len().await < self.config.short_term.max_memories {
            return Ok(TransferStats::default());
        }

        let stms = self.short_term.snapshot().await;
        let stats = self.long_term.transfer_from_short_term(stms).await;
        self.short_term
            .clear_transferred_memories(&stats.transferred_memory_ids)
            .await;

        self.persistence.save_short_term(self.short_term.snapshot().await).await?;
        self.persistence.save_graph(&self.graph).await?;
        Ok(stats)
    }

    /// Wake the auto-transfer loop immediately rather than waiting for the
    /// next adaptive interval, e.g. after a post-hoc perceptual->short-term
    /// promotion.
    pub fn notify_transfer_opportunity(&self) {
        self.wakeup.notify_one();
    }

    pub async fn shutdown(&self) -> MemoryResult<()> {
        info!("memory engine shutting down");
        let _ = self.shutdown_tx.send(true);
        self.wakeup.notify_one();

        let handle = self.auto_transfer_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("auto-transfer task did not shut down within the deadline");
            }
        }

        self.executor.flush_pending_embeds().await;
        self.persistence.save_graph(&self.graph).await?;
        self.persistence.save_short_term(self.short_term.snapshot().await).await?;
        self.persistence.save_perceptual(self.perceptual.snapshot().await).await?;
        Ok(())
    }

    pub fn apply_long_term_decay(&self) -> MemoryResult<()> {
        self.long_term.apply_long_term_decay()
    }

    /// Diagnostic counts across the three tiers, for property tests and the
    /// out-of-scope CLI's health surface.
    pub async fn perceptual_block_count(&self) -> usize {
        self.perceptual.len().await
    }

    pub async fn short_term_memory_count(&self) -> usize {
        self.short_term.len().await
    }

    pub fn long_term_memory_count(&self) -> usize {
        self.graph.memory_count()
    }
}

/// Seed the vector store from nodes that already carry an embedding, and
/// best-effort batch-embed any that don't (spec.md §4.D's "regenerate
/// missing embeddings lazily", simplified to run once at startup rather
/// than on first access).
async fn backfill_missing_embeddings(graph: &GraphStore, vectors: &VectorStore, llm: &Arc<dyn LlmClient>) {
    let (_, nodes, _) = graph.snapshot();
    let mut missing = Vec::new();
    for node in &nodes {
        match &node.embedding {
            Some(embedding) => vectors.add_node(node.id, embedding.clone()),
            None => missing.push(node.clone()),
        }
    }
    if missing.is_empty() {
        return;
    }

    let texts: Vec<String> = missing.iter().map(|n| n.content.clone()).collect();
    let embeddings = llm.embed_batch(&texts).await;
    for (node, embedding) in missing.into_iter().zip(embeddings) {
        if let Some(embedding) = embedding {
            vectors.add_node(node.id, embedding.clone());
            let _ = graph.set_node_embedding(&node.id, embedding);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_auto_transfer_loop(
    short_term: Arc<ShortTermManager>,
    long_term: Arc<LongTermManager>,
    persistence: Arc<PersistenceManager>,
    graph: Arc<GraphStore>,
    base_interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
    wakeup: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let occupancy = short_term.occupancy().await;
            let interval_secs = if occupancy >= 0.8 {
                2
            } else if occupancy >= 0.5 {
                5
            } else if occupancy >= 0.3 {
                10
            } else if occupancy >= 0.1 {
                15
            } else {
                base_interval_secs
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                _ = wakeup.notified() => {}
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }

            if short_term.is_full().await {
                let stms = short_term.get_memories_for_transfer().await;
                let stats = long_term.transfer_from_short_term(stms).await;
                short_term.clear_transferred_memories(&stats.transferred_memory_ids).await;
                if let Err(e) = persistence.save_short_term(short_term.snapshot().await).await {
                    warn!("auto-transfer short-term save failed: {e}");
                }
                if let Err(e) = persistence.save_graph(&graph).await {
                    warn!("auto-transfer graph save failed: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlmClient;

    #[tokio::test]
    async fn manual_transfer_is_noop_when_not_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(4));

        let engine = MemoryEngine::new(config, llm).await.unwrap();
        let stats = engine.manual_transfer().await.unwrap();
        assert_eq!(stats.processed, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn add_message_forms_block_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.perceptual.block_size = 1;
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(4));

        let engine = MemoryEngine::new(config, llm).await.unwrap();
        engine
            .add_message(Message {
                user_id: "u1".into(),
                user_name: "alice".into(),
                platform: "test".into(),
                chat_id: "c1".into(),
                timestamp: chrono::Utc::now(),
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(engine.perceptual.len().await, 1);
        engine.shutdown().await.unwrap();
    }
}
