//! JSON snapshot persistence for all three tiers.
//!
//! Grounded on the teacher's `context-preservation-engine::engine::persist_configuration`
//! atomic-write pattern (write to `.tmp`, `fs::rename` into place) generalized
//! to three per-tier files plus a `.bak` previous-generation copy, since this
//! pipeline has no database tier to delegate durability to (`database/backup.rs`
//! assumes Postgres and doesn't apply once the graph store is in-process).

use crate::error::{MemoryError, MemoryResult};
use crate::graph_store::GraphStore;
use crate::types::{Memory, MemoryBlock, MemoryEdge, MemoryNode, ShortTermMemory};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const GRAPH_FILE: &str = "graph_store.json";
const SHORT_TERM_FILE: &str = "short_term_memory.json";
const PERCEPTUAL_FILE: &str = "perceptual_blocks.json";

#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    memories: Vec<Memory>,
    nodes: Vec<MemoryNode>,
    edges: Vec<MemoryEdge>,
}

#[derive(Serialize, Deserialize)]
struct ShortTermSnapshot {
    memories: Vec<ShortTermMemory>,
}

#[derive(Serialize, Deserialize)]
struct PerceptualSnapshot {
    blocks: Vec<MemoryBlock>,
}

/// Owns the data directory; every save is atomic (tmp file + rename) and
/// keeps one `.bak` generation behind it.
pub struct PersistenceManager {
    data_dir: PathBuf,
}

impl PersistenceManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub async fn ensure_data_dir(&self) -> MemoryResult<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| MemoryError::Persistence(format!("create_dir_all failed: {e}")))
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Serialize `value` to `path` via a sibling `.tmp` file and an atomic
    /// rename, first rotating any existing file to `.bak`.
    async fn atomic_write<T: Serialize>(&self, path: &Path, value: &T) -> MemoryResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        let bak_path = path.with_extension("json.bak");

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| MemoryError::Persistence(format!("write {tmp_path:?} failed: {e}")))?;

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::copy(path, &bak_path).await {
                warn!("failed to rotate backup for {path:?}: {e}");
            }
        }

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| MemoryError::Persistence(format!("rename into {path:?} failed: {e}")))?;

        debug!("persisted {path:?} ({} bytes)", json.len());
        Ok(())
    }

    /// Read and deserialize `path`, falling back to the `.bak` generation if
    /// the primary file is missing or corrupt. Returns `None` if neither
    /// exists or parses, so the caller starts from an empty tier.
    async fn tolerant_read<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Option<T> {
        let bak_path = path.with_extension("json.bak");

        if let Ok(bytes) = tokio::fs::read(path).await {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Some(value),
                Err(e) => warn!("{path:?} is corrupt ({e}), falling back to backup"),
            }
        }

        match tokio::fs::read(&bak_path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    warn!("recovered {path:?} from {bak_path:?}");
                    Some(value)
                }
                Err(e) => {
                    warn!("backup {bak_path:?} is also corrupt ({e}); starting empty");
                    None
                }
            },
            Err(_) => None,
        }
    }

    pub async fn save_graph(&self, store: &GraphStore) -> MemoryResult<()> {
        let (memories, nodes, edges) = store.snapshot();
        let snapshot = GraphSnapshot {
            memories,
            nodes,
            edges,
        };
        self.atomic_write(&self.path_for(GRAPH_FILE), &snapshot).await
    }

    /// Load the graph tier. Node embeddings are carried as-is; the caller is
    /// responsible for seeding the vector store from the returned nodes
    /// (lazy embedding regeneration for nodes without one is a long-term
    /// manager concern, not persistence's).
    pub async fn load_graph(&self) -> GraphStore {
        match self.tolerant_read::<GraphSnapshot>(&self.path_for(GRAPH_FILE)).await {
            Some(snapshot) => GraphStore::from_parts(snapshot.memories, snapshot.nodes, snapshot.edges),
            None => GraphStore::new(),
        }
    }

    pub async fn save_short_term(&self, memories: Vec<ShortTermMemory>) -> MemoryResult<()> {
        let snapshot = ShortTermSnapshot { memories };
        self.atomic_write(&self.path_for(SHORT_TERM_FILE), &snapshot).await
    }

    pub async fn load_short_term(&self) -> Vec<ShortTermMemory> {
        self.tolerant_read::<ShortTermSnapshot>(&self.path_for(SHORT_TERM_FILE))
            .await
            .map(|s| s.memories)
            .unwrap_or_default()
    }

    pub async fn save_perceptual(&self, blocks: Vec<MemoryBlock>) -> MemoryResult<()> {
        let snapshot = PerceptualSnapshot { blocks };
        self.atomic_write(&self.path_for(PERCEPTUAL_FILE), &snapshot).await
    }

    pub async fn load_perceptual(&self) -> Vec<MemoryBlock> {
        self.tolerant_read::<PerceptualSnapshot>(&self.path_for(PERCEPTUAL_FILE))
            .await
            .map(|s| s.blocks)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    #[tokio::test]
    async fn round_trips_graph_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path());
        pm.ensure_data_dir().await.unwrap();

        let store = GraphStore::new();
        let memory = Memory::new(MemoryType::Fact, 0.7);
        let id = store.add_memory(memory).unwrap();

        pm.save_graph(&store).await.unwrap();
        let loaded = pm.load_graph().await;
        assert!(loaded.get_memory_by_id(&id).is_some());
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path());
        pm.ensure_data_dir().await.unwrap();

        pm.save_short_term(vec![]).await.unwrap();
        let path = dir.path().join(SHORT_TERM_FILE);
        // second save rotates the first good copy to .bak
        let mem = ShortTermMemory {
            id: uuid::Uuid::new_v4(),
            content: "x".into(),
            subject: "s".into(),
            topic: "t".into(),
            object: "o".into(),
            memory_type: MemoryType::Fact,
            importance: 0.5,
            attributes: Default::default(),
            embedding: None,
            source_block_ids: vec![],
            created_at: chrono::Utc::now(),
            last_accessed_at: chrono::Utc::now(),
            access_count: 0,
        };
        pm.save_short_term(vec![mem]).await.unwrap();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let loaded = pm.load_short_term().await;
        assert_eq!(loaded.len(), 0, "should have recovered empty backup generation");
    }

    #[tokio::test]
    async fn missing_files_yield_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path());
        let loaded = pm.load_perceptual().await;
        assert!(loaded.is_empty());
    }
}
