//! Layered configuration for the memory engine.
//!
//! Loaded `config::Config::default() -> memory.toml (if present) -> environment`,
//! matching the `MEMORY__SECTION__FIELD` env-var convention of the `config`
//! crate. Every field has a default matching spec.md §6.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub enable: bool,
    pub data_dir: PathBuf,
    pub embedding_dimension: usize,
    pub perceptual: PerceptualConfig,
    pub short_term: ShortTermConfig,
    pub long_term: LongTermConfig,
    pub judge: JudgeConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            data_dir: PathBuf::from("data/memory"),
            embedding_dimension: 768,
            perceptual: PerceptualConfig::default(),
            short_term: ShortTermConfig::default(),
            long_term: LongTermConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Load configuration layered over defaults: an optional
    /// `<data_dir-independent>` `memory.toml` file in the current directory,
    /// then environment variables prefixed `MEMORY__`.
    pub fn load() -> Result<Self, crate::error::MemoryError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults).map_err(|e| {
                crate::error::MemoryError::Config(format!("default config serialization: {e}"))
            })?)
            .add_source(config::File::with_name("memory").required(false))
            .add_source(config::Environment::with_prefix("MEMORY").separator("__"));

        let built = builder
            .build()
            .map_err(|e| crate::error::MemoryError::Config(e.to_string()))?;

        built
            .try_deserialize()
            .map_err(|e| crate::error::MemoryError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptualConfig {
    pub max_blocks: usize,
    pub block_size: usize,
    pub activation_threshold: u32,
    pub recall_top_k: usize,
    pub recall_similarity_threshold: f32,
}

impl Default for PerceptualConfig {
    fn default() -> Self {
        Self {
            max_blocks: 50,
            block_size: 5,
            activation_threshold: 3,
            recall_top_k: 5,
            recall_similarity_threshold: 0.5,
        }
    }
}

/// Which rule triggers short-term overflow handling (spec.md §4.F /
/// §9 Open Questions — both named strategies are implemented, selected here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Evict oldest sub-threshold entries to keep |F| <= 0.9 * max_memories.
    EvictSubThreshold,
    /// Transfer the entire short-term set whenever it is full.
    TransferAllWhenFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermConfig {
    pub max_memories: usize,
    pub transfer_importance_threshold: f32,
    pub overflow_strategy: OverflowStrategy,
    pub enable_force_cleanup: bool,
    pub cleanup_keep_ratio: f32,
    pub decide_top_k: usize,
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            max_memories: 30,
            transfer_importance_threshold: 0.6,
            overflow_strategy: OverflowStrategy::EvictSubThreshold,
            enable_force_cleanup: true,
            cleanup_keep_ratio: 0.9,
            decide_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermConfig {
    pub batch_size: usize,
    pub search_top_k: usize,
    pub decay_factor: f64,
    pub auto_transfer_interval_secs: u64,
    pub similarity_cache_cap: usize,
    pub max_expansion_per_seed: usize,
    pub op_retry_limit: u32,
    pub embed_batch_size: usize,
}

impl Default for LongTermConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            search_top_k: 5,
            decay_factor: 0.95,
            auto_transfer_interval_secs: 600,
            similarity_cache_cap: 100,
            max_expansion_per_seed: 2,
            op_retry_limit: 2,
            embed_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub confidence_threshold: f32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
        }
    }
}
