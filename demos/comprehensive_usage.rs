//! Comprehensive example of the memory engine.
//!
//! Demonstrates:
//! - Initializing the engine over a temp data directory
//! - Ingesting a chat stream and watching blocks form in the perceptual tier
//! - Searching memories with and without the judge
//! - Forcing a short-term -> long-term transfer and inspecting the graph
//! - Running activation decay
//!
//! Uses `MockLlmClient` so the example runs without a live embedding/LLM
//! endpoint; swap in `HttpLlmClient::new(base_url, model_name)` to point at a
//! real Ollama-style server.

use memory_engine::config::MemoryConfig;
use memory_engine::types::Message;
use memory_engine::{LlmClient, MemoryEngine, MockLlmClient};
use std::sync::Arc;
use std::time::Duration;

fn message(user: &str, chat_id: &str, text: &str) -> Message {
    Message {
        user_id: user.to_string(),
        user_name: user.to_string(),
        platform: "demo".to_string(),
        chat_id: chat_id.to_string(),
        timestamp: chrono::Utc::now(),
        text: text.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Memory Engine - Comprehensive Example");
    println!("======================================\n");

    println!("1. Initializing engine...");
    let dir = tempfile::tempdir()?;
    let mut config = MemoryConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.perceptual.block_size = 3;
    config.short_term.max_memories = 4;

    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(8));
    llm.set_canned_response(
        r#"{"content": "alice prefers tea over coffee", "subject": "alice", "topic": "preferences",
            "object": "tea", "memory_type": "fact", "importance": 0.75, "attributes": {}}"#,
    );
    let engine = MemoryEngine::new(config, llm.clone()).await?;
    println!("   engine ready over {}\n", dir.path().display());

    println!("2. Ingesting a chat stream...");
    let chat_id = "chat-1";
    for text in [
        "alice: I've been drinking a lot of tea lately",
        "bob: nice, what kind?",
        "alice: mostly green tea, it helps me focus",
    ] {
        engine.add_message(message("alice", chat_id, text)).await?;
    }
    println!(
        "   perceptual blocks: {}, short-term: {}, long-term: {}\n",
        engine.perceptual_block_count().await,
        engine.short_term_memory_count().await,
        engine.long_term_memory_count(),
    );

    println!("3. Searching without the judge (direct long-term search)...");
    let result = engine.search_memories("what does alice drink", false, &[]).await;
    println!(
        "   perceptual hits: {}, short-term hits: {}, long-term hits: {}\n",
        result.perceptual_blocks.len(),
        result.short_term_memories.len(),
        result.long_term_memories.len(),
    );

    println!("4. Filling short-term to force a transfer...");
    for i in 0..4 {
        for text in [
            format!("alice: fact number {i} about my preferences"),
            format!("bob: got it, noted fact {i}"),
            format!("alice: one more detail about fact {i}"),
        ] {
            engine.add_message(message("alice", chat_id, &text)).await?;
        }
        // Give the retrieval pipeline's background promotion a beat to run;
        // in production this happens as a side effect of search_memories.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = engine.manual_transfer().await?;
    println!(
        "   manual_transfer: processed={}, created={}, merged={}, failed={}\n",
        stats.processed, stats.created, stats.merged, stats.failed
    );
    println!(
        "   short-term now: {}, long-term now: {}\n",
        engine.short_term_memory_count().await,
        engine.long_term_memory_count(),
    );

    println!("5. Applying activation decay...");
    engine.apply_long_term_decay()?;
    println!("   decay applied across {} long-term memories\n", engine.long_term_memory_count());

    println!("6. Shutting down (flushes embeddings, saves all three tiers)...");
    engine.shutdown().await?;
    println!("   done.");

    Ok(())
}
