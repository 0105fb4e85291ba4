use std::env;

use verimirror::{CacheConfig, RemoteConfig, VerifiedChannel};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().format_timestamp_secs().init();

    println!("💾 verimirror - verified remote file mirror");
    println!("================================================\n");

    let data_dir = env::var("VERIMIRROR_CACHE_DIR").unwrap_or_else(|_| "./verimirror_data".to_string());
    let chunk_size = env::var("VERIMIRROR_CHUNK_SIZE")
        .ok()
        .and_then(|v| v.parse::<u64>().ok());
    let max_concurrent_fetches = env::var("VERIMIRROR_MAX_CONCURRENT_FETCHES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok());
    let remote_url = env::var("VERIMIRROR_REMOTE_URL").ok();

    println!("📋 Configuration:");
    println!("   Cache directory: {data_dir}");
    println!("   Chunk size: {:?}", chunk_size.unwrap_or(4 * 1024 * 1024));
    println!("   Max concurrent fetches: {:?}", max_concurrent_fetches.unwrap_or(8));
    println!("   Remote URL: {}", remote_url.as_deref().unwrap_or("(none set)"));
    println!();

    let Some(remote_url) = remote_url else {
        println!("⚠️  VERIMIRROR_REMOTE_URL not set; nothing to mirror. Exiting.");
        return Ok(());
    };

    let mut config = CacheConfig::new(&data_dir, RemoteConfig::from_env(remote_url));
    if let Some(chunk_size) = chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if let Some(max) = max_concurrent_fetches {
        config = config.with_max_concurrent_fetches(max);
    }

    println!("🔌 Opening verified channel...");
    let channel = VerifiedChannel::open(&config, "content").await?;
    println!("✅ Channel open. Logical size: {} bytes\n", channel.size());

    let read_len = std::cmp::min(channel.size(), 4096);
    println!("📥 Reading first {read_len} bytes...");
    let bytes = channel.read_at(0, read_len).await?;
    println!("✅ Read {} bytes, verified against the reference tree.", bytes.len());

    channel.close()?;
    Ok(())
}
