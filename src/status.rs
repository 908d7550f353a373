//! Index status overview.
//!
//! Summarizes what is indexed: the repo state the last run reached, chunk,
//! file, and vector counts, and the embedding model the vectors came from.
//! Used by `chx status`.

use anyhow::Result;
use chrono::{DateTime, Utc};

use code_harness_core::state::RepoState;
use code_harness_core::store::{ChunkRepository, FileRepository};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::sqlite_store::SqliteIndex;

pub async fn run_status(config: &Config) -> Result<()> {
    let store = SqliteIndex::open(config).await?;

    let state = RepoState::load(&store).await?;
    let chunks = ChunkRepository::count(&store).await?;
    let files = FileRepository::count(&store).await?;
    let vectors = store.vector_count().await?;
    let fingerprints = store.vector_fingerprints().await?;
    let by_lang = store.chunks_by_lang().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Code Harness Index Status");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Last tree:   {}",
        state
            .last_tree_sha
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never indexed".to_string())
    );
    println!(
        "  Mode:        {}",
        state
            .last_sync_mode
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Indexed:     {}",
        state
            .indexed_at
            .map(format_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Model:       {}",
        state.model_fingerprint.as_deref().unwrap_or("-")
    );
    if let (Some(stored), Ok(embedder)) = (
        state.model_fingerprint.as_deref(),
        create_embedder(&config.embedding),
    ) {
        let current = embedder.fingerprint();
        if stored != current {
            println!(
                "  WARNING:     configured model is {}; run `chx index --force` to rebuild",
                current
            );
        }
    }
    println!();
    println!("  Files:       {}", files);
    println!("  Chunks:      {}", chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        vectors,
        chunks,
        if chunks > 0 {
            (vectors.min(chunks) * 100) / chunks
        } else {
            0
        }
    );

    if fingerprints.len() > 1 {
        println!();
        println!("  Vectors by model:");
        for (fingerprint, n) in &fingerprints {
            println!("    {:<48} {:>8}", fingerprint, n);
        }
    }

    if !by_lang.is_empty() {
        println!();
        println!("  By language:");
        println!("  {:<16} {:>8}", "LANG", "CHUNKS");
        println!("  {}", "-".repeat(25));
        for (lang, n) in &by_lang {
            println!("  {:<16} {:>8}", lang, n);
        }
    }

    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        ts.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_relative() {
        let now = Utc::now();
        assert_eq!(format_relative(now), "just now");
        assert_eq!(format_relative(now - Duration::minutes(1)), "1 min ago");
        assert_eq!(format_relative(now - Duration::hours(3)), "3 hours ago");
        assert_eq!(format_relative(now - Duration::days(2)), "2 days ago");
    }
}
