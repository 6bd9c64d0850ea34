//! Staging database overview.
//!
//! Row counts per staging table and the most recent runs from the
//! `sync_runs` ledger. Used by `rentsync stats` to check that imports and
//! exports are landing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::staging::StagingStore;

/// Runs shown in the ledger section.
const RECENT_RUNS: i64 = 20;

/// One entity row of a recorded run.
struct RunRow {
    flow: String,
    entity: String,
    started_at: String,
    added: i64,
    updated: i64,
    deleted: i64,
    failed: i64,
    stale_kept: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = StagingStore::new(pool.clone());

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("rentsync: staging database");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  {:<20} {:>8}", "TABLE", "ROWS");
    println!("  {}", "-".repeat(29));
    for table in &config.staging.tables {
        let count = store.count(table).await?;
        println!("  {:<20} {:>8}", table, count);
    }

    let rows = sqlx::query(
        r#"
        SELECT flow, entity, started_at, added, updated, deleted, failed, stale_kept
        FROM sync_runs
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(RECENT_RUNS)
    .fetch_all(&pool)
    .await?;

    let runs: Vec<RunRow> = rows
        .iter()
        .map(|row| RunRow {
            flow: row.get("flow"),
            entity: row.get("entity"),
            started_at: row.get("started_at"),
            added: row.get("added"),
            updated: row.get("updated"),
            deleted: row.get("deleted"),
            failed: row.get("failed"),
            stale_kept: row.get("stale_kept"),
        })
        .collect();

    println!();
    if runs.is_empty() {
        println!("  No runs recorded yet.");
    } else {
        println!("  Recent runs:");
        println!(
            "  {:<8} {:<18} {:>6} {:>6} {:>6} {:>6} {:>6}   {}",
            "FLOW", "ENTITY", "ADDED", "UPD", "DEL", "FAIL", "STALE", "STARTED"
        );
        println!("  {}", "-".repeat(82));
        for r in &runs {
            let started = chrono::DateTime::parse_from_rfc3339(&r.started_at)
                .map(|dt| format_ts_relative(dt.timestamp()))
                .unwrap_or_else(|_| r.started_at.clone());
            println!(
                "  {:<8} {:<18} {:>6} {:>6} {:>6} {:>6} {:>6}   {}",
                r.flow, r.entity, r.added, r.updated, r.deleted, r.failed, r.stale_kept, started
            );
        }
    }
    println!();

    pool.close().await;
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
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
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now - 5), "just now");
        assert_eq!(format_ts_relative(now - 3 * 3600 - 10), "3 hours ago");
        assert_eq!(format_ts_relative(now - 86400 - 10), "1 day ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
