//! Store command - inspect the persisted expiration store

use crate::cli::args::{OutputFormat, StoreAction, StoreArgs};
use crate::config::{Config, ConfigManager};
use crate::error::CacheResult;
use crate::store::{ExpirationRecord, ExpirationStore};
use chrono::Utc;
use console::style;
use tracing::debug;

/// Execute the store command
pub async fn execute(args: StoreArgs, config: &Config) -> CacheResult<()> {
    let path = ConfigManager::store_path(config);
    debug!("Using expiration store at {}", path.display());

    if let StoreAction::Path = args.action {
        println!("{}", path.display());
        return Ok(());
    }

    let Some(store) = ConfigManager::open_store(config) else {
        println!(
            "{} Expiration store is disabled (store.enabled = false)",
            style("!").yellow()
        );
        return Ok(());
    };

    match args.action {
        StoreAction::List { format } => list_records(store.as_ref(), format).await,
        StoreAction::Gc => gc_records(store.as_ref()).await,
        StoreAction::Path => Ok(()),
    }
}

async fn list_records(store: &dyn ExpirationStore, format: OutputFormat) -> CacheResult<()> {
    let records = store.list().await?;
    let now = Utc::now().timestamp();

    match format {
        OutputFormat::Table => print_table(&records, now),
        OutputFormat::Json => print_json(&records, now)?,
        OutputFormat::Plain => {
            for record in &records {
                println!("{}", record.call_key);
            }
        }
    }

    Ok(())
}

fn print_table(records: &[ExpirationRecord], now: i64) {
    if records.is_empty() {
        println!("No expiration records found.");
        return;
    }

    println!("{:<40} {:<40} {:<20}", "CALL KEY", "STORAGE KEY", "EXPIRES");
    println!("{}", "-".repeat(100));

    for record in records {
        let expires = record
            .expires_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.expiration.to_string());
        let expires = if record.is_expired(now) {
            style(format!("{} (expired)", expires)).dim().to_string()
        } else {
            style(expires).green().to_string()
        };

        println!(
            "{:<40} {:<40} {}",
            truncate(&record.call_key, 40),
            truncate(&record.storage_key, 40),
            expires
        );
    }

    println!();
    println!("Total: {} record(s)", records.len());
}

fn print_json(records: &[ExpirationRecord], now: i64) -> CacheResult<()> {
    #[derive(serde::Serialize)]
    struct RecordJson<'a> {
        call_key: &'a str,
        storage_key: &'a str,
        expiration: i64,
        expired: bool,
    }

    let json: Vec<RecordJson<'_>> = records
        .iter()
        .map(|r| RecordJson {
            call_key: &r.call_key,
            storage_key: &r.storage_key,
            expiration: r.expiration,
            expired: r.is_expired(now),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn gc_records(store: &dyn ExpirationStore) -> CacheResult<()> {
    let removed = store.gc_expired(Utc::now().timestamp()).await?;

    if removed == 0 {
        println!("{} No expired records", style("✓").green());
    } else {
        println!(
            "{} Removed {} expired record(s)",
            style("✓").green(),
            removed
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
