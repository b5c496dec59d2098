//! Operator utility for the persistent cache.
//!
//! ```text
//! cache-admin stats
//! cache-admin integrity
//! cache-admin clear [namespace|all] [older-than-days]
//! cache-admin forget-location <location>
//! ```

use anyhow::Context;
use dotenvy::dotenv;
use leadscout::cache_store::{CacheStore, ClearFilter, Namespace};
use leadscout::config::Config;
use leadscout::db::Database;
use leadscout::keys::geocode_key;
use std::env;
use std::time::Duration;

const USAGE: &str = "usage: cache-admin <stats | integrity | clear [namespace|all] [older-than-days] | forget-location <location>>";

fn print_stats_line(label: &str, count: i64, oldest: Option<String>, newest: Option<String>) {
    println!(
        "{:<16} {:>8}   oldest {}   newest {}",
        label,
        count,
        oldest.unwrap_or_else(|| "-".to_string()),
        newest.unwrap_or_else(|| "-".to_string())
    );
}

async fn stats(cache: &CacheStore) -> anyhow::Result<()> {
    let overview = cache.overview().await?;
    for stats in &overview.namespaces {
        print_stats_line(
            stats.namespace.as_str(),
            stats.count,
            stats.oldest.map(|t| t.to_rfc3339()),
            stats.newest.map(|t| t.to_rfc3339()),
        );
    }
    println!(
        "Estimated API calls saved: {}",
        overview.estimated_api_calls_saved
    );
    Ok(())
}

async fn integrity(cache: &CacheStore) -> anyhow::Result<bool> {
    let report = cache.integrity_check().await?;
    for (namespace, count) in &report.row_counts {
        let corrupt = report
            .corrupt_keys
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0);
        println!("{:<16} {:>8} rows, {} corrupt", namespace.as_str(), count, corrupt);
    }
    for (namespace, keys) in &report.corrupt_keys {
        for key in keys {
            println!("  corrupt {} entry: {}", namespace, key);
        }
    }
    Ok(report.is_clean())
}

async fn clear(cache: &CacheStore, args: &[String]) -> anyhow::Result<u64> {
    let namespace = match args.first().map(String::as_str) {
        None | Some("all") => None,
        Some(name) => Some(name.parse::<Namespace>().map_err(anyhow::Error::msg)?),
    };
    let filter = match args.get(1) {
        Some(days) => {
            let days: u64 = days
                .parse()
                .with_context(|| format!("older-than-days must be a whole number, got {}", days))?;
            ClearFilter::OlderThan(Duration::from_secs(days.saturating_mul(86_400)))
        }
        None => ClearFilter::All,
    };

    let deleted = match namespace {
        Some(namespace) => cache.clear(namespace, &filter).await?,
        None => cache.clear_all(&filter).await?,
    };
    Ok(deleted)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| Config::default().database_url);
    let db = Database::new(&database_url)
        .await
        .with_context(|| format!("Failed to open cache database {}", database_url))?;
    let cache = CacheStore::new(db.pool);

    match command.as_str() {
        "stats" => stats(&cache).await?,
        "integrity" => {
            if !integrity(&cache).await? {
                std::process::exit(1);
            }
        }
        "clear" => {
            let deleted = clear(&cache, &args[1..]).await?;
            println!("Deleted {} entries", deleted);
        }
        "forget-location" => {
            let location = args[1..].join(" ");
            if location.trim().is_empty() {
                anyhow::bail!("forget-location needs a location");
            }
            let deleted = cache
                .clear(Namespace::Search, &ClearFilter::Key(geocode_key(&location)))
                .await?;
            println!("Deleted {} geocode entries for '{}'", deleted, location.trim());
        }
        other => {
            eprintln!("unknown command: {}\n{}", other, USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}
