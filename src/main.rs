use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use feedstore::config::Config;
use feedstore::storage::{
    Address, Database, EntryFilter, EntryOrder, FeedFilter, FeedOrder, FeedOverlayPatch,
    FeedSelector, IngestFeed, StoreError,
};

/// Get the config directory path (~/.config/feedstore/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedstore"))
}

/// Accepts unix seconds or an RFC 3339 timestamp.
fn parse_time(raw: &str) -> Result<i64, String> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .map_err(|e| format!("expected unix seconds or RFC 3339 time: {}", e))
}

#[derive(Parser, Debug)]
#[command(name = "feedstore", about = "Inspect and edit a local feed store")]
struct Args {
    /// Database file (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Config file (default: ~/.config/feedstore/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List feeds from the merged view
    Feeds {
        /// Include hidden feeds
        #[arg(long)]
        hidden: bool,
        /// Only feeds with unread entries
        #[arg(long)]
        unread: bool,
    },
    /// List entries from the merged view
    Entries {
        /// Feed id, "all" or "starred"
        #[arg(long, default_value = "all")]
        feed: FeedSelector,
        #[arg(long)]
        unread: bool,
        /// Only entries whose read state awaits reconciliation
        #[arg(long)]
        pending: bool,
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,
        #[arg(long, default_value = "date-desc")]
        order: EntryOrder,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Read any merged address, e.g. `feeds/3/entries` or `sync-log`
    Get { address: Address },
    /// Register a feed url (or refresh its title)
    AddFeed {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Mark an entry read (or unread with --unread)
    MarkRead {
        entry_id: i64,
        #[arg(long)]
        unread: bool,
    },
    /// Mark every unread entry of a collection read
    MarkAllRead {
        #[arg(long, default_value = "all")]
        feed: FeedSelector,
    },
    /// Star an entry (or unstar with --off)
    Star {
        entry_id: i64,
        #[arg(long)]
        off: bool,
    },
    /// Set a feed's custom title; omit the title to clear it
    RenameFeed { feed_id: i64, title: Option<String> },
    /// Hide a feed from listings (or show it again with --show)
    HideFeed {
        feed_id: i64,
        #[arg(long)]
        show: bool,
    },
    /// List entries with unconfirmed read state
    PendingRead,
    /// Confirm all pending read flags
    CommitRead,
    /// Show poll history
    SyncLog {
        #[arg(long)]
        feed: Option<i64>,
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), value).context("Failed to write output")?;
    println!();
    Ok(())
}

#[derive(Serialize)]
struct Affected {
    affected: u64,
}

async fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Feeds { hidden, unread } => {
            let filter = FeedFilter {
                include_hidden: hidden,
                with_unread_only: unread,
                ..FeedFilter::default()
            };
            let feeds = db.query_feeds(&filter, FeedOrder::Title).collect_all().await?;
            print_json(&feeds)
        }
        Command::Entries {
            feed,
            unread,
            pending,
            since,
            order,
            limit,
        } => {
            let filter = EntryFilter {
                unread_only: unread,
                pending_only: pending,
                updated_since: since,
                limit,
                ..EntryFilter::default()
            };
            let entries = db.query_entries(feed, &filter, order).collect_all().await?;
            print_json(&entries)
        }
        Command::Get { address } => {
            let result = db
                .query(&address)
                .await
                .with_context(|| format!("Failed to read {}", address))?;
            print_json(&result)
        }
        Command::AddFeed { url, title } => {
            let id = db
                .ingest_feed(&IngestFeed {
                    url,
                    title,
                    ..IngestFeed::default()
                })
                .await
                .context("Failed to add feed")?;
            print_json(&db.get_feed(id).await?)
        }
        Command::MarkRead { entry_id, unread } => {
            let affected = db.mark_entry_read(entry_id, !unread).await?;
            print_json(&Affected { affected })
        }
        Command::MarkAllRead { feed } => {
            let affected = db.mark_all_read(feed).await?;
            print_json(&Affected { affected })
        }
        Command::Star { entry_id, off } => {
            let affected = db.set_entry_starred(entry_id, !off).await?;
            print_json(&Affected { affected })
        }
        Command::RenameFeed { feed_id, title } => {
            let affected = db.set_feed_custom_title(feed_id, title.as_deref()).await?;
            print_json(&Affected { affected })
        }
        Command::HideFeed { feed_id, show } => {
            let affected = db
                .set_feed_overlay(feed_id, &FeedOverlayPatch::hidden(!show))
                .await?;
            print_json(&Affected { affected })
        }
        Command::PendingRead => print_json(&db.pending_read_changes().await?),
        Command::CommitRead => {
            let confirmed = db
                .confirm_read_flags()
                .await
                .context("Failed to commit read flags")?;
            println!("Confirmed {} read flag(s)", confirmed);
            Ok(())
        }
        Command::SyncLog { feed, since } => print_json(&db.query_sync_log(feed, since).await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => {
            std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
            config.database_path_or(&config_dir)
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let db = match Database::open_with(db_path_str, &config.store_options()).await {
        Ok(db) => db,
        Err(StoreError::InstanceLocked) => {
            eprintln!(
                "Error: The feed store at {} is locked by another process. Please close it and try again.",
                db_path.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let result = run(&db, args.command).await;
    db.close().await;
    result
}
