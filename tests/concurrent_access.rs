//! Integration tests for concurrent use of one store: writes made while a
//! query stream is open, and racing ingests of the same entry.
//!
//! Each scenario runs against an in-memory store and a WAL file store.

use feedstore::storage::{
    Database, EntryFilter, EntryOrder, FeedSelector, IngestEntry, IngestFeed,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::time::Duration;

/// Fresh database file under the temp dir, removing leftovers of earlier runs.
fn temp_db_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "feedstore_{}_{}.db",
        name,
        std::process::id()
    ));
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
    path
}

async fn open_backends(name: &str) -> Vec<(&'static str, Database)> {
    let path = temp_db_path(name);
    vec![
        ("memory", Database::open(":memory:").await.unwrap()),
        (
            "file",
            Database::open(path.to_str().unwrap()).await.unwrap(),
        ),
    ]
}

async fn add_feed(db: &Database) -> i64 {
    db.ingest_feed(&IngestFeed {
        url: "https://example.com/rss".to_string(),
        title: "Example".to_string(),
        ..IngestFeed::default()
    })
    .await
    .unwrap()
}

fn entry(guid: &str, updated: i64) -> IngestEntry {
    IngestEntry {
        guid: guid.to_string(),
        title: Some(format!("Title {}", guid)),
        updated: Some(updated),
        ..IngestEntry::default()
    }
}

// ============================================================================
// Writes During Iteration
// ============================================================================

#[tokio::test]
async fn test_write_while_iterating_does_not_block() {
    for (backend, db) in open_backends("write_while_iterating").await {
        let feed_id = add_feed(&db).await;
        let batch: Vec<IngestEntry> = (0..200).map(|n| entry(&format!("e{}", n), n)).collect();
        db.ingest_entries(feed_id, &batch).await.unwrap();

        let mut rows = db.query_entries(
            FeedSelector::All,
            &EntryFilter::default(),
            EntryOrder::default(),
        );
        let first = rows.next_row().await.unwrap().unwrap();

        let written = tokio::time::timeout(
            Duration::from_secs(10),
            db.mark_entry_read(first.id, true),
        )
        .await;
        assert!(
            matches!(written, Ok(Ok(1))),
            "{}: write while iterating -> {:?}",
            backend,
            written
        );

        let rest = rows.collect_all().await.unwrap();
        assert_eq!(rest.len(), 199, "{}", backend);
        assert!(db.get_entry(first.id).await.unwrap().unwrap().read, "{}", backend);
        db.close().await;
    }
}

#[tokio::test]
async fn test_batch_while_iterating_does_not_block() {
    for (backend, db) in open_backends("batch_while_iterating").await {
        let feed_id = add_feed(&db).await;
        let batch: Vec<IngestEntry> = (0..150).map(|n| entry(&format!("e{}", n), n)).collect();
        db.ingest_entries(feed_id, &batch).await.unwrap();

        let mut rows = db.query_entries(
            FeedSelector::Feed(feed_id),
            &EntryFilter::default(),
            EntryOrder::DateAscending,
        );
        rows.next_row().await.unwrap().unwrap();

        let more: Vec<IngestEntry> = (150..160).map(|n| entry(&format!("e{}", n), n)).collect();
        let ingested =
            tokio::time::timeout(Duration::from_secs(10), db.ingest_entries(feed_id, &more)).await;
        assert!(ingested.is_ok(), "{}: ingest while iterating timed out", backend);
        assert_eq!(ingested.unwrap().unwrap().new, 10, "{}", backend);

        // The open stream finishes without error whatever snapshot it saw
        rows.collect_all().await.unwrap();
        db.close().await;
    }
}

// ============================================================================
// Racing Ingests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_of_same_guid_yields_one_entry() {
    for (backend, db) in open_backends("concurrent_ingest").await {
        let feed_id = add_feed(&db).await;

        let tasks: Vec<_> = (0..16)
            .map(|n| {
                let db = db.clone();
                tokio::spawn(async move { db.ingest_entry(feed_id, &entry("same", n)).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(id) => ids.push(id),
                Err(e) => panic!("{}: concurrent ingest failed: {}", backend, e),
            }
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1, "{}: distinct ids {:?}", backend, ids);

        let stored = db
            .query_entries(
                FeedSelector::Feed(feed_id),
                &EntryFilter::default(),
                EntryOrder::default(),
            )
            .collect_all()
            .await
            .unwrap();
        assert_eq!(stored.len(), 1, "{}", backend);
        assert_eq!(stored[0].id, ids[0], "{}", backend);
        db.close().await;
    }
}
