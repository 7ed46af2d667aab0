use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::address::{route, Address, FeedSelector, Route, Target};
use super::query::Clauses;
use super::schema::Database;
use super::types::{
    EntryId, FeedId, FeedPollUpdate, IngestEntry, IngestFeed, IngestSummary, StoreError,
};
use crate::notify::CollectionId;
use crate::util::validate_feed_url;

/// Outcome of upserting one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryUpsert {
    pub id: EntryId,
    /// A new remote row was inserted
    pub created: bool,
    /// The entry already existed and is starred
    pub starred: bool,
}

impl EntryUpsert {
    /// Collections whose contents change when this entry is written.
    pub(crate) fn touched(&self, feed_id: FeedId) -> Vec<CollectionId> {
        let mut touched = vec![
            CollectionId::Entries(FeedSelector::Feed(feed_id)),
            CollectionId::Entries(FeedSelector::All),
            CollectionId::Feeds,
        ];
        if self.starred {
            touched.push(CollectionId::Entries(FeedSelector::Starred));
        }
        touched
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Connection-level Writes
// ============================================================================

/// Upsert the remote part of a feed keyed by its url.
pub(crate) async fn ingest_feed_in(
    conn: &mut SqliteConnection,
    feed: &IngestFeed,
) -> Result<FeedId, StoreError> {
    let url = validate_feed_url(&feed.url)
        .map_err(|e| StoreError::ConstraintViolation(format!("feed url '{}': {}", feed.url, e)))?;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO feed_sync (url, title, link, language, favicon_url)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            title = excluded.title,
            link = COALESCE(excluded.link, link),
            language = COALESCE(excluded.language, language),
            favicon_url = COALESCE(excluded.favicon_url, favicon_url)
        RETURNING id
        "#,
    )
    .bind(url)
    .bind(&feed.title)
    .bind(&feed.link)
    .bind(&feed.language)
    .bind(&feed.favicon_url)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Upsert one entry by (feed, guid).
///
/// The existing row is updated first; `update_time` only moves when one of
/// the remote fields actually changed. The insert path fires the trigger
/// that creates the overlay row.
pub(crate) async fn ingest_entry_in(
    conn: &mut SqliteConnection,
    feed_id: FeedId,
    entry: &IngestEntry,
    now: i64,
) -> Result<EntryUpsert, StoreError> {
    if entry.guid.trim().is_empty() {
        return Err(StoreError::ConstraintViolation(format!(
            "entry of feed {} has an empty guid",
            feed_id
        )));
    }

    // Assignments see the pre-update row, so the CASE compares old values
    let existing: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE entry_sync SET
            title = ?3,
            link = ?4,
            content = ?5,
            author = ?6,
            updated = ?7,
            update_time = CASE
                WHEN title IS ?3 AND link IS ?4 AND content IS ?5
                     AND author IS ?6 AND updated IS ?7
                THEN update_time
                ELSE ?8
            END
        WHERE feed_id = ?1 AND guid = ?2
        RETURNING id
        "#,
    )
    .bind(feed_id)
    .bind(&entry.guid)
    .bind(&entry.title)
    .bind(&entry.link)
    .bind(&entry.content)
    .bind(&entry.author)
    .bind(entry.updated)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = existing {
        let (starred,): (bool,) = sqlx::query_as("SELECT flag_star FROM entry_user WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        return Ok(EntryUpsert {
            id,
            created: false,
            starred,
        });
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO entry_sync
            (feed_id, guid, title, link, content, author, updated, insert_time, update_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(feed_id)
    .bind(&entry.guid)
    .bind(&entry.title)
    .bind(&entry.link)
    .bind(&entry.content)
    .bind(&entry.author)
    .bind(entry.updated)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(EntryUpsert {
        id,
        created: true,
        starred: false,
    })
}

/// Write poll metadata to the remote part of every feed `route` selects.
pub(crate) async fn update_feed_remote_in(
    conn: &mut SqliteConnection,
    route: &Route,
    update: &FeedPollUpdate,
) -> Result<u64, StoreError> {
    if update.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE feed_sync SET ");
    {
        let mut assignments = builder.separated(", ");
        if let Some(title) = &update.title {
            assignments.push("title = ");
            assignments.push_bind_unseparated(title.clone());
        }
        if let Some(link) = &update.link {
            assignments.push("link = ");
            assignments.push_bind_unseparated(link.clone());
        }
        if let Some(language) = &update.language {
            assignments.push("language = ");
            assignments.push_bind_unseparated(language.clone());
        }
        if let Some(favicon_url) = &update.favicon_url {
            assignments.push("favicon_url = ");
            assignments.push_bind_unseparated(favicon_url.clone());
        }
        if let Some(time) = update.last_poll_time {
            assignments.push("last_poll_time = ");
            assignments.push_bind_unseparated(time);
        }
        if let Some(error) = &update.last_poll_error {
            assignments.push("last_poll_error = ");
            assignments.push_bind_unseparated(error.clone());
        }
        if let Some(etag) = &update.http_etag {
            assignments.push("http_etag = ");
            assignments.push_bind_unseparated(etag.clone());
        }
        if let Some(last_modified) = &update.http_last_modified {
            assignments.push("http_last_modified = ");
            assignments.push_bind_unseparated(last_modified.clone());
        }
    }

    let mut clauses = Clauses::new();
    route.push_predicate(&mut builder, &mut clauses);

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Database Operations
// ============================================================================

impl Database {
    /// Upsert the remote part of a feed by url and return its stable id.
    ///
    /// A new feed gets an empty overlay row. Re-ingesting an existing url
    /// refreshes its title and keeps any known link, language and favicon
    /// the new data lacks. Overlay fields are never touched.
    ///
    /// # Errors
    ///
    /// `StoreError::ConstraintViolation` if the url is not an http(s) url.
    pub async fn ingest_feed(&self, feed: &IngestFeed) -> Result<FeedId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = ingest_feed_in(&mut *tx, feed).await?;
        tx.commit().await?;

        tracing::debug!(feed_id = id, url = %feed.url, "Ingested feed");
        self.notifier.notify(CollectionId::Feeds);
        Ok(id)
    }

    /// Upsert a single entry by (feed, guid) and return its id.
    ///
    /// Idempotent: ingesting the same data twice yields the same id and
    /// leaves the row unchanged. Overlay fields are never touched. Does not
    /// notify; use [`Database::ingest_entries`] or a batch for that.
    ///
    /// # Errors
    ///
    /// `StoreError::ConstraintViolation` for an empty guid or unknown feed.
    pub async fn ingest_entry(
        &self,
        feed_id: FeedId,
        entry: &IngestEntry,
    ) -> Result<EntryId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let upsert = ingest_entry_in(&mut *tx, feed_id, entry, now()).await?;
        tx.commit().await?;
        Ok(upsert.id)
    }

    /// Ingest one poll worth of entries for a feed in a single transaction.
    ///
    /// Either every entry is written or none is. Observers of the feed, of
    /// the "all" collection and of the feed listing are notified after the
    /// commit; observers of "starred" too when a starred entry changed.
    pub async fn ingest_entries(
        &self,
        feed_id: FeedId,
        entries: &[IngestEntry],
    ) -> Result<IngestSummary, StoreError> {
        if entries.is_empty() {
            return Ok(IngestSummary::default());
        }

        let now = now();
        let mut summary = IngestSummary::default();
        let mut touched = Vec::new();

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let upsert = ingest_entry_in(&mut *tx, feed_id, entry, now).await?;
            summary.total += 1;
            if upsert.created {
                summary.new += 1;
            }
            touched.extend(upsert.touched(feed_id));
        }
        tx.commit().await?;

        tracing::info!(
            feed_id,
            total = summary.total,
            new = summary.new,
            "Ingested entries"
        );
        self.notifier.notify_all(touched);
        Ok(summary)
    }

    /// Record poll metadata on the remote part of the addressed feed(s).
    ///
    /// Fields left `None` in `update` keep their stored value.
    ///
    /// # Errors
    ///
    /// `StoreError::UnroutableAddress` unless `address` is a remote feed
    /// address such as [`Address::feed_remote`].
    pub async fn update_feed_remote(
        &self,
        address: &Address,
        update: &FeedPollUpdate,
    ) -> Result<u64, StoreError> {
        let route = route(address)?.require(Target::FeedRemote, address)?;

        let mut tx = self.pool.begin().await?;
        let affected = update_feed_remote_in(&mut *tx, &route, update).await?;
        tx.commit().await?;

        if affected > 0 {
            tracing::debug!(%address, affected, "Updated feed poll metadata");
            self.notifier.notify(CollectionId::Feeds);
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use crate::notify::CollectionId;
    use crate::storage::{
        Address, Database, EntryFilter, EntryOrder, FeedPollUpdate, FeedSelector, IngestEntry,
        IngestFeed, StoreError,
    };

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn feed(url: &str, title: &str) -> IngestFeed {
        IngestFeed {
            url: url.to_string(),
            title: title.to_string(),
            ..IngestFeed::default()
        }
    }

    fn entry(guid: &str, title: &str) -> IngestEntry {
        IngestEntry {
            guid: guid.to_string(),
            title: Some(title.to_string()),
            updated: Some(1_700_000_000),
            ..IngestEntry::default()
        }
    }

    async fn entry_count(db: &Database) -> usize {
        db.query_entries(FeedSelector::All, &EntryFilter::default(), EntryOrder::default())
            .collect_all()
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_ingest_feed_upserts_by_url() {
        let db = test_db().await;
        let first = db
            .ingest_feed(&feed("https://example.com/rss", "Old"))
            .await
            .unwrap();
        let second = db
            .ingest_feed(&feed("https://example.com/rss", "New"))
            .await
            .unwrap();

        assert_eq!(first, second);
        let stored = db.get_feed(first).await.unwrap().unwrap();
        assert_eq!(stored.title, "New");
        assert_eq!(stored.remote_title, "New");
    }

    #[tokio::test]
    async fn test_ingest_feed_keeps_known_link() {
        let db = test_db().await;
        let mut with_link = feed("https://example.com/rss", "A");
        with_link.link = Some("https://example.com".to_string());
        let id = db.ingest_feed(&with_link).await.unwrap();
        db.ingest_feed(&feed("https://example.com/rss", "A")).await.unwrap();

        let stored = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(stored.link.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn test_ingest_feed_rejects_bad_url() {
        let db = test_db().await;
        let result = db.ingest_feed(&feed("ftp://example.com/rss", "A")).await;
        assert!(matches!(result, Err(StoreError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn test_ingest_entry_is_idempotent() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();

        let first = db.ingest_entry(feed_id, &entry("g1", "Hello")).await.unwrap();
        let before = db.get_entry(first).await.unwrap().unwrap();
        let second = db.ingest_entry(feed_id, &entry("g1", "Hello")).await.unwrap();
        let after = db.get_entry(second).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(before, after);
        assert_eq!(entry_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_reingest_updates_remote_keeps_overlay() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();
        let id = db.ingest_entry(feed_id, &entry("g1", "Draft")).await.unwrap();
        db.mark_entry_read(id, true).await.unwrap();
        db.set_entry_starred(id, true).await.unwrap();

        let again = db.ingest_entry(feed_id, &entry("g1", "Final")).await.unwrap();
        assert_eq!(again, id);

        let stored = db.get_entry(id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Final"));
        assert!(stored.read);
        assert!(stored.starred);
    }

    #[tokio::test]
    async fn test_same_guid_in_different_feeds() {
        let db = test_db().await;
        let a = db.ingest_feed(&feed("https://a.example.com/rss", "A")).await.unwrap();
        let b = db.ingest_feed(&feed("https://b.example.com/rss", "B")).await.unwrap();

        let in_a = db.ingest_entry(a, &entry("shared", "x")).await.unwrap();
        let in_b = db.ingest_entry(b, &entry("shared", "x")).await.unwrap();
        assert_ne!(in_a, in_b);
    }

    #[tokio::test]
    async fn test_ingest_entry_rejects_empty_guid_and_unknown_feed() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();

        let empty = db.ingest_entry(feed_id, &entry("", "x")).await;
        assert!(matches!(empty, Err(StoreError::ConstraintViolation(_))));

        let unknown = db.ingest_entry(feed_id + 100, &entry("g", "x")).await;
        assert!(matches!(unknown, Err(StoreError::ConstraintViolation(_))));
        assert_eq!(entry_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_ingest_entries_summary_and_notification() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();
        db.ingest_entry(feed_id, &entry("old", "Old")).await.unwrap();

        let mut sub = db.subscribe(CollectionId::Entries(FeedSelector::Feed(feed_id)));
        let summary = db
            .ingest_entries(feed_id, &[entry("old", "Old"), entry("new", "New")])
            .await
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.new, 1);
        assert!(sub.try_changed().is_some());
    }

    #[tokio::test]
    async fn test_ingest_entries_all_or_nothing() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();

        let result = db
            .ingest_entries(feed_id, &[entry("ok", "Fine"), entry("", "Broken")])
            .await;
        assert!(result.is_err());
        assert_eq!(entry_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_update_feed_remote() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();

        let failure = FeedPollUpdate {
            http_etag: Some(Some("\"abc\"".to_string())),
            ..FeedPollUpdate::failure(100, "timeout")
        };
        let n = db
            .update_feed_remote(&Address::feed_remote(feed_id), &failure)
            .await
            .unwrap();
        assert_eq!(n, 1);

        let stored = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(stored.last_poll_time, Some(100));
        assert_eq!(stored.last_poll_error.as_deref(), Some("timeout"));
        assert_eq!(stored.http_etag.as_deref(), Some("\"abc\""));

        db.update_feed_remote(&Address::feed_remote(feed_id), &FeedPollUpdate::success(200))
            .await
            .unwrap();
        let stored = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(stored.last_poll_time, Some(200));
        assert_eq!(stored.last_poll_error, None);
        assert_eq!(stored.http_etag.as_deref(), Some("\"abc\""));
    }

    #[tokio::test]
    async fn test_update_feed_remote_requires_remote_address() {
        let db = test_db().await;
        let feed_id = db
            .ingest_feed(&feed("https://example.com/rss", "A"))
            .await
            .unwrap();

        let result = db
            .update_feed_remote(&Address::feed_overlay(feed_id), &FeedPollUpdate::success(1))
            .await;
        assert!(matches!(result, Err(StoreError::UnroutableAddress(_))));

        let empty = db
            .update_feed_remote(&Address::feed_remote(feed_id), &FeedPollUpdate::default())
            .await
            .unwrap();
        assert_eq!(empty, 0);
    }
}
