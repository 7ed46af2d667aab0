use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::address::{route, Address, Route, Target};
use super::query::Clauses;
use super::schema::Database;
use super::types::{FeedId, NewSyncLogEntry, StoreError, SyncLogEntry};
use crate::notify::CollectionId;

pub(crate) async fn append_sync_log_in(
    conn: &mut SqliteConnection,
    entry: &NewSyncLogEntry,
) -> Result<i64, StoreError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO sync_log (feed_id, poll, error, entries_total, entries_new)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(entry.feed_id)
    .bind(entry.poll)
    .bind(&entry.error)
    .bind(entry.entries_total)
    .bind(entry.entries_new)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

impl Database {
    /// Record one poll attempt. Rows are never updated afterwards.
    ///
    /// # Errors
    ///
    /// `StoreError::ConstraintViolation` if the feed does not exist.
    pub async fn append_sync_log(&self, entry: &NewSyncLogEntry) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = append_sync_log_in(&mut *tx, entry).await?;
        tx.commit().await?;

        tracing::debug!(
            feed_id = entry.feed_id,
            poll = entry.poll,
            failed = entry.error.is_some(),
            "Appended sync log"
        );
        self.notifier.notify(CollectionId::SyncLog);
        Ok(id)
    }

    /// Poll records, oldest first, optionally for one feed and from
    /// `since` (inclusive) on.
    pub async fn query_sync_log(
        &self,
        feed_id: Option<FeedId>,
        since: Option<i64>,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let address = Address::sync_log(feed_id);
        let route = route(&address)?.require(Target::SyncLog, &address)?;
        self.sync_log_rows(&route, since).await
    }

    pub(crate) async fn sync_log_rows(
        &self,
        route: &Route,
        since: Option<i64>,
    ) -> Result<Vec<SyncLogEntry>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, feed_id, poll, error, entries_total, entries_new FROM sync_log",
        );
        let mut clauses = Clauses::new();
        route.push_predicate(&mut builder, &mut clauses);
        if let Some(since) = since {
            clauses.next(&mut builder);
            builder.push("poll >= ");
            builder.push_bind(since);
        }
        builder.push(" ORDER BY poll ASC, id ASC");

        let rows = builder
            .build_query_as::<SyncLogEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IngestFeed;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn add_feed(db: &Database, n: i64) -> FeedId {
        db.ingest_feed(&IngestFeed {
            url: format!("https://feed{}.example.com/rss", n),
            title: format!("Feed {}", n),
            ..IngestFeed::default()
        })
        .await
        .unwrap()
    }

    fn poll(feed_id: FeedId, poll: i64, error: Option<&str>) -> NewSyncLogEntry {
        NewSyncLogEntry {
            feed_id,
            poll,
            error: error.map(str::to_string),
            entries_total: 10,
            entries_new: 2,
        }
    }

    #[tokio::test]
    async fn test_append_and_query_ordered_by_poll() {
        let db = test_db().await;
        let feed_id = add_feed(&db, 1).await;

        db.append_sync_log(&poll(feed_id, 300, None)).await.unwrap();
        db.append_sync_log(&poll(feed_id, 100, Some("timeout"))).await.unwrap();
        db.append_sync_log(&poll(feed_id, 200, None)).await.unwrap();

        let rows = db.query_sync_log(Some(feed_id), None).await.unwrap();
        let polls: Vec<i64> = rows.iter().map(|r| r.poll).collect();
        assert_eq!(polls, vec![100, 200, 300]);
        assert_eq!(rows[0].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_query_filters_feed_and_since() {
        let db = test_db().await;
        let a = add_feed(&db, 1).await;
        let b = add_feed(&db, 2).await;
        db.append_sync_log(&poll(a, 100, None)).await.unwrap();
        db.append_sync_log(&poll(b, 150, None)).await.unwrap();
        db.append_sync_log(&poll(a, 200, None)).await.unwrap();

        assert_eq!(db.query_sync_log(None, None).await.unwrap().len(), 3);
        assert_eq!(db.query_sync_log(Some(b), None).await.unwrap().len(), 1);

        let recent = db.query_sync_log(Some(a), Some(150)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].poll, 200);
    }

    #[tokio::test]
    async fn test_unknown_feed_is_constraint_violation() {
        let db = test_db().await;
        let result = db.append_sync_log(&poll(99, 1, None)).await;
        assert!(matches!(result, Err(StoreError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn test_append_notifies_sync_log_observers() {
        let db = test_db().await;
        let feed_id = add_feed(&db, 1).await;
        let mut sub = db.subscribe(CollectionId::SyncLog);
        let mut feeds = db.subscribe(CollectionId::Feeds);

        db.append_sync_log(&poll(feed_id, 1, None)).await.unwrap();
        assert!(sub.try_changed().is_some());
        assert!(feeds.try_changed().is_none());
    }
}
