use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;
use crate::notify::{ChangeNotifier, CollectionId, Subscription};

// ============================================================================
// Store Options
// ============================================================================

/// Tuning knobs for the connection pool, usually filled from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// SQLite is single-writer; extra connections only serve concurrent readers.
    pub max_connections: u32,
    /// How long a connection waits on a lock before SQLITE_BUSY.
    pub busy_timeout: Duration,
    /// How long a caller waits for a free pooled connection.
    pub acquire_timeout: Duration,
    /// Rows buffered ahead of a slow consumer of a query stream.
    pub row_buffer: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_millis(5000),
            acquire_timeout: Duration::from_secs(10),
            row_buffer: 64,
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Handle to the record store. Cheap to clone; every clone shares the pool
/// and the change notifier.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) notifier: ChangeNotifier,
    pub(crate) row_buffer: usize,
    /// Drain each query before handing rows out. Set for `":memory:"`,
    /// whose shared cache keeps a table lock while a statement is open.
    pub(crate) buffered_reads: bool,
}

impl Database {
    /// Open a database connection with default options and run migrations.
    ///
    /// `":memory:"` opens a private in-memory store shared by the pool.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        Self::open_with(path, &StoreOptions::default()).await
    }

    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `StoreError::Migration` if the schema could not be applied.
    pub async fn open_with(path: &str, options: &StoreOptions) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);
        let in_memory = path == ":memory:";

        let mut connect = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_open)?
            .foreign_keys(true)
            .pragma("busy_timeout", options.busy_timeout.as_millis().to_string());
        if !in_memory {
            // WAL lets readers proceed while a writer holds its transaction
            connect = connect.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await
            .map_err(StoreError::from_open)?;

        let db = Self {
            pool,
            notifier: ChangeNotifier::new(),
            row_buffer: options.row_buffer.max(1),
            buffered_reads: in_memory,
        };
        db.migrate().await.map_err(|e| match StoreError::from_open(e) {
            StoreError::InstanceLocked => StoreError::InstanceLocked,
            other => StoreError::Migration(other.to_string()),
        })?;
        tracing::debug!(path = %path, "Opened feed store");
        Ok(db)
    }

    /// The notifier observers register with.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Shorthand for `self.notifier().subscribe(collection)`.
    pub fn subscribe(&self, collection: CollectionId) -> Subscription {
        self.notifier.subscribe(collection)
    }

    /// Close every pooled connection. Outstanding clones become unusable.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// Remote-sourced data and local overlay data live in separate tables
    /// sharing one id. Triggers create the overlay row in the same statement
    /// as its remote row, so neither side ever exists alone. Reads go through
    /// the two merge views.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Real feed ids are positive; negative ids are reserved for the
        // "all" and "starred" sentinel selectors.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_sync (
                id INTEGER PRIMARY KEY CHECK (id > 0),
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                link TEXT,
                language TEXT,
                favicon_url TEXT,
                last_poll_time INTEGER,
                last_poll_error TEXT,
                http_etag TEXT,
                http_last_modified TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_user (
                id INTEGER PRIMARY KEY REFERENCES feed_sync(id) ON DELETE CASCADE,
                custom_title TEXT,
                entry_order TEXT,
                hidden INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_sync (
                id INTEGER PRIMARY KEY CHECK (id > 0),
                feed_id INTEGER NOT NULL REFERENCES feed_sync(id) ON DELETE CASCADE,
                guid TEXT NOT NULL CHECK (guid <> ''),
                title TEXT,
                link TEXT,
                content TEXT,
                author TEXT,
                updated INTEGER,
                insert_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                UNIQUE(feed_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_user (
                id INTEGER PRIMARY KEY REFERENCES entry_sync(id) ON DELETE CASCADE,
                flag_read INTEGER NOT NULL DEFAULT 0,
                ro_flag_read INTEGER NOT NULL DEFAULT 0,
                flag_star INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feed_sync(id) ON DELETE CASCADE,
                poll INTEGER NOT NULL,
                error TEXT,
                entries_total INTEGER NOT NULL DEFAULT 0,
                entries_new INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_sync_feed ON entry_sync(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entry_sync_date ON entry_sync(COALESCE(updated, insert_time) DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_user_star ON entry_user(flag_star)")
            .execute(&mut *tx)
            .await?;
        // Partial index: commit_pending_read_flags only touches diverging rows
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entry_user_pending ON entry_user(id) WHERE flag_read <> ro_flag_read",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_log_feed_poll ON sync_log(feed_id, poll)")
            .execute(&mut *tx)
            .await?;

        // Eager overlay rows
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS feed_sync_overlay AFTER INSERT ON feed_sync BEGIN
                INSERT INTO feed_user (id) VALUES (new.id);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS entry_sync_overlay AFTER INSERT ON entry_sync BEGIN
                INSERT INTO entry_user (id) VALUES (new.id);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // The sync log is append-only
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS sync_log_append_only BEFORE UPDATE ON sync_log BEGIN
                SELECT RAISE(ABORT, 'sync_log rows are immutable');
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Merge views: overlay values win when non-null
        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS feed_view AS
            SELECT
                fs.id,
                fs.url,
                COALESCE(fu.custom_title, fs.title) AS title,
                fs.title AS remote_title,
                fu.custom_title,
                fs.link,
                fs.language,
                fs.favicon_url,
                fs.last_poll_time,
                fs.last_poll_error,
                fs.http_etag,
                fs.http_last_modified,
                fu.entry_order,
                fu.hidden,
                (
                    SELECT COUNT(*)
                    FROM entry_sync es
                    JOIN entry_user eu ON eu.id = es.id
                    WHERE es.feed_id = fs.id AND eu.flag_read = 0
                ) AS unread_count
            FROM feed_sync fs
            JOIN feed_user fu ON fu.id = fs.id
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS entry_view AS
            SELECT
                es.id,
                es.feed_id,
                es.guid,
                es.title,
                es.link,
                es.content,
                es.author,
                es.updated,
                es.insert_time,
                es.update_time,
                eu.flag_read,
                eu.ro_flag_read,
                eu.flag_star,
                COALESCE(fu.custom_title, fs.title) AS feed_title,
                fs.favicon_url AS feed_favicon_url
            FROM entry_sync es
            JOIN entry_user eu ON eu.id = es.id
            JOIN feed_sync fs ON fs.id = es.feed_id
            JOIN feed_user fu ON fu.id = fs.id
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count(db: &Database, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&db.pool).await.unwrap();
        row.0
    }

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = Database::open(":memory:").await.unwrap();
        for table in [
            "feed_sync",
            "feed_user",
            "entry_sync",
            "entry_user",
            "sync_log",
            "feed_view",
            "entry_view",
        ] {
            assert_eq!(count(&db, table).await, 0, "{} should exist and be empty", table);
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_insert_creates_overlay_row() {
        let db = Database::open(":memory:").await.unwrap();
        sqlx::query("INSERT INTO feed_sync (url, title) VALUES ('https://a.example/rss', 'A')")
            .execute(&db.pool)
            .await
            .unwrap();

        assert_eq!(count(&db, "feed_user").await, 1);
    }

    #[tokio::test]
    async fn test_sentinel_ids_cannot_be_assigned() {
        let db = Database::open(":memory:").await.unwrap();
        for id in [-1_i64, -2, 0] {
            let result =
                sqlx::query("INSERT INTO feed_sync (id, url, title) VALUES (?, 'https://x.example', 'X')")
                    .bind(id)
                    .execute(&db.pool)
                    .await;
            assert!(result.is_err(), "feed id {} must be rejected", id);
        }
    }

    #[tokio::test]
    async fn test_sync_log_rows_are_immutable() {
        let db = Database::open(":memory:").await.unwrap();
        sqlx::query("INSERT INTO feed_sync (url, title) VALUES ('https://a.example/rss', 'A')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sync_log (feed_id, poll) VALUES (1, 100)")
            .execute(&db.pool)
            .await
            .unwrap();

        let result = sqlx::query("UPDATE sync_log SET error = 'late'")
            .execute(&db.pool)
            .await;
        assert!(result.is_err());
    }
}
