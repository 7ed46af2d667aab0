use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::query::EntryOrder;

/// Identifier of a real feed. Always positive; see [`super::FeedSelector`] for
/// the reserved sentinel values.
pub type FeedId = i64;

/// Identifier of an entry, assigned on first ingestion and never changed.
pub type EntryId = i64;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by every store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The address is malformed or names a shape no operation accepts.
    #[error("Unroutable address: {0}")]
    UnroutableAddress(String),

    /// A natural-key, foreign-key or check constraint rejected the write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// One operation of a batch failed; nothing of the batch was applied.
    #[error("Batch aborted at operation {index}: {source}")]
    BatchAborted {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },

    /// Another process holds the database lock
    #[error("The database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The underlying store failed. The transaction was rolled back and the
    /// whole operation may be retried.
    #[error("Store failure: {0}")]
    StoreFailure(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            use sqlx::error::ErrorKind;
            match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => {
                    return StoreError::ConstraintViolation(db_err.message().to_string());
                }
                _ => {}
            }
            // Older SQLite builds only report the primary result code
            if db_err.message().contains("constraint failed") {
                return StoreError::ConstraintViolation(db_err.message().to_string());
            }
        }
        StoreError::StoreFailure(err)
    }
}

impl StoreError {
    /// Classify an error raised while opening the store.
    ///
    /// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all mean
    /// some other process owns the file right now.
    pub(crate) fn from_open(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }
        StoreError::StoreFailure(err)
    }

    /// The innermost error, looking through `BatchAborted` wrappers.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::BatchAborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            StoreError::StoreFailure(_) | StoreError::InstanceLocked
        )
    }
}

// ============================================================================
// Ingestion Inputs
// ============================================================================

/// Remote-sourced feed fields, as supplied by the fetch collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFeed {
    pub url: String,
    pub title: String,
    pub link: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
}

/// Remote-sourced entry fields. `guid` is the natural key within a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEntry {
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    /// Publish/update time reported by the source (unix seconds)
    pub updated: Option<i64>,
}

/// Poll metadata written to the remote part of a feed.
///
/// `None` leaves a column untouched. For the nullable columns `Some(None)`
/// clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedPollUpdate {
    pub title: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub last_poll_time: Option<i64>,
    pub last_poll_error: Option<Option<String>>,
    pub http_etag: Option<Option<String>>,
    pub http_last_modified: Option<Option<String>>,
}

impl FeedPollUpdate {
    /// A successful poll at `time`: records the time and clears any error.
    pub fn success(time: i64) -> Self {
        Self {
            last_poll_time: Some(time),
            last_poll_error: Some(None),
            ..Self::default()
        }
    }

    /// A failed poll at `time`.
    pub fn failure(time: i64, error: impl Into<String>) -> Self {
        Self {
            last_poll_time: Some(time),
            last_poll_error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Counts produced by ingesting one poll worth of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub total: usize,
    pub new: usize,
}

/// A sync-log row to append, one per poll attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSyncLogEntry {
    pub feed_id: FeedId,
    pub poll: i64,
    pub error: Option<String>,
    pub entries_total: i64,
    pub entries_new: i64,
}

// ============================================================================
// Merged Rows
// ============================================================================

/// Internal row type for `feed_view` (used by sqlx FromRow).
/// Converts to [`Feed`] via `into_feed()`, parsing the stored entry order.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub remote_title: String,
    pub custom_title: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub last_poll_time: Option<i64>,
    pub last_poll_error: Option<String>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub entry_order: Option<String>,
    pub hidden: bool,
    pub unread_count: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        let entry_order = self.entry_order.as_deref().and_then(|raw| {
            let parsed = raw.parse::<EntryOrder>().ok();
            if parsed.is_none() {
                tracing::warn!(feed_id = self.id, value = %raw, "Ignoring unknown entry order");
            }
            parsed
        });

        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            remote_title: self.remote_title,
            custom_title: self.custom_title,
            link: self.link,
            language: self.language,
            favicon_url: self.favicon_url,
            last_poll_time: self.last_poll_time,
            last_poll_error: self.last_poll_error,
            http_etag: self.http_etag,
            http_last_modified: self.http_last_modified,
            entry_order,
            hidden: self.hidden,
            unread_count: self.unread_count,
        }
    }
}

/// A feed as seen through the merged view.
///
/// `title` is the custom title when one is set, the remote title otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feed {
    pub id: FeedId,
    pub url: String,
    pub title: String,
    pub remote_title: String,
    pub custom_title: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub last_poll_time: Option<i64>,
    pub last_poll_error: Option<String>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub entry_order: Option<EntryOrder>,
    pub hidden: bool,
    /// Entries of this feed whose pending read flag is unset
    pub unread_count: i64,
}

/// An entry as seen through the merged view, with the owning feed's display
/// fields denormalized in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Entry {
    pub id: EntryId,
    pub feed_id: FeedId,
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub updated: Option<i64>,
    /// First time the entry was ingested
    pub insert_time: i64,
    /// Last ingestion that changed the remote fields
    pub update_time: i64,
    /// Pending (live, local) read flag
    #[sqlx(rename = "flag_read")]
    pub read: bool,
    /// Last read flag reconciled by `commit_pending_read_flags`
    #[sqlx(rename = "ro_flag_read")]
    pub read_confirmed: bool,
    #[sqlx(rename = "flag_star")]
    pub starred: bool,
    pub feed_title: String,
    pub feed_favicon_url: Option<String>,
}

/// One append-only poll record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub feed_id: FeedId,
    pub poll: i64,
    pub error: Option<String>,
    pub entries_total: i64,
    pub entries_new: i64,
}

/// An entry whose pending read flag differs from the confirmed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ReadStateChange {
    pub id: EntryId,
    pub feed_id: FeedId,
    pub guid: String,
    #[sqlx(rename = "flag_read")]
    pub pending: bool,
    #[sqlx(rename = "ro_flag_read")]
    pub confirmed: bool,
}
