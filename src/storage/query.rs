use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::fmt;
use std::str::FromStr;

use super::address::{route, Address, FeedSelector, Route, Target};
use super::rows::{forward, forward_all, Rows};
use super::schema::Database;
use super::types::{Entry, EntryId, Feed, FeedDbRow, FeedId, StoreError, SyncLogEntry};

// ============================================================================
// Predicate Assembly
// ============================================================================

/// Joins predicate fragments with `WHERE` then `AND`.
#[derive(Debug, Default)]
pub(crate) struct Clauses {
    any: bool,
}

impl Clauses {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next(&mut self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(if self.any { " AND " } else { " WHERE " });
        self.any = true;
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Ordering of entry listings. Dates fall back to the ingestion time when a
/// source reports none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryOrder {
    #[default]
    #[serde(rename = "date-desc")]
    DateDescending,
    #[serde(rename = "date-asc")]
    DateAscending,
    #[serde(rename = "title-asc")]
    TitleAscending,
}

impl EntryOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryOrder::DateDescending => "date-desc",
            EntryOrder::DateAscending => "date-asc",
            EntryOrder::TitleAscending => "title-asc",
        }
    }

    fn sql(self) -> &'static str {
        match self {
            EntryOrder::DateDescending => " ORDER BY COALESCE(updated, insert_time) DESC, id DESC",
            EntryOrder::DateAscending => " ORDER BY COALESCE(updated, insert_time) ASC, id ASC",
            EntryOrder::TitleAscending => " ORDER BY title COLLATE NOCASE ASC, id ASC",
        }
    }
}

impl fmt::Display for EntryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date-desc" => Ok(EntryOrder::DateDescending),
            "date-asc" => Ok(EntryOrder::DateAscending),
            "title-asc" => Ok(EntryOrder::TitleAscending),
            other => Err(format!("unknown entry order '{}'", other)),
        }
    }
}

/// Ordering of feed listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOrder {
    /// Merged title, case-insensitive
    #[default]
    Title,
    Id,
}

impl FeedOrder {
    fn sql(self) -> &'static str {
        match self {
            FeedOrder::Title => " ORDER BY title COLLATE NOCASE ASC, id ASC",
            FeedOrder::Id => " ORDER BY id ASC",
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Caller-supplied entry predicate, conjoined with the selector predicate.
///
/// Used by reads and as the extra predicate of overlay writes. `limit` only
/// applies to reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryFilter {
    /// Only entries whose pending read flag is unset
    pub unread_only: bool,
    /// Only entries whose pending read flag differs from the confirmed one
    pub pending_only: bool,
    pub starred: Option<bool>,
    /// Entry date at or after (unix seconds)
    pub updated_since: Option<i64>,
    /// Entry date strictly before (unix seconds)
    pub updated_before: Option<i64>,
    /// Restrict to these ids. `Some(vec![])` matches nothing.
    pub entry_ids: Option<Vec<EntryId>>,
    pub limit: Option<i64>,
}

impl EntryFilter {
    pub fn unread() -> Self {
        Self {
            unread_only: true,
            ..Self::default()
        }
    }

    pub(crate) fn push_predicate(
        &self,
        target: Target,
        builder: &mut QueryBuilder<'_, Sqlite>,
        clauses: &mut Clauses,
    ) {
        if self.unread_only {
            clauses.next(builder);
            builder.push("flag_read = 0");
        }
        if self.pending_only {
            clauses.next(builder);
            builder.push("flag_read <> ro_flag_read");
        }
        if let Some(starred) = self.starred {
            clauses.next(builder);
            builder.push("flag_star = ");
            builder.push_bind(starred);
        }

        if let Some(since) = self.updated_since {
            clauses.next(builder);
            push_date_column(target, builder);
            builder.push(" >= ");
            builder.push_bind(since);
            builder.push(")");
        }
        if let Some(before) = self.updated_before {
            clauses.next(builder);
            push_date_column(target, builder);
            builder.push(" < ");
            builder.push_bind(before);
            builder.push(")");
        }

        if let Some(ids) = &self.entry_ids {
            clauses.next(builder);
            if ids.is_empty() {
                builder.push("0 = 1");
            } else {
                builder.push("id IN (");
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
        }
    }
}

/// Opens a parenthesized comparison on the entry date. Overlay rows carry no
/// dates, so writes against them go through the remote part.
fn push_date_column(target: Target, builder: &mut QueryBuilder<'_, Sqlite>) {
    if target == Target::EntryOverlay {
        builder.push("id IN (SELECT id FROM entry_sync WHERE COALESCE(updated, insert_time)");
    } else {
        builder.push("(COALESCE(updated, insert_time)");
    }
}

/// Caller-supplied feed predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedFilter {
    /// Restrict to these ids. `Some(vec![])` matches nothing.
    pub ids: Option<Vec<FeedId>>,
    /// Also list feeds the user hid
    pub include_hidden: bool,
    /// Only feeds with at least one unread entry
    pub with_unread_only: bool,
}

impl FeedFilter {
    /// Every feed, hidden ones included.
    pub fn everything() -> Self {
        Self {
            include_hidden: true,
            ..Self::default()
        }
    }

    fn push_predicate(&self, builder: &mut QueryBuilder<'_, Sqlite>, clauses: &mut Clauses) {
        if let Some(ids) = &self.ids {
            clauses.next(builder);
            if ids.is_empty() {
                builder.push("0 = 1");
            } else {
                builder.push("id IN (");
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
        }
        if !self.include_hidden {
            clauses.next(builder);
            builder.push("hidden = 0");
        }
        if self.with_unread_only {
            clauses.next(builder);
            builder.push("unread_count > 0");
        }
    }
}

/// Result of a read through [`Database::query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum QueryResult {
    Feeds(Vec<Feed>),
    Entries(Vec<Entry>),
    SyncLog(Vec<SyncLogEntry>),
}

const FEED_COLUMNS: &str = "SELECT id, url, title, remote_title, custom_title, link, language, \
     favicon_url, last_poll_time, last_poll_error, http_etag, http_last_modified, \
     entry_order, hidden, unread_count FROM feed_view";

const ENTRY_COLUMNS: &str = "SELECT id, feed_id, guid, title, link, content, author, updated, \
     insert_time, update_time, flag_read, ro_flag_read, flag_star, feed_title, \
     feed_favicon_url FROM entry_view";

impl Database {
    // ========================================================================
    // Merged Reads
    // ========================================================================

    /// Stream feeds from the merged view.
    pub fn query_feeds(&self, filter: &FeedFilter, order: FeedOrder) -> Rows<Feed> {
        match route(&Address::feeds()) {
            Ok(route) => self.stream_feeds(route, filter.clone(), order),
            Err(e) => Rows::failed(e),
        }
    }

    /// Stream entries from the merged view.
    ///
    /// `selector` picks one feed's entries, every starred entry, or every
    /// entry; `filter` narrows further.
    pub fn query_entries(
        &self,
        selector: FeedSelector,
        filter: &EntryFilter,
        order: EntryOrder,
    ) -> Rows<Entry> {
        match route(&Address::feed_entries(selector)) {
            Ok(route) => self.stream_entries(route, filter.clone(), order),
            Err(e) => Rows::failed(e),
        }
    }

    /// Get a single merged feed.
    pub async fn get_feed(&self, feed_id: FeedId) -> Result<Option<Feed>, StoreError> {
        let route = route(&Address::feed(feed_id))?;
        let mut rows = self
            .stream_feeds(route, FeedFilter::everything(), FeedOrder::Id)
            .collect_all()
            .await?;
        Ok(rows.pop())
    }

    /// Get a single merged entry.
    pub async fn get_entry(&self, entry_id: EntryId) -> Result<Option<Entry>, StoreError> {
        let route = route(&Address::entry(entry_id))?;
        let mut rows = self
            .stream_entries(route, EntryFilter::default(), EntryOrder::default())
            .collect_all()
            .await?;
        Ok(rows.pop())
    }

    /// Read whatever a merged (or sync-log) address names.
    ///
    /// # Errors
    ///
    /// `StoreError::UnroutableAddress` for remote and overlay addresses; those
    /// parts are never read directly.
    pub async fn query(&self, address: &Address) -> Result<QueryResult, StoreError> {
        let route = route(address)?;
        match route.target {
            Target::FeedView => Ok(QueryResult::Feeds(
                self.stream_feeds(route, FeedFilter::everything(), FeedOrder::default())
                    .collect_all()
                    .await?,
            )),
            Target::EntryView => Ok(QueryResult::Entries(
                self.stream_entries(route, EntryFilter::default(), EntryOrder::default())
                    .collect_all()
                    .await?,
            )),
            Target::SyncLog => Ok(QueryResult::SyncLog(self.sync_log_rows(&route, None).await?)),
            _ => Err(StoreError::UnroutableAddress(format!(
                "{} is not readable; query the merged view instead",
                address
            ))),
        }
    }

    fn stream_feeds(&self, route: Route, filter: FeedFilter, order: FeedOrder) -> Rows<Feed> {
        let pool = self.pool.clone();
        let buffered = self.buffered_reads;
        Rows::spawn(self.row_buffer, move |tx| async move {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(FEED_COLUMNS);
            let mut clauses = Clauses::new();
            route.push_predicate(&mut builder, &mut clauses);
            filter.push_predicate(&mut builder, &mut clauses);
            builder.push(order.sql());

            let query = builder.build_query_as::<FeedDbRow>();
            if buffered {
                forward_all(query.fetch_all(&pool).await, &tx, FeedDbRow::into_feed).await;
            } else {
                forward(query.fetch(&pool), &tx, FeedDbRow::into_feed).await;
            }
        })
    }

    fn stream_entries(&self, route: Route, filter: EntryFilter, order: EntryOrder) -> Rows<Entry> {
        let pool = self.pool.clone();
        let buffered = self.buffered_reads;
        Rows::spawn(self.row_buffer, move |tx| async move {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(ENTRY_COLUMNS);
            let mut clauses = Clauses::new();
            route.push_predicate(&mut builder, &mut clauses);
            filter.push_predicate(Target::EntryView, &mut builder, &mut clauses);
            builder.push(order.sql());
            if let Some(limit) = filter.limit {
                builder.push(" LIMIT ");
                builder.push_bind(limit.max(0));
            }
            tracing::trace!(sql = builder.sql(), "Streaming entries");

            let query = builder.build_query_as::<Entry>();
            if buffered {
                forward_all(query.fetch_all(&pool).await, &tx, |entry| entry).await;
            } else {
                forward(query.fetch(&pool), &tx, |entry| entry).await;
            }
        })
    }
}
