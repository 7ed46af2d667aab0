use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::address::{route, Address, FeedSelector, Route, Target};
use super::query::{Clauses, EntryFilter, EntryOrder};
use super::schema::Database;
use super::types::{EntryId, FeedId, StoreError};
use crate::notify::CollectionId;

// ============================================================================
// Patches
// ============================================================================

/// Partial update of a feed's overlay part.
///
/// `None` leaves a field alone. For the nullable fields `Some(None)` clears
/// the override so the merged view falls back to the remote value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedOverlayPatch {
    pub custom_title: Option<Option<String>>,
    pub entry_order: Option<Option<EntryOrder>>,
    pub hidden: Option<bool>,
}

impl FeedOverlayPatch {
    pub fn custom_title(title: Option<&str>) -> Self {
        Self {
            custom_title: Some(title.map(str::to_string)),
            ..Self::default()
        }
    }

    pub fn entry_order(order: Option<EntryOrder>) -> Self {
        Self {
            entry_order: Some(order),
            ..Self::default()
        }
    }

    pub fn hidden(hidden: bool) -> Self {
        Self {
            hidden: Some(hidden),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.custom_title.is_none() && self.entry_order.is_none() && self.hidden.is_none()
    }
}

/// Partial update of entry overlay parts. Only the pending read flag is
/// writable; the confirmed flag belongs to `commit_pending_read_flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryOverlayPatch {
    pub read: Option<bool>,
    pub starred: Option<bool>,
}

impl EntryOverlayPatch {
    pub fn read(read: bool) -> Self {
        Self {
            read: Some(read),
            starred: None,
        }
    }

    pub fn starred(starred: bool) -> Self {
        Self {
            read: None,
            starred: Some(starred),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.starred.is_none()
    }
}

// ============================================================================
// Connection-level Writes
// ============================================================================

pub(crate) async fn update_feed_overlays_in(
    conn: &mut SqliteConnection,
    route: &Route,
    patch: &FeedOverlayPatch,
) -> Result<u64, StoreError> {
    if patch.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE feed_user SET ");
    {
        let mut assignments = builder.separated(", ");
        if let Some(title) = &patch.custom_title {
            // A blank override would hide the remote title behind nothing
            let title = title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            assignments.push("custom_title = ");
            assignments.push_bind_unseparated(title);
        }
        if let Some(order) = patch.entry_order {
            assignments.push("entry_order = ");
            assignments.push_bind_unseparated(order.map(EntryOrder::as_str));
        }
        if let Some(hidden) = patch.hidden {
            assignments.push("hidden = ");
            assignments.push_bind_unseparated(hidden);
        }
    }

    let mut clauses = Clauses::new();
    route.push_predicate(&mut builder, &mut clauses);

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

pub(crate) async fn update_entry_overlays_in(
    conn: &mut SqliteConnection,
    route: &Route,
    patch: &EntryOverlayPatch,
    filter: &EntryFilter,
) -> Result<u64, StoreError> {
    if patch.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE entry_user SET ");
    {
        let mut assignments = builder.separated(", ");
        if let Some(read) = patch.read {
            assignments.push("flag_read = ");
            assignments.push_bind_unseparated(read);
        }
        if let Some(starred) = patch.starred {
            assignments.push("flag_star = ");
            assignments.push_bind_unseparated(starred);
        }
    }

    let mut clauses = Clauses::new();
    route.push_predicate(&mut builder, &mut clauses);
    filter.push_predicate(Target::EntryOverlay, &mut builder, &mut clauses);

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Route `address` and insist it names feed overlay rows.
pub(crate) fn feed_overlay_route(address: &Address) -> Result<Route, StoreError> {
    route(address)?.require(Target::FeedOverlay, address)
}

/// Route `address` and insist it names entry overlay rows.
pub(crate) fn entry_overlay_route(address: &Address) -> Result<Route, StoreError> {
    route(address)?.require(Target::EntryOverlay, address)
}

// ============================================================================
// Database Operations
// ============================================================================

impl Database {
    /// Apply `patch` to the overlay part of one feed.
    ///
    /// Returns the number of rows affected (0 for an unknown feed or an
    /// empty patch). Remote fields are never touched.
    pub async fn set_feed_overlay(
        &self,
        feed_id: FeedId,
        patch: &FeedOverlayPatch,
    ) -> Result<u64, StoreError> {
        self.update_feed_overlays(&Address::feed_overlay(feed_id), patch)
            .await
    }

    /// Apply `patch` to every feed overlay row `address` selects.
    ///
    /// # Errors
    ///
    /// `StoreError::UnroutableAddress` unless `address` has overlay scope.
    pub async fn update_feed_overlays(
        &self,
        address: &Address,
        patch: &FeedOverlayPatch,
    ) -> Result<u64, StoreError> {
        let route = feed_overlay_route(address)?;
        if patch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let affected = update_feed_overlays_in(&mut *tx, &route, patch).await?;
        tx.commit().await?;

        if affected > 0 {
            tracing::debug!(%address, affected, "Updated feed overlay");
            self.notifier.notify(CollectionId::Feeds);
        }
        Ok(affected)
    }

    /// Apply `patch` to the entry overlay rows selected by `address` and
    /// narrowed by `filter`.
    ///
    /// `address` is an overlay entry address: a single entry, the entries of
    /// a feed, every starred entry or every entry. `filter.limit` is ignored.
    ///
    /// # Errors
    ///
    /// `StoreError::UnroutableAddress` for remote or merged addresses and
    /// non-positive ids.
    pub async fn set_entry_overlay(
        &self,
        address: &Address,
        patch: &EntryOverlayPatch,
        filter: &EntryFilter,
    ) -> Result<u64, StoreError> {
        let route = entry_overlay_route(address)?;
        if patch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let affected = update_entry_overlays_in(&mut *tx, &route, patch, filter).await?;
        tx.commit().await?;

        if affected > 0 {
            tracing::debug!(%address, affected, ?patch, "Updated entry overlay");
            self.notifier.notify(CollectionId::Feeds);
        }
        Ok(affected)
    }

    pub async fn mark_entry_read(&self, entry_id: EntryId, read: bool) -> Result<u64, StoreError> {
        self.set_entry_overlay(
            &Address::entry_overlay(entry_id),
            &EntryOverlayPatch::read(read),
            &EntryFilter::default(),
        )
        .await
    }

    pub async fn set_entry_starred(
        &self,
        entry_id: EntryId,
        starred: bool,
    ) -> Result<u64, StoreError> {
        self.set_entry_overlay(
            &Address::entry_overlay(entry_id),
            &EntryOverlayPatch::starred(starred),
            &EntryFilter::default(),
        )
        .await
    }

    /// Mark every unread entry of the selected collection read.
    pub async fn mark_all_read(&self, selector: FeedSelector) -> Result<u64, StoreError> {
        self.set_entry_overlay(
            &Address::entries_overlay(selector),
            &EntryOverlayPatch::read(true),
            &EntryFilter::unread(),
        )
        .await
    }

    /// Set or clear (`None`) a feed's custom title.
    pub async fn set_feed_custom_title(
        &self,
        feed_id: FeedId,
        title: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.set_feed_overlay(feed_id, &FeedOverlayPatch::custom_title(title))
            .await
    }
}
