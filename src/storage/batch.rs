use sqlx::SqliteConnection;

use super::address::{route, Address, Target};
use super::ingest::{ingest_entry_in, ingest_feed_in, now, update_feed_remote_in};
use super::overlay::{
    entry_overlay_route, feed_overlay_route, update_entry_overlays_in, update_feed_overlays_in,
    EntryOverlayPatch, FeedOverlayPatch,
};
use super::query::EntryFilter;
use super::schema::Database;
use super::sync_log::append_sync_log_in;
use super::types::{
    EntryId, FeedId, FeedPollUpdate, IngestEntry, IngestFeed, NewSyncLogEntry, StoreError,
};
use crate::notify::CollectionId;

/// One step of a batch. Each variant has the semantics of the matching
/// single-shot `Database` method, minus its notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    IngestFeed(IngestFeed),
    IngestEntry {
        feed_id: FeedId,
        entry: IngestEntry,
    },
    UpdateFeedRemote {
        address: Address,
        update: FeedPollUpdate,
    },
    SetFeedOverlay {
        feed_id: FeedId,
        patch: FeedOverlayPatch,
    },
    SetEntryOverlay {
        address: Address,
        patch: EntryOverlayPatch,
        filter: EntryFilter,
    },
    AppendSyncLog(NewSyncLogEntry),
}

/// Result of one batch step, in operation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Feed(FeedId),
    Entry(EntryId),
    /// Rows matched by an update
    Affected(u64),
    SyncLog(i64),
}

async fn apply_one(
    conn: &mut SqliteConnection,
    operation: &Operation,
    now: i64,
    touched: &mut Vec<CollectionId>,
) -> Result<OperationResult, StoreError> {
    match operation {
        Operation::IngestFeed(feed) => {
            let id = ingest_feed_in(conn, feed).await?;
            touched.push(CollectionId::Feeds);
            Ok(OperationResult::Feed(id))
        }
        Operation::IngestEntry { feed_id, entry } => {
            let upsert = ingest_entry_in(conn, *feed_id, entry, now).await?;
            touched.extend(upsert.touched(*feed_id));
            Ok(OperationResult::Entry(upsert.id))
        }
        Operation::UpdateFeedRemote { address, update } => {
            let route = route(address)?.require(Target::FeedRemote, address)?;
            let affected = update_feed_remote_in(conn, &route, update).await?;
            if affected > 0 {
                touched.push(CollectionId::Feeds);
            }
            Ok(OperationResult::Affected(affected))
        }
        Operation::SetFeedOverlay { feed_id, patch } => {
            let route = feed_overlay_route(&Address::feed_overlay(*feed_id))?;
            let affected = update_feed_overlays_in(conn, &route, patch).await?;
            if affected > 0 {
                touched.push(CollectionId::Feeds);
            }
            Ok(OperationResult::Affected(affected))
        }
        Operation::SetEntryOverlay {
            address,
            patch,
            filter,
        } => {
            let route = entry_overlay_route(address)?;
            let affected = update_entry_overlays_in(conn, &route, patch, filter).await?;
            if affected > 0 {
                touched.push(CollectionId::Feeds);
            }
            Ok(OperationResult::Affected(affected))
        }
        Operation::AppendSyncLog(entry) => {
            let id = append_sync_log_in(conn, entry).await?;
            touched.push(CollectionId::SyncLog);
            Ok(OperationResult::SyncLog(id))
        }
    }
}

impl Database {
    /// Apply `operations` in order inside one transaction.
    ///
    /// Commits only if every operation succeeds; otherwise nothing is
    /// applied and nobody is notified. After the commit each distinct
    /// collection the batch touched is notified exactly once.
    ///
    /// # Errors
    ///
    /// `StoreError::BatchAborted` naming the index of the first failing
    /// operation, wrapping its error. A failing commit is returned as is.
    pub async fn apply_batch(
        &self,
        operations: Vec<Operation>,
    ) -> Result<Vec<OperationResult>, StoreError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let now = now();
        let mut results = Vec::with_capacity(operations.len());
        let mut touched = Vec::new();

        let mut tx = self.pool.begin().await?;
        for (index, operation) in operations.iter().enumerate() {
            match apply_one(&mut *tx, operation, now, &mut touched).await {
                Ok(result) => results.push(result),
                Err(source) => {
                    if let Err(e) = tx.rollback().await {
                        tracing::warn!(error = %e, "Failed to roll back aborted batch");
                    }
                    tracing::warn!(index, error = %source, "Batch aborted");
                    return Err(StoreError::BatchAborted {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }
        tx.commit().await?;

        tracing::debug!(operations = results.len(), "Applied batch");
        self.notifier.notify_all(touched);
        Ok(results)
    }
}
