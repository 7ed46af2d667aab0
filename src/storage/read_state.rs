use super::schema::Database;
use super::types::{ReadStateChange, StoreError};
use crate::notify::CollectionId;

impl Database {
    /// Confirm every pending read flag: `ro_flag_read := flag_read` for the
    /// rows where the two differ, in one transaction.
    ///
    /// Call before reporting read state upstream. Observers of the feed
    /// listing are notified once, and only when something changed.
    pub async fn commit_pending_read_flags(&self) -> Result<(), StoreError> {
        self.confirm_read_flags().await.map(|_| ())
    }

    /// Same as [`Database::commit_pending_read_flags`], returning how many
    /// rows the committing transaction confirmed.
    pub async fn confirm_read_flags(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE entry_user SET ro_flag_read = flag_read WHERE ro_flag_read <> flag_read",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, "Committed pending read flags");
            self.notifier.notify(CollectionId::Feeds);
        }
        Ok(count)
    }

    /// Entries whose pending read flag has not been confirmed yet.
    pub async fn pending_read_changes(&self) -> Result<Vec<ReadStateChange>, StoreError> {
        let rows = sqlx::query_as::<_, ReadStateChange>(
            r#"
            SELECT id, feed_id, guid, flag_read, ro_flag_read
            FROM entry_view
            WHERE flag_read <> ro_flag_read
            ORDER BY feed_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
