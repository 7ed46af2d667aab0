use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::types::StoreError;

/// Lazy, finite, single-pass sequence of query results.
///
/// The query runs on a background task and hands rows over as they are
/// read. Dropping `Rows` abandons the query; the store is not affected. To
/// read again, issue a new query.
///
/// On an in-memory store the query runs to completion before the first row
/// is handed over, so a consumer may write between rows on any backend.
pub struct Rows<T> {
    rx: mpsc::Receiver<Result<T, StoreError>>,
}

impl<T: Send + 'static> Rows<T> {
    /// Run `producer` on its own task, feeding rows into a channel of
    /// `buffer` slots.
    pub(crate) fn spawn<F, Fut>(buffer: usize, producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<T, StoreError>>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(producer(tx));
        Self { rx }
    }

    /// A sequence that yields `err` and ends.
    pub(crate) fn failed(err: StoreError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh channel: cannot be full or closed
        let _ = tx.try_send(Err(err));
        Self { rx }
    }
}

impl<T> Rows<T> {
    /// Next row, or `None` when the sequence is exhausted.
    pub async fn next_row(&mut self) -> Option<Result<T, StoreError>> {
        self.rx.recv().await
    }

    /// Drain the sequence, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>, StoreError> {
        let mut rows = Vec::new();
        while let Some(row) = self.rx.recv().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl<T> Stream for Rows<T> {
    type Item = Result<T, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Hand over rows that were already read in full, mapping each row.
///
/// Used where an open statement would block writers until the consumer
/// catches up.
pub(crate) async fn forward_all<R, T>(
    rows: Result<Vec<R>, sqlx::Error>,
    tx: &mpsc::Sender<Result<T, StoreError>>,
    map: impl Fn(R) -> T,
) {
    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            let _ = tx.send(Err(StoreError::from(e))).await;
            return;
        }
    };
    for row in rows {
        if tx.send(Ok(map(row))).await.is_err() {
            tracing::debug!("Row consumer went away, dropping buffered rows");
            return;
        }
    }
}

/// Pump a sqlx row stream into `tx`, mapping each row.
///
/// Stops after the first error, or as soon as the consumer is gone.
pub(crate) async fn forward<S, R, T>(
    mut stream: S,
    tx: &mpsc::Sender<Result<T, StoreError>>,
    map: impl Fn(R) -> T,
) where
    S: Stream<Item = Result<R, sqlx::Error>> + Unpin,
{
    while let Some(item) = stream.next().await {
        let item = item.map(&map).map_err(StoreError::from);
        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            tracing::debug!("Row consumer went away, abandoning query");
            return;
        }
        if failed {
            return;
        }
    }
}
