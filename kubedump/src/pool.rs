//! A bounded worker pool for fanning out per-item work

use crate::errors::Errors;
use std::{future::Future, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

/// The default number of workers used by the pod-log and resource collectors
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Processes `items` on `concurrency` workers, returning the errors from all
/// items
///
/// All items are enqueued on a queue sized to hold them before the queue is
/// closed; workers exit once it is drained. Each item produces exactly one
/// result on a result queue of the same size, which is read serially here, so
/// no item is lost or processed twice and no locking is needed to merge
/// errors.
///
/// Once `token` is cancelled, workers skip the remaining items (still
/// reporting a result for each). The caller is responsible for checking the
/// token afterwards.
pub(crate) async fn run<T, F, Fut>(
    concurrency: usize,
    items: Vec<T>,
    token: &CancellationToken,
    work: F,
) -> Errors
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Errors> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Errors::default();
    }

    let (items_tx, items_rx) = mpsc::channel(total);
    for item in items {
        if items_tx.try_send(item).is_err() {
            unreachable!("queue is sized to hold every item");
        }
    }
    drop(items_tx);
    let items_rx = Arc::new(Mutex::new(items_rx));

    let (results_tx, mut results_rx) = mpsc::channel::<Errors>(total);
    let mut workers = JoinSet::new();
    for _ in 0..concurrency.clamp(1, total) {
        let items_rx = items_rx.clone();
        let results_tx = results_tx.clone();
        let token = token.clone();
        let work = work.clone();
        workers.spawn(async move {
            loop {
                let next = items_rx.lock().await.recv().await;
                let Some(item) = next else {
                    return;
                };
                let errors = if token.is_cancelled() {
                    Errors::default()
                } else {
                    work(item).await
                };
                if results_tx.send(errors).await.is_err() {
                    return;
                }
            }
        });
    }
    drop(results_tx);

    let mut errors = Errors::default();
    let mut received = 0;
    while received < total {
        match results_rx.recv().await {
            Some(item_errors) => {
                errors.extend(item_errors);
                received += 1;
            }
            None => break,
        }
    }

    while let Some(res) = workers.join_next().await {
        if let Err(error) = res {
            tracing::error!(%error, "Worker failed");
        }
    }
    if received < total {
        tracing::error!(received, total, "Workers exited before all items were processed");
    }

    errors
}
