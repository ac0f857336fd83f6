//! Update dispatch: the channel adapter feeds a single bounded queue drained
//! by a fixed pool of workers.

use crate::handler::HandleError;
use crate::metrics;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use svoi_channels::Update;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[async_trait]
pub trait UpdateProcessor: Send + Sync + 'static {
    async fn process(&self, update: &Update, cancel: &CancellationToken)
    -> Result<(), HandleError>;
}

pub struct WorkerPool<P> {
    processor: Arc<P>,
    workers: usize,
}

impl<P: UpdateProcessor> WorkerPool<P> {
    pub fn new(processor: Arc<P>, workers: usize) -> Self {
        Self {
            processor,
            workers: workers.max(1),
        }
    }

    /// Drain `rx` until it closes or `cancel` fires, then wait for every
    /// in-flight update to finish.
    #[tracing::instrument(level = "info", skip_all, fields(workers = self.workers))]
    pub async fn run(self, rx: mpsc::Receiver<Update>, cancel: CancellationToken) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            set.spawn(worker_loop(
                worker,
                self.processor.clone(),
                rx.clone(),
                cancel.clone(),
            ));
        }
        tracing::info!("worker pool started");

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(%e, "worker task aborted");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop<P: UpdateProcessor>(
    worker: usize,
    processor: Arc<P>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Update>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            update = async { rx.lock().await.recv().await } => update,
        };
        let Some(update) = next else {
            return;
        };
        process_one(worker, processor.as_ref(), &update, &cancel).await;
    }
}

async fn process_one<P: UpdateProcessor>(
    worker: usize,
    processor: &P,
    update: &Update,
    cancel: &CancellationToken,
) {
    let span = match &update.message {
        Some(msg) => tracing::info_span!(
            "update",
            update_id = update.update_id,
            message_id = %msg.message_id,
            chat_id = %msg.chat_id,
            from_id = %msg.sender.id,
            from_username = msg.sender.username.as_deref().unwrap_or(""),
            worker,
        ),
        None => tracing::info_span!("update", update_id = update.update_id, worker),
    };

    if let Some(msg) = &update.message {
        metrics::record_queue_wait(msg.age());
    }

    async {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(processor.process(update, cancel))
            .catch_unwind()
            .await;
        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "update handling failed");
                false
            }
            Err(_) => {
                tracing::error!("update handler panicked");
                false
            }
        };
        if let Some(msg) = &update.message {
            metrics::record_update(msg.chat_id, "message", ok, started.elapsed());
        }
        tracing::debug!(ok, elapsed_ms = started.elapsed().as_millis() as u64, "update processed");
    }
    .instrument(span)
    .await
}
