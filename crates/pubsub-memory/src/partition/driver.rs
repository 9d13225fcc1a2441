use super::state::WorkItem;
use super::PartitionInner;

use std::sync::Arc;

use proven_pubsub::{AckReceiver, BatchHandler};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resolves acks, sweeps deadlines and dispatches batches for one
/// subscription until cancelled.
pub async fn run_driver(
    inner: Arc<PartitionInner>,
    generation: u64,
    mut acks: AckReceiver,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval(inner.config.ack_sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut acks_open = true;
    inner.dispatch(generation);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            ack = acks.recv(), if acks_open => {
                if let Some(ack) = ack {
                    inner.handle_ack(generation, ack);
                    inner.dispatch(generation);
                } else {
                    // Unacknowledged deliveries will time out.
                    debug!("Ack channel for {}/{} closed", inner.topic, inner.id);
                    acks_open = false;
                }
            }
            () = inner.wake.notified() => inner.dispatch(generation),
            _ = sweep.tick() => {
                inner.sweep(generation);
                inner.dispatch(generation);
            }
        }
    }

    debug!("Driver for {}/{} stopped", inner.topic, inner.id);
}

/// Hands batches to the handler one at a time, in dispatch order.
pub async fn run_worker(
    inner: Arc<PartitionInner>,
    handler: Arc<dyn BatchHandler>,
    mut work: mpsc::Receiver<WorkItem>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = work.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        // The queue has room again.
        inner.wake.notify_one();

        let batch = inner.begin_handoff(item);
        if batch.is_empty() {
            continue;
        }

        debug!(
            "Delivering batch of {} to {}/{}",
            batch.len(),
            inner.topic,
            inner.id
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = handler.deliver(batch) => {}
        }
    }

    debug!("Delivery worker for {}/{} stopped", inner.topic, inner.id);
}
