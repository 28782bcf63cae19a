// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer side of the relay: drains the datagram source and feeds the hand-off channel.
//!
//! Depending on where batching happens the loop either fills batches itself and hands off
//! each sealed batch, or forwards raw payloads for the dispatch loop to batch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{Batch, BatchBuilder, Payload};
use crate::constants::MAX_CONSECUTIVE_RECEIVE_ERRORS;
use crate::errors::RelayError;
use crate::handoff::HandoffSender;
use crate::source::{Datagram, DatagramSource};
use crate::stats::RelayCounters;

/// What the ingest loop pushes into the hand-off channel.
pub enum IngestOutput {
    /// Batch on this side; hand off sealed batches.
    Batches {
        builder: BatchBuilder,
        tx: HandoffSender<Batch>,
        /// Hand off a partially filled batch when no datagram arrived for this long.
        linger: Option<Duration>,
    },
    /// Hand off every payload as received.
    Payloads(HandoffSender<Payload>),
}

pub struct IngestLoop<S> {
    source: S,
    output: IngestOutput,
    counters: Arc<RelayCounters>,
    cancel_token: CancellationToken,
}

enum Event {
    Datagram(Datagram),
    Lingered,
    Cancelled,
}

/// Wraps the source with error accounting and cancellation.
struct Receiver<'a, S> {
    source: &'a mut S,
    counters: &'a RelayCounters,
    cancel_token: &'a CancellationToken,
    consecutive_errors: u32,
}

impl<S: DatagramSource> Receiver<'_, S> {
    async fn next(&mut self, linger: Option<Duration>) -> Result<Event, RelayError> {
        loop {
            let received = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return Ok(Event::Cancelled),
                res = self.source.receive() => res,
                () = linger_elapsed(linger) => return Ok(Event::Lingered),
            };

            let e = match received {
                Ok(datagram) => {
                    self.consecutive_errors = 0;
                    self.counters.datagram_received();
                    trace!(
                        "Received {} bytes from {}",
                        datagram.payload.len(),
                        datagram.sender
                    );
                    return Ok(Event::Datagram(datagram));
                }
                Err(e) => e,
            };

            self.counters.receive_error();
            self.consecutive_errors += 1;
            if self.consecutive_errors >= MAX_CONSECUTIVE_RECEIVE_ERRORS {
                error!(
                    "Too many consecutive receive errors ({}), stopping ingest: {}",
                    self.consecutive_errors, e
                );
                return Err(RelayError::Receive {
                    attempts: self.consecutive_errors,
                    source: e,
                });
            }
            warn!("Failed to receive datagram: {}", e);

            let backoff = Duration::from_millis(10u64 * (1 << self.consecutive_errors));
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return Ok(Event::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

async fn linger_elapsed(linger: Option<Duration>) {
    match linger {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Pushes one item, waiting for room when the channel is full. Not raced against
/// cancellation: the dispatch loop keeps draining during shutdown, so the push completes.
async fn forward<T>(
    tx: &HandoffSender<T>,
    item: T,
    counters: &RelayCounters,
) -> Result<(), RelayError> {
    if tx.push(item).await.is_err() {
        error!("Dispatch loop is gone, stopping ingest");
        return Err(RelayError::ChannelClosed);
    }
    counters.item_enqueued();
    Ok(())
}

impl<S: DatagramSource> IngestLoop<S> {
    pub fn new(
        source: S,
        output: IngestOutput,
        counters: Arc<RelayCounters>,
        cancel_token: CancellationToken,
    ) -> Self {
        IngestLoop {
            source,
            output,
            counters,
            cancel_token,
        }
    }

    /// Runs until cancelled or until the source becomes unusable.
    ///
    /// Dropping the loop drops its sender, which lets the dispatch loop finish draining.
    pub async fn run(self) -> Result<(), RelayError> {
        let IngestLoop {
            mut source,
            output,
            counters,
            cancel_token,
        } = self;
        let mut receiver = Receiver {
            source: &mut source,
            counters: &counters,
            cancel_token: &cancel_token,
            consecutive_errors: 0,
        };

        debug!("Ingest loop started");
        let result = match output {
            IngestOutput::Batches {
                builder,
                tx,
                linger,
            } => run_batches(&mut receiver, builder, &tx, linger).await,
            IngestOutput::Payloads(tx) => run_payloads(&mut receiver, &tx).await,
        };
        info!("Ingest loop stopped");
        result
    }
}

async fn run_batches<S: DatagramSource>(
    receiver: &mut Receiver<'_, S>,
    builder: BatchBuilder,
    tx: &HandoffSender<Batch>,
    linger: Option<Duration>,
) -> Result<(), RelayError> {
    let counters = receiver.counters;
    let mut open = builder.open();

    let result = loop {
        let linger = if open.is_empty() { None } else { linger };
        let event = match receiver.next(linger).await {
            Ok(event) => event,
            Err(e) => break Err(e),
        };
        match event {
            Event::Datagram(datagram) => match builder.try_add(&mut open, datagram.payload) {
                Ok(None) => {}
                Ok(Some(sealed)) => {
                    debug!(
                        "Batch full, handing off {} payloads ({} bytes)",
                        sealed.len(),
                        sealed.size_bytes()
                    );
                    forward(tx, sealed, counters).await?;
                }
                Err(oversized) => {
                    counters.oversized_payload();
                    warn!("Dropping datagram from {}: {}", datagram.sender, oversized);
                }
            },
            Event::Lingered => {
                let sealed = std::mem::replace(&mut open, builder.open());
                debug!(
                    "Source idle, handing off partial batch of {} payloads",
                    sealed.len()
                );
                forward(tx, sealed, counters).await?;
            }
            Event::Cancelled => break Ok(()),
        }
    };

    // Whatever was received is handed off, also when the source failed.
    if !open.is_empty() {
        debug!("Handing off final batch of {} payloads", open.len());
        if tx.push(open).await.is_err() {
            warn!("Dispatch loop is gone, dropping final batch");
        } else {
            counters.item_enqueued();
        }
    }
    result
}

async fn run_payloads<S: DatagramSource>(
    receiver: &mut Receiver<'_, S>,
    tx: &HandoffSender<Payload>,
) -> Result<(), RelayError> {
    let counters = receiver.counters;
    loop {
        match receiver.next(None).await? {
            Event::Datagram(datagram) => forward(tx, datagram.payload, counters).await?,
            Event::Lingered => {}
            Event::Cancelled => return Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::BatchLimits;
    use crate::handoff::{channel, ChannelCapacity, HandoffReceiver};
    use crate::test_support::{count_limits, feed_source, FeedSource, SourceFeed};
    use std::io::ErrorKind;
    use tokio::task::JoinHandle;
    use tracing::Instrument;
    use tracing_test::traced_test;

    struct Harness {
        feed: SourceFeed,
        cancel_token: CancellationToken,
        counters: Arc<RelayCounters>,
        task: JoinHandle<Result<(), RelayError>>,
    }

    fn spawn_loop(output: IngestOutput, source: FeedSource, feed: SourceFeed) -> Harness {
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(RelayCounters::default());
        let ingest = IngestLoop::new(source, output, Arc::clone(&counters), cancel_token.clone());
        Harness {
            feed,
            cancel_token,
            counters,
            task: tokio::spawn(ingest.run().in_current_span()),
        }
    }

    fn spawn_batching(
        limits: BatchLimits,
        capacity: ChannelCapacity,
        linger: Option<Duration>,
    ) -> (Harness, HandoffReceiver<Batch>) {
        let (feed, source) = feed_source();
        let (tx, rx) = channel(capacity);
        let output = IngestOutput::Batches {
            builder: BatchBuilder::new(limits),
            tx,
            linger,
        };
        (spawn_loop(output, source, feed), rx)
    }

    fn strings(batch: &Batch) -> Vec<String> {
        batch
            .payloads()
            .iter()
            .map(|p| String::from_utf8(p.bytes().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_seals_batches_in_receive_order() {
        let (harness, mut rx) =
            spawn_batching(count_limits(2), ChannelCapacity::Bounded(8), None);
        for p in ["a", "b", "c"] {
            harness.feed.send(p);
        }

        let first = rx.recv().await.unwrap();
        assert_eq!(strings(&first), vec!["a", "b"]);

        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();

        let last = rx.recv().await.unwrap();
        assert_eq!(strings(&last), vec!["c"]);
        assert!(rx.recv().await.is_none());

        let snapshot = harness.counters.snapshot();
        assert_eq!(snapshot.datagrams_received, 3);
        assert_eq!(snapshot.items_enqueued, 2);
    }

    #[tokio::test]
    async fn test_cancel_with_empty_batch_hands_off_nothing() {
        let (harness, mut rx) =
            spawn_batching(count_limits(2), ChannelCapacity::Bounded(8), None);
        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_hands_off_partial_batch() {
        let linger = Duration::from_secs(30);
        let (harness, mut rx) =
            spawn_batching(count_limits(10), ChannelCapacity::Bounded(8), Some(linger));
        harness.feed.send("lonely");

        let start = tokio::time::Instant::now();
        let batch = rx.recv().await.unwrap();
        assert_eq!(strings(&batch), vec!["lonely"]);
        assert!(start.elapsed() >= linger);
        harness.cancel_token.cancel();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_oversized_payload_is_rejected_not_retried() {
        let (harness, mut rx) =
            spawn_batching(BatchLimits::raw(4), ChannelCapacity::Bounded(8), None);
        harness.feed.send("ab");
        harness.feed.send("way too long");
        harness.feed.send("cd");
        harness.feed.send("e");

        let first = rx.recv().await.unwrap();
        assert_eq!(strings(&first), vec!["ab", "cd"]);

        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
        assert_eq!(harness.counters.snapshot().oversized_payloads, 1);
        assert!(logs_contain("exceeds the maximum batch size"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_single_receive_error_does_not_stop_ingest() {
        let (harness, mut rx) =
            spawn_batching(count_limits(1), ChannelCapacity::Bounded(8), None);
        harness.feed.fail(ErrorKind::ConnectionReset);
        harness.feed.send("a");
        harness.feed.send("b");

        let batch = rx.recv().await.unwrap();
        assert_eq!(strings(&batch), vec!["a"]);
        assert_eq!(harness.counters.snapshot().receive_errors, 1);
        assert!(logs_contain("Failed to receive datagram"));
        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_receive_errors_are_fatal() {
        let (harness, _rx) =
            spawn_batching(count_limits(1), ChannelCapacity::Bounded(8), None);
        for _ in 0..MAX_CONSECUTIVE_RECEIVE_ERRORS {
            harness.feed.fail(ErrorKind::Other);
        }

        match harness.task.await.unwrap() {
            Err(RelayError::Receive { attempts, .. }) => {
                assert_eq!(attempts, MAX_CONSECUTIVE_RECEIVE_ERRORS);
            }
            other => panic!("expected fatal receive error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_error_streak() {
        let (harness, mut rx) =
            spawn_batching(count_limits(1), ChannelCapacity::Bounded(64), None);
        for i in 0..3 {
            for _ in 0..MAX_CONSECUTIVE_RECEIVE_ERRORS - 1 {
                harness.feed.fail(ErrorKind::Other);
            }
            harness.feed.send(&format!("p{i}"));
        }
        harness.feed.send("last");

        for expected in ["p0", "p1", "p2"] {
            assert_eq!(strings(&rx.recv().await.unwrap()), vec![expected]);
        }
        assert!(!harness.task.is_finished());
        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_channel_throttles_ingest() {
        let (harness, mut rx) =
            spawn_batching(count_limits(1), ChannelCapacity::Bounded(1), None);
        for p in ["a", "b", "c", "d"] {
            harness.feed.send(p);
        }

        // [a] is queued, [b] waits for room, [c] is open and "d" is still unread.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = harness.counters.snapshot();
        assert_eq!(snapshot.datagrams_received, 3);
        assert_eq!(snapshot.items_enqueued, 1);

        for expected in ["a", "b", "c"] {
            assert_eq!(strings(&rx.recv().await.unwrap()), vec![expected]);
        }
        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
        assert_eq!(strings(&rx.recv().await.unwrap()), vec!["d"]);
    }

    #[tokio::test]
    async fn test_closed_channel_is_fatal() {
        let (harness, rx) = spawn_batching(count_limits(1), ChannelCapacity::Bounded(1), None);
        drop(rx);
        harness.feed.send("a");
        harness.feed.send("b");

        assert!(matches!(
            harness.task.await.unwrap(),
            Err(RelayError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_payload_mode_forwards_raw_payloads() {
        let (feed, source) = feed_source();
        let (tx, mut rx) = channel(ChannelCapacity::Unbounded);
        let harness = spawn_loop(IngestOutput::Payloads(tx), source, feed);
        harness.feed.send("x");
        harness.feed.send_bytes(vec![0xff, 0x00]);

        assert_eq!(rx.recv().await.unwrap().bytes(), b"x");
        assert_eq!(rx.recv().await.unwrap().bytes(), &[0xff, 0x00]);

        harness.cancel_token.cancel();
        harness.task.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(harness.counters.snapshot().items_enqueued, 2);
    }
}
