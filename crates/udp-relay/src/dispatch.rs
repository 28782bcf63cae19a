// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumer side of the relay: takes items off the hand-off channel and submits batches.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{Batch, BatchBuilder, Payload};
use crate::handoff::HandoffReceiver;
use crate::sink::{submit_with_retry, RemoteSink, RetryStrategy};
use crate::stats::RelayCounters;

/// What the dispatch loop expects to find in the hand-off channel.
pub enum DispatchInput {
    /// Sealed batches, submitted as they are.
    Batches(HandoffReceiver<Batch>),
    /// Raw payloads, batched here right before submission.
    Payloads(HandoffReceiver<Payload>),
}

pub struct DispatchLoop<K> {
    sink: K,
    input: DispatchInput,
    retry: RetryStrategy,
    idle_interval: Duration,
    counters: Arc<RelayCounters>,
    cancel_token: CancellationToken,
}

enum Received<T> {
    Item(T),
    Idle,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    // Cancelled; waiting for the producer to hang up.
    Draining,
    // Receiver closed; only queued items are left.
    Closed,
}

struct Inbox<'a, T> {
    rx: HandoffReceiver<T>,
    idle_interval: Duration,
    cancel_token: &'a CancellationToken,
    phase: Phase,
}

impl<T> Inbox<'_, T> {
    async fn next(&mut self) -> Received<T> {
        loop {
            match self.phase {
                Phase::Running => {
                    let received = tokio::select! {
                        biased;
                        () = self.cancel_token.cancelled() => {
                            debug!("Shutdown requested, draining the hand-off channel");
                            self.phase = Phase::Draining;
                            continue;
                        }
                        res = tokio::time::timeout(self.idle_interval, self.rx.recv()) => res,
                    };
                    return match received {
                        Ok(Some(item)) => Received::Item(item),
                        Ok(None) => Received::Closed,
                        Err(_) => Received::Idle,
                    };
                }
                Phase::Draining => {
                    match tokio::time::timeout(self.idle_interval, self.rx.recv()).await {
                        Ok(Some(item)) => return Received::Item(item),
                        Ok(None) => return Received::Closed,
                        Err(_) => {
                            warn!(
                                "Producer still attached {:?} after shutdown, closing the hand-off channel",
                                self.idle_interval
                            );
                            self.rx.close();
                            self.phase = Phase::Closed;
                        }
                    }
                }
                Phase::Closed => {
                    return match self.rx.recv().await {
                        Some(item) => Received::Item(item),
                        None => Received::Closed,
                    };
                }
            }
        }
    }
}

impl<K: RemoteSink> DispatchLoop<K> {
    pub fn new(
        sink: K,
        input: DispatchInput,
        retry: RetryStrategy,
        idle_interval: Duration,
        counters: Arc<RelayCounters>,
        cancel_token: CancellationToken,
    ) -> Self {
        DispatchLoop {
            sink,
            input,
            retry,
            idle_interval,
            counters,
            cancel_token,
        }
    }

    /// Runs until the hand-off channel is closed and drained.
    ///
    /// Submission failures never end the loop; the failed batch is dropped.
    pub async fn run(self) {
        let DispatchLoop {
            sink,
            input,
            retry,
            idle_interval,
            counters,
            cancel_token,
        } = self;
        let submitter = Submitter {
            sink: &sink,
            retry: &retry,
            counters: &counters,
            cancel_token: &cancel_token,
        };

        debug!("Dispatch loop started");
        match input {
            DispatchInput::Batches(rx) => {
                let inbox = Inbox {
                    rx,
                    idle_interval,
                    cancel_token: &cancel_token,
                    phase: Phase::Running,
                };
                run_batches(inbox, &submitter).await;
            }
            DispatchInput::Payloads(rx) => {
                let inbox = Inbox {
                    rx,
                    idle_interval,
                    cancel_token: &cancel_token,
                    phase: Phase::Running,
                };
                run_payloads(inbox, &submitter).await;
            }
        }
        info!("Dispatch loop stopped: {}", counters.snapshot());
    }
}

struct Submitter<'a, K> {
    sink: &'a K,
    retry: &'a RetryStrategy,
    counters: &'a RelayCounters,
    cancel_token: &'a CancellationToken,
}

impl<K: RemoteSink> Submitter<'_, K> {
    async fn submit(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        debug!(
            "Submitting batch of {} payloads ({} bytes)",
            batch.len(),
            batch.size_bytes()
        );
        match submit_with_retry(self.sink, &batch, self.retry, self.cancel_token).await {
            Ok(()) => self.counters.batch_submitted(batch.len()),
            Err(e) => {
                self.counters.submit_failure();
                error!("Dropping batch of {} payloads: {}", batch.len(), e);
            }
        }
    }
}

async fn run_batches<K: RemoteSink>(mut inbox: Inbox<'_, Batch>, submitter: &Submitter<'_, K>) {
    loop {
        match inbox.next().await {
            Received::Item(batch) => submitter.submit(batch).await,
            Received::Idle => {
                submitter.counters.idle_wakeup();
                trace!("No batch within {:?}", inbox.idle_interval);
            }
            Received::Closed => return,
        }
    }
}

async fn run_payloads<K: RemoteSink>(
    mut inbox: Inbox<'_, Payload>,
    submitter: &Submitter<'_, K>,
) {
    let builder = BatchBuilder::new(submitter.sink.batch_limits());
    let mut open = builder.open();
    loop {
        match inbox.next().await {
            Received::Item(payload) => match builder.try_add(&mut open, payload) {
                Ok(None) => {}
                Ok(Some(sealed)) => submitter.submit(sealed).await,
                Err(oversized) => {
                    submitter.counters.oversized_payload();
                    warn!("Dropping payload: {}", oversized);
                }
            },
            Received::Idle => {
                submitter.counters.idle_wakeup();
                if open.is_empty() {
                    trace!("No payload within {:?}", inbox.idle_interval);
                } else {
                    let sealed = std::mem::replace(&mut open, builder.open());
                    submitter.submit(sealed).await;
                }
            }
            Received::Closed => break,
        }
    }
    submitter.submit(open).await;
}
