// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters shared by the ingest and dispatch loops.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct RelayCounters {
    datagrams_received: AtomicU64,
    receive_errors: AtomicU64,
    oversized_payloads: AtomicU64,
    items_enqueued: AtomicU64,
    batches_submitted: AtomicU64,
    payloads_submitted: AtomicU64,
    submit_failures: AtomicU64,
    idle_wakeups: AtomicU64,
}

impl RelayCounters {
    pub(crate) fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn oversized_payload(&self) {
        self.oversized_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_enqueued(&self) {
        self.items_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_submitted(&self, payloads: usize) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.payloads_submitted
            .fetch_add(payloads as u64, Ordering::Relaxed);
    }

    pub(crate) fn submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn idle_wakeup(&self) {
        self.idle_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            oversized_payloads: self.oversized_payloads.load(Ordering::Relaxed),
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            payloads_submitted: self.payloads_submitted.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            idle_wakeups: self.idle_wakeups.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`RelayCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub datagrams_received: u64,
    pub receive_errors: u64,
    /// Payloads rejected because they exceed the maximum batch size on their own.
    pub oversized_payloads: u64,
    /// Batches or raw payloads pushed into the hand-off channel.
    pub items_enqueued: u64,
    pub batches_submitted: u64,
    pub payloads_submitted: u64,
    /// Batches dropped after the sink refused them.
    pub submit_failures: u64,
    /// Times the dispatch loop found the channel empty for a whole idle interval.
    pub idle_wakeups: u64,
}

impl fmt::Display for RelaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "datagrams_received={}, receive_errors={}, oversized_payloads={}, items_enqueued={}, batches_submitted={}, payloads_submitted={}, submit_failures={}, idle_wakeups={}",
            self.datagrams_received,
            self.receive_errors,
            self.oversized_payloads,
            self.items_enqueued,
            self.batches_submitted,
            self.payloads_submitted,
            self.submit_failures,
            self.idle_wakeups,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let counters = RelayCounters::default();
        counters.datagram_received();
        counters.datagram_received();
        counters.batch_submitted(2);
        counters.submit_failure();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.datagrams_received, 2);
        assert_eq!(snapshot.batches_submitted, 1);
        assert_eq!(snapshot.payloads_submitted, 2);
        assert_eq!(snapshot.submit_failures, 1);
        assert_eq!(snapshot.idle_wakeups, 0);
    }

    #[test]
    fn test_display_lists_every_counter() {
        let rendered = RelaySnapshot::default().to_string();
        assert!(rendered.starts_with("datagrams_received=0"));
        assert!(rendered.ends_with("idle_wakeups=0"));
        assert_eq!(rendered.matches('=').count(), 8);
    }
}
