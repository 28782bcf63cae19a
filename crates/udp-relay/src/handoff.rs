// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-process queue between the ingest loop and the dispatch loop.
//!
//! A thin wrapper over tokio's mpsc channels so the loops do not care whether the queue is
//! bounded. With a bounded queue a full channel makes `push` wait, which throttles the
//! ingest side instead of growing memory. The unbounded flavour never waits.

use tokio::sync::mpsc;

pub use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCapacity {
    /// At most this many items in flight; pushes wait while the channel is full.
    Bounded(usize),
    Unbounded,
}

impl ChannelCapacity {
    /// `0` selects an unbounded channel.
    #[must_use]
    pub fn from_size(size: usize) -> Self {
        match size {
            0 => ChannelCapacity::Unbounded,
            n => ChannelCapacity::Bounded(n),
        }
    }
}

impl std::fmt::Display for ChannelCapacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelCapacity::Bounded(n) => write!(f, "bounded({})", n),
            ChannelCapacity::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Returned by [`HandoffSender::push`] when the consumer is gone. Carries the item back.
pub struct ChannelClosed<T>(pub T);

impl<T> std::fmt::Debug for ChannelClosed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelClosed(..)")
    }
}

impl<T> std::fmt::Display for ChannelClosed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("hand-off channel closed")
    }
}

impl<T> std::error::Error for ChannelClosed<T> {}

enum SenderInner<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum ReceiverInner<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

pub struct HandoffSender<T> {
    inner: SenderInner<T>,
}

pub struct HandoffReceiver<T> {
    inner: ReceiverInner<T>,
}

#[must_use]
pub fn channel<T>(capacity: ChannelCapacity) -> (HandoffSender<T>, HandoffReceiver<T>) {
    match capacity {
        ChannelCapacity::Bounded(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (
                HandoffSender {
                    inner: SenderInner::Bounded(tx),
                },
                HandoffReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        ChannelCapacity::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                HandoffSender {
                    inner: SenderInner::Unbounded(tx),
                },
                HandoffReceiver {
                    inner: ReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}

impl<T> HandoffSender<T> {
    /// Enqueues `item`, waiting for room when the channel is bounded and full.
    pub async fn push(&self, item: T) -> Result<(), ChannelClosed<T>> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.send(item).await.map_err(|e| ChannelClosed(e.0)),
            SenderInner::Unbounded(tx) => tx.send(item).map_err(|e| ChannelClosed(e.0)),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }

    /// Free slots left, `None` when unbounded.
    #[must_use]
    pub fn remaining_capacity(&self) -> Option<usize> {
        match &self.inner {
            SenderInner::Bounded(tx) => Some(tx.capacity()),
            SenderInner::Unbounded(_) => None,
        }
    }
}

impl<T> HandoffReceiver<T> {
    /// Waits for the next item. `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.try_recv(),
            ReceiverInner::Unbounded(rx) => rx.try_recv(),
        }
    }

    /// Stops accepting new items. Items already queued can still be received.
    pub fn close(&mut self) {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.close(),
            ReceiverInner::Unbounded(rx) => rx.close(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        for capacity in [ChannelCapacity::Bounded(16), ChannelCapacity::Unbounded] {
            let (tx, mut rx) = channel(capacity);
            for i in 0..10 {
                tx.push(i).await.unwrap();
            }
            drop(tx);

            let mut received = Vec::new();
            while let Some(i) = rx.recv().await {
                received.push(i);
            }
            assert_eq!(received, (0..10).collect::<Vec<_>>(), "{capacity}");
        }
    }

    #[tokio::test]
    async fn test_bounded_push_waits_when_full() {
        let (tx, mut rx) = channel(ChannelCapacity::Bounded(1));
        tx.push("first").await.unwrap();
        assert_eq!(tx.remaining_capacity(), Some(0));

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.push("second")).await;
        assert!(blocked.is_err(), "push should wait on a full channel");

        assert_eq!(rx.recv().await, Some("first"));
        tx.push("third").await.unwrap();
        assert_eq!(rx.recv().await, Some("third"));
    }

    #[tokio::test]
    async fn test_unbounded_push_never_waits() {
        let (tx, _rx) = channel(ChannelCapacity::Unbounded);
        for i in 0..10_000 {
            tx.push(i).await.unwrap();
        }
        assert_eq!(tx.remaining_capacity(), None);
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped_returns_item() {
        let (tx, rx) = channel(ChannelCapacity::Bounded(4));
        drop(rx);
        assert!(tx.is_closed());
        let ChannelClosed(item) = tx.push(42).await.unwrap_err();
        assert_eq!(item, 42);
    }

    #[tokio::test]
    async fn test_try_recv_empty_and_disconnected() {
        let (tx, mut rx) = channel::<u8>(ChannelCapacity::Unbounded);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        tx.push(1).await.unwrap();
        drop(tx);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test]
    async fn test_close_keeps_queued_items() {
        let (tx, mut rx) = channel(ChannelCapacity::Bounded(4));
        tx.push(1).await.unwrap();
        rx.close();
        assert!(tx.push(2).await.is_err());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_capacity_from_size() {
        assert_eq!(ChannelCapacity::from_size(0), ChannelCapacity::Unbounded);
        assert_eq!(ChannelCapacity::from_size(8), ChannelCapacity::Bounded(8));
    }
}
