// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the relay unit tests: a datagram source fed from the test body and
//! a sink that records what it is asked to submit.

#![cfg(test)]
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::{mpsc, Notify};

use crate::batch::{Batch, BatchLimits, Payload};
use crate::errors::SinkError;
use crate::sink::RemoteSink;
use crate::source::{Datagram, DatagramSource};

pub(crate) fn sender_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(111, 112, 113, 114)), 0)
}

/// Counts every payload as one unit, so `max` is a payload count.
pub(crate) fn count_limits(max: usize) -> BatchLimits {
    fn one_unit(_: &[u8]) -> usize {
        1
    }
    BatchLimits::new(max, one_unit)
}

/// Test handle pushing reads into a [`FeedSource`].
#[derive(Clone)]
pub(crate) struct SourceFeed {
    tx: mpsc::UnboundedSender<std::io::Result<Vec<u8>>>,
}

impl SourceFeed {
    pub(crate) fn send(&self, payload: &str) {
        self.tx.send(Ok(payload.as_bytes().to_vec())).unwrap();
    }

    pub(crate) fn send_bytes(&self, payload: Vec<u8>) {
        self.tx.send(Ok(payload)).unwrap();
    }

    pub(crate) fn fail(&self, kind: std::io::ErrorKind) {
        self.tx
            .send(Err(std::io::Error::new(kind, "scripted receive failure")))
            .unwrap();
    }
}

/// Replays whatever the feed sends, then blocks forever like an idle socket.
pub(crate) struct FeedSource {
    rx: mpsc::UnboundedReceiver<std::io::Result<Vec<u8>>>,
}

pub(crate) fn feed_source() -> (SourceFeed, FeedSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SourceFeed { tx }, FeedSource { rx })
}

#[async_trait]
impl DatagramSource for FeedSource {
    async fn receive(&mut self) -> std::io::Result<Datagram> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Datagram {
                payload: Payload::from(bytes),
                sender: sender_addr(),
            }),
            Some(Err(e)) => Err(e),
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ScriptedFailure {
    Transient,
    Permanent,
}

struct RecordingState {
    submitted: Mutex<Vec<Vec<Vec<u8>>>>,
    attempts: Mutex<usize>,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    notify: Notify,
}

/// Sink that stores every successfully submitted batch.
#[derive(Clone)]
pub(crate) struct RecordingSink {
    limits: BatchLimits,
    state: Arc<RecordingState>,
}

impl RecordingSink {
    pub(crate) fn new(limits: BatchLimits) -> Self {
        RecordingSink {
            limits,
            state: Arc::new(RecordingState {
                submitted: Mutex::new(Vec::new()),
                attempts: Mutex::new(0),
                failures: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// The next submissions fail in the given order before the sink recovers.
    pub(crate) fn fail_next(&self, failures: &[ScriptedFailure]) {
        self.state
            .failures
            .lock()
            .unwrap()
            .extend(failures.iter().copied());
    }

    pub(crate) fn submitted(&self) -> Vec<Vec<Vec<u8>>> {
        self.state.submitted.lock().unwrap().clone()
    }

    pub(crate) fn submitted_strings(&self) -> Vec<Vec<String>> {
        self.submitted()
            .into_iter()
            .map(|batch| {
                batch
                    .into_iter()
                    .map(|p| String::from_utf8(p).unwrap())
                    .collect()
            })
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        *self.state.attempts.lock().unwrap()
    }

    /// Waits until at least `n` batches were submitted.
    pub(crate) async fn wait_for_batches(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.state.notify.notified();
                if self.state.submitted.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .unwrap();
    }
}

#[async_trait]
impl RemoteSink for RecordingSink {
    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    async fn submit_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        *self.state.attempts.lock().unwrap() += 1;
        let failure = self.state.failures.lock().unwrap().pop_front();
        let result = match failure {
            Some(ScriptedFailure::Transient) => Err(SinkError::Destination(
                Some(StatusCode::SERVICE_UNAVAILABLE),
                "scripted outage".to_string(),
            )),
            Some(ScriptedFailure::Permanent) => Err(SinkError::Destination(
                Some(StatusCode::BAD_REQUEST),
                "scripted rejection".to_string(),
            )),
            None => {
                let payloads = batch
                    .payloads()
                    .iter()
                    .map(|p| p.bytes().to_vec())
                    .collect();
                self.state.submitted.lock().unwrap().push(payloads);
                Ok(())
            }
        };
        self.state.notify.notify_waiters();
        result
    }
}
