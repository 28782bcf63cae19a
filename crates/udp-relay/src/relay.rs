// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires a datagram source, the hand-off channel and a remote sink into two running loops.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::batch::BatchBuilder;
use crate::config::RelayConfig;
use crate::constants::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_IDLE_INTERVAL};
use crate::dispatch::{DispatchInput, DispatchLoop};
use crate::errors::RelayError;
use crate::event_hub::EventHubSink;
use crate::handoff::{channel, ChannelCapacity};
use crate::ingest::{IngestLoop, IngestOutput};
use crate::sink::{RemoteSink, RetryStrategy};
use crate::source::{DatagramSource, UdpSource};
use crate::stats::{RelayCounters, RelaySnapshot};

/// Which loop owns the batch builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchingSide {
    /// The ingest loop batches and hands off sealed batches.
    #[default]
    Producer,
    /// The ingest loop hands off raw payloads and the dispatch loop batches them.
    Consumer,
}

impl FromStr for BatchingSide {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "producer" => Ok(BatchingSide::Producer),
            "consumer" => Ok(BatchingSide::Consumer),
            other => Err(RelayError::InvalidConfig(format!(
                "Invalid batching side '{}'. Must be one of: producer, consumer",
                other
            ))),
        }
    }
}

impl Display for BatchingSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchingSide::Producer => write!(f, "producer"),
            BatchingSide::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub batching: BatchingSide,
    pub channel_capacity: ChannelCapacity,
    /// Longest the dispatch loop blocks on an empty channel before checking in.
    pub idle_interval: Duration,
    /// Producer-side batching only: hand off a partial batch after this much silence.
    pub linger: Option<Duration>,
    pub retry: RetryStrategy,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            batching: BatchingSide::default(),
            channel_capacity: ChannelCapacity::Bounded(DEFAULT_CHANNEL_CAPACITY),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            linger: Some(DEFAULT_IDLE_INTERVAL),
            retry: RetryStrategy::default(),
        }
    }
}

pub struct Relay<S, K> {
    source: S,
    sink: K,
    options: RelayOptions,
}

impl Relay<UdpSource, EventHubSink> {
    /// Binds the UDP socket and builds the Event Hub client described by `config`.
    pub async fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let sink = EventHubSink::new(config.event_hub_config()?)?;
        let source = UdpSource::bind(&config.host, config.port).await?;
        Ok(Relay::with_parts(source, sink, config.relay_options()))
    }
}

impl<S, K> Relay<S, K>
where
    S: DatagramSource + 'static,
    K: RemoteSink + 'static,
{
    pub fn with_parts(source: S, sink: K, options: RelayOptions) -> Self {
        Relay {
            source,
            sink,
            options,
        }
    }

    /// Spawns the ingest and dispatch loops on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> RelayHandle {
        let Relay {
            source,
            sink,
            options,
        } = self;
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(RelayCounters::default());

        let (output, input) = match options.batching {
            BatchingSide::Producer => {
                let (tx, rx) = channel(options.channel_capacity);
                let output = IngestOutput::Batches {
                    builder: BatchBuilder::new(sink.batch_limits()),
                    tx,
                    linger: options.linger,
                };
                (output, DispatchInput::Batches(rx))
            }
            BatchingSide::Consumer => {
                let (tx, rx) = channel(options.channel_capacity);
                (IngestOutput::Payloads(tx), DispatchInput::Payloads(rx))
            }
        };
        info!(
            "Starting relay: batching={}, channel={}, idle_interval={:?}, retry={:?}",
            options.batching, options.channel_capacity, options.idle_interval, options.retry
        );

        let ingest_loop = IngestLoop::new(
            source,
            output,
            Arc::clone(&counters),
            cancel_token.clone(),
        );
        let ingest_token = cancel_token.clone();
        let ingest = tokio::spawn(
            async move {
                let result = ingest_loop.run().await;
                if let Err(e) = &result {
                    error!("Ingest loop failed: {}", e);
                    ingest_token.cancel();
                }
                result
            }
            .in_current_span(),
        );

        let dispatch_loop = DispatchLoop::new(
            sink,
            input,
            options.retry,
            options.idle_interval,
            Arc::clone(&counters),
            cancel_token.clone(),
        );
        let dispatch = tokio::spawn(dispatch_loop.run().in_current_span());

        RelayHandle {
            cancel_token,
            counters,
            ingest,
            dispatch,
        }
    }
}

/// Running relay. Dropping the handle leaves the loops running until the token is cancelled.
pub struct RelayHandle {
    cancel_token: CancellationToken,
    counters: Arc<RelayCounters>,
    ingest: JoinHandle<Result<(), RelayError>>,
    dispatch: JoinHandle<()>,
}

enum Stopped {
    Ingest(Result<Result<(), RelayError>, JoinError>),
    Dispatch(Result<(), JoinError>),
}

fn joined<T>(result: Result<T, JoinError>) -> Result<T, RelayError> {
    result.map_err(|e| RelayError::Join(e.to_string()))
}

impl RelayHandle {
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    #[must_use]
    pub fn stats(&self) -> RelaySnapshot {
        self.counters.snapshot()
    }

    /// Cancels both loops, waits for the queued work to drain and returns the first
    /// fatal loop error.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        info!("Shutting down relay");
        self.cancel_token.cancel();
        self.wait().await
    }

    /// Waits for both loops to stop. When either stops on its own the other is cancelled.
    pub async fn wait(self) -> Result<(), RelayError> {
        let RelayHandle {
            cancel_token,
            counters,
            mut ingest,
            mut dispatch,
        } = self;

        let first = tokio::select! {
            biased;
            res = &mut ingest => Stopped::Ingest(res),
            res = &mut dispatch => Stopped::Dispatch(res),
        };
        // Once cancelled, the dispatch loop exits on its own after draining.
        let stopping = cancel_token.is_cancelled();
        cancel_token.cancel();
        let (ingest_result, dispatch_result) = match first {
            Stopped::Ingest(res) => (joined(res).and_then(|r| r), joined(dispatch.await)),
            Stopped::Dispatch(res) => {
                if !stopping {
                    error!("Dispatch loop stopped before the ingest loop");
                }
                (joined(ingest.await).and_then(|r| r), joined(res))
            }
        };

        info!("Relay stopped: {}", counters.snapshot());
        ingest_result.and(dispatch_result)
    }
}
