// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the ingest and dispatch sides of the relay.

use crate::batch::Payload;
use reqwest::StatusCode;

/// Fatal errors. Anything surfacing as a `RelayError` stops the loop that hit it.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Giving up on datagram source after {attempts} consecutive errors: {source}")]
    Receive {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Hand-off channel closed by the other side")]
    ChannelClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Failed to create remote sink client: {0}")]
    SinkCreation(String),

    #[error("Relay task failed: {0}")]
    Join(String),
}

/// A submission to the remote sink failed.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The batch itself could not be turned into a request. Never retried.
    #[error("Failed to prepare payload: {0}")]
    Payload(String),

    /// The remote service or the network failed.
    #[error("Error shipping batch: {0:?} {1}")]
    Destination(Option<StatusCode>, String),
}

impl SinkError {
    /// 4xx responses and payload errors will fail the same way on every attempt.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            SinkError::Payload(_) => true,
            SinkError::Destination(status, _) => status.is_some_and(|s| s.is_client_error()),
        }
    }
}

/// A payload that can never fit into a batch, whatever the batch already holds.
#[derive(Debug, thiserror::Error)]
#[error("Payload of {size} bytes exceeds the maximum batch size of {max} bytes")]
pub struct OversizedPayload {
    pub payload: Payload,
    pub size: usize,
    pub max: usize,
}

/// Outcome of a rejected `Batch::try_add`. The payload is always handed back.
#[derive(Debug, thiserror::Error)]
pub enum AddError {
    /// Normal control signal: seal this batch and retry in a fresh one.
    #[error("Batch full")]
    Full(Payload),

    #[error(transparent)]
    TooLarge(#[from] OversizedPayload),
}
