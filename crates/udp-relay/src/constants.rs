// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Size of the receive buffer handed to the socket for every datagram.
/// Datagrams longer than this are truncated by the OS.
pub const BUFFER_SIZE: usize = 8196;

/// UDP port the relay listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 1444;

/// Address the relay binds to when nothing else is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// How long the dispatch loop waits on an empty hand-off channel before it
/// reports itself idle and re-checks.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Number of items the hand-off channel holds before the producer is throttled.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Largest batch Event Hubs accepts on the standard tier.
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 1_024 * 1_024;

pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

// Backoff formula: 10ms * 2^error_count.
// With MAX = 5: backoffs are 20ms, 40ms, 80ms, 160ms before giving up on the socket.
pub const MAX_CONSECUTIVE_RECEIVE_ERRORS: u32 = 5;
