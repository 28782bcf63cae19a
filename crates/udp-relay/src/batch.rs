// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-bounded batch construction.
//!
//! A [`Batch`] accumulates payloads until the next one would push its serialized size past
//! the limit declared by the remote sink. Rejection because the batch is full is not an
//! error: it is the signal to seal the batch and start a new one. A payload that would not
//! fit even into an empty batch is reported separately so callers never loop on it.

use crate::errors::{AddError, OversizedPayload};

/// An immutable datagram body, moved into exactly one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload(s.as_bytes().to_vec())
    }
}

/// Serialized cost of one payload once it is placed in a batch.
pub type EventSizeFn = fn(&[u8]) -> usize;

/// Size policy handed out by a remote sink. `Copy`, so the ingest side can build batches
/// without holding on to the sink itself.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_size_bytes: usize,
    pub event_size: EventSizeFn,
}

impl BatchLimits {
    #[must_use]
    pub fn new(max_size_bytes: usize, event_size: EventSizeFn) -> Self {
        BatchLimits {
            max_size_bytes,
            event_size,
        }
    }

    /// Limits where a payload costs exactly its length.
    #[must_use]
    pub fn raw(max_size_bytes: usize) -> Self {
        BatchLimits::new(max_size_bytes, <[u8]>::len)
    }

    #[must_use]
    pub fn event_cost(&self, payload: &Payload) -> usize {
        (self.event_size)(payload.bytes())
    }
}

/// An ordered run of payloads whose accounted size never exceeds `max_size_bytes`.
#[derive(Debug, Clone)]
pub struct Batch {
    payloads: Vec<Payload>,
    size_bytes: usize,
    limits: BatchLimits,
}

impl Batch {
    #[must_use]
    pub fn new(limits: BatchLimits) -> Self {
        Batch {
            payloads: Vec::new(),
            size_bytes: 0,
            limits,
        }
    }

    /// Appends `payload` if it fits. On rejection the batch is left untouched and the
    /// payload is returned inside the error.
    pub fn try_add(&mut self, payload: Payload) -> Result<(), AddError> {
        let cost = self.limits.event_cost(&payload);
        if cost > self.limits.max_size_bytes {
            return Err(AddError::TooLarge(OversizedPayload {
                payload,
                size: cost,
                max: self.limits.max_size_bytes,
            }));
        }
        if self.size_bytes + cost > self.limits.max_size_bytes {
            return Err(AddError::Full(payload));
        }
        self.payloads.push(payload);
        self.size_bytes += cost;
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn max_size_bytes(&self) -> usize {
        self.limits.max_size_bytes
    }

    #[must_use]
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    #[must_use]
    pub fn into_payloads(self) -> Vec<Payload> {
        self.payloads
    }
}

/// Opens batches bound to a fixed set of limits and rolls them over when full.
#[derive(Debug, Clone, Copy)]
pub struct BatchBuilder {
    limits: BatchLimits,
}

impl BatchBuilder {
    #[must_use]
    pub fn new(limits: BatchLimits) -> Self {
        BatchBuilder { limits }
    }

    #[must_use]
    pub fn open(&self) -> Batch {
        Batch::new(self.limits)
    }

    /// Adds `payload` to the open `batch`.
    ///
    /// Returns `Ok(Some(sealed))` when `batch` was full: the full batch is returned for
    /// dispatch and `batch` is replaced by a new one that already holds `payload`.
    pub fn try_add(
        &self,
        batch: &mut Batch,
        payload: Payload,
    ) -> Result<Option<Batch>, OversizedPayload> {
        match batch.try_add(payload) {
            Ok(()) => Ok(None),
            Err(AddError::TooLarge(oversized)) => Err(oversized),
            Err(AddError::Full(payload)) => {
                let sealed = std::mem::replace(batch, self.open());
                match batch.try_add(payload) {
                    Ok(()) => Ok(Some(sealed)),
                    // The open batch may have carried looser limits than this builder.
                    Err(AddError::TooLarge(oversized)) => {
                        *batch = sealed;
                        Err(oversized)
                    }
                    Err(AddError::Full(payload)) => {
                        let size = self.limits.event_cost(&payload);
                        *batch = sealed;
                        Err(OversizedPayload {
                            payload,
                            size,
                            max: self.limits.max_size_bytes,
                        })
                    }
                }
            }
        }
    }
}
