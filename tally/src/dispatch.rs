// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ingress contract.

use tally_core::Event;
use tally_queue::RouteError;

/// Turns raw domain input into aggregation events.
///
/// Implementations are plain functions of their input, typically generated per source.
/// One raw record may contribute to several kinds, or to none.
pub trait Dispatcher<Raw>: Send + Sync {
    fn dispatch(&self, raw: Raw) -> Vec<Event>;
}

impl<R, F> Dispatcher<R> for F
where
    F: Fn(R) -> Vec<Event> + Send + Sync,
{
    fn dispatch(&self, raw: R) -> Vec<Event> {
        self(raw)
    }
}

/// Why an event could not be handed to a worker.
///
/// Overload is not an error: a full buffer is reported as `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("pipeline is shut down")]
    ShutDown,
}

/// Outcome of [`Pipeline::ingest`](crate::Pipeline::ingest).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events handed to a worker.
    pub accepted: usize,
    /// Events refused by a full buffer or remote queue.
    pub dropped: usize,
    /// Events that could not be routed.
    pub failed: usize,
}
