// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

//! Ingestion side of the `tally` pipeline.
//!
//! Producers pick a lane with a [`Router`] and [`Buffer::publish`] into it; a
//! [`ConsumerPool`] drains lanes on dedicated threads and hands batches to a
//! [`Consumer`]. Because a partition key always maps to the same lane and every lane
//! has exactly one draining thread, state keyed by partition is only ever touched by
//! one thread.

pub mod buffer;
pub mod pool;
#[doc(hidden)]
pub mod rate_limit;
pub mod router;
#[cfg(feature = "test-util")]
pub mod test_util;

pub use buffer::{BackpressurePolicy, Buffer, BufferBuilder, BufferStats};
pub use pool::{BatchError, Consumer, ConsumerPool, ConsumerPoolBuilder, allocate_lanes};
pub use router::{PartitionPolicy, RouteError, Router};
