// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consumer that merges drained events into the aggregate store.

use std::{fmt, sync::Arc, time::Duration};

use tally_core::{Event, Identity, MergeError};
use tally_queue::{BatchError, Consumer, rate_limited};

use crate::store::AggregateStore;

/// Events of one batch that could not be merged.
#[derive(Debug)]
pub struct MergeFailures {
    pub merged: usize,
    pub failures: Vec<(Identity, MergeError)>,
}

impl fmt::Display for MergeFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} events failed to merge", self.failures.len())?;
        if let Some((id, err)) = self.failures.first() {
            write!(f, ", first: {id}: {err}")?;
        }
        Ok(())
    }
}

/// [`Consumer`] for one pool thread, writing to that thread's store shard.
pub struct MergeConsumer {
    store: Arc<AggregateStore>,
    shard: usize,
}

impl MergeConsumer {
    pub fn new(store: Arc<AggregateStore>, shard: usize) -> Self {
        Self { store, shard }
    }
}

impl Consumer<Event> for MergeConsumer {
    type Error = MergeFailures;

    fn consume(&mut self, batch: &[Event]) -> Result<(), MergeFailures> {
        let mut failures = vec![];
        let merged = self.store.apply_batch(self.shard, batch, |event, err| {
            failures.push((event.identity().clone(), err))
        });
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MergeFailures { merged, failures })
        }
    }

    fn on_error(&mut self, batch: &[Event], error: BatchError<MergeFailures>) {
        match error {
            BatchError::Failed(failures) => rate_limited!(
                Duration::from_secs(1),
                tracing::warn!(shard = self.shard, merged = failures.merged, %failures, "dropped events that failed to merge")
            ),
            BatchError::Panicked(msg) => rate_limited!(
                Duration::from_secs(1),
                tracing::error!(shard = self.shard, batch_len = batch.len(), %msg, "merge panicked, batch may be partially applied")
            ),
        }
    }

    fn on_exit(&mut self) {
        tracing::debug!(shard = self.shard, "merge consumer exiting");
    }
}
