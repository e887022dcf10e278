// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Assembles buffer, consumer pool, aggregate store and persistence into one pipeline.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tally_aggregation::{
    AggregateStore, KindRegistry, MergeConsumer, PersistenceCycle, PersistenceOptions,
    PersistenceTimer, PersistenceTimerBuilder, TickReport,
};
use tally_core::{ConfigError, Event};
use tally_queue::{BufferBuilder, ConsumerPool, ConsumerPoolBuilder, rate_limited};
use tally_remote::{EventCodec, EventSink, RemoteSchemas};
use tokio::runtime::Handle;

use crate::{
    config::PipelineConfig,
    dispatch::{DispatchError, Dispatcher, IngestReport},
    worker::{LocalWorker, PartitionOwner, RemoteContext, WorkerTable},
};

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: Arc<KindRegistry>,
    owners: Vec<PartitionOwner>,
    runtime: Option<Handle>,
    name: String,
}

impl PipelineBuilder {
    /// Partition owners, in partition order. Defaults to a single local partition.
    pub fn owners(mut self, owners: impl Into<Vec<PartitionOwner>>) -> Self {
        self.owners = owners.into();
        self
    }

    /// Runtime the remote clients run on. Required if any owner is remote.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Prefix of thread names and log fields. Defaults to `"tally"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.name = name;
        self
    }

    /// Validate the configuration and start the consumer and persistence threads.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let Self {
            config,
            registry,
            owners,
            runtime,
            name,
        } = self;
        config.validate()?;
        config.validate_owners(&owners)?;
        if registry.is_empty() {
            return Err(ConfigError::Zero("registered kinds"));
        }

        let buffer = BufferBuilder::new()
            .channels(config.channels)
            .capacity(config.channel_capacity)
            .segments_per_channel(config.segments_per_channel)
            .consumers(config.consumer_threads)
            .policy(config.backpressure)
            .name(format!("{name}-buffer"))
            .build::<Event>()?;
        let codec = EventCodec::new(
            registry
                .kinds()
                .map(|kind| (kind.id(), kind.schema().clone()))
                .collect::<RemoteSchemas>(),
        );
        let local = Arc::new(LocalWorker::new(buffer.clone(), config.partition_policy));
        let remote = runtime.as_ref().map(|runtime| RemoteContext {
            runtime,
            codec: codec.clone(),
            config: &config.remote,
        });
        let workers = WorkerTable::build(&owners, local.clone(), remote)?;

        let store = Arc::new(AggregateStore::new(registry, config.consumer_threads));
        let pool = ConsumerPoolBuilder::new()
            .threads(config.consumer_threads)
            .batch_size(config.batch_size)
            .idle_wait(config.idle_wait)
            .shutdown_timeout(config.shutdown_timeout)
            .thread_name(format!("{name}-consumer"))
            .start(buffer, |index| MergeConsumer::new(Arc::clone(&store), index))?;
        let cycle = Arc::new(PersistenceCycle::new(
            Arc::clone(&store),
            PersistenceOptions {
                max_batch_size: config.max_write_batch,
                cache_idle_cycles: config.cache_idle_cycles,
            },
        ));
        let timer = PersistenceTimerBuilder::new()
            .flush_interval(config.flush_interval)
            .shutdown_timeout(config.shutdown_timeout)
            .thread_name(format!("{name}-persistence"))
            .start(Arc::clone(&cycle))
            .map_err(|err| ConfigError::Invalid(format!("failed to spawn persistence thread: {err}")))?;

        tracing::info!(
            pipeline = %name,
            kinds = store.registry().len(),
            partitions = workers.partitions(),
            consumers = pool.workers(),
            "pipeline started"
        );
        Ok(Pipeline {
            name,
            workers,
            local,
            codec,
            store,
            cycle,
            pool: Some(pool),
            timer: Some(timer),
            unroutable: AtomicU64::new(0),
        })
    }
}

/// Point-in-time counters of a [`Pipeline`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Events accepted by the local buffer.
    pub published: u64,
    /// Events the local buffer refused or evicted.
    pub dropped: u64,
    /// Events without a usable partition key.
    pub unroutable: u64,
    pub remote_sent: u64,
    pub remote_dropped: u64,
    pub merged: u64,
    pub merge_errors: u64,
    /// Completed flush cycles.
    pub flushes: u64,
    /// Records written to storage.
    pub flushed: u64,
    /// Records handed back for the next flush after a storage failure.
    pub restored: u64,
    /// Failed storage reads and writes.
    pub flush_failures: u64,
    /// Aggregates changed since the last flush.
    pub dirty: usize,
}

/// A running aggregation pipeline.
///
/// Dropping it is equivalent to [`Pipeline::shutdown`].
pub struct Pipeline {
    name: String,
    workers: WorkerTable,
    local: Arc<LocalWorker>,
    codec: EventCodec,
    store: Arc<AggregateStore>,
    cycle: Arc<PersistenceCycle>,
    pool: Option<ConsumerPool<Event>>,
    timer: Option<PersistenceTimer>,
    unroutable: AtomicU64,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig, registry: Arc<KindRegistry>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            registry,
            owners: vec![PartitionOwner::Local],
            runtime: None,
            name: "tally".into(),
        }
    }

    /// Hand `event` to the worker owning its partition.
    ///
    /// Returns `Ok(false)` if backpressure dropped it.
    pub fn dispatch(&self, event: Event) -> Result<bool, DispatchError> {
        let result = self.workers.dispatch(event);
        if let Err(DispatchError::Route(_)) = result {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Run `raw` through `dispatcher` and dispatch every resulting event. Failures are
    /// counted and logged, never returned.
    pub fn ingest<R>(&self, dispatcher: &impl Dispatcher<R>, raw: R) -> IngestReport {
        let mut report = IngestReport::default();
        for event in dispatcher.dispatch(raw) {
            match self.dispatch(event) {
                Ok(true) => report.accepted += 1,
                Ok(false) => report.dropped += 1,
                Err(err) => {
                    report.failed += 1;
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::warn!(pipeline = %self.name, %err, "failed to dispatch event")
                    );
                }
            }
        }
        report
    }

    /// Flush now, in addition to the periodic flushes.
    pub fn tick(&self) -> TickReport {
        self.cycle.tick()
    }

    /// Sink for a [`RemoteReceiver`](tally_remote::RemoteReceiver) serving the partitions
    /// this node owns.
    pub fn local_sink(&self) -> Arc<dyn EventSink> {
        self.local.clone()
    }

    /// The codec remote nodes must use to send to this one.
    pub fn codec(&self) -> &EventCodec {
        &self.codec
    }

    /// Running consumer threads, zero once shut down.
    pub fn consumers(&self) -> usize {
        self.pool.as_ref().map_or(0, ConsumerPool::workers)
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    pub fn stats(&self) -> PipelineStats {
        let buffer = self.local.buffer().stats();
        let remote = self.workers.remote_stats();
        let store = self.store.stats();
        let persistence = self.cycle.stats();
        PipelineStats {
            published: buffer.published,
            dropped: buffer.dropped + buffer.evicted + buffer.rejected,
            unroutable: self.unroutable.load(Ordering::Relaxed),
            remote_sent: remote.sent,
            remote_dropped: remote.dropped,
            merged: store.merged,
            merge_errors: store.merge_errors,
            flushes: persistence.ticks,
            flushed: persistence.written,
            restored: persistence.restored,
            flush_failures: persistence.fetch_failures + persistence.write_failures,
            dirty: self.store.dirty_len(),
        }
    }

    /// Drain the buffer through the consumers, run one final flush and stop all threads.
    /// Both steps are bounded by the configured shutdown timeout.
    pub fn shutdown(mut self) -> PipelineStats {
        self.stop();
        self.stats()
    }

    fn stop(&mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::info!(pipeline = %self.name, "draining consumers");
            pool.close();
        }
        if let Some(timer) = self.timer.take() {
            timer.close();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
