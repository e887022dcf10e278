// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consumer pool draining a [`Buffer`].
//!
//! Each worker thread owns a disjoint set of lanes (see [`allocate_lanes`]), so every
//! lane has exactly one reader and events for one partition key are consumed in
//! publish order by the same thread.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};
use tally_core::ConfigError;

use crate::{Buffer, rate_limited};

/// Per-thread batch handler.
///
/// A consumer is created on the pool's behalf for each worker thread (see
/// [`ConsumerPoolBuilder::start`]) and only ever called from that thread, so it can
/// keep thread-local state without synchronization.
pub trait Consumer<T>: Send {
    /// Error returned by [`Consumer::consume`].
    type Error: fmt::Display;

    /// Called once on the worker thread before the first batch.
    fn init(&mut self) {}

    /// Handle a batch of events drained from one lane.
    fn consume(&mut self, batch: &[T]) -> Result<(), Self::Error>;

    /// Called when [`Consumer::consume`] fails or panics. The worker keeps running afterwards.
    fn on_error(&mut self, batch: &[T], error: BatchError<Self::Error>) {
        rate_limited!(
            Duration::from_secs(1),
            tracing::error!(batch_len = batch.len(), %error, "failed to consume batch")
        );
    }

    /// Called once on the worker thread after the final drain at shutdown.
    fn on_exit(&mut self) {}
}

/// Why a batch failed.
#[derive(Debug)]
pub enum BatchError<E> {
    /// The consumer returned an error.
    Failed(E),
    /// The consumer panicked, with the panic message if it was a string.
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for BatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::Failed(err) => write!(f, "{err}"),
            BatchError::Panicked(msg) => write!(f, "consumer panicked: {msg}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BatchError<E> {}

/// Assign lanes to threads.
///
/// Returns, for each thread, the lanes it drains.
///
/// * `channels >= threads`: each thread gets `channels / threads` contiguous channels,
///   the first `channels % threads` threads one more, with all of their segments.
/// * `threads > channels`: threads are spread over channels in contiguous groups and each
///   channel's segments are split into contiguous sub-ranges, one per thread in its group.
///   Threads beyond a channel's segment count get nothing.
///
/// Every lane is assigned to exactly one thread.
pub fn allocate_lanes(channels: usize, segments: usize, threads: usize) -> Vec<Vec<usize>> {
    let mut assignment = vec![Vec::new(); threads];
    if threads == 0 || channels == 0 || segments == 0 {
        return assignment;
    }
    if channels >= threads {
        let (per_thread, extra) = (channels / threads, channels % threads);
        let mut channel = 0;
        for (thread, lanes) in assignment.iter_mut().enumerate() {
            let take = per_thread + usize::from(thread < extra);
            lanes.extend(channel * segments..(channel + take) * segments);
            channel += take;
        }
    } else {
        let (per_channel, extra) = (threads / channels, threads % channels);
        let mut thread = 0;
        for channel in 0..channels {
            let group = per_channel + usize::from(channel < extra);
            let (per_thread, extra_segments) = (segments / group, segments % group);
            let mut segment = channel * segments;
            for member in 0..group {
                let take = per_thread + usize::from(member < extra_segments);
                assignment[thread + member].extend(segment..segment + take);
                segment += take;
            }
            thread += group;
        }
    }
    assignment
}

/// Builder for [`ConsumerPool`].
pub struct ConsumerPoolBuilder {
    threads: usize,
    batch_size: usize,
    idle_wait: Duration,
    shutdown_timeout: Duration,
    thread_name: String,
}

impl Default for ConsumerPoolBuilder {
    fn default() -> Self {
        Self {
            threads: 2,
            batch_size: 512,
            idle_wait: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(30),
            thread_name: "tally-consumer".into(),
        }
    }
}

impl ConsumerPoolBuilder {
    /// A builder for 2 threads draining up to 512 events at a time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads. Defaults to 2.
    pub fn threads(mut self, threads: usize) -> Self {
        assert!(threads > 0, "a consumer pool needs at least one thread");
        self.threads = threads;
        self
    }

    /// Maximum number of events handed to one [`Consumer::consume`] call. Defaults to 512.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must not be zero");
        self.batch_size = batch_size;
        self
    }

    /// How long a worker with nothing to do sleeps before polling its lanes again. Publishing
    /// wakes it earlier. Defaults to 20ms.
    pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
        assert!(idle_wait > Duration::ZERO, "idle_wait must not be zero");
        self.idle_wait = idle_wait;
        self
    }

    /// How long each worker keeps draining once shutdown starts. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        assert!(
            shutdown_timeout > Duration::ZERO,
            "shutdown_timeout must not be zero"
        );
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Prefix for worker thread names, suffixed with the thread index.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.thread_name = name;
        self
    }

    /// Allocate lanes and spawn the workers. `factory` is called once per worker with its index.
    ///
    /// Fails if some lane of `buffer` is already drained by another pool.
    pub fn start<T, C, F>(self, buffer: Buffer<T>, mut factory: F) -> Result<ConsumerPool<T>, ConfigError>
    where
        T: Send + 'static,
        C: Consumer<T> + 'static,
        F: FnMut(usize) -> C,
    {
        let assignment = allocate_lanes(buffer.channels(), buffer.segments_per_channel(), self.threads);
        let idle = assignment.iter().filter(|lanes| lanes.is_empty()).count();
        if idle > 0 {
            tracing::warn!(
                buffer = buffer.name(),
                idle,
                threads = self.threads,
                lanes = buffer.lanes(),
                "more consumer threads than lanes, some threads will not be started"
            );
        }

        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(assignment.len() - idle);
        for (index, lanes) in assignment.into_iter().enumerate() {
            if lanes.is_empty() {
                continue;
            }
            let parker = Parker::new();
            let unparker = parker.unparker().clone();
            for &lane in &lanes {
                buffer.attach(lane, unparker.clone())?;
            }
            let worker = Worker {
                index,
                lanes,
                consumer: factory(index),
                buffer: buffer.clone(),
                batch_size: self.batch_size,
                idle_wait: self.idle_wait,
                shutdown_timeout: self.shutdown_timeout,
                shutdown_signal: Arc::clone(&shutdown_signal),
                parker,
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", self.thread_name))
                .spawn(move || worker.run())
                .map_err(|err| ConfigError::Invalid(format!("failed to spawn consumer thread: {err}")))?;
            workers.push((handle, unparker));
        }
        tracing::info!(buffer = buffer.name(), workers = workers.len(), "consumer pool started");

        Ok(ConsumerPool {
            buffer,
            workers,
            shutdown_signal,
        })
    }
}

/// Running consumer pool. Dropping it is equivalent to [`ConsumerPool::close`].
pub struct ConsumerPool<T> {
    buffer: Buffer<T>,
    workers: Vec<(thread::JoinHandle<()>, Unparker)>,
    shutdown_signal: Arc<AtomicBool>,
}

impl<T> ConsumerPool<T> {
    /// Number of running worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// The buffer this pool drains.
    pub fn buffer(&self) -> &Buffer<T> {
        &self.buffer
    }

    /// Stop accepting events, let every worker drain its lanes (bounded by the shutdown
    /// timeout), run [`Consumer::on_exit`] and join the threads.
    pub fn close(self) {}

    fn shut_down(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.buffer.shut_down();
        self.shutdown_signal.store(true, Ordering::Release);
        tracing::info!(buffer = self.buffer.name(), "awaiting consumer pool shutdown");
        for (handle, unparker) in self.workers.drain(..) {
            unparker.unpark();
            if handle.join().is_err() {
                tracing::error!(buffer = self.buffer.name(), "consumer thread panicked");
            }
        }
        tracing::info!(buffer = self.buffer.name(), "consumer pool shut down");
    }
}

impl<T> Drop for ConsumerPool<T> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

struct Worker<T, C> {
    index: usize,
    lanes: Vec<usize>,
    consumer: C,
    buffer: Buffer<T>,
    batch_size: usize,
    idle_wait: Duration,
    shutdown_timeout: Duration,
    shutdown_signal: Arc<AtomicBool>,
    parker: Parker,
}

impl<T, C: Consumer<T>> Worker<T, C> {
    fn run(mut self) {
        let span = tracing::span!(
            tracing::Level::TRACE,
            "tally consumer",
            buffer = self.buffer.name(),
            worker = self.index
        );
        let _enter = span.enter();
        self.consumer.init();

        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            // read the signal before draining so nothing published before shutdown is skipped
            let shutting_down = self.shutdown_signal.load(Ordering::Acquire);
            let drained = self.drain_once(&mut batch);
            if shutting_down {
                break;
            }
            if drained == 0 {
                self.parker.park_timeout(self.idle_wait);
            }
        }
        self.shut_down(batch);
    }

    fn drain_once(&mut self, batch: &mut Vec<T>) -> usize {
        let mut total = 0;
        for i in 0..self.lanes.len() {
            let count = self.buffer.pop_batch(self.lanes[i], self.batch_size, batch);
            if count > 0 {
                self.consume(batch);
                batch.clear();
                total += count;
            }
        }
        total
    }

    fn consume(&mut self, batch: &[T]) {
        let consumer = &mut self.consumer;
        let error = match catch_unwind(AssertUnwindSafe(|| consumer.consume(batch))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => BatchError::Failed(err),
            Err(panic) => BatchError::Panicked(panic_message(&*panic)),
        };
        self.consumer.on_error(batch, error);
    }

    fn shut_down(mut self, mut batch: Vec<T>) {
        let deadline = Instant::now() + self.shutdown_timeout;
        while self.drain_once(&mut batch) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!("unable to drain consumer lanes while shutting down");
                break;
            }
        }
        self.consumer.on_exit();
        tracing::debug!("consumer worker has shut down");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert2::check;
    use rstest::rstest;

    use super::*;
    use crate::{
        BackpressurePolicy, BufferBuilder, PartitionPolicy, Router,
        test_util::{Recorded, RecordingConsumer},
    };

    fn lanes_of(assignment: &[Vec<usize>]) -> Vec<usize> {
        let mut lanes: Vec<usize> = assignment.iter().flatten().copied().collect();
        lanes.sort();
        lanes
    }

    #[rstest]
    #[case(4, 1, 2, vec![vec![0, 1], vec![2, 3]])]
    #[case(5, 1, 2, vec![vec![0, 1, 2], vec![3, 4]])]
    #[case(3, 2, 2, vec![vec![0, 1, 2, 3], vec![4, 5]])]
    #[case(1, 4, 2, vec![vec![0, 1], vec![2, 3]])]
    #[case(2, 3, 4, vec![vec![0, 1], vec![2], vec![3, 4], vec![5]])]
    #[case(1, 2, 3, vec![vec![0], vec![1], vec![]])]
    #[case(2, 1, 3, vec![vec![0], vec![], vec![1]])]
    fn allocates_lanes(
        #[case] channels: usize,
        #[case] segments: usize,
        #[case] threads: usize,
        #[case] expected: Vec<Vec<usize>>,
    ) {
        check!(allocate_lanes(channels, segments, threads) == expected);
    }

    #[test]
    fn every_lane_has_exactly_one_owner() {
        for channels in 1..8 {
            for segments in 1..5 {
                for threads in 1..12 {
                    let assignment = allocate_lanes(channels, segments, threads);
                    check!(assignment.len() == threads);
                    check!(lanes_of(&assignment) == (0..channels * segments).collect::<Vec<_>>());
                }
            }
        }
    }

    #[test]
    fn consumes_everything_published() {
        let buffer = BufferBuilder::new().channels(4).capacity(1_000).build().unwrap();
        let recorded = Recorded::default();
        let pool = ConsumerPoolBuilder::new()
            .threads(2)
            .batch_size(16)
            .start(buffer.clone(), |thread| RecordingConsumer::new(thread, recorded.clone()))
            .unwrap();

        std::thread::scope(|scope| {
            for producer in 0..4u64 {
                let buffer = buffer.clone();
                scope.spawn(move || {
                    for i in 0..250 {
                        check!(buffer.publish_with(
                            (i % 4) as usize,
                            producer * 1_000 + i,
                            BackpressurePolicy::Block
                        ));
                    }
                });
            }
        });
        pool.close();

        let mut values = recorded.values();
        values.sort();
        let mut expected: Vec<u64> = (0..4).flat_map(|p| (0..250).map(move |i| p * 1_000 + i)).collect();
        expected.sort();
        check!(values == expected);
        check!(recorded.exits() == 2);
        check!(recorded.inits() == 2);
    }

    #[test]
    fn more_threads_than_channels_split_the_channel() {
        let buffer = BufferBuilder::new().channels(1).capacity(1_000).consumers(4).build().unwrap();
        let recorded = Recorded::default();
        let pool = ConsumerPoolBuilder::new()
            .threads(4)
            .start(buffer.clone(), |thread| RecordingConsumer::new(thread, recorded.clone()))
            .unwrap();
        check!(pool.workers() == 4);

        for i in 0..400u64 {
            check!(buffer.publish_with((i % 4) as usize, i, BackpressurePolicy::Block));
        }
        pool.close();

        let mut threads: Vec<usize> = recorded.consumed().into_iter().map(|(thread, _)| thread).collect();
        threads.sort();
        threads.dedup();
        check!(threads == vec![0, 1, 2, 3]);
        check!(recorded.values().len() == 400);
    }

    #[test]
    fn same_key_same_thread_in_order() {
        let buffer = BufferBuilder::new().channels(2).segments_per_channel(3).capacity(30_000).build().unwrap();
        let router = Router::new(PartitionPolicy::Keyed);
        let recorded = Recorded::default();
        let pool = ConsumerPoolBuilder::new()
            .threads(5)
            .start(buffer.clone(), |thread| RecordingConsumer::new(thread, recorded.clone()))
            .unwrap();

        // value encodes (key, sequence)
        for seq in 0..1_000u64 {
            for key in 0..10u64 {
                let lane = router.route(Some(&format!("key-{key}")), buffer.lanes()).unwrap();
                check!(buffer.publish_with(lane, key * 10_000 + seq, BackpressurePolicy::Block));
            }
        }
        pool.close();

        let mut by_key: HashMap<u64, (usize, Vec<u64>)> = HashMap::new();
        for (thread, value) in recorded.consumed() {
            let entry = by_key.entry(value / 10_000).or_insert((thread, vec![]));
            check!(entry.0 == thread);
            entry.1.push(value % 10_000);
        }
        check!(by_key.len() == 10);
        for (_, (_, sequence)) in by_key {
            check!(sequence == (0..1_000).collect::<Vec<_>>());
        }
    }

    #[test]
    fn errors_and_panics_do_not_stop_the_worker() {
        let buffer = BufferBuilder::new().channels(1).capacity(100).build().unwrap();
        let recorded = Recorded::default();
        let pool = ConsumerPoolBuilder::new()
            .threads(1)
            .batch_size(1)
            .start(buffer.clone(), |thread| {
                RecordingConsumer::new(thread, recorded.clone())
                    .fail_on(|v| *v == 3)
                    .panic_on(|v| *v == 5)
            })
            .unwrap();
        for i in 0..10u64 {
            check!(buffer.publish(0, i));
        }
        pool.close();

        check!(recorded.values() == vec![0, 1, 2, 4, 6, 7, 8, 9]);
        let errors = recorded.errors();
        check!(errors.len() == 2);
        check!(errors[0] == "rejected 3");
        check!(errors[1] == "consumer panicked: refusing 5");
    }

    #[test]
    fn close_drains_pending_events() {
        let buffer = BufferBuilder::new().channels(2).capacity(10_000).build().unwrap();
        for i in 0..5_000u64 {
            check!(buffer.publish((i % 2) as usize, i));
        }
        let recorded = Recorded::default();
        let pool = ConsumerPoolBuilder::new()
            .threads(1)
            .idle_wait(Duration::from_secs(10))
            .start(buffer.clone(), |thread| RecordingConsumer::new(thread, recorded.clone()))
            .unwrap();
        pool.close();
        check!(recorded.values().len() == 5_000);
        check!(!buffer.publish(0, 1));
    }

    #[test]
    fn buffer_cannot_be_drained_twice() {
        let buffer = BufferBuilder::new().channels(1).build::<u64>().unwrap();
        let recorded = Recorded::default();
        let _pool = ConsumerPoolBuilder::new()
            .threads(1)
            .start(buffer.clone(), |thread| RecordingConsumer::new(thread, recorded.clone()))
            .unwrap();
        let second = ConsumerPoolBuilder::new()
            .threads(1)
            .start(buffer, |thread| RecordingConsumer::new(thread, recorded.clone()));
        check!(matches!(second, Err(ConfigError::Invalid(_))));
    }
}
