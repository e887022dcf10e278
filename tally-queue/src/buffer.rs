// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded multi-channel buffer.
//!
//! A [`Buffer`] is a fixed set of channels, each a ring buffer of fixed capacity.
//! A channel can be split into equally sized segments so that more consumer threads
//! than channels can share one channel's backlog. A *lane* is one segment of one
//! channel and is the unit that producers publish to and consumers drain from:
//! lane `i` belongs to channel `i / segments_per_channel`.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, sync::Unparker};
use tally_core::ConfigError;

use crate::rate_limited;

// how long a blocked producer sleeps between attempts once spinning is exhausted
const BLOCKED_POLL: Duration = Duration::from_micros(50);

/// What [`Buffer::publish`] does when the target lane is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BackpressurePolicy {
    /// Wait until a consumer frees space. For producers whose data must not be dropped, e.g. exporters.
    Block,
    /// Reject the new event and return `false`. For high-volume, low-criticality deltas.
    #[default]
    DropIfFull,
    /// Evict the oldest queued event to make room. For streams where only the latest value matters.
    DropOldest,
}

/// Builder for [`Buffer`].
#[derive(Clone, Debug)]
pub struct BufferBuilder {
    channels: usize,
    capacity: usize,
    segments_per_channel: usize,
    consumers: usize,
    policy: BackpressurePolicy,
    name: String,
}

impl Default for BufferBuilder {
    fn default() -> Self {
        Self {
            channels: 2,
            capacity: 10_000,
            segments_per_channel: 1,
            consumers: 1,
            policy: BackpressurePolicy::default(),
            name: "tally-buffer".into(),
        }
    }
}

impl BufferBuilder {
    /// A builder with 2 channels of 10000 events each.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of independent channels. Must be at least 1.
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Number of events each channel holds. When a channel is segmented, each segment
    /// holds `capacity / segments_per_channel` (at least 1).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Split each channel into this many lanes. Defaults to 1.
    ///
    /// Only useful when the consumer pool has more threads than there are channels. See
    /// also [`BufferBuilder::consumers`].
    pub fn segments_per_channel(mut self, segments: usize) -> Self {
        self.segments_per_channel = segments;
        self
    }

    /// Number of consumer threads that will drain the buffer. Defaults to 1.
    ///
    /// If there are more threads than channels, each channel gets at least
    /// `ceil(threads / channels)` segments so that every thread has a lane of its own.
    pub fn consumers(mut self, threads: usize) -> Self {
        self.consumers = threads;
        self
    }

    /// Default policy for [`Buffer::publish`]. Defaults to [`BackpressurePolicy::DropIfFull`].
    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Allocate the lanes.
    ///
    /// Fails if the channel count, capacity or segment count is zero.
    pub fn build<T>(self) -> Result<Buffer<T>, ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.capacity == 0 {
            return Err(ConfigError::Zero("channel capacity"));
        }
        if self.segments_per_channel == 0 {
            return Err(ConfigError::Zero("segments per channel"));
        }
        let segments_per_channel = self
            .segments_per_channel
            .max(self.consumers.div_ceil(self.channels));
        if segments_per_channel > self.segments_per_channel {
            tracing::info!(
                buffer = %self.name,
                consumers = self.consumers,
                channels = self.channels,
                segments = segments_per_channel,
                "more consumers than channels, splitting channels into segments"
            );
        }
        let lane_capacity = (self.capacity / segments_per_channel).max(1);
        let lanes = (0..self.channels * segments_per_channel)
            .map(|_| Lane {
                queue: ArrayQueue::new(lane_capacity),
                waker: OnceLock::new(),
            })
            .collect();
        tracing::debug!(
            buffer = %self.name,
            channels = self.channels,
            segments = segments_per_channel,
            lane_capacity,
            "built buffer"
        );
        Ok(Buffer(Arc::new(Inner {
            lanes,
            channels: self.channels,
            segments_per_channel,
            policy: self.policy,
            name: self.name,
            shut_down: AtomicBool::new(false),
            stats: Counters::default(),
        })))
    }
}

/// Handle to a bounded multi-channel buffer. Cloning is cheap and publishes to the same buffer.
pub struct Buffer<T>(Arc<Inner<T>>);

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

struct Inner<T> {
    lanes: Box<[Lane<T>]>,
    channels: usize,
    segments_per_channel: usize,
    policy: BackpressurePolicy,
    name: String,
    shut_down: AtomicBool,
    stats: Counters,
}

struct Lane<T> {
    // ArrayQueue rather than a channel: DropOldest needs force_push
    queue: ArrayQueue<T>,
    // unparks the consumer thread that owns this lane, set once when a pool starts
    waker: OnceLock<Unparker>,
}

impl<T> Lane<T> {
    fn wake(&self) {
        if let Some(unparker) = self.waker.get() {
            unparker.unpark();
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time counters of a [`Buffer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Events accepted.
    pub published: u64,
    /// Events refused because their lane was full.
    pub dropped: u64,
    /// Queued events evicted by [`BackpressurePolicy::DropOldest`].
    pub evicted: u64,
    /// Events refused because the buffer was shut down or the lane didn't exist.
    pub rejected: u64,
}

impl<T> Buffer<T> {
    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.0.channels
    }

    /// Number of lanes each channel is split into.
    pub fn segments_per_channel(&self) -> usize {
        self.0.segments_per_channel
    }

    /// Total number of lanes, `channels * segments_per_channel`.
    pub fn lanes(&self) -> usize {
        self.0.lanes.len()
    }

    /// The channel a lane belongs to.
    pub fn channel_of(&self, lane: usize) -> usize {
        lane / self.0.segments_per_channel
    }

    /// Capacity of a single lane.
    pub fn lane_capacity(&self) -> usize {
        self.0.lanes[0].queue.capacity()
    }

    /// Number of events queued in `lane`.
    pub fn len(&self, lane: usize) -> usize {
        self.0.lanes.get(lane).map_or(0, |lane| lane.queue.len())
    }

    /// Whether every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.0.lanes.iter().all(|lane| lane.queue.is_empty())
    }

    /// The policy used by [`Buffer::publish`].
    pub fn policy(&self) -> BackpressurePolicy {
        self.0.policy
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Enqueue `item` into `lane` using the buffer's default policy. Returns whether it was accepted.
    pub fn publish(&self, lane: usize, item: T) -> bool {
        self.publish_with(lane, item, self.0.policy)
    }

    /// Enqueue `item` into `lane` with an explicit policy for this call site.
    ///
    /// Never panics. Publishing after [`Buffer::shut_down`] or to a lane that doesn't exist returns `false`.
    pub fn publish_with(&self, lane: usize, item: T, policy: BackpressurePolicy) -> bool {
        let inner = &*self.0;
        if inner.shut_down.load(Ordering::Acquire) {
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(target) = inner.lanes.get(lane) else {
            inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
            rate_limited!(
                Duration::from_secs(1),
                tracing::error!(buffer = %inner.name, lane, lanes = inner.lanes.len(), "publish to a lane that doesn't exist")
            );
            return false;
        };

        let accepted = match policy {
            BackpressurePolicy::DropIfFull => match target.queue.push(item) {
                Ok(()) => true,
                Err(_) => {
                    inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::warn!(buffer = %inner.name, lane, "lane is full, dropping events")
                    );
                    false
                }
            },
            BackpressurePolicy::DropOldest => {
                if target.queue.force_push(item).is_some() {
                    inner.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::warn!(buffer = %inner.name, lane, "lane is full, evicting oldest events")
                    );
                }
                true
            }
            BackpressurePolicy::Block => self.push_blocking(target, item),
        };

        if accepted {
            inner.stats.published.fetch_add(1, Ordering::Relaxed);
            // the consumer also wakes up on its own after its idle wait, so ordering against the push is not critical
            target.wake();
        }
        accepted
    }

    fn push_blocking(&self, lane: &Lane<T>, mut item: T) -> bool {
        let backoff = Backoff::new();
        loop {
            match lane.queue.push(item) {
                Ok(()) => return true,
                Err(rejected) => {
                    if self.0.shut_down.load(Ordering::Acquire) {
                        self.0.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    item = rejected;
                    lane.wake();
                    if backoff.is_completed() {
                        thread::sleep(BLOCKED_POLL);
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Stop accepting events. Queued events stay until drained; blocked producers give up.
    pub fn shut_down(&self) {
        if !self.0.shut_down.swap(true, Ordering::AcqRel) {
            tracing::info!(buffer = %self.0.name, "buffer shutting down");
        }
        for lane in self.0.lanes.iter() {
            lane.wake();
        }
    }

    /// Whether [`Buffer::shut_down`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.0.shut_down.load(Ordering::Acquire)
    }

    /// Counters since the buffer was built.
    pub fn stats(&self) -> BufferStats {
        let stats = &self.0.stats;
        BufferStats {
            published: stats.published.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            evicted: stats.evicted.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Pop up to `max` events from `lane` into `out`, returning how many were taken.
    pub(crate) fn pop_batch(&self, lane: usize, max: usize, out: &mut Vec<T>) -> usize {
        let queue = &self.0.lanes[lane].queue;
        let mut count = 0;
        while count < max {
            match queue.pop() {
                Some(item) => {
                    out.push(item);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Route wake-ups for `lane` to `unparker`. Fails if the lane already has an owner.
    pub(crate) fn attach(&self, lane: usize, unparker: Unparker) -> Result<(), ConfigError> {
        self.0.lanes[lane].waker.set(unparker).map_err(|_| {
            ConfigError::Invalid(format!(
                "lane {lane} of buffer `{}` is already drained by another consumer",
                self.0.name
            ))
        })
    }
}
