// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Operational settings of a [`Pipeline`](crate::Pipeline).
//!
//! Every field has a default, so an empty document is a valid configuration. Durations
//! are written in humantime form (`"3s"`, `"20ms"`). Reading the document from disk is up
//! to the embedding process.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::ConfigError;
use tally_queue::{BackpressurePolicy, PartitionPolicy};

use crate::worker::PartitionOwner;

/// Pipeline configuration.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// How often dirty aggregates are flushed to storage. Default: 3s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Number of buffer channels. Default: 2.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Capacity of each channel. Default: 10000.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Segments each channel is split into, so several consumer threads can drain one
    /// channel. Default: 1.
    #[serde(default = "default_one")]
    pub segments_per_channel: usize,

    /// Consumer threads. Default: 2.
    #[serde(default = "default_consumer_threads")]
    pub consumer_threads: usize,

    /// Largest batch a consumer thread merges at once. Default: 512.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long an idle consumer thread waits before polling again. Default: 20ms.
    #[serde(default = "default_idle_wait", with = "humantime_serde")]
    pub idle_wait: Duration,

    /// What publishing into a full channel does. Default: `drop_if_full`.
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// How events are assigned to lanes. Partitions are always assigned by key. Default:
    /// `keyed`.
    #[serde(default)]
    pub partition_policy: PartitionPolicy,

    /// Upper bound for draining consumers and for the final flush on shutdown. Default: 30s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Largest `bulk_upsert` call. Default: 2000.
    #[serde(default = "default_max_write_batch")]
    pub max_write_batch: usize,

    /// Flush cycles a written aggregate stays in the session cache without being touched.
    /// Default: 3.
    #[serde(default = "default_cache_idle_cycles")]
    pub cache_idle_cycles: u64,

    /// Streaming to partitions owned by other nodes.
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Remote routing configuration.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Events queued per remote node before new ones are dropped. Default: 10000.
    #[serde(default = "default_send_capacity")]
    pub send_capacity: usize,

    /// Default: 3s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            channels: default_channels(),
            channel_capacity: default_channel_capacity(),
            segments_per_channel: default_one(),
            consumer_threads: default_consumer_threads(),
            batch_size: default_batch_size(),
            idle_wait: default_idle_wait(),
            backpressure: BackpressurePolicy::default(),
            partition_policy: PartitionPolicy::default(),
            shutdown_timeout: default_shutdown_timeout(),
            max_write_batch: default_max_write_batch(),
            cache_idle_cycles: default_cache_idle_cycles(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            send_capacity: default_send_capacity(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        let counts = [
            (self.channel_capacity, "channel capacity"),
            (self.segments_per_channel, "segments per channel"),
            (self.consumer_threads, "consumer threads"),
            (self.batch_size, "batch size"),
            (self.max_write_batch, "max write batch"),
            (self.remote.send_capacity, "remote send capacity"),
        ];
        if let Some(&(_, what)) = counts.iter().find(|(n, _)| *n == 0) {
            return Err(ConfigError::Zero(what));
        }
        let durations = [
            (self.flush_interval, "flush interval"),
            (self.idle_wait, "idle wait"),
            (self.shutdown_timeout, "shutdown timeout"),
            (self.remote.connect_timeout, "remote connect timeout"),
        ];
        if let Some(&(_, what)) = durations.iter().find(|(d, _)| d.is_zero()) {
            return Err(ConfigError::Zero(what));
        }
        if self.backpressure == BackpressurePolicy::Block {
            tracing::info!("buffer uses the block policy, producers wait while channels are full");
        }
        Ok(())
    }

    /// Reject settings that don't work with these partition owners.
    ///
    /// Once another node owns partitions, events must be placed by key: `round_robin` is
    /// refused.
    pub fn validate_owners(&self, owners: &[PartitionOwner]) -> Result<(), ConfigError> {
        let remote = owners
            .iter()
            .any(|owner| matches!(owner, PartitionOwner::Remote(_)));
        if remote && self.partition_policy == PartitionPolicy::RoundRobin {
            return Err(ConfigError::Invalid(
                "round_robin partitioning cannot be used with remote partition owners".into(),
            ));
        }
        Ok(())
    }
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_channels() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_one() -> usize {
    1
}

fn default_consumer_threads() -> usize {
    2
}

fn default_batch_size() -> usize {
    512
}

fn default_idle_wait() -> Duration {
    Duration::from_millis(20)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_write_batch() -> usize {
    2000
}

fn default_cache_idle_cycles() -> u64 {
    3
}

fn default_send_capacity() -> usize {
    10_000
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}
