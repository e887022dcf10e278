// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Partition routing.

use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicUsize, Ordering},
};

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// How a [`Router`] picks a member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PartitionPolicy {
    /// `hash(key) mod members`. Events with equal keys always land on the same member,
    /// which is what makes each aggregate single-writer.
    #[default]
    Keyed,
    /// Everything goes to member 0, for strictly sequential workloads.
    AlwaysFirst,
    /// Spread evenly with no key affinity. Only for workloads without shared mutable state,
    /// and never across nodes.
    RoundRobin,
}

impl PartitionPolicy {
    /// Whether routing with this policy needs a key.
    pub fn requires_key(self) -> bool {
        self == PartitionPolicy::Keyed
    }
}

/// Why an event could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// A key-based policy was asked to route an event that has no partition key.
    #[error("keyed routing requires a partition key, but the event has none")]
    MissingKey,
    /// There is nothing to route to.
    #[error("cannot route to zero members")]
    NoMembers,
}

// Fixed seeds so every thread of a process agrees on where a key lives.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug)]
enum KeyHash {
    // ahash output depends on the crate version and CPU features, so only within a process
    Local(ahash::RandomState),
    // XXH3-64, identical for every build and platform
    Stable(u64),
}

/// Deterministic mapping from partition keys to member indexes.
#[derive(Debug)]
pub struct Router {
    policy: PartitionPolicy,
    hash: KeyHash,
    next: AtomicUsize,
}

impl Router {
    /// A router for placement inside one process, such as picking a buffer lane.
    pub fn new(policy: PartitionPolicy) -> Self {
        Self {
            policy,
            hash: KeyHash::Local(ahash::RandomState::with_seeds(
                SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3],
            )),
            next: AtomicUsize::new(0),
        }
    }

    /// A keyed router whose placement every node agrees on, whatever build or hardware it
    /// runs on. Keys are hashed with XXH3-64 seeded with `seed`.
    ///
    /// Its placement is independent of [`Router::new`], so the keys one node owns still
    /// spread over all of that node's lanes.
    pub fn stable(seed: u64) -> Self {
        Self {
            policy: PartitionPolicy::Keyed,
            hash: KeyHash::Stable(seed),
            next: AtomicUsize::new(0),
        }
    }

    /// The policy this router applies.
    pub fn policy(&self) -> PartitionPolicy {
        self.policy
    }

    /// The hash keyed routing reduces modulo the member count.
    pub fn hash_key(&self, key: &str) -> u64 {
        match &self.hash {
            KeyHash::Local(state) => state.hash_one(key),
            KeyHash::Stable(seed) => xxh3_64_with_seed(key.as_bytes(), *seed),
        }
    }

    /// Pick a member in `[0, member_count)` for `key`.
    ///
    /// With [`PartitionPolicy::Keyed`] the result depends only on the key and `member_count`.
    /// An empty key is a valid key. A missing key is an error, never a silent default.
    pub fn route(&self, key: Option<&str>, member_count: usize) -> Result<usize, RouteError> {
        if member_count == 0 {
            return Err(RouteError::NoMembers);
        }
        match self.policy {
            PartitionPolicy::Keyed => {
                let key = key.ok_or(RouteError::MissingKey)?;
                Ok((self.hash_key(key) % member_count as u64) as usize)
            }
            PartitionPolicy::AlwaysFirst => Ok(0),
            PartitionPolicy::RoundRobin => {
                Ok(self.next.fetch_add(1, Ordering::Relaxed) % member_count)
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(PartitionPolicy::default())
    }
}
