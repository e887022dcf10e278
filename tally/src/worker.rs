// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local and remote workers behind one interface.
//!
//! Every partition has an owner. The [`WorkerTable`] is built once at start-up with one
//! [`Worker`] per partition, so the local-versus-remote decision is a table lookup and
//! never made per message.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tally_core::{ConfigError, Event};
use tally_queue::{BackpressurePolicy, Buffer, PartitionPolicy, Router, rate_limited};
use tally_remote::{EventCodec, EventSink, RemoteClient, RemoteClientConfig, RemoteClientStats};
use tokio::runtime::Handle;

use crate::{config::RemoteConfig, dispatch::DispatchError};

// every node of a cluster must use the same seed
const PARTITION_SEED: u64 = 0x7061_7274_6974_696f;

/// Accepts events for the partitions it owns.
pub trait Worker: Send + Sync {
    /// Hand `event` on. `Ok(false)` means it was dropped by backpressure.
    fn apply(&self, event: Event) -> Result<bool, DispatchError>;
}

/// Routes events to a lane of the local buffer.
pub struct LocalWorker {
    buffer: Buffer<Event>,
    router: Router,
}

impl LocalWorker {
    pub fn new(buffer: Buffer<Event>, policy: PartitionPolicy) -> Self {
        Self {
            buffer,
            router: Router::new(policy),
        }
    }

    pub fn buffer(&self) -> &Buffer<Event> {
        &self.buffer
    }

    fn lane(&self, event: &Event) -> Result<usize, DispatchError> {
        if self.buffer.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        Ok(self.router.route(event.partition_key(), self.buffer.lanes())?)
    }
}

impl Worker for LocalWorker {
    fn apply(&self, event: Event) -> Result<bool, DispatchError> {
        let lane = self.lane(&event)?;
        Ok(self.buffer.publish(lane, event))
    }
}

/// Events streamed in from other nodes. Never waits for space, even when the buffer uses
/// [`BackpressurePolicy::Block`], since it runs on the receiver's async tasks.
impl EventSink for LocalWorker {
    fn accept(&self, event: Event) -> bool {
        let lane = match self.lane(&event) {
            Ok(lane) => lane,
            Err(err) => {
                rate_limited!(
                    Duration::from_secs(1),
                    tracing::warn!(identity = %event.identity(), %err, "dropping remote event")
                );
                return false;
            }
        };
        let policy = match self.buffer.policy() {
            BackpressurePolicy::Block => BackpressurePolicy::DropIfFull,
            policy => policy,
        };
        self.buffer.publish_with(lane, event, policy)
    }
}

/// Streams events to the node that owns their partition.
pub struct RemoteWorker {
    client: RemoteClient,
}

impl RemoteWorker {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    pub fn addr(&self) -> SocketAddr {
        self.client.addr()
    }

    pub fn stats(&self) -> RemoteClientStats {
        self.client.stats()
    }
}

impl Worker for RemoteWorker {
    fn apply(&self, event: Event) -> Result<bool, DispatchError> {
        Ok(self.client.send(&event))
    }
}

/// Who owns a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionOwner {
    Local,
    Remote(SocketAddr),
}

/// Everything needed to reach remote partition owners.
pub struct RemoteContext<'a> {
    pub runtime: &'a Handle,
    pub codec: EventCodec,
    pub config: &'a RemoteConfig,
}

/// Partition-to-worker table.
pub struct WorkerTable {
    router: Router,
    workers: Vec<Arc<dyn Worker>>,
    remotes: Vec<Arc<RemoteWorker>>,
}

impl WorkerTable {
    /// A single partition owned by this node.
    pub fn local(local: Arc<LocalWorker>) -> Self {
        Self {
            router: Router::stable(PARTITION_SEED),
            workers: vec![local],
            remotes: vec![],
        }
    }

    /// One worker per entry of `owners`. Partitions owned by the same remote node share
    /// one client.
    ///
    /// Partitions are always picked by key, with a hash every node computes the same way,
    /// so each aggregate has one owning node whatever the lane policy is.
    pub fn build(
        owners: &[PartitionOwner],
        local: Arc<LocalWorker>,
        remote: Option<RemoteContext<'_>>,
    ) -> Result<Self, ConfigError> {
        if owners.is_empty() {
            return Err(ConfigError::Zero("partition owners"));
        }
        let mut clients: HashMap<SocketAddr, Arc<RemoteWorker>> = HashMap::new();
        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(owners.len());
        for owner in owners {
            match owner {
                PartitionOwner::Local => workers.push(local.clone()),
                PartitionOwner::Remote(addr) => {
                    let Some(remote) = &remote else {
                        return Err(ConfigError::Invalid(format!(
                            "partition owned by {addr} needs a tokio runtime for remote routing"
                        )));
                    };
                    let worker = clients.entry(*addr).or_insert_with(|| {
                        let config = RemoteClientConfig {
                            queue_capacity: remote.config.send_capacity,
                            connect_timeout: remote.config.connect_timeout,
                        };
                        let client =
                            RemoteClient::start(remote.runtime, *addr, remote.codec.clone(), config);
                        Arc::new(RemoteWorker::new(client))
                    });
                    workers.push(worker.clone());
                }
            }
        }
        tracing::info!(
            partitions = workers.len(),
            remote_nodes = clients.len(),
            "worker table built"
        );
        Ok(Self {
            router: Router::stable(PARTITION_SEED),
            workers,
            remotes: clients.into_values().collect(),
        })
    }

    pub fn partitions(&self) -> usize {
        self.workers.len()
    }

    /// Route `event` to its partition's worker.
    ///
    /// With more than one partition the event needs a partition key.
    pub fn dispatch(&self, event: Event) -> Result<bool, DispatchError> {
        let partition = match self.workers.len() {
            1 => 0,
            partitions => self.router.route(event.partition_key(), partitions)?,
        };
        self.workers[partition].apply(event)
    }

    /// Summed counters of all remote clients.
    pub fn remote_stats(&self) -> RemoteClientStats {
        self.remotes
            .iter()
            .map(|remote| remote.stats())
            .fold(RemoteClientStats::default(), |acc, stats| RemoteClientStats {
                sent: acc.sent + stats.sent,
                dropped: acc.dropped + stats.dropped,
                errors: acc.errors + stats.errors,
            })
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use tally_core::{KindId, TimeBucket};
    use tally_queue::{BufferBuilder, RouteError};

    use super::*;

    fn local(capacity: usize) -> Arc<LocalWorker> {
        let buffer = BufferBuilder::new()
            .channels(2)
            .capacity(capacity)
            .build()
            .unwrap();
        Arc::new(LocalWorker::new(buffer, PartitionPolicy::Keyed))
    }

    fn event(entity: &str) -> Event {
        Event::for_entity(KindId(1), entity, TimeBucket::from_raw(202401010930).unwrap())
    }

    #[test]
    fn local_worker_publishes_by_key() {
        let worker = local(16);
        check!(worker.apply(event("svc-42")) == Ok(true));
        check!(worker.apply(event("svc-42")) == Ok(true));
        let buffer = worker.buffer();
        let lens: Vec<_> = (0..buffer.lanes()).map(|lane| buffer.len(lane)).collect();
        check!(lens.iter().sum::<usize>() == 2);
        check!(lens.contains(&2));
    }

    #[test]
    fn keyless_events_fail_loudly() {
        let table = WorkerTable::local(local(16));
        let keyless = event("svc").with_partition_key(None::<&str>);
        check!(table.dispatch(keyless) == Err(DispatchError::Route(RouteError::MissingKey)));
    }

    #[test]
    fn single_partition_takes_keyless_events() {
        let buffer = BufferBuilder::new().channels(2).capacity(16).build().unwrap();
        let worker = Arc::new(LocalWorker::new(buffer, PartitionPolicy::RoundRobin));
        let table = WorkerTable::local(worker.clone());
        for _ in 0..4 {
            check!(table.dispatch(event("svc").with_partition_key(None::<&str>)) == Ok(true));
        }
        check!(worker.buffer().len(0) == 2);
        check!(worker.buffer().len(1) == 2);

        let table = WorkerTable::build(&[PartitionOwner::Local; 2], worker, None).unwrap();
        let keyless = event("svc").with_partition_key(None::<&str>);
        check!(table.dispatch(keyless) == Err(DispatchError::Route(RouteError::MissingKey)));
    }

    #[test]
    fn shut_down_buffer_is_reported() {
        let worker = local(16);
        worker.buffer().shut_down();
        check!(worker.apply(event("a")) == Err(DispatchError::ShutDown));
        check!(!worker.accept(event("a")));
    }

    #[test]
    fn remote_owner_requires_runtime() {
        let owners = [
            PartitionOwner::Local,
            PartitionOwner::Remote("127.0.0.1:7000".parse().unwrap()),
        ];
        check!(matches!(
            WorkerTable::build(&owners, local(16), None),
            Err(ConfigError::Invalid(_))
        ));
        check!(matches!(
            WorkerTable::build(&[], local(16), None),
            Err(ConfigError::Zero(_))
        ));
    }

    #[test]
    fn all_local_partitions_share_one_buffer() {
        let worker = local(1024);
        let owners = [PartitionOwner::Local; 3];
        let table = WorkerTable::build(&owners, worker.clone(), None).unwrap();
        check!(table.partitions() == 3);
        for i in 0..100 {
            check!(table.dispatch(event(&format!("svc-{i}"))) == Ok(true));
        }
        check!(worker.buffer().stats().published == 100);
        check!(table.remote_stats() == RemoteClientStats::default());
    }
}
