// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use assert2::check;
use tally::{
    Event, FieldDef, FieldType, Identity, KindId, MergeSchema, PartitionOwner,
    Pipeline, PipelineConfig, TimeBucket,
    aggregation::{AggregateKind, InMemoryStorage, KindRegistry},
    queue::{BackpressurePolicy, PartitionPolicy},
    remote::RemoteReceiver,
};

const SERVICE: KindId = KindId(1);
const ENDPOINT: KindId = KindId(2);
const CALLS: usize = 0;
const DURATION: usize = 1;

fn schema() -> MergeSchema {
    MergeSchema::new([
        FieldDef::sum("calls", FieldType::Long),
        FieldDef::sum("duration", FieldType::Long),
    ])
    .unwrap()
}

fn registry(storage: &Arc<InMemoryStorage>) -> Arc<KindRegistry> {
    let kind = |id: KindId, name: &str| {
        AggregateKind::builder(id, name)
            .schema(schema())
            .storage(storage.clone())
            .build()
            .unwrap()
    };
    Arc::new(
        KindRegistry::builder()
            .register(kind(SERVICE, "service_resp_time"))
            .unwrap()
            .register(kind(ENDPOINT, "endpoint_resp_time"))
            .unwrap()
            .build(),
    )
}

fn config() -> PipelineConfig {
    PipelineConfig {
        // flushes are driven by the tests
        flush_interval: Duration::from_secs(3_600),
        idle_wait: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

fn minute() -> TimeBucket {
    TimeBucket::from_raw(202401010930).unwrap()
}

fn svc(entity: &str) -> Identity {
    Identity::new(SERVICE, entity, minute())
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < Duration::from_secs(30), "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn svc_42_is_reconciled_across_flushes() {
    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(config(), registry(&storage)).build().unwrap();
    let event = || Event::new(svc("svc-42")).with(CALLS, 1i64);

    check!(pipeline.dispatch(event()) == Ok(true));
    check!(pipeline.dispatch(event().with(DURATION, 120i64)) == Ok(true));
    check!(pipeline.dispatch(event().with(DURATION, 80i64)) == Ok(true));
    wait_until("three merges", || pipeline.stats().merged == 3);

    let report = pipeline.tick();
    check!(report.written == 1);
    let stored = storage.get(&svc("svc-42")).unwrap();
    check!(stored.long(CALLS) == Some(3));
    check!(stored.long(DURATION) == Some(200));

    let report = pipeline.tick();
    check!(report.drained == 0);
    check!(report.written == 0);

    check!(pipeline.dispatch(event()) == Ok(true));
    wait_until("the fourth merge", || pipeline.stats().merged == 4);
    pipeline.tick();
    let stored = storage.get(&svc("svc-42")).unwrap();
    check!(stored.long(CALLS) == Some(4));
    check!(stored.long(DURATION) == Some(200));
}

#[test]
fn shutdown_drains_and_flushes() {
    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(
        PipelineConfig {
            channels: 4,
            consumer_threads: 3,
            backpressure: BackpressurePolicy::Block,
            channel_capacity: 64,
            ..config()
        },
        registry(&storage),
    )
    .build()
    .unwrap();

    std::thread::scope(|scope| {
        for producer in 0..4 {
            let pipeline = &pipeline;
            scope.spawn(move || {
                for i in 0..2_500 {
                    let entity = format!("svc-{}", (i + producer) % 10);
                    check!(pipeline.dispatch(Event::new(svc(&entity)).with(CALLS, 1i64)) == Ok(true));
                }
            });
        }
    });

    let stats = pipeline.shutdown();
    check!(stats.published == 10_000);
    check!(stats.dropped == 0);
    check!(stats.merged == 10_000);
    check!(stats.dirty == 0);
    check!(serde_json::to_value(stats).unwrap()["flushed"] == 10);
    let total: i64 = (0..10)
        .map(|i| storage.get(&svc(&format!("svc-{i}"))).unwrap().long(CALLS).unwrap())
        .sum();
    check!(total == 10_000);
}

#[test]
fn ingest_runs_the_dispatcher() {
    struct Request {
        service: &'static str,
        endpoint: &'static str,
        latency: i64,
    }

    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(config(), registry(&storage)).build().unwrap();
    let dispatcher = |request: Request| {
        vec![
            Event::new(svc(request.service))
                .with(CALLS, 1i64)
                .with(DURATION, request.latency),
            Event::for_entity(ENDPOINT, request.endpoint, minute())
                .with(CALLS, 1i64)
                .with(DURATION, request.latency),
            // no key, cannot be routed
            Event::new(svc(request.service)).with_partition_key(None::<&str>),
        ]
    };
    let report = pipeline.ingest(
        &dispatcher,
        Request {
            service: "checkout",
            endpoint: "/cart",
            latency: 25,
        },
    );
    check!(report.accepted == 2);
    check!(report.failed == 1);
    check!(pipeline.stats().unroutable == 1);

    pipeline.shutdown();
    check!(storage.get(&svc("checkout")).unwrap().long(DURATION) == Some(25));
    let endpoint = Identity::new(ENDPOINT, "/cart", minute());
    check!(storage.get(&endpoint).unwrap().long(CALLS) == Some(1));
}

#[test]
fn unregistered_kinds_are_counted_as_merge_errors() {
    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(config(), registry(&storage)).build().unwrap();
    let unknown = Event::for_entity(KindId(9), "svc", minute()).with(CALLS, 1i64);
    check!(pipeline.dispatch(unknown) == Ok(true));
    check!(pipeline.dispatch(Event::new(svc("svc")).with(CALLS, "one")) == Ok(true));
    check!(pipeline.dispatch(Event::new(svc("svc")).with(CALLS, 2i64)) == Ok(true));

    let stats = pipeline.shutdown();
    check!(stats.merge_errors == 2);
    check!(stats.merged == 1);
    check!(storage.get(&svc("svc")).unwrap().long(CALLS) == Some(2));
}

#[test]
fn invalid_configuration_fails_fast() {
    let storage = Arc::new(InMemoryStorage::new());
    let result = Pipeline::builder(
        PipelineConfig {
            channels: 0,
            ..config()
        },
        registry(&storage),
    )
    .build();
    check!(matches!(result, Err(tally::ConfigError::ZeroChannels)));

    let empty = Arc::new(KindRegistry::builder().build());
    check!(Pipeline::builder(config(), empty).build().is_err());
}

#[test]
fn remote_partitions_are_merged_by_their_owner() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let storage = Arc::new(InMemoryStorage::new());

    let owner = Pipeline::builder(config(), registry(&storage))
        .name("owner")
        .build()
        .unwrap();
    let receiver = runtime
        .block_on(RemoteReceiver::bind(
            "127.0.0.1:0",
            owner.codec().clone(),
            owner.local_sink(),
        ))
        .unwrap();

    let front = Pipeline::builder(config(), registry(&storage))
        .name("front")
        .owners([PartitionOwner::Local, PartitionOwner::Remote(receiver.local_addr())])
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();

    for i in 0..200 {
        let event = Event::new(svc(&format!("svc-{}", i % 20))).with(CALLS, 1i64);
        check!(front.dispatch(event) == Ok(true));
    }
    wait_until("every event merged on some node", || {
        front.stats().merged + owner.stats().merged == 200
    });
    let front_stats = front.shutdown();
    let owner_stats = owner.shutdown();
    check!(front_stats.remote_dropped == 0);
    check!(front_stats.remote_sent == owner_stats.merged);
    check!(front_stats.merged > 0);
    check!(owner_stats.merged > 0);

    let total: i64 = (0..20)
        .map(|i| storage.get(&svc(&format!("svc-{i}"))).unwrap().long(CALLS).unwrap())
        .sum();
    check!(total == 200);
    runtime.block_on(receiver.shutdown());
}

#[test]
fn one_key_has_one_writer_across_nodes() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let owner = Pipeline::builder(config(), registry(&storage))
        .name("owner")
        .build()
        .unwrap();
    let receiver = runtime
        .block_on(RemoteReceiver::bind(
            "127.0.0.1:0",
            owner.codec().clone(),
            owner.local_sink(),
        ))
        .unwrap();
    let front = Pipeline::builder(config(), registry(&storage))
        .name("front")
        .owners([PartitionOwner::Local, PartitionOwner::Remote(receiver.local_addr())])
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();

    for round in 1..=3u64 {
        for _ in 0..10 {
            check!(front.dispatch(Event::new(svc("svc-1")).with(CALLS, 1i64)) == Ok(true));
        }
        wait_until("the round merged", || {
            front.stats().merged + owner.stats().merged == 10 * round
        });
        front.tick();
        owner.tick();
        let stored = storage.get(&svc("svc-1")).unwrap();
        check!(stored.long(CALLS) == Some(10 * round as i64));
    }
    // every event of the key was merged on the same node
    check!((front.stats().merged == 0) != (owner.stats().merged == 0));

    front.shutdown();
    owner.shutdown();
    runtime.block_on(receiver.shutdown());
}

#[test]
fn round_robin_is_refused_with_remote_owners() {
    let storage = Arc::new(InMemoryStorage::new());
    let result = Pipeline::builder(
        PipelineConfig {
            partition_policy: PartitionPolicy::RoundRobin,
            ..config()
        },
        registry(&storage),
    )
    .owners([PartitionOwner::Local, PartitionOwner::Remote("127.0.0.1:7000".parse().unwrap())])
    .build();
    check!(matches!(result, Err(tally::ConfigError::Invalid(_))));
}

#[test]
fn every_consumer_thread_gets_a_lane() {
    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(
        PipelineConfig {
            channels: 1,
            consumer_threads: 4,
            ..config()
        },
        registry(&storage),
    )
    .build()
    .unwrap();
    check!(pipeline.consumers() == 4);

    for i in 0..100 {
        let event = Event::new(svc(&format!("svc-{}", i % 10))).with(CALLS, 1i64);
        check!(pipeline.dispatch(event) == Ok(true));
    }
    let stats = pipeline.shutdown();
    check!(stats.merged == 100);
    let total: i64 = (0..10)
        .map(|i| storage.get(&svc(&format!("svc-{i}"))).unwrap().long(CALLS).unwrap())
        .sum();
    check!(total == 100);
}

#[test]
fn remote_events_are_refused_after_shutdown() {
    let storage = Arc::new(InMemoryStorage::new());
    let pipeline = Pipeline::builder(config(), registry(&storage)).build().unwrap();
    let sink = pipeline.local_sink();
    check!(sink.accept(Event::new(svc("early")).with(CALLS, 1i64)));
    pipeline.shutdown();
    check!(!sink.accept(Event::new(svc("late")).with(CALLS, 1i64)));
    check!(storage.get(&svc("early")).is_some());
    check!(storage.get(&svc("late")).is_none());
}
