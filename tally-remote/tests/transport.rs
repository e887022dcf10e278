// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use assert2::check;
use bytes::Bytes;
use futures::SinkExt;
use tally_core::{Event, FieldDef, FieldType, FieldValue, KindId, MergeSchema, TimeBucket};
use tally_remote::{EventCodec, RemoteClient, RemoteClientConfig, RemoteReceiver, RemoteSchemas};
use tokio::{net::TcpStream, runtime::Handle};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

const SERVICE: KindId = KindId(1);

fn codec() -> EventCodec {
    let schema = MergeSchema::new([
        FieldDef::sum("calls", FieldType::Long),
        FieldDef::sum("duration", FieldType::Long),
    ])
    .unwrap();
    EventCodec::new(RemoteSchemas::new().with(SERVICE, schema))
}

fn calls(entity: &str, n: i64) -> Event {
    Event::for_entity(SERVICE, entity, TimeBucket::from_raw(202401010930).unwrap()).with(0, n)
}

type Received = Arc<Mutex<Vec<Event>>>;

async fn receiver() -> (RemoteReceiver, Received) {
    let received = Received::default();
    let sink = {
        let received = Arc::clone(&received);
        move |event: Event| {
            received.lock().unwrap().push(event);
            true
        }
    };
    let receiver = RemoteReceiver::bind("127.0.0.1:0", codec(), Arc::new(sink))
        .await
        .unwrap();
    (receiver, received)
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let wait = async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_stream_to_the_owning_node() {
    let (receiver, received) = receiver().await;
    let client = RemoteClient::start(
        &Handle::current(),
        receiver.local_addr(),
        codec(),
        RemoteClientConfig::default(),
    );
    for i in 0..100 {
        check!(client.send(&calls(&format!("svc-{}", i % 7), 1)));
    }
    wait_for("all events", || received.lock().unwrap().len() == 100).await;

    let received = received.lock().unwrap().clone();
    check!(received[0] == calls("svc-0", 1));
    check!(received[99].payload() == &[(0, FieldValue::Long(1))][..]);
    check!(client.stats().dropped == 0);
    client.close().await;
    check!(receiver.stats().connections == 1);
    receiver.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_flushes_queued_events() {
    let (receiver, received) = receiver().await;
    let client = RemoteClient::start(
        &Handle::current(),
        receiver.local_addr(),
        codec(),
        RemoteClientConfig::default(),
    );
    for i in 0..50 {
        check!(client.send(&calls("svc-1", i)));
    }
    let stats = client.stats();
    client.close().await;

    wait_for("all queued events", || received.lock().unwrap().len() == 50).await;
    check!(stats.dropped == 0);
    let total: i64 = received
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event.payload() {
            [(0, FieldValue::Long(n))] => *n,
            other => panic!("unexpected payload {other:?}"),
        })
        .sum();
    check!(total == (0..50).sum::<i64>());
    receiver.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_node_drops_without_failing_the_caller() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = RemoteClient::start(
        &Handle::current(),
        addr,
        codec(),
        RemoteClientConfig {
            connect_timeout: Duration::from_millis(200),
            ..RemoteClientConfig::default()
        },
    );
    for _ in 0..3 {
        client.send(&calls("svc-1", 1));
    }
    wait_for("drops", || client.stats().dropped == 3).await;
    check!(client.stats().sent == 0);
    check!(client.stats().errors >= 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_drops_new_events() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    // a runtime nobody drives, so nothing is ever dequeued
    let idle = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let client = RemoteClient::start(
        idle.handle(),
        addr,
        codec(),
        RemoteClientConfig {
            queue_capacity: 2,
            ..RemoteClientConfig::default()
        },
    );
    check!(client.send(&calls("a", 1)));
    check!(client.send(&calls("a", 1)));
    check!(!client.send(&calls("a", 1)));
    check!(client.stats().dropped == 1);
    drop(client);
    tokio::task::spawn_blocking(move || drop(idle)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_frames_are_skipped() {
    let (receiver, received) = receiver().await;
    let stream = TcpStream::connect(receiver.local_addr()).await.unwrap();
    let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
    frames.send(Bytes::from_static(b"garbage")).await.unwrap();
    frames
        .send(codec().encode_event(&calls("svc-42", 5)).unwrap())
        .await
        .unwrap();

    wait_for("the valid frame", || received.lock().unwrap().len() == 1).await;
    check!(receiver.stats().decode_errors == 1);
    check!(received.lock().unwrap()[0] == calls("svc-42", 5));
    drop(frames);
    receiver.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sink_rejections_are_counted() {
    let receiver = RemoteReceiver::bind(
        "127.0.0.1:0",
        codec(),
        Arc::new(|event: Event| event.identity().entity_id() != "blocked"),
    )
    .await
    .unwrap();
    let client = RemoteClient::start(
        &Handle::current(),
        receiver.local_addr(),
        codec(),
        RemoteClientConfig::default(),
    );
    client.send(&calls("blocked", 1));
    client.send(&calls("ok", 1));
    client.close().await;
    wait_for("both frames", || {
        let stats = receiver.stats();
        stats.received + stats.rejected == 2
    })
    .await;
    check!(receiver.stats().rejected == 1);
    receiver.shutdown().await;
}
