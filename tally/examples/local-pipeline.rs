// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-node pipeline fed by a dispatcher, flushing into in-memory storage.
//!
//! Run with `RUST_LOG=tally=debug` to see flush cycles.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tally::{
    Event, FieldDef, FieldType, Granularity, KindId, MergeSchema, Pipeline, PipelineConfig,
    TimeBucket,
    aggregation::{AggregateKind, InMemoryStorage, KindRegistry},
};
use tracing_subscriber::EnvFilter;

const SERVICE: KindId = KindId(1);

const CONFIG: &str = r#"
flush_interval = "500ms"
channels = 4
consumer_threads = 2
backpressure = "drop_if_full"
"#;

struct Request {
    service: String,
    latency_ms: i64,
    error: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config: PipelineConfig = toml::from_str(CONFIG).context("parsing config")?;
    let schema = MergeSchema::new([
        FieldDef::identity("service", FieldType::Str),
        FieldDef::sum("calls", FieldType::Long),
        FieldDef::sum("errors", FieldType::Long),
        FieldDef::sum("duration_ms", FieldType::Long),
    ])?;
    let storage = Arc::new(InMemoryStorage::new());
    let registry = KindRegistry::builder()
        .register(
            AggregateKind::builder(SERVICE, "service_resp_time")
                .schema(schema.clone())
                .storage(storage.clone())
                .rollup(Granularity::Hour)
                .build()?,
        )?
        .build();
    let pipeline = Pipeline::builder(config, Arc::new(registry)).build()?;

    let dispatcher = |request: Request| {
        let bucket = TimeBucket::current_minute();
        vec![
            Event::for_entity(SERVICE, request.service.as_str(), bucket)
                .with_named(&schema, "service", request.service.as_str())
                .with_named(&schema, "calls", 1i64)
                .with_named(&schema, "errors", i64::from(request.error))
                .with_named(&schema, "duration_ms", request.latency_ms),
        ]
    };

    for i in 0..10_000i64 {
        let request = Request {
            service: format!("svc-{}", i % 5),
            latency_ms: 10 + i % 90,
            error: i % 97 == 0,
        };
        pipeline.ingest(&dispatcher, request);
        if i % 2_000 == 0 {
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    let stats = pipeline.shutdown();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    for (identity, record) in storage.snapshot() {
        println!(
            "{identity}: calls={:?} errors={:?} duration_ms={:?}",
            record.long(1),
            record.long(2),
            record.long(3)
        );
    }
    Ok(())
}

