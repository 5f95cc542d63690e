/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::Ipv4Addr;
use std::time::Instant;

use criterion::*;
use topflow::{
    common::FlowKey,
    flow_aggregator::{extract, FlowAggregator},
};

fn key(i: u64) -> FlowKey {
    FlowKey::new(
        Ipv4Addr::new(10, (i >> 16) as u8, (i >> 8) as u8, i as u8).into(),
        Ipv4Addr::new(192, 168, 0, 1).into(),
        (i % 50000) as u16 + 1024,
        443,
    )
}

fn record(c: &mut Criterion) {
    c.bench_function("record_distinct_flows", |b| {
        b.iter_custom(|iters| {
            let aggregator = FlowAggregator::new();
            let keys: Vec<_> = (0..iters).map(key).collect();
            let start = Instant::now();
            for k in keys {
                aggregator.record(k, 1460);
            }
            start.elapsed()
        })
    });
    c.bench_function("record_hot_flows", |b| {
        b.iter_custom(|iters| {
            let aggregator = FlowAggregator::new();
            let keys: Vec<_> = (0..1024).map(key).collect();
            let start = Instant::now();
            for i in 0..iters {
                aggregator.record(keys[i as usize & 1023], 1460);
            }
            start.elapsed()
        })
    });
}

fn top_n(c: &mut Criterion) {
    let aggregator = FlowAggregator::new();
    for i in 0..100_000u64 {
        aggregator.record(key(i), i.wrapping_mul(2654435761) % 65536);
    }
    c.bench_function("snapshot_100k_flows", |b| {
        b.iter(|| black_box(aggregator.snapshot()))
    });
    let snapshot = aggregator.snapshot();
    c.bench_function("extract_top10_of_100k", |b| {
        b.iter_batched(
            || snapshot.clone(),
            |flows| black_box(extract(flows, 10)),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, record, top_n);
criterion_main!(benches);
