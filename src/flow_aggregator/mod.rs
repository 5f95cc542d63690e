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

mod top_n;

pub use top_n::extract;

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use crate::common::FlowKey;

/// Cumulative payload bytes per flow, shared by the ingestion loop and the report worker.
///
/// Entries are never evicted. Memory grows with the number of distinct flows seen during the
/// run, so an input with unbounded 4-tuple cardinality means unbounded memory, unless the
/// caller drains the table periodically with [`FlowAggregator::drain`].
#[derive(Debug, Default)]
pub struct FlowAggregator {
    flows: DashMap<FlowKey, u64>,
    counter: AggregatorCounter,
}

#[derive(Debug, Default)]
struct AggregatorCounter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl FlowAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: FlowKey, payload_len: u64) {
        // the shard write lock is held for the whole read-modify-write
        *self.flows.entry(key).or_insert(0) += payload_len;
        self.counter.packets.fetch_add(1, Ordering::Relaxed);
        self.counter
            .bytes
            .fetch_add(payload_len, Ordering::Relaxed);
    }

    pub fn get(&self, key: &FlowKey) -> Option<u64> {
        self.flows.get(key).map(|v| *v.value())
    }

    // Every entry is copied under its shard lock. Entries recorded while the copy is in
    // progress may or may not be part of the result.
    pub fn snapshot(&self) -> Vec<(FlowKey, u64)> {
        self.flows
            .iter()
            .map(|item| (*item.key(), *item.value()))
            .collect()
    }

    // Removes and returns every entry. An increment racing with the drain lands either in the
    // returned value or in a fresh entry left in the table.
    pub fn drain(&self) -> Vec<(FlowKey, u64)> {
        let mut drained = Vec::with_capacity(self.flows.len());
        self.flows.retain(|key, bytes| {
            drained.push((*key, *bytes));
            false
        });
        drained
    }

    // Adds previously drained entries back, merging with whatever was recorded since. Packet
    // and byte counters are left alone since these bytes were already counted once.
    pub fn restore<I: IntoIterator<Item = (FlowKey, u64)>>(&self, flows: I) {
        for (key, bytes) in flows {
            *self.flows.entry(key).or_insert(0) += bytes;
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.flows.iter().map(|item| *item.value()).sum()
    }
}

impl RefCountable for FlowAggregator {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "flows",
                CounterType::Gauged,
                CounterValue::Unsigned(self.flows.len() as u64),
            ),
            (
                "recorded_packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.packets.load(Ordering::Relaxed)),
            ),
            (
                "recorded_bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.bytes.load(Ordering::Relaxed)),
            ),
        ]
    }
}
