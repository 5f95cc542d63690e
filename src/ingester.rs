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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use log::{debug, info, trace, warn};
use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    queue,
};

use crate::{
    capture::{self, CaptureSource, Captured},
    config::ReadErrorPolicy,
    error::{Error, Result},
    exporter::ReportTask,
    flow_aggregator::FlowAggregator,
};

/// Fires once every `batch_size` tcp packets.
#[derive(Debug)]
pub struct BatchTrigger {
    batch_size: u64,
    count: u64,
}

impl BatchTrigger {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            count: 0,
        }
    }

    pub fn tick(&mut self) -> bool {
        self.count += 1;
        self.count % self.batch_size == 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    // packets counted since the trigger last fired
    pub fn pending(&self) -> u64 {
        self.count % self.batch_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Opening,
    Reading,
    Terminated,
}

/// Asks a running ingester to stop at the next packet boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct IngestCounter {
    tcp_packets: AtomicU64,
    non_tcp_packets: AtomicU64,
    skipped_packets: AtomicU64,
    cycles_posted: AtomicU64,
    cycles_coalesced: AtomicU64,
    read_errors: AtomicU64,
}

impl IngestCounter {
    pub fn tcp_packets(&self) -> u64 {
        self.tcp_packets.load(Ordering::Relaxed)
    }

    pub fn cycles_posted(&self) -> u64 {
        self.cycles_posted.load(Ordering::Relaxed)
    }

    pub fn cycles_coalesced(&self) -> u64 {
        self.cycles_coalesced.load(Ordering::Relaxed)
    }
}

impl RefCountable for IngestCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "tcp_packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.tcp_packets.load(Ordering::Relaxed)),
            ),
            (
                "non_tcp_packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.non_tcp_packets.load(Ordering::Relaxed)),
            ),
            (
                "skipped_packets",
                CounterType::Counted,
                CounterValue::Unsigned(self.skipped_packets.load(Ordering::Relaxed)),
            ),
            (
                "cycles_posted",
                CounterType::Counted,
                CounterValue::Unsigned(self.cycles_posted.load(Ordering::Relaxed)),
            ),
            (
                "cycles_coalesced",
                CounterType::Counted,
                CounterValue::Unsigned(self.cycles_coalesced.load(Ordering::Relaxed)),
            ),
            (
                "read_errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.read_errors.load(Ordering::Relaxed)),
            ),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EndOfStream,
    // read error under the end-of-stream policy
    ReadError,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub termination: Termination,
    pub tcp_packets: u64,
    pub cycles_posted: u64,
    pub cycles_coalesced: u64,
}

pub struct IngesterConfig {
    pub batch_size: u64,
    pub read_error_policy: ReadErrorPolicy,
    pub report_on_exit: bool,
}

/// Pulls packets from a capture source into the aggregator and posts report cycles.
///
/// Posting never blocks: when the report queue is full the cycle is coalesced into the one
/// already pending. The final cycle of `report_on_exit` is the exception and waits for room,
/// so a consumer must be draining the queue by then.
pub struct Ingester {
    config: IngesterConfig,
    aggregator: Arc<FlowAggregator>,
    trigger: BatchTrigger,
    task_sender: queue::Sender<ReportTask>,
    stop_handle: StopHandle,
    counter: Arc<IngestCounter>,
    state: State,
    cycle: u64,
}

impl Ingester {
    pub fn new(
        config: IngesterConfig,
        aggregator: Arc<FlowAggregator>,
        task_sender: queue::Sender<ReportTask>,
        stop_handle: StopHandle,
    ) -> Self {
        Self {
            trigger: BatchTrigger::new(config.batch_size),
            config,
            aggregator,
            task_sender,
            stop_handle,
            counter: Default::default(),
            state: State::Opening,
            cycle: 0,
        }
    }

    pub fn counter(&self) -> &Arc<IngestCounter> {
        &self.counter
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Opens the source with `open` and reads it until it ends, fails or is stopped.
    ///
    /// A source that cannot be opened is fatal and nothing is processed. A read error is fatal
    /// under [`ReadErrorPolicy::Terminate`] and a clean end otherwise. Cycles already posted
    /// stay queued in every case.
    pub fn run<S, F>(&mut self, open: F) -> Result<IngestSummary>
    where
        S: CaptureSource,
        F: FnOnce() -> capture::Result<S>,
    {
        if self.state != State::Opening {
            return Err(Error::InvalidState(self.state));
        }
        let mut source = match open() {
            Ok(s) => s,
            Err(e) => {
                self.state = State::Terminated;
                return Err(Error::SourceOpen(e));
            }
        };
        self.state = State::Reading;
        debug!("ingester reading");

        let result = self.read_all(&mut source);
        self.state = State::Terminated;
        if self.config.report_on_exit && self.trigger.pending() > 0 {
            self.post_final_cycle();
        }

        let termination = result?;
        info!(
            "ingester terminated by {:?} after {} tcp packets",
            termination,
            self.trigger.count()
        );
        Ok(IngestSummary {
            termination,
            tcp_packets: self.counter.tcp_packets(),
            cycles_posted: self.counter.cycles_posted(),
            cycles_coalesced: self.counter.cycles_coalesced(),
        })
    }

    fn read_all<S: CaptureSource>(&mut self, source: &mut S) -> Result<Termination> {
        loop {
            if self.stop_handle.is_stopped() {
                return Ok(Termination::Stopped);
            }
            match source.next_packet() {
                Ok(Captured::Packet(packet)) => match packet.flow_key() {
                    Some(key) => {
                        self.aggregator.record(key, packet.payload_len as u64);
                        self.counter.tcp_packets.fetch_add(1, Ordering::Relaxed);
                        if self.trigger.tick() {
                            self.post_cycle();
                        }
                    }
                    None => {
                        self.counter.non_tcp_packets.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Ok(Captured::Skipped(reason)) => {
                    trace!("packet skipped: {}", reason);
                    self.counter.skipped_packets.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Captured::EndOfStream) => return Ok(Termination::EndOfStream),
                Err(e) => {
                    self.counter.read_errors.fetch_add(1, Ordering::Relaxed);
                    return match self.config.read_error_policy {
                        ReadErrorPolicy::Terminate => Err(Error::SourceRead(e)),
                        ReadErrorPolicy::EndOfStream => {
                            warn!("{}, treated as end of stream", e);
                            Ok(Termination::ReadError)
                        }
                    };
                }
            }
        }
    }

    fn next_task(&mut self) -> ReportTask {
        self.cycle += 1;
        ReportTask::Extract {
            cycle: self.cycle,
            packets: self.trigger.count(),
        }
    }

    fn post_cycle(&mut self) {
        let task = self.next_task();
        match self.task_sender.try_send(task) {
            Ok(()) => {
                self.counter.cycles_posted.fetch_add(1, Ordering::Relaxed);
            }
            Err(queue::Error::Full(_)) => {
                debug!("report queue full, cycle {} coalesced", self.cycle);
                self.counter
                    .cycles_coalesced
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("post cycle {} failed: {}", self.cycle, e);
                self.counter
                    .cycles_coalesced
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn post_final_cycle(&mut self) {
        let task = self.next_task();
        match self.task_sender.send(task) {
            Ok(()) => {
                debug!("final cycle {} posted", self.cycle);
                self.counter.cycles_posted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("post final cycle {} failed: {}", self.cycle, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::capture::{PacketEvent, SkipReason, L4};
    use crate::common::FlowKey;

    struct ScriptedSource(VecDeque<capture::Result<Captured>>);

    impl CaptureSource for ScriptedSource {
        fn next_packet(&mut self) -> capture::Result<Captured> {
            self.0.pop_front().unwrap_or(Ok(Captured::EndOfStream))
        }
    }

    fn tcp(host: u8, payload_len: u32) -> capture::Result<Captured> {
        Ok(Captured::Packet(PacketEvent {
            src_ip: Ipv4Addr::new(10, 0, 0, host).into(),
            dst_ip: Ipv4Addr::new(10, 0, 0, 100).into(),
            l4: L4::Tcp {
                src_port: 1000,
                dst_port: 80,
            },
            payload_len,
        }))
    }

    fn udp(host: u8) -> capture::Result<Captured> {
        Ok(Captured::Packet(PacketEvent {
            src_ip: Ipv4Addr::new(10, 0, 0, host).into(),
            dst_ip: Ipv4Addr::new(10, 0, 0, 100).into(),
            l4: L4::Other(17),
            payload_len: 64,
        }))
    }

    fn key(host: u8) -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, host).into(),
            Ipv4Addr::new(10, 0, 0, 100).into(),
            1000,
            80,
        )
    }

    struct Fixture {
        ingester: Ingester,
        aggregator: Arc<FlowAggregator>,
        tasks: queue::Receiver<ReportTask>,
    }

    fn fixture(
        batch_size: u64,
        queue_size: usize,
        read_error_policy: ReadErrorPolicy,
        report_on_exit: bool,
    ) -> Fixture {
        let aggregator = Arc::new(FlowAggregator::new());
        let (sender, tasks, _) = queue::bounded(queue_size);
        let ingester = Ingester::new(
            IngesterConfig {
                batch_size,
                read_error_policy,
                report_on_exit,
            },
            aggregator.clone(),
            sender,
            StopHandle::default(),
        );
        Fixture {
            ingester,
            aggregator,
            tasks,
        }
    }

    fn drain(tasks: &queue::Receiver<ReportTask>) -> Vec<ReportTask> {
        let mut v = vec![];
        while let Ok(t) = tasks.recv(Some(Duration::from_millis(10))) {
            v.push(t);
        }
        v
    }

    fn script(items: Vec<capture::Result<Captured>>) -> ScriptedSource {
        ScriptedSource(items.into())
    }

    #[test]
    fn batch_trigger_fires_on_multiples() {
        let mut trigger = BatchTrigger::new(3);
        let fired: Vec<_> = (0..7).map(|_| trigger.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
        assert_eq!(trigger.count(), 7);
        assert_eq!(trigger.pending(), 1);
    }

    #[test]
    fn one_cycle_after_third_of_five_packets() {
        let mut f = fixture(3, 4, ReadErrorPolicy::Terminate, false);
        let items = (1..=5).map(|h| tcp(h, 10)).collect();
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();

        assert_eq!(summary.termination, Termination::EndOfStream);
        assert_eq!(summary.tcp_packets, 5);
        assert_eq!(
            drain(&f.tasks),
            vec![ReportTask::Extract {
                cycle: 1,
                packets: 3
            }]
        );
        assert_eq!(f.aggregator.len(), 5);
        assert_eq!(f.ingester.state(), State::Terminated);
    }

    #[test]
    fn report_on_exit_posts_final_cycle() {
        let mut f = fixture(3, 4, ReadErrorPolicy::Terminate, true);
        let items = (1..=5).map(|h| tcp(h, 10)).collect();
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();

        assert_eq!(summary.cycles_posted, 2);
        assert_eq!(
            drain(&f.tasks).last(),
            Some(&ReportTask::Extract {
                cycle: 2,
                packets: 5
            })
        );
    }

    #[test]
    fn no_tcp_no_cycle() {
        let mut f = fixture(1, 4, ReadErrorPolicy::Terminate, true);
        let items = vec![
            udp(1),
            Ok(Captured::Skipped(SkipReason::Fragment)),
            udp(2),
        ];
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();

        assert_eq!(summary.tcp_packets, 0);
        assert!(drain(&f.tasks).is_empty());
        assert!(f.aggregator.is_empty());
        let counters = f.ingester.counter().get_counters();
        assert_eq!(counters[1].2, CounterValue::Unsigned(2));
        assert_eq!(counters[2].2, CounterValue::Unsigned(1));
    }

    #[test]
    fn skipped_packets_do_not_stop_reading() {
        let mut f = fixture(10, 4, ReadErrorPolicy::Terminate, false);
        let items = vec![
            tcp(1, 100),
            Ok(Captured::Skipped(SkipReason::Truncated("tcp"))),
            tcp(1, 200),
            tcp(1, 50),
        ];
        f.ingester.run(|| Ok(script(items))).unwrap();
        assert_eq!(f.aggregator.get(&key(1)), Some(350));
    }

    #[test]
    fn full_queue_coalesces_cycles() {
        let mut f = fixture(1, 2, ReadErrorPolicy::Terminate, false);
        let items = (1..=5).map(|h| tcp(h, 1)).collect();
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();

        assert_eq!(summary.cycles_posted, 2);
        assert_eq!(summary.cycles_coalesced, 3);
        assert_eq!(drain(&f.tasks).len(), 2);
        assert_eq!(f.aggregator.len(), 5);
    }

    #[test]
    fn open_failure_processes_nothing() {
        let mut f = fixture(1, 4, ReadErrorPolicy::Terminate, true);
        let result = f.ingester.run(|| -> capture::Result<ScriptedSource> {
            Err(capture::Error::Open {
                path: "missing.pcap".to_owned(),
                reason: "not found".to_owned(),
            })
        });
        assert!(matches!(result, Err(Error::SourceOpen(_))));
        assert_eq!(f.ingester.state(), State::Terminated);
        assert!(drain(&f.tasks).is_empty());
    }

    #[test]
    fn read_error_terminates_by_default() {
        let mut f = fixture(2, 4, ReadErrorPolicy::Terminate, false);
        let items = vec![
            tcp(1, 10),
            tcp(2, 10),
            Err(capture::Error::Read("truncated block".to_owned())),
            tcp(3, 10),
        ];
        let result = f.ingester.run(|| Ok(script(items)));

        assert!(matches!(result, Err(Error::SourceRead(_))));
        assert_eq!(drain(&f.tasks).len(), 1);
        assert_eq!(f.aggregator.get(&key(3)), None);
    }

    #[test]
    fn read_error_as_end_of_stream() {
        let mut f = fixture(2, 4, ReadErrorPolicy::EndOfStream, false);
        let items = vec![
            tcp(1, 10),
            Err(capture::Error::Read("truncated block".to_owned())),
        ];
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();
        assert_eq!(summary.termination, Termination::ReadError);
        assert_eq!(summary.tcp_packets, 1);
    }

    #[test]
    fn stop_handle_ends_reading() {
        let mut f = fixture(1, 4, ReadErrorPolicy::Terminate, false);
        let stop = StopHandle::default();
        f.ingester.stop_handle = stop.clone();
        stop.stop();
        let items = (1..=3).map(|h| tcp(h, 1)).collect();
        let summary = f.ingester.run(|| Ok(script(items))).unwrap();

        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(summary.tcp_packets, 0);
    }

    #[test]
    fn runs_only_once() {
        let mut f = fixture(1, 4, ReadErrorPolicy::Terminate, false);
        f.ingester.run(|| Ok(script(vec![]))).unwrap();
        assert!(matches!(
            f.ingester.run(|| Ok(script(vec![]))),
            Err(Error::InvalidState(State::Terminated))
        ));
    }
}
