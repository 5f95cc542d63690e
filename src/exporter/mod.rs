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

mod writer;

pub use writer::{ReportWriter, WriterCounter, REPORT_HEADER};

use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    queue,
};
use thiserror::Error;

use crate::{
    common::TopNSnapshot,
    config::{Config, CountingMode},
    flow_aggregator::{self, FlowAggregator},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTask {
    // `packets` is the tcp packet count when the cycle was triggered
    Extract { cycle: u64, packets: u64 },
    Terminated,
}

#[derive(Debug, Default)]
pub struct ExporterCounter {
    reports: AtomicU64,
    report_failures: AtomicU64,
    written_rows: AtomicU64,
    last_cycle: AtomicU64,
}

impl ExporterCounter {
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    pub fn report_failures(&self) -> u64 {
        self.report_failures.load(Ordering::Relaxed)
    }

    pub fn last_cycle(&self) -> u64 {
        self.last_cycle.load(Ordering::Relaxed)
    }
}

impl RefCountable for ExporterCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "reports",
                CounterType::Counted,
                CounterValue::Unsigned(self.reports.load(Ordering::Relaxed)),
            ),
            (
                "report_failures",
                CounterType::Counted,
                CounterValue::Unsigned(self.report_failures.load(Ordering::Relaxed)),
            ),
            (
                "written_rows",
                CounterType::Counted,
                CounterValue::Unsigned(self.written_rows.load(Ordering::Relaxed)),
            ),
            (
                "last_cycle",
                CounterType::Gauged,
                CounterValue::Unsigned(self.last_cycle.load(Ordering::Relaxed)),
            ),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub report_file: PathBuf,
    pub top_n: usize,
    pub counting_mode: CountingMode,
}

impl From<&Config> for ExporterConfig {
    fn from(c: &Config) -> Self {
        Self {
            report_file: PathBuf::from(&c.report_file),
            top_n: c.top_n,
            counting_mode: c.counting_mode,
        }
    }
}

/// Turns report cycles into CSV rankings on a dedicated thread.
///
/// Only this thread touches the report file, so two exports can never interleave. Extraction
/// runs here as well and reads the aggregator concurrently with ingestion.
pub struct ReportExporter {
    config: ExporterConfig,
    aggregator: Arc<FlowAggregator>,
    task_receiver: Arc<queue::Receiver<ReportTask>>,
    counter: Arc<ExporterCounter>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ReportExporter {
    pub fn new(
        config: ExporterConfig,
        aggregator: Arc<FlowAggregator>,
        task_receiver: queue::Receiver<ReportTask>,
    ) -> Self {
        Self {
            config,
            aggregator,
            task_receiver: Arc::new(task_receiver),
            counter: Default::default(),
            thread: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn counter(&self) -> &Arc<ExporterCounter> {
        &self.counter
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("report exporter has already running");
            return Ok(());
        }

        if let Some(parent) = self.config.report_file.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        let config = self.config.clone();
        let aggregator = self.aggregator.clone();
        let counter = self.counter.clone();
        let task_receiver = self.task_receiver.clone();
        // the sender side closes or posts Terminated before stop is called
        let thread = thread::Builder::new()
            .name("report-exporter".to_owned())
            .spawn(move || {
                let mut writer = ReportWriter::new(&config.report_file);
                loop {
                    match task_receiver.recv(None) {
                        Ok(ReportTask::Extract { cycle, packets }) => Self::export(
                            cycle,
                            packets,
                            &config,
                            &aggregator,
                            &mut writer,
                            &counter,
                        ),
                        Ok(ReportTask::Terminated) | Err(queue::Error::Terminated(_)) => break,
                        Err(queue::Error::Timeout) | Err(queue::Error::Full(_)) => continue,
                    }
                }
                let stats = writer.get_and_reset_stats();
                debug!(
                    "report exporter finished, {} reports with {} rows written",
                    stats.written_reports, stats.written_rows
                );
            })?;
        *self.thread.lock() = Some(thread);
        info!(
            "report exporter started, top {} flows to {}",
            self.config.top_n,
            self.config.report_file.display()
        );
        Ok(())
    }

    fn export(
        cycle: u64,
        packets: u64,
        config: &ExporterConfig,
        aggregator: &FlowAggregator,
        writer: &mut ReportWriter,
        counter: &ExporterCounter,
    ) {
        let flows = match config.counting_mode {
            CountingMode::Cumulative => aggregator.snapshot(),
            CountingMode::ResetOnReport => aggregator.drain(),
        };
        let snapshot = TopNSnapshot {
            cycle,
            packets,
            flows: flow_aggregator::extract(flows.iter().copied(), config.top_n),
        };
        match writer.write(&snapshot) {
            Ok(()) => {
                counter.reports.fetch_add(1, Ordering::Relaxed);
                counter
                    .written_rows
                    .fetch_add(snapshot.len() as u64, Ordering::Relaxed);
                counter.last_cycle.store(cycle, Ordering::Relaxed);
                debug!(
                    "cycle {} at {} tcp packets: top {} of {} flows exported, {} bytes",
                    cycle,
                    packets,
                    snapshot.len(),
                    flows.len(),
                    snapshot.total_bytes()
                );
            }
            Err(e) => {
                counter.report_failures.fetch_add(1, Ordering::Relaxed);
                if config.counting_mode == CountingMode::ResetOnReport {
                    // carried into the next report
                    aggregator.restore(flows);
                }
                warn!(
                    "export report of cycle {} to {} failed: {}",
                    cycle,
                    writer.path().display(),
                    e
                );
            }
        }
    }

    // Waits until every queued task is handled. Call after the sender side is closed.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("report exporter has already stopped");
            return;
        }
        if let Some(handler) = self.thread.lock().take() {
            let _ = handler.join();
        }
        info!("report exporter stopped");
    }
}
