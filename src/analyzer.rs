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

use std::sync::Arc;

use log::{error, info, warn};
use public::{
    counter::{format_counters, OwnedCountable, RefCountable},
    queue,
};

use crate::{
    capture::PcapFileSource,
    config::Config,
    error::{Error, Result},
    exporter::{ExporterConfig, ReportExporter, ReportTask},
    flow_aggregator::FlowAggregator,
    ingester::{IngestSummary, Ingester, IngesterConfig, StopHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ingest: IngestSummary,
    pub reports: u64,
    pub report_failures: u64,
    pub flows: usize,
    pub total_bytes: u64,
}

/// Wires a capture file, the flow table, the ingester and the report exporter into one run.
pub struct Analyzer {
    config: Config,
    stop_handle: StopHandle,
}

impl Analyzer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stop_handle: StopHandle::default(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Processes the whole capture and waits until every posted report is exported.
    ///
    /// Nothing is processed when the capture cannot be opened. A read error surfaces as
    /// [`Error::SourceRead`] under the default policy, but only after queued reports drained.
    pub fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let source = PcapFileSource::open(&config.capture_file).map_err(|e| {
            error!("{}", e);
            Error::SourceOpen(e)
        })?;
        info!("analyzing {}", source.path().display());

        let aggregator = Arc::new(FlowAggregator::new());
        let (task_sender, task_receiver, queue_stats) = queue::bounded(config.report_queue_size);
        let exporter = ReportExporter::new(
            ExporterConfig::from(config),
            aggregator.clone(),
            task_receiver,
        );
        exporter.start()?;

        let mut ingester = Ingester::new(
            IngesterConfig {
                batch_size: config.batch_size,
                read_error_policy: config.read_error_policy,
                report_on_exit: config.report_on_exit,
            },
            aggregator.clone(),
            task_sender.clone(),
            self.stop_handle.clone(),
        );
        let result = ingester.run(move || Ok(source));
        let ingest_counter = ingester.counter().clone();
        drop(ingester);
        // queued after every posted cycle, the exporter exits once it gets here
        if let Err(e) = task_sender.send(ReportTask::Terminated) {
            warn!("post terminate to report exporter failed: {}", e);
        }
        drop(task_sender);
        exporter.stop();

        info!(
            "ingester: {}",
            format_counters(&ingest_counter.get_counters())
        );
        info!("flow table: {}", format_counters(&aggregator.get_counters()));
        info!(
            "report queue: {}",
            format_counters(&queue_stats.get_counters())
        );
        info!(
            "exporter: {}",
            format_counters(&exporter.counter().get_counters())
        );

        let ingest = result.map_err(|e| {
            error!("{}", e);
            e
        })?;
        Ok(RunSummary {
            ingest,
            reports: exporter.counter().reports(),
            report_failures: exporter.counter().report_failures(),
            flows: aggregator.len(),
            total_bytes: aggregator.total_bytes(),
        })
    }
}
