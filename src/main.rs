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

#[cfg(unix)]
use std::thread;

use anyhow::Result;
use clap::{ArgAction, Parser};
use log::info;
#[cfg(unix)]
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use ::topflow::{ingester::StopHandle, utils::init_logger, Analyzer, Config};

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long)]
    config_file: Option<String>,

    /// Capture file to analyze, overrides capture-file in config
    #[clap(short = 'r', long)]
    capture_file: Option<String>,

    /// Report file, overrides report-file in config
    #[clap(short = 'o', long)]
    report_file: Option<String>,

    /// TCP packets between two reports
    #[clap(long)]
    batch_size: Option<u64>,

    /// Flows per report
    #[clap(short = 'n', long)]
    top_n: Option<usize>,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,
}

impl Opts {
    fn into_config(self) -> Result<Config> {
        let mut config = match self.config_file.as_ref() {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };
        if let Some(f) = self.capture_file {
            config.capture_file = f;
        }
        if let Some(f) = self.report_file {
            config.report_file = f;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(n) = self.top_n {
            config.top_n = n;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(unix)]
fn stop_on_signals(stop_handle: StopHandle) -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    thread::Builder::new()
        .name("signal".to_owned())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("signal {} received, stopping", signal);
                stop_handle.stop();
            }
        })?;
    Ok(())
}

#[cfg(windows)]
fn stop_on_signals(_: StopHandle) -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let config = opts.into_config()?;
    let _logger = init_logger(&config)?;

    let analyzer = Analyzer::new(config)?;
    stop_on_signals(analyzer.stop_handle())?;
    let summary = analyzer.run()?;
    info!(
        "{} tcp packets in {} flows, {} reports written",
        summary.ingest.tcp_packets, summary.flows, summary.reports
    );
    Ok(())
}
