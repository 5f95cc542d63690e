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

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use super::Result;
use crate::common::TopNSnapshot;

pub const REPORT_HEADER: [&str; 5] = [
    "Source IP",
    "Destination IP",
    "Source Port",
    "Destination Port",
    "Total Bytes",
];

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct WriterCounter {
    pub written_reports: u64,
    pub written_rows: u64,
}

/// Writes rankings as CSV, each call fully replacing the previous report.
///
/// Rows go to a sibling `.temp` file first which is then renamed over the report, so readers
/// of the report never see a partially written ranking.
#[derive(Debug)]
pub struct ReportWriter {
    path: PathBuf,
    temp_path: PathBuf,
    counter: WriterCounter,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("report"));
        temp_name.push(".temp");
        let temp_path = path.with_file_name(temp_name);
        Self {
            path,
            temp_path,
            counter: WriterCounter::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, snapshot: &TopNSnapshot) -> Result<()> {
        if let Err(e) = self.write_temp(snapshot) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(e);
        }
        if let Err(e) = fs::rename(&self.temp_path, &self.path) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(e.into());
        }
        debug!(
            "report of cycle {} with {} flows written to {}",
            snapshot.cycle,
            snapshot.len(),
            self.path.display()
        );

        self.counter.written_reports += 1;
        self.counter.written_rows += snapshot.len() as u64;
        Ok(())
    }

    fn write_temp(&self, snapshot: &TopNSnapshot) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.temp_path)?;
        writer.write_record(REPORT_HEADER)?;
        for flow in snapshot.iter() {
            writer.write_record([
                flow.key.src_ip.to_string(),
                flow.key.dst_ip.to_string(),
                flow.key.src_port.to_string(),
                flow.key.dst_port.to_string(),
                flow.bytes.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn get_and_reset_stats(&mut self) -> WriterCounter {
        let c = self.counter;
        self.counter = WriterCounter::default();
        c
    }
}
