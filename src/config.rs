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

use std::fs;
use std::path::Path;

use serde::{
    de::{self, Unexpected},
    Deserialize, Deserializer,
};
use thiserror::Error;

pub const DEFAULT_REPORT_FILE: &str = "top_tcp_flows.csv";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("capture-file is empty")]
    CaptureFileEmpty,
    #[error("report-file is empty")]
    ReportFileEmpty,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
}

/// What the ingestion loop does when the capture source fails mid-stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadErrorPolicy {
    // stop the run and report the error
    #[default]
    Terminate,
    // log the error and finish as if the capture ended there
    EndOfStream,
}

impl<'de> Deserialize<'de> for ReadErrorPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.as_str() {
            "terminate" => Ok(Self::Terminate),
            "end-of-stream" | "end_of_stream" => Ok(Self::EndOfStream),
            other => Err(de::Error::invalid_value(
                Unexpected::Str(other),
                &"terminate|end-of-stream|end_of_stream",
            )),
        }
    }
}

/// Meaning of "Total Bytes" in a report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CountingMode {
    // since the start of the run, the flow table only grows
    #[default]
    Cumulative,
    // since the previous report, the flow table is emptied by every report
    ResetOnReport,
}

impl<'de> Deserialize<'de> for CountingMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.as_str() {
            "cumulative" => Ok(Self::Cumulative),
            "reset-on-report" | "reset_on_report" => Ok(Self::ResetOnReport),
            other => Err(de::Error::invalid_value(
                Unexpected::Str(other),
                &"cumulative|reset-on-report|reset_on_report",
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub capture_file: String,
    pub report_file: String,
    // tcp packets between two reports
    pub batch_size: u64,
    pub top_n: usize,
    // pending report cycles, further cycles are coalesced while the queue is full
    pub report_queue_size: usize,
    pub report_on_exit: bool,
    pub read_error_policy: ReadErrorPolicy,
    pub counting_mode: CountingMode,
    // empty means stderr only
    pub log_file: String,
    pub log_level: String,
    pub log_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_file: String::new(),
            report_file: DEFAULT_REPORT_FILE.to_owned(),
            batch_size: 10000,
            top_n: 10,
            report_queue_size: 4,
            report_on_exit: false,
            read_error_policy: ReadErrorPolicy::default(),
            counting_mode: CountingMode::default(),
            log_file: String::new(),
            log_level: "info".to_owned(),
            log_retention: 7,
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_file.is_empty() {
            return Err(ConfigError::CaptureFileEmpty);
        }
        if self.report_file.is_empty() {
            return Err(ConfigError::ReportFileEmpty);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive("batch-size"));
        }
        if self.top_n == 0 {
            return Err(ConfigError::NotPositive("top-n"));
        }
        if self.report_queue_size == 0 {
            return Err(ConfigError::NotPositive("report-queue-size"));
        }
        Ok(())
    }
}
