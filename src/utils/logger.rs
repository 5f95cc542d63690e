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

use std::{fs, path::Path};

use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger,
    LoggerHandle, Naming,
};

use crate::config::Config;

/// Starts the global logger. `RUST_LOG` overrides the configured level.
///
/// Logs go to stderr, or to a daily rotated file duplicated to stderr when a log file is
/// configured and its directory is writable.
pub fn init_logger(config: &Config) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);
    if config.log_file.is_empty() {
        return logger.log_to_stderr().start();
    }

    let log_file = Path::new(&config.log_file);
    let writable = match log_file.parent() {
        Some(dir) if dir.as_os_str().is_empty() => true,
        Some(dir) if dir.exists() => dir
            .metadata()
            .ok()
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false),
        Some(dir) => fs::create_dir_all(dir).is_ok(),
        None => false,
    };
    if !writable {
        eprintln!(
            "Log file path '{}' access denied, logs will not be written to file",
            config.log_file
        );
        return logger.log_to_stderr().start();
    }

    logger
        .log_to_file(FileSpec::try_from(log_file)?)
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(config.log_retention),
        )
        .append()
        .duplicate_to_stderr(Duplicate::All)
        .start()
}
