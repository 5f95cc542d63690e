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

use thiserror::Error;

use crate::{capture, config::ConfigError, exporter, ingester::State};

#[derive(Debug, Error)]
pub enum Error {
    #[error("capture source unavailable: {0}")]
    SourceOpen(#[source] capture::Error),
    #[error("capture source failed: {0}")]
    SourceRead(#[source] capture::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("report exporter: {0}")]
    Exporter(#[from] exporter::Error),
    #[error("ingester cannot run in state {0:?}")]
    InvalidState(State),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
