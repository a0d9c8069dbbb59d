// SPDX-License-Identifier: Apache-2.0

//! Per-file and per-directory monitors: the orchestration between tailers,
//! parsers, and sinks.

pub mod dir;
pub mod file;

pub use dir::DirectoryMonitor;
pub use file::FileMonitor;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("stream {stream} not found for file {file}")]
    StreamNotFound { stream: String, file: String },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("invalid front_split_regex: {0}")]
    FrontSplit(String),
}
