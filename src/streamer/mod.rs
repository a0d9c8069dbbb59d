// SPDX-License-Identifier: Apache-2.0

//! Sinks ("streamers"): batch records and deliver them to their
//! destination with bounded-queue backpressure and linear-capped retry.
//!
//! Each sink owns a task fed by a bounded channel. [`StreamerHandle`] is the
//! producer side handed to file monitors; `stream()` blocks when the queue
//! is full, which is how sink backpressure reaches the tailer. Dropping
//! every handle closes the queue; the sink task then performs a final flush
//! and exits once in-flight uploads finish or hit their retry ceiling.

pub mod csv_file;
pub mod delivery;
pub mod http_ingest;
pub mod object_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::config::{Config, ConfigError, RecordSchema, SinkType, StreamConfig, parse_options};
use crate::record::Record;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("sink queue closed")]
    Closed,

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Producer side of a sink: cloned into every file monitor routed to it.
#[derive(Clone)]
pub struct StreamerHandle {
    tx: BoundedSender<Record>,
    schema: RecordSchema,
}

impl StreamerHandle {
    pub fn new(tx: BoundedSender<Record>, schema: RecordSchema) -> Self {
        Self { tx, schema }
    }

    /// Enqueue a record. Blocks while the sink queue is full; this
    /// backpressure is intended to stall the tailer path.
    pub async fn stream(&self, record: Record) -> Result<(), StreamError> {
        self.tx.send(record).await.map_err(|_| StreamError::Closed)
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }
}

/// Linear backoff, capped at sixty seconds: `min(60, 5 x fail_count)`.
pub fn retry_backoff(fail_count: u32) -> Duration {
    Duration::from_secs((5 * fail_count as u64).min(60))
}

pub type SinkTaskSet = JoinSet<Result<(), Box<dyn std::error::Error + Send + Sync>>>;

/// Build every configured stream's sink, spawning sink tasks onto the given
/// task set. Returns the handles keyed by stream name.
pub fn build_streamers(
    config: &Config,
    task_set: &mut SinkTaskSet,
    cancel: &CancellationToken,
) -> Result<HashMap<String, StreamerHandle>, ConfigError> {
    let mut handles = HashMap::new();

    for stream in &config.streams {
        let schema: RecordSchema = Arc::new(stream.record_format.clone());
        let handle = match stream.kind {
            SinkType::ObjectStore => {
                info!(stream = %stream.stream_name, "streaming to object store");
                let (handle, sink) = object_store::ObjectStoreSink::build(stream, schema)?;
                let token = cancel.clone();
                task_set.spawn(async move { sink.start(token).await.map_err(Into::into) });
                handle
            }
            SinkType::Delivery => {
                info!(stream = %stream.stream_name, name = %stream.name,
                    "streaming to delivery service");
                let (handle, sink) = delivery::DeliverySink::build(stream, schema)?;
                let token = cancel.clone();
                task_set.spawn(async move { sink.start(token).await.map_err(Into::into) });
                handle
            }
            SinkType::Http => {
                info!(stream = %stream.stream_name, "streaming to http ingest");
                let (handle, sink) = http_ingest::HttpIngestSink::build(stream, schema)?;
                let token = cancel.clone();
                task_set.spawn(async move { sink.start(token).await.map_err(Into::into) });
                handle
            }
            SinkType::Csv => {
                let filename = format!("{}.csv", stream.name);
                info!(stream = %stream.stream_name, file = %filename, "streaming to csv");
                let (handle, sink) = csv_file::CsvFileSink::build(stream, schema)?;
                let token = cancel.clone();
                task_set.spawn(async move { sink.start(token).await.map_err(Into::into) });
                handle
            }
        };

        handles.insert(stream.stream_name.clone(), handle);
    }

    Ok(handles)
}

/// Shared plumbing for sink builders: the bounded input queue and handle.
pub(crate) fn sink_channel(
    capacity: usize,
    schema: RecordSchema,
) -> (StreamerHandle, BoundedReceiver<Record>) {
    let (tx, rx) = bounded(capacity);
    (StreamerHandle::new(tx, schema), rx)
}

/// Sink options shared by builders.
pub(crate) struct SinkOptions(HashMap<String, String>);

impl SinkOptions {
    pub(crate) fn from_stream(stream: &StreamConfig) -> Self {
        Self(parse_options(&stream.options))
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub(crate) fn get_usize(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.0.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("option {} must be an integer, got {}", key, raw))
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(retry_backoff(0), Duration::from_secs(0));
        assert_eq!(retry_backoff(1), Duration::from_secs(5));
        assert_eq!(retry_backoff(4), Duration::from_secs(20));
        assert_eq!(retry_backoff(12), Duration::from_secs(60));
        assert_eq!(retry_backoff(100), Duration::from_secs(60));
    }
}
