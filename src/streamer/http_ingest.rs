// SPDX-License-Identifier: Apache-2.0

//! HTTP ingest sink: batches events and POSTs them as
//! `{api_key, transaction_id, events}` bodies. The transaction id is the MD5
//! of the concatenated per-record hashes plus a fixed salt, so a replayed
//! batch is recognizable server-side (409).

use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{StreamError, StreamerHandle, retry_backoff, sink_channel};
use crate::bounded_channel::BoundedReceiver;
use crate::config::{ConfigError, RecordSchema, StreamConfig};
use crate::record::Record;

const DEFAULT_SIZE_LIMIT: usize = 125_000;
const UPLOAD_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const INPUT_QUEUE_SIZE: usize = 64;

/// Salt appended to the hash chain for transaction-id uniqueness.
const TRANSACTION_SALT: &[u8] = b"20160727";

/// Attributes stripped from each event before upload; the ingest endpoint
/// derives its own timestamps and does not want raw lines.
const STRIPPED_KEYS: [&str; 3] = ["log_line", "ingest_datetime", "event_datetime"];

#[derive(Serialize)]
struct IngestPost<'a> {
    api_key: &'a str,
    transaction_id: &'a str,
    events: &'a [Map<String, Value>],
}

/// What a response status means for the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered; move on.
    Success,
    /// The server rejected the batch or already has it; drop it.
    Terminal,
    /// Worth another attempt after backoff.
    Retry,
}

pub fn classify_status(status: u16) -> Disposition {
    match status {
        200 => Disposition::Success,
        400 | 500 => Disposition::Terminal,
        409 => Disposition::Terminal, // transaction already applied
        429 | 504 => Disposition::Retry,
        s if (200..300).contains(&s) => Disposition::Success,
        _ => Disposition::Retry,
    }
}

pub struct HttpIngestSink {
    rx: BoundedReceiver<Record>,
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    size_limit: usize,
    stream_name: String,
}

impl HttpIngestSink {
    pub fn build(
        stream: &StreamConfig,
        schema: RecordSchema,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        if stream.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "stream {}: http sink requires url",
                stream.stream_name
            )));
        }

        let options = super::SinkOptions::from_stream(stream);
        let size_limit = options.get_usize("size_limit", DEFAULT_SIZE_LIMIT)?;

        let (handle, rx) = sink_channel(INPUT_QUEUE_SIZE, schema);
        Ok((
            handle,
            Self {
                rx,
                client: reqwest::Client::new(),
                endpoint: stream.url.clone(),
                api_key: stream.stream_api_key.clone(),
                size_limit,
                stream_name: stream.stream_name.clone(),
            },
        ))
    }

    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut events: Vec<Map<String, Value>> = Vec::new();
        let mut hasher = Md5::new();
        let mut last_upload = Instant::now();

        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let mut exit = false;

            select! {
                _ = cancel.cancelled() => exit = true,

                record = self.rx.next() => match record {
                    None => exit = true,
                    Some(record) => {
                        hasher.update(record.hash());
                        events.push(event_body(&record));
                    }
                },

                _ = tick.tick() => {}
            }

            let force = exit || last_upload.elapsed() >= UPLOAD_INTERVAL;
            if !events.is_empty() && (events.len() >= self.size_limit || force) {
                let batch = std::mem::take(&mut events);

                hasher.update(TRANSACTION_SALT);
                let txid = format!("{:x}", hasher.finalize_reset());

                self.upload(&txid, &batch).await;
                last_upload = Instant::now();
            }

            if exit {
                break;
            }
        }

        debug!(stream = %self.stream_name, "http ingest sink stopped");
        Ok(())
    }

    /// Upload one transaction, retrying transient failures with the linear
    /// backoff. Terminal responses drop the batch.
    async fn upload(&self, txid: &str, events: &[Map<String, Value>]) {
        let body = IngestPost {
            api_key: &self.api_key,
            transaction_id: txid,
            events,
        };

        let mut try_count = 0u32;
        loop {
            let backoff = retry_backoff(try_count);
            if !backoff.is_zero() {
                warn!(txid = %txid, delay = ?backoff, "retrying ingest transaction");
                tokio::time::sleep(backoff).await;
            }
            try_count += 1;

            debug!(txid = %txid, events = events.len(), "pushing transaction");

            let resp = match self
                .client
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(txid = %txid, error = %e, "http error, retrying");
                    continue;
                }
            };

            match classify_status(resp.status().as_u16()) {
                Disposition::Success => {
                    debug!(txid = %txid, "transaction accepted");
                    return;
                }
                Disposition::Terminal => {
                    error!(txid = %txid, status = %resp.status(),
                        "terminal response, dropping transaction");
                    return;
                }
                Disposition::Retry => {
                    warn!(txid = %txid, status = %resp.status(), "retrying");
                }
            }
        }
    }
}

/// The event payload: every attribute except the stripped keys.
fn event_body(record: &Record) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in &record.attributes {
        if STRIPPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        map.insert(key.clone(), Value::String(value.clone()));
    }
    map
}

/// Hex MD5 of concatenated record hashes plus the salt; exposed for tests.
pub fn transaction_id(records: &[Record]) -> String {
    let mut hasher = Md5::new();
    for record in records {
        hasher.update(record.hash());
    }
    hasher.update(TRANSACTION_SALT);
    format!("{:x}", hasher.finalize())
}
