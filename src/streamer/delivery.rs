// SPDX-License-Identifier: Apache-2.0

//! Streaming-delivery sink: batches of up to 500 records / 2,000,000 bytes,
//! flushed every five seconds, uploaded concurrently. Partial failures
//! re-batch only the failed sub-records; retries are unbounded with the
//! linear-capped backoff.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{StreamError, StreamerHandle, retry_backoff, sink_channel};
use crate::bounded_channel::BoundedReceiver;
use crate::config::{ConfigError, RecordSchema, StreamConfig};

pub const BATCH_LIMIT: usize = 500;
pub const REQUEST_SIZE_LIMIT: usize = 2_000_000;
pub const RECORD_SIZE_LIMIT: usize = 1_000_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one sub-record within a batch put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

/// The delivery transport. Cloud specifics are out of scope; the contract is
/// a batch put returning one outcome per record.
#[async_trait]
pub trait DeliveryService: Send + Sync + 'static {
    async fn put_records(&self, records: &[Vec<u8>]) -> Result<Vec<DeliveryOutcome>, StreamError>;
}

#[derive(Serialize)]
struct DeliveryRequest<'a> {
    stream: &'a str,
    records: Vec<&'a str>,
}

/// HTTP delivery service: POSTs the batch as JSON to the configured URL.
pub struct HttpDeliveryService {
    client: reqwest::Client,
    url: String,
    stream: String,
}

impl HttpDeliveryService {
    pub fn new(url: String, stream: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            stream,
        }
    }
}

#[async_trait]
impl DeliveryService for HttpDeliveryService {
    async fn put_records(&self, records: &[Vec<u8>]) -> Result<Vec<DeliveryOutcome>, StreamError> {
        let body: Vec<String> = records
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect();
        let req = DeliveryRequest {
            stream: &self.stream,
            records: body.iter().map(String::as_str).collect(),
        };

        let resp = self.client.post(&self.url).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(StreamError::Upload(format!(
                "delivery service returned {}",
                resp.status()
            )));
        }

        Ok(vec![DeliveryOutcome::Delivered; records.len()])
    }
}

pub struct DeliverySink {
    rx: BoundedReceiver<crate::record::Record>,
    service: Arc<dyn DeliveryService>,
    stream_name: String,
}

impl DeliverySink {
    pub fn build(
        stream: &StreamConfig,
        schema: RecordSchema,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        if stream.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "stream {}: delivery sink requires url",
                stream.stream_name
            )));
        }
        let service: Arc<dyn DeliveryService> = Arc::new(HttpDeliveryService::new(
            stream.url.clone(),
            stream.name.clone(),
        ));
        Ok(Self::build_with_service(stream, schema, service))
    }

    pub fn build_with_service(
        stream: &StreamConfig,
        schema: RecordSchema,
        service: Arc<dyn DeliveryService>,
    ) -> (StreamerHandle, Self) {
        let (handle, rx) = sink_channel(BATCH_LIMIT * 5, schema);
        (
            handle,
            Self {
                rx,
                service,
                stream_name: stream.stream_name.clone(),
            },
        )
    }

    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut accum: Vec<Vec<u8>> = Vec::with_capacity(BATCH_LIMIT);
        let mut accum_bytes = 0usize;
        let mut uploads: JoinSet<()> = JoinSet::new();

        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.reset();

        loop {
            let mut flush = false;
            let mut exit = false;

            select! {
                _ = cancel.cancelled() => {
                    debug!(stream = %self.stream_name, "cancelled, force flush");
                    flush = true;
                    exit = true;
                }

                record = self.rx.next() => match record {
                    None => {
                        flush = true;
                        exit = true;
                    }
                    Some(record) => {
                        let data = record.to_csv().into_bytes();
                        if data.len() > RECORD_SIZE_LIMIT {
                            warn!(stream = %self.stream_name, bytes = data.len(),
                                "record exceeds delivery size limit, skipping");
                            continue;
                        }
                        accum_bytes += data.len();
                        accum.push(data);
                    }
                },

                _ = tick.tick() => flush = true,
            }

            if (accum.len() >= BATCH_LIMIT || accum_bytes > REQUEST_SIZE_LIMIT || flush)
                && !accum.is_empty()
            {
                let batch = std::mem::take(&mut accum);
                accum_bytes = 0;

                let service = self.service.clone();
                let stream_name = self.stream_name.clone();
                uploads.spawn(async move {
                    upload_with_retry(service, stream_name, batch).await;
                });
            }

            if exit {
                break;
            }
        }

        while uploads.join_next().await.is_some() {}
        Ok(())
    }
}

/// Retry until everything in the batch is delivered. On partial failure only
/// the failed sub-records carry over into the next attempt.
async fn upload_with_retry(
    service: Arc<dyn DeliveryService>,
    stream_name: String,
    mut records: Vec<Vec<u8>>,
) {
    let mut fail_count = 0u32;

    while !records.is_empty() {
        let backoff = retry_backoff(fail_count);
        if !backoff.is_zero() {
            warn!(stream = %stream_name, records = records.len(), delay = ?backoff,
                "retrying delivery batch");
            tokio::time::sleep(backoff).await;
        }

        match service.put_records(&records).await {
            Err(e) => {
                error!(stream = %stream_name, error = %e, "delivery put failed");
                fail_count += 1;
            }
            Ok(outcomes) => {
                let failed: Vec<Vec<u8>> = records
                    .into_iter()
                    .zip(outcomes)
                    .filter(|(_, outcome)| *outcome == DeliveryOutcome::Failed)
                    .map(|(record, _)| record)
                    .collect();

                if failed.is_empty() {
                    return;
                }
                records = failed;
                fail_count += 1;
            }
        }
    }
}
