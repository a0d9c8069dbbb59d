// SPDX-License-Identifier: Apache-2.0

//! Object-store sink: buffers serialized CSV rows and uploads the buffer as
//! keyed objects, optionally gzipped, with a bounded retry ceiling and an
//! optional manifest callback after each successful upload.
//!
//! The store itself sits behind the [`ObjectStore`] trait; the batching, key
//! layout, compression, and retry policy live here.

use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SinkOptions, StreamError, StreamerHandle, retry_backoff, sink_channel};
use crate::bounded_channel::BoundedReceiver;
use crate::config::{ConfigError, RecordSchema, StreamConfig};
use crate::record::Record;

const DEFAULT_MAX_UPLOAD_RETRY: usize = 3;
const DEFAULT_BUFFER_SIZE: usize = 1 << 20; // 1 MiB of serialized rows
const DEFAULT_BUFFER_INTERVAL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StreamError>;
}

/// HTTP object store: PUTs each object to `{url}/{key}`. The cloud-specific
/// client is out of scope; anything that can accept an HTTP PUT works.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StreamError> {
        let url = format!("{}/{}", self.base_url, key);
        let resp = self.client.put(&url).body(body).send().await?;
        if !resp.status().is_success() {
            return Err(StreamError::Upload(format!(
                "object store returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> Vec<(String, Vec<u8>)> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StreamError> {
        self.objects.lock().unwrap().push((key.to_string(), body));
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ManifestRequest {
    fullpath: String,
    table_name: String,
    ddl_version: String,
    record_count: usize,
}

struct ManifestCallback {
    client: reqwest::Client,
    api_url: String,
    api_header_key: String,
    api_key: String,
}

impl ManifestCallback {
    async fn notify(&self, req: ManifestRequest) -> Result<(), StreamError> {
        self.client
            .post(&self.api_url)
            .header(self.api_header_key.as_str(), self.api_key.as_str())
            .json(&req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct ObjectStoreSink {
    rx: BoundedReceiver<Record>,
    store: Arc<dyn ObjectStore>,
    stream_name: String,
    prefix: String,
    buffer_size: usize,
    buffer_interval: Duration,
    max_upload_retry: usize,
    gzip: bool,
    ddl_version: String,
    manifest: Option<Arc<ManifestCallback>>,
}

impl ObjectStoreSink {
    pub fn build(
        stream: &StreamConfig,
        schema: RecordSchema,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(object_url(stream)?));
        Self::build_with_store(stream, schema, store)
    }

    pub fn build_with_store(
        stream: &StreamConfig,
        schema: RecordSchema,
        store: Arc<dyn ObjectStore>,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        let options = SinkOptions::from_stream(stream);

        let buffer_size = options.get_usize("buffer_size", DEFAULT_BUFFER_SIZE)?;
        let max_upload_retry = match options.get_usize("max_upload_retry", 0)? {
            0 => {
                warn!(stream = %stream.stream_name,
                    "max upload retry unspecified, using default of {}", DEFAULT_MAX_UPLOAD_RETRY);
                DEFAULT_MAX_UPLOAD_RETRY
            }
            n => n,
        };
        let buffer_interval = options
            .get_usize("buffer_interval", DEFAULT_BUFFER_INTERVAL.as_secs() as usize)
            .map(|secs| Duration::from_secs(secs as u64))?;

        let gzip = match options.get("compression") {
            None => false,
            Some(v) if v.eq_ignore_ascii_case("gzip") => true,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "compression {} not supported",
                    other
                )));
            }
        };

        let manifest = options.get("api_url").map(|api_url| {
            Arc::new(ManifestCallback {
                client: reqwest::Client::new(),
                api_url: api_url.to_string(),
                api_header_key: options.get("api_header_key").unwrap_or("x-api-key").to_string(),
                api_key: options.get("api_key").unwrap_or_default().to_string(),
            })
        });

        // channel sized relative to the buffer: enough rows in flight to
        // refill the next object while one uploads
        let (handle, rx) = sink_channel(2 * (buffer_size / 512).max(8), schema);

        Ok((
            handle,
            Self {
                rx,
                store,
                stream_name: stream.name.clone(),
                prefix: options.get("prefix").unwrap_or_default().to_string(),
                buffer_size,
                buffer_interval,
                max_upload_retry,
                gzip,
                ddl_version: options.get("ddl_version").unwrap_or_default().to_string(),
                manifest,
            },
        ))
    }

    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.buffer_size);
        let mut record_count = 0usize;
        let mut uploads: JoinSet<()> = JoinSet::new();

        let mut tick = tokio::time::interval(self.buffer_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.reset();

        loop {
            select! {
                _ = cancel.cancelled() => {
                    debug!(stream = %self.stream_name, "cancelled, force flush");
                    break;
                }

                record = self.rx.next() => {
                    match record {
                        None => break, // all producers gone
                        Some(record) => {
                            buf.extend_from_slice(record.to_csv().as_bytes());
                            record_count += 1;
                            if buf.len() >= self.buffer_size {
                                self.flush(&mut buf, &mut record_count, &mut uploads);
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    self.flush(&mut buf, &mut record_count, &mut uploads);
                }
            }
        }

        self.flush(&mut buf, &mut record_count, &mut uploads);

        // Drain: every in-flight upload completes or hits its retry ceiling.
        while uploads.join_next().await.is_some() {}

        Ok(())
    }

    fn flush(&self, buf: &mut Vec<u8>, record_count: &mut usize, uploads: &mut JoinSet<()>) {
        if *record_count == 0 {
            return;
        }

        let payload = if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(buf).is_err() {
                warn!(stream = %self.stream_name, "gzip of upload buffer failed, sending raw");
                buf.clone()
            } else {
                encoder.finish().unwrap_or_else(|_| buf.clone())
            }
        } else {
            buf.clone()
        };

        let key = self.object_key(&payload);
        let count = *record_count;
        buf.clear();
        *record_count = 0;

        let store = self.store.clone();
        let manifest = self.manifest.clone();
        let stream_name = self.stream_name.clone();
        let ddl_version = self.ddl_version.clone();
        let max_retry = self.max_upload_retry;

        uploads.spawn(async move {
            upload_with_retry(
                store, manifest, stream_name, ddl_version, key, payload, count, max_retry,
            )
            .await;
        });
    }

    /// `{prefix}/{stream}/YYYY/MM/DD/HH/MM/{md5hex}[.gz]`, empty components
    /// omitted, UTC clock.
    fn object_key(&self, payload: &[u8]) -> String {
        let now = Utc::now();
        let folders = now.format("%Y/%m/%d/%H/%M").to_string();

        let mut filename = format!("{:x}", Md5::digest(payload));
        if self.gzip {
            filename.push_str(".gz");
        }

        [self.prefix.as_str(), self.stream_name.as_str(), &folders, &filename]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_with_retry(
    store: Arc<dyn ObjectStore>,
    manifest: Option<Arc<ManifestCallback>>,
    stream_name: String,
    ddl_version: String,
    key: String,
    payload: Vec<u8>,
    record_count: usize,
    max_retry: usize,
) {
    let mut fail_count = 0usize;

    loop {
        let backoff = retry_backoff(fail_count as u32);
        if !backoff.is_zero() {
            warn!(key = %key, bytes = payload.len(), retry = fail_count, delay = ?backoff,
                "retrying object upload");
            tokio::time::sleep(backoff).await;
        }

        match store.put(&key, payload.clone()).await {
            Ok(()) => {
                if fail_count > 0 {
                    warn!(key = %key, retries = fail_count, "object upload succeeded after retries");
                }
                break;
            }
            Err(e) => {
                fail_count += 1;
                if fail_count > max_retry {
                    warn!(key = %key, retries = max_retry, bytes = payload.len(),
                        "retry count exceeded, dropping buffered object");
                    return;
                }
                warn!(key = %key, error = %e, "object upload failed, will retry");
            }
        }
    }

    if let Some(manifest) = manifest {
        let req = ManifestRequest {
            fullpath: key.clone(),
            table_name: stream_name,
            ddl_version,
            record_count,
        };
        if let Err(e) = manifest.notify(req).await {
            warn!(key = %key, error = %e, "manifest callback failed");
        }
    }
}

fn object_url(stream: &StreamConfig) -> Result<String, ConfigError> {
    if stream.url.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "stream {}: object store sink requires url",
            stream.stream_name
        )));
    }
    Ok(stream.url.clone())
}
