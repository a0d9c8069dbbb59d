// SPDX-License-Identifier: Apache-2.0

//! Local CSV sink: each record's serialization is written straight to a
//! file, guarded by an exclusive lock.

use std::fs::File;
use std::io::Write;
use std::sync::Mutex;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{StreamError, StreamerHandle, sink_channel};
use crate::bounded_channel::BoundedReceiver;
use crate::config::{ConfigError, RecordSchema, StreamConfig};
use crate::record::Record;

const INPUT_QUEUE_SIZE: usize = 64;

pub struct CsvFileSink {
    rx: BoundedReceiver<Record>,
    file: Mutex<File>,
    filename: String,
}

impl CsvFileSink {
    pub fn build(
        stream: &StreamConfig,
        schema: RecordSchema,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        let filename = format!("{}.csv", stream.name);
        Self::build_with_path(stream, schema, &filename)
    }

    pub fn build_with_path(
        _stream: &StreamConfig,
        schema: RecordSchema,
        path: &str,
    ) -> Result<(StreamerHandle, Self), ConfigError> {
        let file = File::create(path)
            .map_err(|e| ConfigError::Invalid(format!("unable to create {}: {}", path, e)))?;

        let (handle, rx) = sink_channel(INPUT_QUEUE_SIZE, schema);
        Ok((
            handle,
            Self {
                rx,
                file: Mutex::new(file),
                filename: path.to_string(),
            },
        ))
    }

    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        loop {
            select! {
                _ = cancel.cancelled() => break,

                record = self.rx.next() => match record {
                    None => break,
                    Some(record) => {
                        if let Err(e) = self.write(&record) {
                            error!(file = %self.filename, error = %e, "csv write failed");
                        }
                    }
                }
            }
        }

        // Drain whatever is still queued before closing the file.
        while let Some(record) = self.rx.try_recv() {
            if let Err(e) = self.write(&record) {
                error!(file = %self.filename, error = %e, "csv write failed");
            }
        }

        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        debug!(file = %self.filename, "csv sink stopped");
        Ok(())
    }

    fn write(&self, record: &Record) -> std::io::Result<()> {
        let row = record.to_csv();
        let mut file = self.file.lock().unwrap();
        file.write_all(row.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttrKind, Attribute};
    use crate::record::Attributes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stream_config() -> StreamConfig {
        serde_yaml::from_str("stream_name: main\nname: out\ntype: csv\n").unwrap()
    }

    #[tokio::test]
    async fn writes_rows_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");

        let schema: RecordSchema = Arc::new(vec![
            Attribute::new("log_level", AttrKind::String, 0),
            Attribute::new("user_tag", AttrKind::String, 0),
        ]);

        let (handle, sink) =
            CsvFileSink::build_with_path(&stream_config(), schema.clone(), path.to_str().unwrap())
                .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sink.start(cancel));

        for (level, tag) in [("INFO", "a"), ("WARN", "b")] {
            let mut attrs = Attributes::new();
            attrs.insert("log_level".to_string(), level.to_string());
            attrs.insert("user_tag".to_string(), tag.to_string());
            handle
                .stream(Record::new(level.to_string(), schema.clone(), attrs))
                .await
                .unwrap();
        }

        drop(handle);
        task.await.unwrap().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "INFO,a\nWARN,b\n");
    }
}
