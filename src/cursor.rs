// SPDX-License-Identifier: Apache-2.0

//! Persistent per-file cursor store.
//!
//! File monitors report `(filename, last_event_time)` through a bounded
//! channel with non-blocking sends; this task folds the updates into a map
//! and rewrites the cursor file every five seconds and once more at
//! shutdown. The cursor file is the only durable state in the process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ISO_8601;
use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::context::AppContext;
use crate::record::csv::{split_record, write_record};
use std::sync::Arc;

/// Capacity of the shared cursor-update channel. Senders use try_send and
/// drop on full; the next successful send supersedes anything lost.
pub const UPDATE_CHANNEL_CAPACITY: usize = 1028;

const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("unable to write cursor file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    pub filename: String,
    pub last_event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorEntry {
    pub filename: String,
    pub last_event_time: Option<DateTime<Utc>>,
    pub app_version: String,
}

pub fn update_channel() -> (BoundedSender<CursorUpdate>, BoundedReceiver<CursorUpdate>) {
    bounded(UPDATE_CHANNEL_CAPACITY)
}

/// Read the cursor file. Missing file means a cold start; malformed rows are
/// skipped with a warning. The caller seeds logfile cursors from the result
/// and feeds the entries back into the store as synthetic updates.
pub fn load(path: impl AsRef<Path>) -> HashMap<String, CursorEntry> {
    let mut entries = HashMap::new();

    let raw = match std::fs::read_to_string(path.as_ref()) {
        Ok(raw) => raw,
        Err(_) => return entries,
    };

    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let fields = match split_record(line) {
            Ok(fields) if fields.len() == 3 => fields,
            _ => {
                warn!(file = %path.as_ref().display(), line, "skipping malformed cursor row");
                continue;
            }
        };

        let last_event_time = if fields[1].is_empty() {
            None
        } else {
            match chrono::NaiveDateTime::parse_from_str(&fields[1], ISO_8601) {
                Ok(naive) => Some(naive.and_utc()),
                Err(e) => {
                    warn!(file = %path.as_ref().display(), line, error = %e,
                        "unable to parse cursor timestamp");
                    continue;
                }
            }
        };

        entries.insert(
            fields[0].clone(),
            CursorEntry {
                filename: fields[0].clone(),
                last_event_time,
                app_version: fields[2].clone(),
            },
        );
    }

    entries
}

pub struct CursorStore {
    path: PathBuf,
    ctx: Arc<AppContext>,
    rx: BoundedReceiver<CursorUpdate>,
    entries: HashMap<String, CursorUpdate>,
}

impl CursorStore {
    pub fn new(
        path: impl Into<PathBuf>,
        ctx: Arc<AppContext>,
        rx: BoundedReceiver<CursorUpdate>,
    ) -> Self {
        Self {
            path: path.into(),
            ctx,
            rx,
            entries: HashMap::new(),
        }
    }

    /// Run until cancellation, then persist one final time. A failed write is
    /// fatal: losing the cursor would replay already-shipped data on restart.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CursorError> {
        let mut tick = tokio::time::interval(PERSIST_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancel.cancelled() => break,

                update = self.rx.next() => {
                    match update {
                        Some(update) => self.apply(update),
                        None => break, // all senders gone
                    }
                }

                _ = tick.tick() => {
                    if !self.entries.is_empty() {
                        self.persist()?;
                    }
                }
            }
        }

        // Drain anything already queued before the final write.
        while let Some(update) = self.rx.try_recv() {
            self.apply(update);
        }
        self.persist()?;

        debug!(file = %self.path.display(), "cursor store stopped");
        Ok(())
    }

    fn apply(&mut self, update: CursorUpdate) {
        // Zero-value timestamps never regress an entry.
        if update.last_event_time.timestamp_millis() == 0 {
            return;
        }
        self.entries.insert(update.filename.clone(), update);
    }

    /// Truncate-and-write the full map as `filename,iso8601_ms,app_version`
    /// rows.
    fn persist(&self) -> Result<(), CursorError> {
        let app_ver = self.ctx.app_ver();
        let mut out = String::new();

        for update in self.entries.values() {
            let ts = update.last_event_time.format(ISO_8601).to_string();
            out.push_str(&write_record(&[
                update.filename.clone(),
                ts,
                app_ver.clone(),
            ]));
        }

        std::fs::write(&self.path, out).map_err(|e| CursorError::Write {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(
            "app".into(),
            "1.0".into(),
            "host".into(),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            true,
        ))
    }

    #[tokio::test]
    async fn round_trips_entries_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pushr.state");

        let ctx = test_ctx();
        let (tx, rx) = update_channel();
        let store = CursorStore::new(&path, ctx, rx);

        let cancel = CancellationToken::new();
        let ts = Utc.with_ymd_and_hms(2016, 5, 4, 13, 54, 21).unwrap();
        tx.try_send(CursorUpdate {
            filename: "/var/log/app.log".into(),
            last_event_time: ts,
        })
        .unwrap();

        let handle = tokio::spawn(store.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let entries = load(&path);
        let entry = &entries["/var/log/app.log"];
        assert_eq!(entry.last_event_time.unwrap(), ts);
        assert_eq!(entry.app_version, "1.0");
    }

    #[tokio::test]
    async fn later_update_supersedes_earlier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pushr.state");

        let (tx, rx) = update_channel();
        let store = CursorStore::new(&path, test_ctx(), rx);

        let t1 = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2016, 1, 2, 0, 0, 0).unwrap();
        tx.try_send(CursorUpdate {
            filename: "f".into(),
            last_event_time: t1,
        })
        .unwrap();
        tx.try_send(CursorUpdate {
            filename: "f".into(),
            last_event_time: t2,
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(store.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(load(&path)["f"].last_event_time.unwrap(), t2);
    }

    #[test]
    fn load_skips_malformed_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pushr.state");
        std::fs::write(
            &path,
            "good.log,2016-05-04T13:54:21.000Z,1.0\nbad row\nempty.log,,1.0\n",
        )
        .unwrap();

        let entries = load(&path);
        assert_eq!(entries.len(), 2);
        assert!(entries["good.log"].last_event_time.is_some());
        assert!(entries["empty.log"].last_event_time.is_none());
    }

    #[test]
    fn load_missing_file_is_empty() {
        assert!(load("/nonexistent/pushr.state").is_empty());
    }
}
