// SPDX-License-Identifier: Apache-2.0

//! Directory monitor: expands a directory wildcard into per-file monitors
//! and keeps the set current as files come and go.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{FileMonitor, MonitorError};
use crate::bounded_channel::{BoundedSender, bounded};
use crate::config::Logfile;
use crate::context::AppContext;
use crate::cursor::CursorUpdate;
use crate::streamer::StreamerHandle;
use crate::tail::watcher::{PathEvent, PathEventKind, create_watcher};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const WATCH_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Expand a directory wildcard into the files currently matching it.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, MonitorError> {
    let mut files = Vec::new();
    let entries = glob::glob(pattern).map_err(|e| {
        MonitorError::Config(crate::config::ConfigError::Invalid(format!(
            "invalid directory glob {}: {}",
            pattern, e
        )))
    })?;

    for entry in entries.flatten() {
        if entry.is_file() {
            files.push(entry);
        }
    }
    Ok(files)
}

pub struct DirectoryMonitor {
    template: Logfile,
    ctx: Arc<AppContext>,
    streams: Arc<HashMap<String, StreamerHandle>>,
    cursor_tx: BoundedSender<CursorUpdate>,
    initial_files: Vec<PathBuf>,
}

impl DirectoryMonitor {
    pub fn new(
        template: Logfile,
        ctx: Arc<AppContext>,
        streams: Arc<HashMap<String, StreamerHandle>>,
        cursor_tx: BoundedSender<CursorUpdate>,
        initial_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            template,
            ctx,
            streams,
            cursor_tx,
            initial_files,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), MonitorError> {
        let pattern = self.template.directory.clone();
        info!(directory = %pattern, "monitoring dir start");

        // The wildcard suffix doubles as the extension filter for events,
        // e.g. /var/log/app/*.log watches /var/log/app for names
        // containing ".log".
        let pattern_path = Path::new(&pattern);
        let dir_path = pattern_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let ext = pattern_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let (event_tx, mut event_rx) = bounded::<PathEvent>(EVENT_CHANNEL_CAPACITY);
        spawn_dir_watch_thread(dir_path, event_tx, cancel.clone());

        let mut children: JoinSet<Result<(), MonitorError>> = JoinSet::new();
        let mut tokens: HashMap<PathBuf, CancellationToken> = HashMap::new();

        for file in &self.initial_files {
            self.spawn_monitor(file, &cancel, &mut children, &mut tokens);
        }

        loop {
            select! {
                _ = cancel.cancelled() => break,

                event = event_rx.next() => {
                    let event = match event {
                        Some(event) => event,
                        None => break,
                    };

                    for path in &event.paths {
                        let name = path.to_string_lossy();
                        if !ext.is_empty() && !name.contains(&ext) {
                            continue;
                        }

                        match event.kind {
                            PathEventKind::Create => {
                                if !tokens.contains_key(path) {
                                    self.spawn_monitor(path, &cancel, &mut children, &mut tokens);
                                }
                            }
                            PathEventKind::Remove | PathEventKind::Rename => {
                                if let Some(token) = tokens.remove(path) {
                                    info!(file = %path.display(),
                                        stream = %self.template.stream_name,
                                        "removed from filesystem");
                                    token.cancel();
                                }
                            }
                            _ => {}
                        }
                    }
                }

                Some(res) = children.join_next(), if !children.is_empty() => {
                    if let Ok(Err(e)) = res {
                        error!(directory = %pattern, error = %e, "file monitor failed");
                    }
                }
            }
        }

        // Cancel every child and wait for them to drain.
        for token in tokens.values() {
            token.cancel();
        }
        while let Some(res) = children.join_next().await {
            if let Ok(Err(e)) = res {
                error!(directory = %pattern, error = %e, "file monitor failed during drain");
            }
        }

        info!(directory = %pattern, "monitoring dir stop");
        Ok(())
    }

    fn spawn_monitor(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        children: &mut JoinSet<Result<(), MonitorError>>,
        tokens: &mut HashMap<PathBuf, CancellationToken>,
    ) {
        let mut logfile = self.template.clone();
        logfile.filename = path.to_string_lossy().into_owned();

        let monitor = match FileMonitor::new(
            logfile,
            self.ctx.clone(),
            &self.streams,
            self.cursor_tx.clone(),
        ) {
            Ok(monitor) => monitor,
            Err(e) => {
                error!(file = %path.display(), error = %e, "unable to monitor file");
                return;
            }
        };

        let token = cancel.child_token();
        tokens.insert(path.to_path_buf(), token.clone());
        children.spawn(monitor.run(token));
    }
}

fn spawn_dir_watch_thread(
    dir: PathBuf,
    tx: BoundedSender<PathEvent>,
    cancel: CancellationToken,
) {
    std::thread::spawn(move || {
        let mut watcher = create_watcher(WATCH_POLL_INTERVAL);
        if let Err(e) = watcher.watch(&dir) {
            warn!(directory = %dir.display(), error = %e, "unable to watch directory");
            return;
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match watcher.recv_timeout(WATCH_RECV_TIMEOUT) {
                Ok(events) => {
                    for event in events {
                        if tx.send_blocking(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(directory = %dir.display(), error = %e, "watcher error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::cursor;
    use crate::streamer::testing::capture_handle;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn test_ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(
            "go-testing".into(),
            "1.0".into(),
            "tester-box".into(),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            true,
        ))
    }

    fn dir_logfile(pattern: &str) -> Logfile {
        let config: Config = serde_yaml::from_str(&format!(
            r#"
app: go-testing
streams:
  - stream_name: main
    type: csv
files:
  - directory: "{}"
    stream: main
    parse_mode: json_raw
    time_format: "%Y-%m-%dT%H:%M:%S%.3fZ"
    retry_file_open: true
"#,
            pattern
        ))
        .unwrap();
        config.logfiles[0].clone()
    }

    #[test]
    fn expand_glob_lists_matching_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.log"), "x").unwrap();
        std::fs::write(dir.path().join("b.log"), "x").unwrap();
        std::fs::write(dir.path().join("c.txt"), "x").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let files = expand_glob(&pattern).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn monitors_initial_and_newly_created_files() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.log", dir.path().display());

        std::fs::write(
            dir.path().join("first.log"),
            "{\"timestamp\":\"2016-05-04T13:54:21.000Z\",\"user_tag\":\"one\"}\n",
        )
        .unwrap();

        let (handle, records) = capture_handle();
        let streams = Arc::new(HashMap::from([("main".to_string(), handle)]));
        let (cursor_tx, _rx) = cursor::update_channel();

        let initial = expand_glob(&pattern).unwrap();
        let monitor = DirectoryMonitor::new(
            dir_logfile(&pattern),
            test_ctx(),
            streams,
            cursor_tx,
            initial,
        );

        let cancel = CancellationToken::new();
        let run = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;

        // a new file appears; its monitor should be spawned by the watcher
        std::fs::write(
            dir.path().join("second.log"),
            "{\"timestamp\":\"2016-05-04T13:54:22.000Z\",\"user_tag\":\"two\"}\n",
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let records = records.lock().unwrap();
        let tags: Vec<&str> = records
            .iter()
            .map(|r| r.attributes["user_tag"].as_str())
            .collect();
        assert!(tags.contains(&"one"), "records: {:?}", tags);
        assert!(tags.contains(&"two"), "records: {:?}", tags);
    }
}
