// SPDX-License-Identifier: Apache-2.0

//! File tailer: yields a lazy sequence of logical lines from a potentially
//! rotated file.
//!
//! Each tailer owns a task that reads the file in 1 MiB chunks, feeds a
//! [`scanner::LineScanner`], and sends completed records into a bounded
//! channel. Sends block when downstream is full, so sink backpressure
//! reaches the file read loop. On rename the task spawns a replacement for
//! the same path (picking up the fresh inode) and keeps draining the old
//! descriptor until the rotate grace expires.

pub mod scanner;
pub mod watcher;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::select;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use scanner::{LineScanner, SplitMode};
use watcher::{PathEventKind, create_watcher};

const READ_BUFFER_SIZE: usize = 1 << 20; // 1 MiB
const OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);
const LINE_CHANNEL_CAPACITY: usize = 64;
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default time an old descriptor is kept open after rotation.
pub const DEFAULT_ROTATE_WAIT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct TailConfig {
    pub path: PathBuf,
    pub follow: bool,
    /// Keep retrying the open every five seconds; useful when the file does
    /// not exist yet.
    pub retry_open: bool,
    /// When set, the regex marks the start of a record instead of its end.
    pub front_split: Option<regex::bytes::Regex>,
    pub seek_to_end: bool,
    pub rotate_wait: Duration,
}

impl TailConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            follow: true,
            retry_open: true,
            front_split: None,
            seek_to_end: false,
            rotate_wait: DEFAULT_ROTATE_WAIT,
        }
    }
}

pub struct Tailer {
    lines: BoundedReceiver<String>,
    cancel: CancellationToken,
    closed: bool,
}

impl Tailer {
    /// Start tailing. The returned handle yields lines until the file is
    /// exhausted (`follow = false`) or the tailer is closed.
    pub fn start(config: TailConfig, parent_cancel: &CancellationToken) -> Self {
        let cancel = parent_cancel.child_token();
        let (tx, rx) = bounded(LINE_CHANNEL_CAPACITY);

        spawn_tail(config, tx, cancel.clone());

        Self {
            lines: rx,
            cancel,
            closed: false,
        }
    }

    /// Next logical line; None once the tailer has closed its output.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.next().await
    }

    /// Stop the tailer. Idempotent: a second call is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cancel.cancel();
        }
    }
}

/// Plain-fn indirection so a tailer can spawn its rotation replacement
/// without the async state machine containing its own future type.
fn spawn_tail(config: TailConfig, tx: BoundedSender<String>, cancel: CancellationToken) {
    tokio::spawn(async move { run_tail(config, tx, cancel).await });
}

async fn open_file(config: &TailConfig, cancel: &CancellationToken) -> Option<tokio::fs::File> {
    loop {
        match tokio::fs::File::open(&config.path).await {
            Ok(file) => return Some(file),
            Err(e) => {
                if !config.retry_open {
                    warn!(file = %config.path.display(), error = %e, "unable to open");
                    return None;
                }
                info!(file = %config.path.display(), error = %e,
                    "unable to open, retrying in 5 seconds");
                select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(OPEN_RETRY_INTERVAL) => {}
                }
            }
        }
    }
}

async fn run_tail(config: TailConfig, tx: BoundedSender<String>, cancel: CancellationToken) {
    let mut file = match open_file(&config, &cancel).await {
        Some(file) => file,
        None => return,
    };

    if config.seek_to_end {
        if let Err(e) = file.seek(io::SeekFrom::End(0)).await {
            warn!(file = %config.path.display(), error = %e, "seek to end failed");
        }
    }

    let mut scanner = match &config.front_split {
        Some(delim) => LineScanner::new(SplitMode::FrontSplit(delim.clone())),
        None => LineScanner::new(SplitMode::LineEnd),
    };

    // Watcher events arrive on a dedicated thread; the read loop selects on
    // them alongside the idle timer.
    let (event_tx, mut event_rx) = bounded::<PathEventKind>(16);
    spawn_watch_thread(config.path.clone(), event_tx, cancel.clone());

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut rotated_deadline: Option<Instant> = None;

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        let n = select! {
            _ = cancel.cancelled() => break,
            res = file.read(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    warn!(file = %config.path.display(), error = %e, "read error");
                    break;
                }
            }
        };

        if n > 0 {
            for line in scanner.push(&buf[..n]) {
                if send_line(&tx, &cancel, line).await.is_err() {
                    break 'outer;
                }
            }
            continue;
        }

        // EOF
        if !config.follow {
            break;
        }

        if let Some(deadline) = rotated_deadline {
            if Instant::now() >= deadline {
                debug!(file = %config.path.display(), "closing old descriptor after rotation");
                break;
            }
        }

        select! {
            _ = cancel.cancelled() => break,

            _ = sleep(IDLE_TIMEOUT) => {
                // A pause with no new delimiter flushes a pending
                // front-split record.
                if config.front_split.is_some() {
                    if let Some(record) = scanner.flush() {
                        if send_line(&tx, &cancel, record).await.is_err() {
                            break;
                        }
                    }
                }
            }

            kind = event_rx.next() => match kind {
                Some(PathEventKind::Rename) => {
                    if rotated_deadline.is_none() {
                        info!(file = %config.path.display(),
                            "file renamed, monitoring old descriptor until rotate grace expires");
                        let mut replacement = config.clone();
                        replacement.seek_to_end = false;
                        spawn_tail(replacement, tx.clone(), cancel.clone());
                        rotated_deadline = Some(Instant::now() + config.rotate_wait);
                    }
                }
                Some(_) => {} // new data or unrelated; loop re-reads
                None => {}    // watcher thread gone; keep polling reads
            }
        }
    }

    // Front-split drains its accumulator before closing.
    if config.front_split.is_some() {
        if let Some(record) = scanner.flush() {
            let _ = tx.try_send(record);
        }
    }
}

async fn send_line(
    tx: &BoundedSender<String>,
    cancel: &CancellationToken,
    line: String,
) -> Result<(), ()> {
    select! {
        _ = cancel.cancelled() => Err(()),
        res = tx.send(line) => res.map_err(|_| ()),
    }
}

fn spawn_watch_thread(
    path: PathBuf,
    tx: BoundedSender<PathEventKind>,
    cancel: CancellationToken,
) {
    std::thread::spawn(move || {
        let mut watcher = create_watcher(WATCH_POLL_INTERVAL);
        if let Err(e) = watcher.watch(&path) {
            debug!(file = %path.display(), error = %e, "unable to watch file");
            return;
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match watcher.recv_timeout(IDLE_TIMEOUT) {
                Ok(events) => {
                    for event in events {
                        if !event.paths.is_empty() && !event.paths.iter().any(|p| p == &path) {
                            continue;
                        }
                        if tx.try_send(event.kind).is_err() && cancel.is_cancelled() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "watcher error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });
}
