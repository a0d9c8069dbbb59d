// SPDX-License-Identifier: Apache-2.0

//! Polling fallback watcher for file systems without native notifications
//! (NFS and friends). Snapshots watched paths on an interval and diffs the
//! snapshots into events. Rotation shows up as an inode change at the same
//! path and is reported as a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::traits::{PathEvent, PathEventKind, PathWatcher, WatcherError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSig {
    ino: u64,
    len: u64,
}

fn signature(path: &Path) -> Option<FileSig> {
    let meta = std::fs::metadata(path).ok()?;
    #[cfg(unix)]
    let ino = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let ino = 0;
    Some(FileSig {
        ino,
        len: meta.len(),
    })
}

pub struct PollWatcher {
    interval: Duration,
    /// watched path -> (entry path -> signature); a watched file is its own
    /// single entry, a watched directory holds one entry per child file.
    snapshots: HashMap<PathBuf, HashMap<PathBuf, FileSig>>,
}

impl PollWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshots: HashMap::new(),
        }
    }

    fn snapshot(path: &Path) -> HashMap<PathBuf, FileSig> {
        let mut entries = HashMap::new();

        if path.is_dir() {
            if let Ok(read_dir) = std::fs::read_dir(path) {
                for entry in read_dir.flatten() {
                    let child = entry.path();
                    if child.is_dir() {
                        continue;
                    }
                    if let Some(sig) = signature(&child) {
                        entries.insert(child, sig);
                    }
                }
            }
        } else if let Some(sig) = signature(path) {
            entries.insert(path.to_path_buf(), sig);
        }

        entries
    }

    fn diff(old: &HashMap<PathBuf, FileSig>, new: &HashMap<PathBuf, FileSig>) -> Vec<PathEvent> {
        let mut events = Vec::new();

        for (path, sig) in new {
            match old.get(path) {
                None => events.push(PathEvent::new(PathEventKind::Create, vec![path.clone()])),
                Some(prev) if prev.ino != sig.ino => {
                    // same path, different inode: the old file moved away
                    events.push(PathEvent::new(PathEventKind::Rename, vec![path.clone()]));
                }
                Some(prev) if prev.len != sig.len => {
                    events.push(PathEvent::new(PathEventKind::Modify, vec![path.clone()]));
                }
                Some(_) => {}
            }
        }

        for path in old.keys() {
            if !new.contains_key(path) {
                events.push(PathEvent::new(PathEventKind::Remove, vec![path.clone()]));
            }
        }

        events
    }

    fn poll_once(&mut self) -> Vec<PathEvent> {
        let mut events = Vec::new();
        for (watched, snapshot) in self.snapshots.iter_mut() {
            let new = Self::snapshot(watched);
            events.extend(Self::diff(snapshot, &new));
            *snapshot = new;
        }
        events
    }
}

impl PathWatcher for PollWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let snapshot = Self::snapshot(path);
        self.snapshots.insert(path.to_path_buf(), snapshot);
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.snapshots.remove(path);
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError> {
        let deadline = Instant::now() + timeout;

        loop {
            let events = self.poll_once();
            if !events.is_empty() {
                return Ok(events);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            std::thread::sleep(self.interval.min(deadline - now));
        }
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
