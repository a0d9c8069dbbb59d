// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher built on the `notify` crate.
//!
//! Events arrive on a std channel from notify's callback thread; rename and
//! remove kinds are preserved because the tailer's rotation handling depends
//! on them.

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::traits::{PathEvent, PathEventKind, PathWatcher, WatcherError};

pub struct NativeWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<Result<notify::Event, notify::Error>>,
}

impl NativeWatcher {
    pub fn new() -> Result<Self, WatcherError> {
        let (tx, rx) = channel();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            watcher,
            receiver: rx,
        })
    }

    fn convert(event: notify::Event) -> PathEvent {
        let kind = match event.kind {
            EventKind::Create(_) => PathEventKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) => PathEventKind::Rename,
            EventKind::Modify(_) => PathEventKind::Modify,
            EventKind::Remove(_) => PathEventKind::Remove,
            _ => PathEventKind::Other,
        };
        PathEvent::new(kind, event.paths)
    }

    fn drain(&self, first: Option<notify::Event>) -> Vec<PathEvent> {
        let mut events = Vec::new();
        if let Some(event) = first {
            events.push(Self::convert(event));
        }
        while let Ok(res) = self.receiver.try_recv() {
            match res {
                Ok(event) => events.push(Self::convert(event)),
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            }
        }
        events
    }
}

impl PathWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .unwatch(path)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(event)) => Ok(self.drain(Some(event))),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "file watcher error");
                Ok(self.drain(None))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(WatcherError::Channel(
                "watcher channel disconnected".to_string(),
            )),
        }
    }

    fn is_native(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "native"
    }
}
