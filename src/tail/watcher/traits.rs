// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum WatcherError {
    /// Failed to initialize the watcher
    Init(String),
    /// Failed to watch a path
    Watch(String),
    /// IO error
    Io(std::io::Error),
    /// Channel error
    Channel(String),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Init(msg) => write!(f, "watcher initialization failed: {}", msg),
            WatcherError::Watch(msg) => write!(f, "watch failed: {}", msg),
            WatcherError::Io(e) => write!(f, "IO error: {}", e),
            WatcherError::Channel(msg) => write!(f, "channel error: {}", msg),
        }
    }
}

impl std::error::Error for WatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WatcherError {
    fn from(e: std::io::Error) -> Self {
        WatcherError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEventKind {
    Create,
    Modify,
    Remove,
    Rename,
    Other,
}

#[derive(Debug, Clone)]
pub struct PathEvent {
    pub kind: PathEventKind,
    pub paths: Vec<PathBuf>,
}

impl PathEvent {
    pub fn new(kind: PathEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }
}

/// A source of file system events for watched paths.
pub trait PathWatcher {
    /// Add a path to watch. Directories cover the files within them.
    fn watch(&mut self, path: &std::path::Path) -> Result<(), WatcherError>;

    /// Remove a path from watching.
    fn unwatch(&mut self, path: &std::path::Path) -> Result<(), WatcherError>;

    /// Block until events are available or the timeout expires; an empty
    /// vector means timeout.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<PathEvent>, WatcherError>;

    /// Whether this watcher uses native OS notifications.
    fn is_native(&self) -> bool;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
