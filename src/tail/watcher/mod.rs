// SPDX-License-Identifier: Apache-2.0

//! Path-event sources.
//!
//! Native OS notifications (inotify/kqueue/FSEvents) via the `notify` crate,
//! with a polling fallback for file systems that do not support them. Both
//! sit behind the [`PathWatcher`] trait; monitors and tailers only see
//! Create/Modify/Remove/Rename events.

pub mod native;
pub mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{PathEvent, PathEventKind, PathWatcher, WatcherError};

use std::time::Duration;

/// Create a watcher: native when the platform supports it, polling
/// otherwise.
pub fn create_watcher(poll_interval: Duration) -> Box<dyn PathWatcher + Send> {
    match NativeWatcher::new() {
        Ok(w) => Box::new(w),
        Err(e) => {
            tracing::warn!(error = %e, "native file watcher unavailable, falling back to polling");
            Box::new(PollWatcher::new(poll_interval))
        }
    }
}
