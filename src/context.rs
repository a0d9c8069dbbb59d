// SPDX-License-Identifier: Apache-2.0

//! Process-wide pipeline context.
//!
//! The original design kept app name, app version, hostname and the time
//! threshold as module globals; here they travel as one shared context
//! object. The app version is the only datum mutated after startup (a
//! watermark line in a tailed file can update it), so it sits behind a
//! reader-writer lock.

use chrono::{DateTime, Utc};
use std::sync::RwLock;

pub struct AppContext {
    app: String,
    app_ver: RwLock<String>,
    hostname: String,
    /// Records with an event time earlier than this are dropped.
    pub time_threshold: DateTime<Utc>,
    /// Whether tailers keep following files after EOF.
    pub follow: bool,
}

impl AppContext {
    pub fn new(
        app: String,
        app_ver: String,
        hostname: String,
        time_threshold: DateTime<Utc>,
        follow: bool,
    ) -> Self {
        Self {
            app,
            app_ver: RwLock::new(app_ver),
            hostname,
            time_threshold,
            follow,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn app_ver(&self) -> String {
        self.app_ver.read().unwrap().clone()
    }

    pub fn set_app_ver(&self, new_val: String) {
        *self.app_ver.write().unwrap() = new_val;
    }
}

/// Resolve the hostname to report in records: the configured value if set,
/// the OS hostname otherwise.
pub fn resolve_hostname(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    gethostname::gethostname().to_string_lossy().into_owned()
}
