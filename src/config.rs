// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the shipper.
//!
//! The loader produces a fully validated [`Config`]; everything downstream
//! assumes the invariants checked here (streams referenced by logfiles exist,
//! regexes compile, timestamp formats come in pairs). Validation failures are
//! fatal at startup.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Attribute value type, as declared by a stream's record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    String,
    Integer,
    #[serde(alias = "float64")]
    Double,
    Float32,
    Bool,
    Timestamp,
}

/// A column descriptor in a stream's record format.
#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: AttrKind,
    /// Maximum length in code points for string/timestamp values; 0 = unbounded.
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub source_ts_fmt: String,
    #[serde(default)]
    pub dest_ts_fmt: String,
}

impl Attribute {
    pub fn new(key: &str, kind: AttrKind, length: usize) -> Self {
        Self {
            key: key.to_string(),
            kind,
            length,
            source_ts_fmt: String::new(),
            dest_ts_fmt: String::new(),
        }
    }
}

/// Ordered list of attributes defining a sink's output row.
pub type RecordSchema = Arc<Vec<Attribute>>;

/// The record format used when a stream does not declare its own.
pub fn default_record_format() -> Vec<Attribute> {
    use AttrKind::*;
    vec![
        Attribute::new("app", String, 16),
        Attribute::new("app_ver", String, 16),
        Attribute::new("ingest_datetime", Timestamp, 0),
        Attribute::new("event_datetime", Timestamp, 0),
        Attribute::new("hostname", String, 64),
        Attribute::new("filename", String, 256),
        Attribute::new("log_level", String, 16),
        Attribute::new("device_tag", String, 64),
        Attribute::new("user_tag", String, 64),
        Attribute::new("remote_address", String, 64),
        Attribute::new("response_bytes", Integer, 0),
        Attribute::new("response_ms", Double, 0),
        Attribute::new("device_type", String, 32),
        Attribute::new("os", String, 16),
        Attribute::new("os_ver", String, 16),
        Attribute::new("browser", String, 32),
        Attribute::new("browser_ver", String, 16),
        Attribute::new("country", String, 64),
        Attribute::new("language", String, 16),
        Attribute::new("log_line", String, 0),
    ]
}

/// Sink variant selected per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    #[serde(alias = "s3")]
    ObjectStore,
    #[serde(alias = "firehose")]
    Delivery,
    Http,
    Csv,
}

/// Line parsing strategy selected per logfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Regex,
    Json,
    Csv,
    JsonRaw,
    #[serde(alias = "date_keyvalue")]
    DateKv,
    Plugin,
}

/// One output stream: a named sink plus the record format it accepts.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub stream_name: String,
    /// Destination name (delivery stream, object bucket, output file stem).
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SinkType,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub stream_api_key: String,
    #[serde(default = "default_record_format")]
    pub record_format: Vec<Attribute>,
    /// Free-form `key: value` options, sink specific.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Per-file configuration. Either `file` or `directory` is set, never both.
#[derive(Debug, Clone, Deserialize)]
pub struct Logfile {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "file")]
    pub filename: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "stream")]
    pub stream_name: String,
    #[serde(default)]
    pub time_format: String,
    #[serde(default)]
    pub line_regex: String,
    /// When set, the regex marks the *start* of a record instead of its end.
    #[serde(default)]
    pub front_split_regex: String,
    pub parse_mode: ParseMode,
    #[serde(default)]
    pub parser_options: Vec<String>,
    #[serde(default)]
    pub retry_file_open: bool,
    /// canonical key -> source key
    #[serde(default)]
    pub field_mappings: HashMap<String, String>,
    #[serde(default)]
    pub buffer_multi_lines: bool,
    #[serde(default)]
    pub fields_order: Vec<String>,
    #[serde(default)]
    pub parser_plugin: String,
    #[serde(default)]
    pub skip_header_line: bool,
    #[serde(default)]
    pub skip_to_end: bool,
    /// Minutes an old descriptor stays open after rotation to drain
    /// remaining bytes.
    #[serde(default = "default_rotate_wait_minutes")]
    pub rotate_wait_minutes: u64,

    /// Cursor loaded at startup; not part of the config file.
    #[serde(skip)]
    pub last_event_time: Option<DateTime<Utc>>,
}

fn default_rotate_wait_minutes() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: String,
    #[serde(default)]
    pub app_ver: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default, rename = "files")]
    pub logfiles: Vec<Logfile>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.stream_name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.is_empty() {
            return Err(ConfigError::Invalid("app must be set".into()));
        }

        for stream in &self.streams {
            for attr in &stream.record_format {
                attr.validate_timestamp_formats()?;
            }
            if stream.kind == SinkType::Http && stream.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream {}: http sink requires url",
                    stream.stream_name
                )));
            }
        }

        for logfile in &self.logfiles {
            let label = if logfile.name.is_empty() {
                &logfile.filename
            } else {
                &logfile.name
            };

            if logfile.filename.is_empty() == logfile.directory.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "logfile {}: exactly one of file or directory must be set",
                    label
                )));
            }

            if self.stream(&logfile.stream_name).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "logfile {}: stream {} not declared",
                    label, logfile.stream_name
                )));
            }

            if logfile.parse_mode == ParseMode::Regex {
                if logfile.line_regex.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "logfile {}: regex parse mode requires line_regex",
                        label
                    )));
                }
                Regex::new(&logfile.line_regex).map_err(|e| {
                    ConfigError::Invalid(format!("logfile {}: invalid line_regex: {}", label, e))
                })?;
            }

            if logfile.parse_mode == ParseMode::Csv && logfile.fields_order.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "logfile {}: csv parse mode requires fields_order",
                    label
                )));
            }

            if logfile.parse_mode == ParseMode::Plugin && logfile.parser_plugin.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "logfile {}: plugin parse mode requires parser_plugin",
                    label
                )));
            }

            if !logfile.front_split_regex.is_empty() {
                Regex::new(&logfile.front_split_regex).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "logfile {}: invalid front_split_regex: {}",
                        label, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

impl Attribute {
    /// Timestamp attributes either pass through (both formats empty) or
    /// re-render (both present).
    fn validate_timestamp_formats(&self) -> Result<(), ConfigError> {
        if self.kind != AttrKind::Timestamp {
            return Ok(());
        }
        match (self.source_ts_fmt.is_empty(), self.dest_ts_fmt.is_empty()) {
            (true, true) | (false, false) => Ok(()),
            (true, false) => Err(ConfigError::Invalid(format!(
                "attribute {}: destination timestamp format set without source format",
                self.key
            ))),
            (false, true) => Err(ConfigError::Invalid(format!(
                "attribute {}: source timestamp format set without destination format",
                self.key
            ))),
        }
    }
}

/// Parse sink/parser options of the form `key: value`.
pub fn parse_options(options: &[String]) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for option in options {
        if let Some((key, value)) = option.split_once(':') {
            props.insert(key.to_string(), value.trim().to_string());
        }
    }
    props
}
