// SPDX-License-Identifier: Apache-2.0

//! Line parsers.
//!
//! Each variant turns one raw line into a string-keyed attribute map seeded
//! with the stream schema's keys. Selection happens per logfile via
//! [`build`]; the `plugin` mode resolves against a fixed build-time registry.

pub mod csv;
pub mod date_kv;
pub mod json;
pub mod json_raw;
pub mod regex;
pub mod registry;

use crate::ISO_8601;
use crate::NULL_SENTINEL;
use crate::config::{ConfigError, Logfile, ParseMode, RecordSchema};
use crate::context::AppContext;
use crate::record::Attributes;
use ::regex::Regex;
use chrono::Utc;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line did not match pattern")]
    NotMatched,

    #[error("csv fields and fields_order do not match: got {got}, expected {expected}")]
    FieldsOrderMismatch { expected: usize, got: usize },

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid csv: {0}")]
    Csv(String),

    #[error("line shorter than date prefix")]
    TooShort,
}

pub trait LineParser: Send + Sync {
    /// Extract attributes from one line. Errors are per-line and never fatal.
    fn parse(&self, line: &str) -> Result<Attributes, ParseError>;

    /// The attribute map every parse starts from: schema keys seeded with the
    /// NULL sentinel plus host/app/file identity and the ingest timestamp.
    fn defaults(&self) -> Attributes;

    fn schema(&self) -> &RecordSchema;
}

/// Shared seed state for parser defaults.
#[derive(Clone)]
pub struct Seed {
    ctx: Arc<AppContext>,
    filename: String,
    schema: RecordSchema,
    /// All variants but date_kv also pre-seed event_datetime.
    seed_event_datetime: bool,
}

impl Seed {
    pub fn new(ctx: Arc<AppContext>, filename: &str, schema: RecordSchema) -> Self {
        Self {
            ctx,
            filename: filename.to_string(),
            schema,
            seed_event_datetime: true,
        }
    }

    pub fn without_event_datetime(mut self) -> Self {
        self.seed_event_datetime = false;
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn defaults(&self) -> Attributes {
        let mut d = Attributes::with_capacity(self.schema.len() + 6);
        for attr in self.schema.iter() {
            d.insert(attr.key.clone(), NULL_SENTINEL.to_string());
        }

        let ingest = Utc::now().format(ISO_8601).to_string();
        d.insert("app".to_string(), self.ctx.app().to_string());
        d.insert("app_ver".to_string(), self.ctx.app_ver());
        d.insert("filename".to_string(), self.filename.clone());
        d.insert("hostname".to_string(), self.ctx.hostname().to_string());
        if self.seed_event_datetime {
            d.insert("event_datetime".to_string(), ingest.clone());
        }
        d.insert("ingest_datetime".to_string(), ingest);

        d
    }
}

/// Canonicalize empty-ish values to the NULL sentinel.
pub fn canonicalize(value: &str) -> String {
    if crate::record::csv::is_null(value) {
        NULL_SENTINEL.to_string()
    } else {
        value.to_string()
    }
}

static CLEANUP_PAIRS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\[\]|\(\)|- |""|\(ms\)|\\N)"#).unwrap());
static CLEANUP_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

/// Strip leftover empty pairs (`[]`, `()`, `""`, dangling `- `) from a
/// reconstructed log line.
pub fn cleanup_pairs(s: &str) -> String {
    CLEANUP_PAIRS.replace_all(s, "").into_owned()
}

/// Collapse runs of two or more spaces.
pub fn cleanup_spaces(s: &str) -> String {
    CLEANUP_SPACES.replace_all(s, "").into_owned()
}

/// Build the parser a logfile declares. Config validation has already
/// checked the per-mode requirements, so failures here are limited to
/// unknown plugin names.
pub fn build(
    logfile: &Logfile,
    ctx: Arc<AppContext>,
    schema: RecordSchema,
) -> Result<Box<dyn LineParser>, ConfigError> {
    let seed = Seed::new(ctx, &logfile.filename, schema);

    match logfile.parse_mode {
        ParseMode::Regex => {
            let parser = regex::RegexParser::new(seed, &logfile.line_regex).map_err(|e| {
                ConfigError::Invalid(format!("logfile {}: {}", logfile.filename, e))
            })?;
            Ok(Box::new(parser))
        }
        ParseMode::Json => Ok(Box::new(json::JsonParser::new(
            seed,
            logfile.field_mappings.clone(),
        ))),
        ParseMode::Csv => Ok(Box::new(csv::CsvParser::new(
            seed,
            logfile.fields_order.clone(),
        ))),
        ParseMode::JsonRaw => Ok(Box::new(json_raw::JsonRawParser::new(seed))),
        ParseMode::DateKv => Ok(Box::new(date_kv::DateKvParser::new(
            seed.without_event_datetime(),
            logfile.field_mappings.clone(),
            &logfile.parser_options,
        ))),
        ParseMode::Plugin => registry::resolve(&logfile.parser_plugin, seed, logfile),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_seed;

    #[test]
    fn defaults_seed_every_schema_key() {
        let seed = test_seed("test-input");
        let d = seed.defaults();
        for attr in seed.schema().iter() {
            assert!(d.contains_key(&attr.key), "missing {}", attr.key);
        }
        assert_eq!(d["app"], "go-testing");
        assert_eq!(d["app_ver"], "1.0");
        assert_eq!(d["hostname"], "tester-box");
        assert_eq!(d["filename"], "test-input");
        assert_eq!(d["event_datetime"], d["ingest_datetime"]);
        assert_eq!(d["log_level"], NULL_SENTINEL);
    }

    #[test]
    fn canonicalizes_null_values() {
        for v in ["", " ", "-", "null", "none", "empty"] {
            assert_eq!(canonicalize(v), NULL_SENTINEL);
        }
        assert_eq!(canonicalize("ok"), "ok");
    }

    #[test]
    fn cleanup_removes_empty_pairs_and_spaces() {
        assert_eq!(cleanup_spaces("a  b"), "ab");
        assert_eq!(cleanup_pairs("x [] y \"\" - z"), "x  y  z");
        assert_eq!(cleanup_pairs("keep (ms) \\N"), "keep  ");
    }
}
