// SPDX-License-Identifier: Apache-2.0

//! Fixed build-time registry for `plugin` parse mode.
//!
//! The original design loaded parser plugins from shared objects at runtime;
//! that is not portable, so plugin names resolve against this registry
//! instead. Unknown names fail configuration validation at startup.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{LineParser, ParseError, Seed};
use crate::config::{ConfigError, Logfile, RecordSchema};
use crate::record::Attributes;

pub fn resolve(
    name: &str,
    seed: Seed,
    logfile: &Logfile,
) -> Result<Box<dyn LineParser>, ConfigError> {
    match name {
        "variadic_kv" => Ok(Box::new(VariadicKvParser::new(
            seed.without_event_datetime(),
            &logfile.parser_options,
        ))),
        other => Err(ConfigError::Invalid(format!(
            "unknown parser plugin: {}",
            other
        ))),
    }
}

const DEFAULT_DATE_PREFIX_LEN: usize = 24;

/// Key/value parser for logs with arbitrary (variadic) key sets: every pair
/// after the date prefix lands in a JSON object stored in the `event`
/// attribute rather than in fixed columns.
struct VariadicKvParser {
    seed: Seed,
    kv_regex: Regex,
    date_prefix_len: usize,
}

impl VariadicKvParser {
    fn new(seed: Seed, parser_options: &[String]) -> Self {
        let options = crate::config::parse_options(parser_options);

        let date_prefix_len = options
            .get("date_prefix_length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DATE_PREFIX_LEN);

        Self {
            seed,
            kv_regex: Regex::new(r#"([^=]*)="([^"]*)"\s?"#).unwrap(),
            date_prefix_len,
        }
    }
}

impl LineParser for VariadicKvParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let rest = line.get(self.date_prefix_len..).ok_or(ParseError::TooShort)?;

        let mut matches: BTreeMap<String, Value> = BTreeMap::new();
        for caps in self.kv_regex.captures_iter(rest) {
            if let (Some(k), Some(v)) = (caps.get(1), caps.get(2)) {
                matches.insert(
                    k.as_str().trim().to_string(),
                    Value::String(v.as_str().to_string()),
                );
            }
        }

        let mut result = self.defaults();
        if let Ok(event) = serde_json::to_string(&matches) {
            result.insert("event".to_string(), event);
        }
        result.insert("log_line".to_string(), line.trim().to_string());

        Ok(result)
    }

    fn defaults(&self) -> Attributes {
        let mut d = self.seed.defaults();
        d.insert("event".to_string(), String::new());
        d
    }

    fn schema(&self) -> &RecordSchema {
        self.seed.schema()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::test_support::test_seed;

    #[test]
    fn unknown_plugin_is_config_error() {
        let logfile: Logfile = serde_yaml::from_str(
            "file: /tmp/x\nstream: s\nparse_mode: plugin\nparser_plugin: nope\n",
        )
        .unwrap();
        assert!(resolve("nope", test_seed("f"), &logfile).is_err());
    }

    #[test]
    fn variadic_kv_collects_pairs_into_event() {
        let logfile: Logfile = serde_yaml::from_str(
            "file: /tmp/x\nstream: s\nparse_mode: plugin\nparser_plugin: variadic_kv\n",
        )
        .unwrap();
        let parser = resolve("variadic_kv", test_seed("f"), &logfile).unwrap();

        let line = r#"2016/05/18 19:30:54.267 zeta="1" alpha="2""#;
        let attrs = parser.parse(line).unwrap();
        assert_eq!(attrs["event"], r#"{"alpha":"2","zeta":"1"}"#);
        assert_eq!(attrs["log_line"], line);
    }
}
