// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use super::{LineParser, ParseError, Seed, canonicalize};
use crate::config::RecordSchema;
use crate::record::Attributes;

const DEFAULT_DATE_PREFIX_LEN: usize = 24;
const DEFAULT_KV_REGEX: &str = r#"([^=]*)="([^"]*)"\s?"#;

/// How unmapped key/value pairs are folded into `log_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLineFormat {
    KeyValue,
    Json,
}

/// Parses lines of the form `<fixed-width date> key="value" key="value" ...`.
/// The date prefix is skipped by byte length; the key/value regex is applied
/// repeatedly to the remainder.
pub struct DateKvParser {
    seed: Seed,
    field_mappings: HashMap<String, String>,
    kv_regex: Regex,
    date_prefix_len: usize,
    log_line_format: LogLineFormat,
}

impl DateKvParser {
    pub fn new(
        seed: Seed,
        field_mappings: HashMap<String, String>,
        parser_options: &[String],
    ) -> Self {
        let options = crate::config::parse_options(parser_options);

        let log_line_format = match options.get("log_line_format").map(String::as_str) {
            Some("json") => LogLineFormat::Json,
            _ => LogLineFormat::KeyValue,
        };

        let date_prefix_len = options
            .get("date_prefix_length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DATE_PREFIX_LEN);

        let kv_regex = options
            .get("kv_regex")
            .and_then(|p| Regex::new(p).ok())
            .unwrap_or_else(|| Regex::new(DEFAULT_KV_REGEX).unwrap());

        Self {
            seed,
            field_mappings,
            kv_regex,
            date_prefix_len,
            log_line_format,
        }
    }
}

impl LineParser for DateKvParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let rest = line.get(self.date_prefix_len..).ok_or(ParseError::TooShort)?;

        // BTreeMap keeps the reconstructed log_line deterministic.
        let mut matches: BTreeMap<&str, &str> = BTreeMap::new();
        for caps in self.kv_regex.captures_iter(rest) {
            if let (Some(k), Some(v)) = (caps.get(1), caps.get(2)) {
                matches.insert(k.as_str(), v.as_str());
            }
        }

        let mut result = self.defaults();
        for (canonical, source) in &self.field_mappings {
            if let Some(value) = matches.remove(source.as_str()) {
                result.insert(canonical.clone(), canonicalize(value));
            }
        }

        let log_line = match self.log_line_format {
            LogLineFormat::KeyValue => {
                let mut s = String::new();
                for (k, v) in &matches {
                    let _ = write!(s, " {}={}", k, v);
                }
                s
            }
            LogLineFormat::Json => serde_json::to_string(&matches).unwrap_or_default(),
        };
        result.insert("log_line".to_string(), log_line.trim().to_string());

        Ok(result)
    }

    fn defaults(&self) -> Attributes {
        self.seed.defaults()
    }

    fn schema(&self) -> &RecordSchema {
        self.seed.schema()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::test_support::test_seed;

    const LINE: &str = r#"2016/05/18 19:30:54.267 level="WARN" user="u1" extra="e1" more="m1""#;

    fn mappings() -> HashMap<String, String> {
        [("log_level", "level"), ("user_tag", "user")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn maps_keys_after_date_prefix() {
        let seed = test_seed("f").without_event_datetime();
        let parser = DateKvParser::new(seed, mappings(), &[]);
        let attrs = parser.parse(LINE).unwrap();

        assert_eq!(attrs["log_level"], "WARN");
        assert_eq!(attrs["user_tag"], "u1");
        assert_eq!(attrs["log_line"], "extra=e1 more=m1");
        // date_kv does not pre-seed event_datetime
        assert!(!attrs.contains_key("event_datetime") || attrs["event_datetime"] == "\\N");
    }

    #[test]
    fn json_log_line_format() {
        let seed = test_seed("f").without_event_datetime();
        let parser = DateKvParser::new(
            seed,
            mappings(),
            &["log_line_format: json".to_string()],
        );
        let attrs = parser.parse(LINE).unwrap();
        assert_eq!(attrs["log_line"], r#"{"extra":"e1","more":"m1"}"#);
    }

    #[test]
    fn short_line_is_error() {
        let parser = DateKvParser::new(test_seed("f").without_event_datetime(), mappings(), &[]);
        assert!(matches!(parser.parse("short"), Err(ParseError::TooShort)));
    }

    #[test]
    fn custom_date_prefix_length() {
        let parser = DateKvParser::new(
            test_seed("f").without_event_datetime(),
            mappings(),
            &["date_prefix_length: 0".to_string()],
        );
        let attrs = parser.parse(r#"level="INFO" "#).unwrap();
        assert_eq!(attrs["log_level"], "INFO");
    }
}
