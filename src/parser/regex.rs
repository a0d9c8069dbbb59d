// SPDX-License-Identifier: Apache-2.0

use regex::Regex;

use super::{LineParser, ParseError, Seed, canonicalize, cleanup_pairs, cleanup_spaces};
use crate::config::RecordSchema;
use crate::record::Attributes;

/// Extracts attributes via named capture groups; each group name becomes an
/// attribute key. A non-matching line is a parse error.
pub struct RegexParser {
    seed: Seed,
    regex: Regex,
    group_names: Vec<String>,
}

impl RegexParser {
    pub fn new(seed: Seed, pattern: &str) -> Result<Self, String> {
        let regex = Regex::new(pattern).map_err(|e| format!("invalid line_regex: {}", e))?;

        let group_names: Vec<String> = regex
            .capture_names()
            .skip(1) // index 0 is the full match
            .flatten()
            .map(|s| s.to_string())
            .collect();

        if group_names.is_empty() {
            return Err("line_regex must contain at least one named capture group".to_string());
        }

        Ok(Self {
            seed,
            regex,
            group_names,
        })
    }

    /// Blank the matched capture spans out of the line, then strip leftover
    /// empty pairs and runs of spaces. What remains is the unstructured rest
    /// of the line, kept as `log_line`.
    fn residual_log_line(&self, line: &str, captures: Option<&regex::Captures>) -> String {
        let mut bytes = line.as_bytes().to_vec();
        if let Some(caps) = captures {
            for name in &self.group_names {
                if let Some(m) = caps.name(name) {
                    bytes[m.start()..m.end()].fill(b' ');
                }
            }
        }
        let blanked = String::from_utf8_lossy(&bytes);
        cleanup_pairs(&cleanup_spaces(&blanked)).trim().to_string()
    }
}

impl LineParser for RegexParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let caps = match self.regex.captures(line) {
            Some(caps) => caps,
            None => return Err(ParseError::NotMatched),
        };

        let mut result = self.defaults();
        for name in &self.group_names {
            if let Some(m) = caps.name(name) {
                result.insert(name.clone(), canonicalize(m.as_str()));
            }
        }

        result.insert(
            "log_line".to_string(),
            self.residual_log_line(line, Some(&caps)),
        );

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
    use crate::NULL_SENTINEL;
    use crate::parser::test_support::test_seed;

    const ACCESS_LOG_REGEX: &str = r#"^(?P<remote_address>[^ ]*) \- (?P<remote_user>[^ ]*) \[(?P<event_datetime>[^\]]*)\] "[^"]*" (?P<log_level>[\d]*) (?P<response_bytes>[-\d]*) "(?P<http_referer>[^"]*)" "(?P<user_agent>[^"]*)"\s?(?P<response_s>[-\d\.]+)?"#;

    #[test]
    fn parses_access_log_line() {
        let parser = RegexParser::new(test_seed("test-input"), ACCESS_LOG_REGEX).unwrap();

        let line = r#"172.28.251.156 - - [04/May/2016:13:54:21 +0000] "GET /x HTTP/1.1" 200 3311 "-" "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0) like Gecko" 0.123"#;
        let attrs = parser.parse(line).unwrap();

        assert_eq!(attrs["remote_address"], "172.28.251.156");
        assert_eq!(attrs["event_datetime"], "04/May/2016:13:54:21 +0000");
        assert_eq!(attrs["log_level"], "200");
        assert_eq!(attrs["response_bytes"], "3311");
        assert_eq!(attrs["response_s"], "0.123");
        // "-" referer canonicalizes to NULL
        assert_eq!(attrs["http_referer"], NULL_SENTINEL);
        assert!(attrs["user_agent"].contains("Trident/7.0"));
        // captured spans blanked out of the residual line
        assert!(!attrs["log_line"].contains("172.28.251.156"));
        assert!(attrs["log_line"].contains("GET /x HTTP/1.1"));
    }

    #[test]
    fn non_matching_line_is_error() {
        let parser = RegexParser::new(test_seed("f"), r"^(?P<key>\w+)=(?P<value>\w+)$").unwrap();
        assert!(matches!(
            parser.parse("no delimiter here"),
            Err(ParseError::NotMatched)
        ));
    }

    #[test]
    fn requires_named_groups() {
        assert!(RegexParser::new(test_seed("f"), r"^(\w+)$").is_err());
    }

    #[test]
    fn unmatched_optional_group_keeps_default() {
        let parser =
            RegexParser::new(test_seed("f"), r"^(?P<log_level>\w+)( (?P<user_tag>\w+))?$").unwrap();
        let attrs = parser.parse("INFO").unwrap();
        assert_eq!(attrs["log_level"], "INFO");
        assert_eq!(attrs["user_tag"], NULL_SENTINEL);
    }
}
