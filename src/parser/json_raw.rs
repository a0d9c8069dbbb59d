// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use super::{LineParser, ParseError, Seed};
use crate::config::RecordSchema;
use crate::record::Attributes;

/// Parses each line as a JSON object and lifts every string-valued top-level
/// key into an attribute verbatim. The event time comes from a `timestamp`
/// key; `log_line` carries the trimmed original line.
pub struct JsonRawParser {
    seed: Seed,
}

impl JsonRawParser {
    pub fn new(seed: Seed) -> Self {
        Self { seed }
    }
}

impl LineParser for JsonRawParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let matches: serde_json::Map<String, Value> = serde_json::from_str(line)?;

        let mut result = self.defaults();
        for (key, value) in matches {
            if let Value::String(s) = value {
                result.insert(key, s);
            }
        }

        if let Some(ts) = result.get("timestamp").cloned() {
            result.insert("event_datetime".to_string(), ts);
        }
        result.insert("log_line".to_string(), line.trim().to_string());

        Ok(result)
    }

    fn defaults(&self) -> Attributes {
        self.seed.defaults()
    }

    fn schema(&self) -> &RecordSchema {
        self.seed.schema()
    }
}
