// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use std::collections::HashMap;

use super::{LineParser, ParseError, Seed, canonicalize};
use crate::config::RecordSchema;
use crate::record::Attributes;

/// Parses each line as a JSON object. Keys named in `field_mappings`
/// (canonical -> source) are copied into their canonical attribute; whatever
/// is left over is re-serialized into `log_line`.
pub struct JsonParser {
    seed: Seed,
    field_mappings: HashMap<String, String>,
}

impl JsonParser {
    pub fn new(seed: Seed, field_mappings: HashMap<String, String>) -> Self {
        Self {
            seed,
            field_mappings,
        }
    }
}

impl LineParser for JsonParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let mut matches: serde_json::Map<String, Value> = serde_json::from_str(line)?;
        let mut result = self.defaults();

        for (canonical, source) in &self.field_mappings {
            if let Some(Value::String(value)) = matches.get(source) {
                result.insert(canonical.clone(), canonicalize(value));
            }
            matches.remove(source);
        }

        let log_line = serde_json::to_string(&matches).unwrap_or_else(|_| line.to_string());
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
