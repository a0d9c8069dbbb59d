// SPDX-License-Identifier: Apache-2.0

use super::{LineParser, ParseError, Seed, canonicalize, cleanup_pairs, cleanup_spaces};
use crate::config::RecordSchema;
use crate::record::Attributes;
use crate::record::csv::split_record;

/// Splits one CSV record and zips the values against the configured
/// `fields_order`. Positions with an empty field name, or names not present
/// in the schema, are appended to a reconstructed `log_line` instead.
pub struct CsvParser {
    seed: Seed,
    fields_order: Vec<String>,
}

impl CsvParser {
    pub fn new(seed: Seed, fields_order: Vec<String>) -> Self {
        Self { seed, fields_order }
    }
}

impl LineParser for CsvParser {
    fn parse(&self, line: &str) -> Result<Attributes, ParseError> {
        let values = split_record(line).map_err(ParseError::Csv)?;

        if values.len() != self.fields_order.len() {
            return Err(ParseError::FieldsOrderMismatch {
                expected: self.fields_order.len(),
                got: values.len(),
            });
        }

        let mut result = self.defaults();
        let mut residual = String::new();

        for (field, value) in self.fields_order.iter().zip(values.iter()) {
            let skip = field.is_empty() || !result.contains_key(field);
            if skip {
                residual.push_str(value);
                residual.push(' ');
            }
            if !field.is_empty() {
                result.insert(field.clone(), canonicalize(value));
            }
        }

        let log_line = cleanup_spaces(&cleanup_pairs(&residual));
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
