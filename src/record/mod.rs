// SPDX-License-Identifier: Apache-2.0

//! The unit of work flowing from parsers to sinks.

pub mod csv;

use crate::config::RecordSchema;
use md5::{Digest, Md5};
use std::collections::HashMap;

/// String-keyed attribute map produced by parsers. Missing values carry the
/// `\N` sentinel.
pub type Attributes = HashMap<String, String>;

/// A parsed log line plus the schema of the stream it is bound for. Owned by
/// exactly one pipeline stage at a time; handed to the sink queue by move.
#[derive(Debug, Clone)]
pub struct Record {
    raw_line: String,
    schema: RecordSchema,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(raw_line: String, schema: RecordSchema, attributes: Attributes) -> Self {
        Self {
            raw_line,
            schema,
            attributes,
        }
    }

    pub fn raw_line(&self) -> &str {
        &self.raw_line
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// MD5 of the raw line. Per-record hashes are chained into the HTTP
    /// ingest sink's transaction id.
    pub fn hash(&self) -> [u8; 16] {
        let digest = Md5::digest(self.raw_line.as_bytes());
        digest.into()
    }

    /// Serialize this record as one CSV row in schema order.
    pub fn to_csv(&self) -> String {
        csv::record_to_csv(self)
    }
}
