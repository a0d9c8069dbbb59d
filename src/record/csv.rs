// SPDX-License-Identifier: Apache-2.0

//! CSV encoding of records (RFC 4180 quoting, comma delimiter, LF
//! terminator) and the per-attribute type coercion that precedes it.

use crate::NULL_SENTINEL;
use crate::config::{AttrKind, Attribute};
use crate::record::Record;
use tracing::warn;
use uuid::Uuid;

/// Values canonicalized to the NULL sentinel.
const NULL_VALUES: [&str; 6] = ["", " ", "-", "null", "none", "empty"];

pub fn is_null(value: &str) -> bool {
    NULL_VALUES.contains(&value)
}

/// Truncate to `length` code points when `length > 0`.
pub fn truncate_chars(s: &str, length: usize) -> String {
    if length > 0 && s.chars().count() > length {
        s.chars().take(length).collect()
    } else {
        s.to_string()
    }
}

/// Serialize one record in schema order. Each attribute is coerced to its
/// declared type; values that fail coercion degrade to `\N`.
pub fn record_to_csv(record: &Record) -> String {
    let mut fields = Vec::with_capacity(record.schema().len());

    for attr in record.schema().iter() {
        fields.push(convert_field(record, attr));
    }

    write_record(&fields)
}

fn convert_field(record: &Record, attr: &Attribute) -> String {
    let val = record
        .attributes
        .get(&attr.key)
        .map(String::as_str)
        .unwrap_or("");

    if attr.key == "_uuid" {
        return Uuid::new_v4().to_string();
    }

    if val == NULL_SENTINEL {
        return NULL_SENTINEL.to_string();
    }

    match attr.kind {
        AttrKind::String | AttrKind::Timestamp => {
            if is_null(val) {
                NULL_SENTINEL.to_string()
            } else {
                truncate_chars(val, attr.length).replace('\0', "")
            }
        }
        AttrKind::Integer => match val.parse::<i64>() {
            Ok(n) => n.to_string(),
            Err(_) => {
                warn!(value = val, "conversion to integer failed");
                NULL_SENTINEL.to_string()
            }
        },
        AttrKind::Float32 => match val.parse::<f32>() {
            Ok(f) => format_float(f as f64),
            Err(e) => {
                warn!(value = val, error = %e, "conversion to float32 failed");
                NULL_SENTINEL.to_string()
            }
        },
        AttrKind::Double => match val.parse::<f64>() {
            Ok(f) => format_float(f),
            Err(e) => {
                warn!(value = val, error = %e, "conversion to double failed");
                NULL_SENTINEL.to_string()
            }
        },
        AttrKind::Bool => match val.parse::<bool>() {
            Ok(b) => b.to_string(),
            Err(_) => {
                warn!(value = val, "conversion to bool failed");
                NULL_SENTINEL.to_string()
            }
        },
    }
}

/// Minimal-digit, non-scientific float rendering.
fn format_float(f: f64) -> String {
    format!("{}", f)
}

/// Write one CSV record with RFC 4180 quoting and a LF terminator.
pub fn write_record(fields: &[String]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
        {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
    out
}

/// Split a single CSV record into its fields, honoring RFC 4180 quoting.
/// Used by the CSV parse mode and the cursor file reader.
pub fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
        } else {
            match c {
                '"' if field.is_empty() => in_quotes = true,
                ',' => {
                    fields.push(std::mem::take(&mut field));
                }
                '\r' | '\n' => break,
                _ => field.push(c),
            }
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }

    fields.push(field);
    Ok(fields)
}
