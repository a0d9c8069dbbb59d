// SPDX-License-Identifier: Apache-2.0

pub mod assemble;
pub mod bounded_channel;
pub mod config;
pub mod context;
pub mod cursor;
pub mod monitor;
pub mod parser;
pub mod record;
pub mod streamer;
pub mod tail;

/// ISO-8601 with millisecond precision, UTC. Every timestamp that leaves the
/// pipeline is rendered with this layout.
pub const ISO_8601: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// The two-character NULL sentinel written in place of a missing value.
pub const NULL_SENTINEL: &str = "\\N";
