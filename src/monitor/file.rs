// SPDX-License-Identifier: Apache-2.0

//! Per-file monitor: runs one tailer + parser + assembler and routes the
//! resulting records to the file's declared sink.
//!
//! Lifecycle: Opening -> Fast-Forward -> Live -> Draining -> Closed. In
//! fast-forward, records at or before the persisted cursor are discarded;
//! the first record past it switches the monitor to live. Draining flushes
//! the multi-line buffer but does not wait on the sink; sinks are drained by
//! the top-level orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::MonitorError;
use crate::assemble::Assembler;
use crate::bounded_channel::BoundedSender;
use crate::config::Logfile;
use crate::context::AppContext;
use crate::cursor::CursorUpdate;
use crate::parser::{self, LineParser};
use crate::record::Record;
use crate::streamer::StreamerHandle;
use crate::tail::{TailConfig, Tailer};

/// Upper bound on the multi-line buffer (VARCHAR(MAX) downstream).
const MAX_BUFFERED_LINE: usize = 65535;

const BUFFER_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

pub struct FileMonitor {
    logfile: Logfile,
    ctx: Arc<AppContext>,
    stream: StreamerHandle,
    cursor_tx: BoundedSender<CursorUpdate>,
}

impl FileMonitor {
    /// Resolve the declared stream and parser. Fails immediately when the
    /// stream name is unknown.
    pub fn new(
        logfile: Logfile,
        ctx: Arc<AppContext>,
        streams: &HashMap<String, StreamerHandle>,
        cursor_tx: BoundedSender<CursorUpdate>,
    ) -> Result<Self, MonitorError> {
        let stream = streams
            .get(&logfile.stream_name)
            .cloned()
            .ok_or_else(|| MonitorError::StreamNotFound {
                stream: logfile.stream_name.clone(),
                file: logfile.filename.clone(),
            })?;

        Ok(Self {
            logfile,
            ctx,
            stream,
            cursor_tx,
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), MonitorError> {
        let file = self.logfile.filename.clone();
        let stream_name = self.logfile.stream_name.clone();
        info!(file = %file, stream = %stream_name, "monitoring start");

        let parser = parser::build(
            &self.logfile,
            self.ctx.clone(),
            self.stream.schema().clone(),
        )?;

        let mut tail_config = TailConfig::new(&self.logfile.filename);
        tail_config.follow = self.ctx.follow;
        tail_config.retry_open = self.logfile.retry_file_open;
        tail_config.seek_to_end = self.logfile.skip_to_end;
        tail_config.rotate_wait = Duration::from_secs(60 * self.logfile.rotate_wait_minutes);
        if !self.logfile.front_split_regex.is_empty() {
            let delim = regex::bytes::Regex::new(&self.logfile.front_split_regex)
                .map_err(|e| MonitorError::FrontSplit(e.to_string()))?;
            tail_config.front_split = Some(delim);
        }

        let mut tailer = Tailer::start(tail_config, &cancel);

        let assembler = Assembler::new(
            self.ctx.clone(),
            &self.logfile.filename,
            &self.logfile.time_format,
            self.cursor_tx.clone(),
        );

        let mut fast_forward = self.logfile.last_event_time.is_some();
        if let Some(cursor) = self.logfile.last_event_time {
            warn!(file = %file, cursor = %cursor, "found cached time of last scan");
        }

        let mut skip_header = self.logfile.skip_header_line;
        let mut string_buffer = String::new();
        let mut flush_tick = tokio::time::interval(BUFFER_FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_tick.reset();

        let mut lines: u64 = 0;
        let mut streamed: u64 = 0;

        loop {
            select! {
                _ = cancel.cancelled() => break,

                _ = flush_tick.tick() => {
                    if !string_buffer.is_empty() {
                        info!(file = %file, "flushing buffered lines");
                        self.flush_buffer(parser.as_ref(), &mut string_buffer).await;
                    }
                }

                line = tailer.next_line() => {
                    let line = match line {
                        Some(line) => line,
                        None => break,
                    };

                    if skip_header {
                        skip_header = false;
                        continue;
                    }

                    lines += 1;

                    let (record, event_time) = assembler.assemble(parser.as_ref(), &line);

                    if fast_forward {
                        // While resuming, only records with a timestamp past
                        // the cursor count.
                        let cursor = self.logfile.last_event_time.unwrap();
                        match event_time {
                            None => continue,
                            Some(ts) if ts <= cursor => continue,
                            Some(_) => {}
                        }
                    }

                    if let Some(ts) = event_time {
                        if ts < self.ctx.time_threshold {
                            continue;
                        }
                    }

                    if self.logfile.buffer_multi_lines {
                        if record.is_none() && string_buffer.len() < MAX_BUFFERED_LINE {
                            string_buffer.push_str(&line);
                            string_buffer.push_str("\\n");
                            continue;
                        }
                    } else if record.is_none() {
                        error!(file = %file, line_number = lines, "unable to parse line: {}", line);
                        continue;
                    }

                    fast_forward = false;

                    if self.logfile.buffer_multi_lines
                        && ((record.is_some() && !string_buffer.is_empty())
                            || string_buffer.len() >= MAX_BUFFERED_LINE)
                    {
                        self.flush_buffer(parser.as_ref(), &mut string_buffer).await;
                        if record.is_none() {
                            continue;
                        }
                    }

                    let record = match record {
                        Some(record) => record,
                        None => continue,
                    };

                    if let Err(e) = self.stream.stream(record).await {
                        error!(file = %file, stream = %stream_name, error = %e, "error streaming");
                    }
                    streamed += 1;
                }
            }
        }

        // Draining: flush buffered content, but do not wait on the sink.
        if !string_buffer.is_empty() {
            self.flush_buffer(parser.as_ref(), &mut string_buffer).await;
        }
        tailer.close();

        info!(file = %file, stream = %stream_name, streamed, lines, "monitoring stop");
        Ok(())
    }

    /// Ship accumulated unparsable lines as one synthetic record whose
    /// log_line carries the buffered text.
    async fn flush_buffer(&self, parser: &dyn LineParser, buffer: &mut String) {
        let data = std::mem::take(buffer);
        let mut attrs = parser.defaults();
        attrs.insert("log_line".to_string(), data.clone());

        let record = Record::new(data, parser.schema().clone(), attrs);
        if let Err(e) = self.stream.stream(record).await {
            error!(file = %self.logfile.filename, error = %e, "error streaming buffered record");
        }
    }
}
