// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests: tailer -> parser -> assembler -> sink, driven
//! through real files on disk and the local CSV sink.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pushr::config::{Config, RecordSchema};
use pushr::context::AppContext;
use pushr::cursor;
use pushr::monitor::FileMonitor;
use pushr::record::csv::split_record;
use pushr::streamer::StreamerHandle;
use pushr::streamer::csv_file::CsvFileSink;

const SETTLE: Duration = Duration::from_millis(400);

// Column positions in the default record format.
const COL_EVENT_DATETIME: usize = 3;
const COL_LOG_LEVEL: usize = 6;
const COL_USER_TAG: usize = 8;
const COL_REMOTE_ADDRESS: usize = 9;
const COL_RESPONSE_MS: usize = 11;
const COL_OS: usize = 13;
const COL_OS_VER: usize = 14;
const COL_BROWSER: usize = 15;
const COL_BROWSER_VER: usize = 16;
const COL_LOG_LINE: usize = 19;

fn test_ctx() -> Arc<AppContext> {
    Arc::new(AppContext::new(
        "go-testing".into(),
        "1.0".into(),
        "tester-box".into(),
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
        true,
    ))
}

fn load_config(yaml: &str) -> Config {
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    config
}

/// Spin up a CSV sink for the config's single stream; returns the handle,
/// the sink task, and the output path.
fn csv_sink(
    config: &Config,
    dir: &TempDir,
) -> (
    StreamerHandle,
    tokio::task::JoinHandle<()>,
    std::path::PathBuf,
) {
    let stream = &config.streams[0];
    let schema: RecordSchema = Arc::new(stream.record_format.clone());
    let out_path = dir.path().join("out.csv");

    let (handle, sink) =
        CsvFileSink::build_with_path(stream, schema, out_path.to_str().unwrap()).unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move {
        sink.start(cancel).await.unwrap();
    });

    (handle, task, out_path)
}

async fn run_monitor_until_settled(
    config: &Config,
    handle: StreamerHandle,
    ctx: Arc<AppContext>,
    settle: Duration,
) {
    let logfile = config.logfiles[0].clone();
    run_logfile_until_settled(logfile, handle, ctx, settle).await;
}

async fn run_logfile_until_settled(
    logfile: pushr::config::Logfile,
    handle: StreamerHandle,
    ctx: Arc<AppContext>,
    settle: Duration,
) {
    let streams = HashMap::from([(logfile.stream_name.clone(), handle)]);
    let (cursor_tx, _cursor_rx) = cursor::update_channel();

    let monitor = FileMonitor::new(logfile, ctx, &streams, cursor_tx).unwrap();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(monitor.run(cancel.clone()));

    tokio::time::sleep(settle).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
}

fn read_rows(path: &std::path::Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| split_record(line).unwrap())
        .collect()
}

#[tokio::test]
async fn regex_access_log_end_to_end() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("access.log");
    std::fs::write(
        &log_path,
        r#"172.28.251.156 - - [04/May/2016:13:54:21 +0000] "GET /x HTTP/1.1" 200 3311 "-" "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0) like Gecko" 0.123"#
            .to_string()
            + "\n",
    )
    .unwrap();

    let config = load_config(&format!(
        r#"
app: go-testing
app_ver: "1.0"
hostname: tester-box
streams:
  - stream_name: main
    type: csv
    name: out
files:
  - file: {}
    stream: main
    parse_mode: regex
    time_format: "%d/%b/%Y:%H:%M:%S %z"
    retry_file_open: true
    line_regex: '^(?P<remote_address>[^ ]*) \- (?P<remote_user>[^ ]*) \[(?P<event_datetime>[^\]]*)\] "[^"]*" (?P<log_level>[\d]*) (?P<response_bytes>[-\d]*) "(?P<http_referer>[^"]*)" "(?P<user_agent>[^"]*)"\s?(?P<response_s>[-\d\.]+)?'
"#,
        log_path.display()
    ));

    let (handle, sink_task, out_path) = csv_sink(&config, &dir);
    run_monitor_until_settled(&config, handle, test_ctx(), SETTLE).await;
    sink_task.await.unwrap();

    let rows = read_rows(&out_path);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];

    assert_eq!(row[COL_EVENT_DATETIME], "2016-05-04T13:54:21.000Z");
    assert_eq!(row[COL_LOG_LEVEL], "200");
    assert_eq!(row[COL_REMOTE_ADDRESS], "172.28.251.156");
    assert_eq!(row[COL_RESPONSE_MS], "123");
    assert_eq!(row[COL_BROWSER], "ie");
    assert_eq!(row[COL_BROWSER_VER], "11.0");
    assert_eq!(row[COL_OS], "windows");
    assert_eq!(row[COL_OS_VER], "6.1");
}

#[tokio::test]
async fn csv_epochmillisecs_event_time() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("events.csv");
    std::fs::write(
        &log_path,
        "go-testing,1.0,\\N,1463528404955,\\N,\\N,ERROR,DEV-1,user-1,52.39.163.198,\\N,\\N,\"iPhone8,2\",\\N,\\N,\\N,\\N,\\N,\\N,trailing message\n",
    )
    .unwrap();

    let config = load_config(&format!(
        r#"
app: go-testing
streams:
  - stream_name: main
    type: csv
    name: out
files:
  - file: {}
    stream: main
    parse_mode: csv
    time_format: epochmillisecs
    retry_file_open: true
    fields_order: [app, app_ver, "", event_datetime, "", "", log_level, device_tag, user_tag, remote_address, "", "", os, "", "", "", "", "", "", ""]
"#,
        log_path.display()
    ));

    let (handle, sink_task, out_path) = csv_sink(&config, &dir);
    run_monitor_until_settled(&config, handle, test_ctx(), SETTLE).await;
    sink_task.await.unwrap();

    let rows = read_rows(&out_path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][COL_EVENT_DATETIME], "2016-05-17T23:40:04.955Z");
    assert_eq!(rows[0][COL_LOG_LEVEL], "ERROR");
}

#[tokio::test]
async fn json_field_mapping_and_residual_log_line() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("app.json.log");
    std::fs::write(
        &log_path,
        r#"{"timestamp":"2016-05-01T03:09:19.449Z","severity":"WARN","userId":"u1","remoteIp":"1.2.3.4","platform":"iPhone","country":"mx"}"#
            .to_string()
            + "\n",
    )
    .unwrap();

    let config = load_config(&format!(
        r#"
app: go-testing
streams:
  - stream_name: main
    type: csv
    name: out
files:
  - file: {}
    stream: main
    parse_mode: json
    time_format: "%Y-%m-%dT%H:%M:%S%.3fZ"
    retry_file_open: true
    field_mappings:
      log_level: severity
      event_datetime: timestamp
      remote_address: remoteIp
      user_tag: userId
      os: platform
      country: country
"#,
        log_path.display()
    ));

    let (handle, sink_task, out_path) = csv_sink(&config, &dir);
    run_monitor_until_settled(&config, handle, test_ctx(), SETTLE).await;
    sink_task.await.unwrap();

    let rows = read_rows(&out_path);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row[COL_EVENT_DATETIME], "2016-05-01T03:09:19.449Z");
    assert_eq!(row[COL_LOG_LEVEL], "WARN");
    assert_eq!(row[COL_USER_TAG], "u1");
    assert_eq!(row[COL_REMOTE_ADDRESS], "1.2.3.4");
    // residual keys re-serialized, mapped keys consumed
    assert_eq!(row[COL_LOG_LINE], "{}");
}

#[tokio::test]
async fn rotation_no_loss_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("x.log");
    std::fs::write(
        &log_path,
        "{\"timestamp\":\"2016-05-04T00:00:01.000Z\",\"user_tag\":\"before-1\"}\n{\"timestamp\":\"2016-05-04T00:00:02.000Z\",\"user_tag\":\"before-2\"}\n",
    )
    .unwrap();

    let config = load_config(&format!(
        r#"
app: go-testing
streams:
  - stream_name: main
    type: csv
    name: out
files:
  - file: {}
    stream: main
    parse_mode: json_raw
    time_format: "%Y-%m-%dT%H:%M:%S%.3fZ"
    retry_file_open: true
"#,
        log_path.display()
    ));

    let (handle, sink_task, out_path) = csv_sink(&config, &dir);

    let logfile = config.logfiles[0].clone();
    let streams = HashMap::from([(logfile.stream_name.clone(), handle)]);
    let (cursor_tx, _cursor_rx) = cursor::update_channel();
    let monitor = FileMonitor::new(logfile, test_ctx(), &streams, cursor_tx).unwrap();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(monitor.run(cancel.clone()));

    tokio::time::sleep(SETTLE).await;

    // rotate: rename the live file, append one more line to the old inode,
    // then create a fresh file at the original path
    let rotated = dir.path().join("x.log.1");
    std::fs::rename(&log_path, &rotated).unwrap();
    let mut old = std::fs::OpenOptions::new().append(true).open(&rotated).unwrap();
    writeln!(
        old,
        "{{\"timestamp\":\"2016-05-04T00:00:03.000Z\",\"user_tag\":\"after-rename\"}}"
    )
    .unwrap();
    old.flush().unwrap();

    std::fs::write(
        &log_path,
        "{\"timestamp\":\"2016-05-04T00:00:04.000Z\",\"user_tag\":\"new-inode\"}\n",
    )
    .unwrap();

    // replacement tailer retries its open every five seconds
    tokio::time::sleep(Duration::from_secs(7)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
    sink_task.await.unwrap();

    let rows = read_rows(&out_path);
    let mut tags: Vec<String> = rows.iter().map(|r| r[COL_USER_TAG].clone()).collect();
    tags.sort();
    assert_eq!(
        tags,
        vec!["after-rename", "before-1", "before-2", "new-inode"]
    );
}

#[tokio::test]
async fn fast_forward_resumes_from_persisted_cursor() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("x.log");
    let state_path = dir.path().join("pushr.state");

    // cursor at T0 = 00:00:01
    std::fs::write(
        &state_path,
        format!("{},2016-05-04T00:00:01.000Z,1.0\n", log_path.display()),
    )
    .unwrap();

    // events at T0-1, T0, T0+1
    std::fs::write(
        &log_path,
        "{\"timestamp\":\"2016-05-04T00:00:00.000Z\",\"user_tag\":\"old\"}\n{\"timestamp\":\"2016-05-04T00:00:01.000Z\",\"user_tag\":\"at-cursor\"}\n{\"timestamp\":\"2016-05-04T00:00:02.000Z\",\"user_tag\":\"new\"}\n",
    )
    .unwrap();

    let config = load_config(&format!(
        r#"
app: go-testing
streams:
  - stream_name: main
    type: csv
    name: out
files:
  - file: {}
    stream: main
    parse_mode: json_raw
    time_format: "%Y-%m-%dT%H:%M:%S%.3fZ"
    retry_file_open: true
"#,
        log_path.display()
    ));

    let entries = cursor::load(&state_path);
    let mut logfile = config.logfiles[0].clone();
    logfile.last_event_time = entries[&log_path.display().to_string()].last_event_time;
    assert!(logfile.last_event_time.is_some());

    let (handle, sink_task, out_path) = csv_sink(&config, &dir);
    run_logfile_until_settled(logfile, handle, test_ctx(), SETTLE).await;
    sink_task.await.unwrap();

    let rows = read_rows(&out_path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][COL_USER_TAG], "new");
}
