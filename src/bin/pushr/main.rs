// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::error::Error;
use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use chrono::Utc;
use pushr::ISO_8601;
use pushr::assemble;
use pushr::config::{Config, default_record_format};
use pushr::context::{AppContext, resolve_hostname};
use pushr::cursor::{self, CursorStore, CursorUpdate};
use pushr::monitor::{DirectoryMonitor, FileMonitor, dir::expand_glob};
use pushr::parser::{LineParser, Seed, regex::RegexParser};
use pushr::streamer::build_streamers;

#[derive(Debug, Parser)]
#[command(name = "pushr")]
#[command(bin_name = "pushr")]
#[command(version, about = "stream logs to remote sinks", long_about = None)]
struct Arguments {
    /// Config file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "PUSHR_CONFIG",
        default_value = "/etc/pushr.conf"
    )]
    config: String,

    /// Cursor state file
    #[arg(
        long,
        short = 's',
        env = "PUSHR_STATE",
        default_value = "/etc/pushr.state"
    )]
    state: String,

    /// Verbosity: 1 error, 2 warn, 3 info
    #[arg(long, env = "PUSHR_VERBOSE", default_value_t = 2)]
    verbose: u8,

    /// Keep following files after EOF
    #[arg(long, env = "PUSHR_FOLLOW", default_value_t = true, action = clap::ArgAction::Set)]
    follow: bool,

    /// Expand directory wildcards into their current files at startup
    #[arg(long = "scan-dir", env = "PUSHR_SCAN_DIR", default_value_t = true, action = clap::ArgAction::Set)]
    scan_dir: bool,

    /// Enable cloud-metadata lookups in the live server
    #[arg(long, env = "PUSHR_EC2HOST", default_value_t = false, action = clap::ArgAction::Set)]
    ec2host: bool,

    /// Ignore events older than this many days
    #[arg(long = "limit-days-ago", env = "PUSHR_LIMIT_DAYS_AGO", default_value_t = 10)]
    limit_days_ago: i64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the shipper
    Start,

    /// Escape a regex for embedding in a JSON/YAML config
    ConvertRegex,

    /// Parse a timestamp against a strftime format
    TestTimeFormat,

    /// Run a line regex against a sample line
    TestRegex,

    /// Load and validate the config, then print it
    ParseConfig,
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    match &args.command {
        None | Some(Commands::Start) => {
            setup_logging(args.verbose);
            match run_shipper(args) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "failed to run");
                    ExitCode::from(1)
                }
            }
        }
        Some(Commands::ConvertRegex) => convert_regex(),
        Some(Commands::TestTimeFormat) => test_time_format(),
        Some(Commands::TestRegex) => test_regex(),
        Some(Commands::ParseConfig) => {
            setup_logging(3);
            match Config::load(&args.config) {
                Ok(config) => {
                    println!("{:#?}", config);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(file = %args.config, error = %e, "invalid config");
                    ExitCode::from(1)
                }
            }
        }
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        1 => "error",
        2 => "warn",
        _ => "info",
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = Registry::default()
        .with(EnvFilter::new(format!("pushr={}", level)))
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();
}

#[tokio::main]
async fn run_shipper(args: Arguments) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::load(&args.config)?;

    let hostname = resolve_hostname(&config.hostname);
    let time_threshold = Utc::now() - chrono::Duration::days(args.limit_days_ago);
    info!(
        threshold = %time_threshold.format(ISO_8601),
        "ignoring everything earlier than threshold"
    );

    let ctx = Arc::new(AppContext::new(
        config.app.clone(),
        config.app_ver.clone(),
        hostname,
        time_threshold,
        args.follow,
    ));

    // Seed cursors from the state file and republish them into the store.
    let cursor_entries = cursor::load(&args.state);
    let (cursor_tx, cursor_rx) = cursor::update_channel();
    for entry in cursor_entries.values() {
        if !entry.app_version.is_empty() {
            ctx.set_app_ver(entry.app_version.clone());
        }
        if let Some(ts) = entry.last_event_time {
            let _ = cursor_tx.try_send(CursorUpdate {
                filename: entry.filename.clone(),
                last_event_time: ts,
            });
        }
    }

    //
    // Sinks
    //
    let mut sink_task_set = JoinSet::new();
    let sinks_cancel = CancellationToken::new();
    let streams = Arc::new(build_streamers(&config, &mut sink_task_set, &sinks_cancel)?);

    //
    // Cursor store
    //
    let cursor_cancel = CancellationToken::new();
    let mut cursor_task = tokio::spawn(
        CursorStore::new(args.state.clone(), ctx.clone(), cursor_rx).run(cursor_cancel.clone()),
    );

    //
    // File and directory monitors
    //
    let monitors_cancel = CancellationToken::new();
    let mut monitor_task_set: JoinSet<Result<(), pushr::monitor::MonitorError>> = JoinSet::new();

    for logfile in &config.logfiles {
        if !logfile.directory.is_empty() {
            let initial_files = if args.scan_dir {
                expand_glob(&logfile.directory)?
            } else {
                Vec::new()
            };

            let monitor = DirectoryMonitor::new(
                logfile.clone(),
                ctx.clone(),
                streams.clone(),
                cursor_tx.clone(),
                initial_files,
            );
            monitor_task_set.spawn(monitor.run(monitors_cancel.child_token()));
        } else {
            let mut logfile = logfile.clone();
            if let Some(entry) = cursor_entries.get(&logfile.filename) {
                logfile.last_event_time = entry.last_event_time;
            }

            let monitor = FileMonitor::new(logfile, ctx.clone(), &streams, cursor_tx.clone())?;
            monitor_task_set.spawn(monitor.run(monitors_cancel.child_token()));
        }
    }
    drop(cursor_tx);

    if monitor_task_set.is_empty() {
        warn!("no logfiles configured, nothing to do");
    }

    //
    // Run until a signal arrives, every monitor finishes (follow=false), or
    // the cursor store dies (its write failures are fatal).
    //
    let mut result: Result<(), Box<dyn Error + Send + Sync>> = Ok(());
    let mut cursor_consumed = false;
    select! {
        _ = signal_wait() => {
            info!("shutdown signal received");
        }
        res = wait_for_all_tasks(&mut monitor_task_set) => {
            match res {
                Ok(()) => info!("all monitors finished"),
                Err(e) => result = Err(e),
            }
        }
        res = &mut cursor_task => {
            cursor_consumed = true;
            match res {
                Ok(Err(e)) => result = Err(e.into()),
                Ok(Ok(())) => warn!("unexpected early exit of cursor store"),
                Err(e) => result = Err(e.into()),
            }
        }
    }

    // Step one: stop the monitors. Tailer cancellation completes within
    // five seconds; give them a little headroom to drain buffers.
    monitors_cancel.cancel();
    if let Err(e) =
        wait_for_tasks_with_deadline(&mut monitor_task_set, Instant::now() + Duration::from_secs(10))
            .await
    {
        warn!(error = %e, "monitors did not exit cleanly");
    }

    // Step two: close the sinks. Dropping the handles closes their queues;
    // each sink performs a final flush and waits out its in-flight uploads
    // (or their retry ceilings) before exiting.
    drop(streams);
    sinks_cancel.cancel();
    while let Some(res) = sink_task_set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "sink exited with error"),
            Err(e) => error!(error = %e, "failed to join sink task"),
        }
    }

    // Step three: final cursor write. Losing it would duplicate data on the
    // next start, so a failure here fails the process.
    if !cursor_consumed {
        cursor_cancel.cancel();
        match cursor_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(e.into()),
        }
    }

    result
}

async fn wait_for_all_tasks<E: std::fmt::Display + Send + 'static>(
    tasks: &mut JoinSet<Result<(), E>>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string().into()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn wait_for_tasks_with_deadline<E: std::fmt::Display + Send + 'static>(
    tasks: &mut JoinSet<Result<(), E>>,
    stop_at: Instant,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(v)) => match v {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "task exited with error"),
                Err(e) => error!(error = %e, "failed to join task"),
            },
        }
    }
    result
}

async fn signal_wait() {
    let mut sig_hup = sig(SignalKind::hangup());
    let mut sig_int = sig(SignalKind::interrupt());
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_quit = sig(SignalKind::quit());

    select! {
        _ = sig_hup.recv() => {},
        _ = sig_int.recv() => {},
        _ = sig_term.recv() => {},
        _ = sig_quit.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).unwrap()
}

fn read_prompt(prompt: &str) -> String {
    print!("{}", prompt);
    std::io::stdout().flush().unwrap();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).unwrap();
    line.trim_end_matches(['\n', '\r']).to_string()
}

fn convert_regex() -> ExitCode {
    let raw = read_prompt("Enter regex: ");
    match serde_json::to_string(&raw) {
        Ok(escaped) => {
            println!("\nInsert into config:\n{}", escaped);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::from(1)
        }
    }
}

fn test_time_format() -> ExitCode {
    let timestamp = read_prompt("Enter timestamp: ");
    let format = read_prompt("\nEnter time format: ");

    match assemble::parse_timestamp(&timestamp, &format) {
        Some(ts) => {
            println!("\nParsed time:\n{}", ts.format(ISO_8601));
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("ERROR: unable to parse {} with {}", timestamp, format);
            ExitCode::from(1)
        }
    }
}

fn test_regex() -> ExitCode {
    let line = read_prompt("Enter string: ");
    let pattern = read_prompt("\nEnter regular expression: ");

    let ctx = Arc::new(AppContext::new(
        String::new(),
        String::new(),
        String::new(),
        Utc::now(),
        false,
    ));
    let seed = Seed::new(ctx, "", Arc::new(default_record_format()));

    let parser = match RegexParser::new(seed, &pattern) {
        Ok(parser) => parser,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    println!("-------");
    let mut result: HashMap<String, String> = match parser.parse(&line) {
        Ok(attrs) => {
            println!("Matches...");
            attrs.into_iter().collect()
        }
        Err(_) => {
            println!("no matches :(");
            parser.defaults().into_iter().collect()
        }
    };

    if let Some(secs) = result.get("response_s").and_then(|v| v.parse::<f64>().ok()) {
        result.insert("response_ms".to_string(), format!("{:.2}", secs * 1000.0));
    }

    let mut keys: Vec<&String> = result.keys().collect();
    keys.sort();
    for key in keys {
        println!("{} -> {}", key, result[key]);
    }

    ExitCode::SUCCESS
}
