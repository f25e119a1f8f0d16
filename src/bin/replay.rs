//! amqp-replay - publish dumped messages back to their original exchange
//!
//! Usage: `amqp-replay [options] <file> [file ...]`
//!
//! Each file is one JSON envelope as written by `amqp-consume --out-dir`,
//! pretty printed or not. A single file argument of `-` reads envelopes from
//! stdin, one per line, so `amqp-consume` output can be piped straight in.
//! Every message goes back to the exchange and routing key it was consumed
//! from, with its recorded properties, and each outcome is printed to stdout.
//!
//! ## Configuration
//!
//! `[broker]` and `publish.confirm_timeout_ms` in the config file
//! (`AMQP_TOOLS_CONFIG`, default `config/amqp-tools.toml`) supply defaults;
//! flags override them. `RUST_LOG` sets the log level (default: "info").
//!
//! ## Exit codes
//!
//! ```text
//! 0   every message replayed
//! 1   bad arguments or configuration
//! 9   some messages failed
//! 86  the publisher hit a fatal error
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use amqp_tools::amqp::AmqpBroker;
use amqp_tools::config::ToolsConfig;
use amqp_tools::{ReplayConfig, ReplaySource, Replayer, ResultSummary, ShutdownSignal};

const EXIT_ARGS: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "amqp-replay")]
#[command(version, about = "Republish dumped messages to the exchange they were consumed from")]
struct Args {
    /// Envelope files, or a single "-" to read one envelope per stdin line
    #[arg(required = true, value_name = "FILE")]
    files: Vec<String>,

    /// AMQP connection URI
    #[arg(short = 'U', long = "uri", value_name = "URI")]
    uri: Option<String>,

    /// Publish without the mandatory flag
    #[arg(long = "no-mandatory")]
    no_mandatory: bool,

    #[arg(long)]
    immediate: bool,

    /// Stamp messages with the current time instead of the recorded one
    #[arg(long)]
    now: bool,

    /// Milliseconds to wait for each confirm
    #[arg(long = "confirm-timeout-ms")]
    confirm_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EXIT_ARGS } else { 0 });
        }
    };
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let mut config = match ToolsConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            return EXIT_ARGS;
        }
    };
    if let Some(uri) = &args.uri {
        config.broker.uri = Some(uri.clone());
    }
    if let Some(timeout) = args.confirm_timeout_ms {
        config.publish.confirm_timeout_ms = timeout;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return EXIT_ARGS;
    }

    let mut replay = ReplayConfig::new(config.broker.connection_uri());
    replay.mandatory = !args.no_mandatory;
    replay.immediate = args.immediate;
    replay.confirm_timeout = config.publish.confirm_timeout();
    replay.restamp = args.now;

    let shutdown = ShutdownSignal::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    let (sources, queue) = mpsc::unbounded_channel();
    let mut results = Replayer::new(Arc::new(AmqpBroker::new()), replay)
        .with_shutdown(shutdown)
        .spawn(queue);
    tokio::spawn(feed_sources(args.files, sources));

    let mut summary = ResultSummary::default();
    while let Some(result) = results.recv().await {
        if result.fatal {
            error!(source = %result.target, error = %result.message, "Fatal replay error");
        }
        println!("{}", result);
        summary.record(&result);
    }

    let status = summary.status();
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        fatal = summary.fatal,
        status = ?status,
        "Replay finished"
    );
    status.exit_code()
}

/// Queue the envelopes, from files or from stdin lines.
async fn feed_sources(files: Vec<String>, queue: mpsc::UnboundedSender<ReplaySource>) {
    if files.len() == 1 && files[0] == "-" {
        info!("Reading envelopes from stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut number = 0usize;
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    number += 1;
                    if text.trim().is_empty() {
                        continue;
                    }
                    if queue.send(ReplaySource::Line { number, text }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read envelopes from stdin");
                    break;
                }
            }
        }
    } else {
        info!(count = files.len(), "Replaying files provided on command line");
        for file in files {
            if queue.send(ReplaySource::File(PathBuf::from(file))).is_err() {
                break;
            }
        }
    }
}
