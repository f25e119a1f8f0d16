//! amqp-publish-files - publish files as messages with publisher confirms
//!
//! Usage: `amqp-publish-files [options] <exchange> <file> [file ...]`
//!
//! A single file argument of `-` reads file names from stdin, one per line,
//! trimmed. Each file becomes one message; the content type is taken from the
//! extension unless set. Every outcome is printed to stdout.
//!
//! ## Configuration
//!
//! `[broker]` and `[publish]` in the config file (`AMQP_TOOLS_CONFIG`,
//! default `config/amqp-tools.toml`) supply defaults; flags override them.
//! `RUST_LOG` sets the log level (default: "info"). Logs go to stderr.
//!
//! ## Exit codes
//!
//! ```text
//! 0   every file published
//! 1   bad arguments or configuration
//! 9   some files failed
//! 86  a worker hit a fatal error
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
use amqp_tools::{FileDispatcher, IdentifierGenerator, ResultSummary, ShutdownSignal};

const EXIT_ARGS: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "amqp-publish-files")]
#[command(version, about = "Publish files as messages to an exchange, waiting for confirms")]
struct Args {
    /// Exchange to publish to; empty string for the default exchange
    exchange: String,

    /// Files to publish, or a single "-" to read names from stdin
    #[arg(required = true, value_name = "FILE")]
    files: Vec<String>,

    /// AMQP connection URI; wins over the individual broker flags
    #[arg(short = 'U', long = "uri", value_name = "URI")]
    uri: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    vhost: Option<String>,

    #[arg(short = 'r', long = "routing-key")]
    routing_key: Option<String>,

    #[arg(long)]
    mandatory: bool,

    #[arg(long)]
    immediate: bool,

    /// Number of concurrent publishers
    #[arg(short = 't', long = "threads")]
    workers: Option<usize>,

    /// Milliseconds to wait for each confirm
    #[arg(long = "confirm-timeout-ms")]
    confirm_timeout_ms: Option<u64>,

    /// Content type; derived from the file extension when unset
    #[arg(long = "content-type")]
    content_type: Option<String>,

    #[arg(long = "content-encoding")]
    content_encoding: Option<String>,

    /// 1 for transient, 2 for persistent
    #[arg(long = "delivery-mode")]
    delivery_mode: Option<u8>,

    /// 0 to 9
    #[arg(long)]
    priority: Option<u8>,

    #[arg(long = "replyto")]
    reply_to: Option<String>,

    #[arg(long)]
    expiration: Option<String>,

    /// Unix seconds; defaults to the start of the run
    #[arg(long)]
    timestamp: Option<i64>,

    #[arg(long = "type")]
    kind: Option<String>,

    #[arg(long = "userid")]
    user_id: Option<String>,

    #[arg(long = "appid")]
    app_id: Option<String>,

    /// 'series', 'uuid' or a static value
    #[arg(long = "messageid")]
    message_id: Option<String>,

    /// 'series', 'uuid' or a static value
    #[arg(long = "correlationid")]
    correlation_id: Option<String>,
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

    apply_overrides(&mut config, &args);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return EXIT_ARGS;
    }

    let shutdown = ShutdownSignal::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    let dispatcher = FileDispatcher::new(
        Arc::new(AmqpBroker::new()),
        config.publish.dispatcher_config(config.broker.connection_uri()),
    )
    .with_shutdown(shutdown);

    let (files, queue) = mpsc::unbounded_channel();
    let mut results = dispatcher.spawn(queue);
    tokio::spawn(feed_files(args.files, files));

    let mut summary = ResultSummary::default();
    while let Some(result) = results.recv().await {
        if result.fatal {
            error!(file = %result.target, error = %result.message, "Fatal publish error");
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
        "Publishing finished"
    );
    status.exit_code()
}

/// Flags win over the config file.
fn apply_overrides(config: &mut ToolsConfig, args: &Args) {
    let broker = &mut config.broker;
    if let Some(uri) = &args.uri {
        broker.uri = Some(uri.clone());
    }
    if let Some(user) = &args.user {
        broker.user = user.clone();
    }
    if let Some(password) = &args.password {
        broker.password = password.clone();
    }
    if let Some(host) = &args.host {
        broker.host = host.clone();
    }
    if let Some(port) = args.port {
        broker.port = port;
    }
    if let Some(vhost) = &args.vhost {
        broker.vhost = vhost.clone();
    }

    let publish = &mut config.publish;
    publish.exchange = args.exchange.clone();
    if let Some(routing_key) = &args.routing_key {
        publish.routing_key = routing_key.clone();
    }
    publish.mandatory |= args.mandatory;
    publish.immediate |= args.immediate;
    if let Some(workers) = args.workers {
        publish.workers = workers;
    }
    if let Some(timeout) = args.confirm_timeout_ms {
        publish.confirm_timeout_ms = timeout;
    }

    let properties = &mut publish.properties;
    if let Some(content_type) = &args.content_type {
        properties.content_type = content_type.clone();
    }
    if let Some(content_encoding) = &args.content_encoding {
        properties.content_encoding = content_encoding.clone();
    }
    if let Some(delivery_mode) = args.delivery_mode {
        properties.delivery_mode = delivery_mode;
    }
    if let Some(priority) = args.priority {
        properties.priority = priority;
    }
    if let Some(token) = &args.correlation_id {
        properties.correlation_id = IdentifierGenerator::from_token(token);
    }
    if let Some(reply_to) = &args.reply_to {
        properties.reply_to = reply_to.clone();
    }
    if let Some(expiration) = &args.expiration {
        properties.expiration = expiration.clone();
    }
    if let Some(token) = &args.message_id {
        properties.message_id = IdentifierGenerator::from_token(token);
    }
    if let Some(timestamp) = args.timestamp {
        properties.timestamp = timestamp;
    }
    if let Some(kind) = &args.kind {
        properties.kind = kind.clone();
    }
    if let Some(user_id) = &args.user_id {
        properties.user_id = user_id.clone();
    }
    if let Some(app_id) = &args.app_id {
        properties.app_id = app_id.clone();
    }
}

/// Queue the file names, from the arguments or from stdin.
async fn feed_files(files: Vec<String>, queue: mpsc::UnboundedSender<PathBuf>) {
    if files.len() == 1 && files[0] == "-" {
        info!("Reading files from stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let name = line.trim();
                    if name.is_empty() {
                        continue;
                    }
                    if queue.send(PathBuf::from(name)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read file names from stdin");
                    break;
                }
            }
        }
    } else {
        info!(count = files.len(), "Using files provided on command line");
        for file in files {
            if queue.send(PathBuf::from(file)).is_err() {
                break;
            }
        }
    }
}
