//! amqp-consume - dump messages from bound queues or the broker firehose
//!
//! Each delivery is printed to stdout as one JSON document per line, or
//! written to `<out-dir>/<exchange>/<message id>/message.json`, and then
//! acked. With `--keep` it is rejected with requeue instead.
//!
//! ## Configuration
//!
//! Settings come from the `[broker]` and `[consume]` sections of the config
//! file (`AMQP_TOOLS_CONFIG`, default `config/amqp-tools.toml`); flags
//! override them. `RUST_LOG` sets the log level (default: "info"). Logs go
//! to stderr.
//!
//! ## Exit codes
//!
//! ```text
//! 0   stream ended normally
//! 1   connection failed          4   consumer tag unavailable
//! 2   channel open failed        5   queue bind / consume failed
//! 3   prefetch refused           86  bad configuration or session fault
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use amqp_tools::amqp::AmqpBroker;
use amqp_tools::config::ToolsConfig;
use amqp_tools::dump::{self, DumpEnvelope};
use amqp_tools::{
    BindingSet, Broker, ConsumeEvent, ConsumeMode, ConsumeMultiplexer, ConsumeSession, Delivery,
    LogTailer, ShutdownSignal,
};

const EXIT_FATAL: i32 = 86;

#[derive(Parser, Debug)]
#[command(name = "amqp-consume")]
#[command(version, about = "Consume or drain AMQP queues and dump each message as JSON")]
struct Args {
    /// Queue bindings as exchange/queue/routing_key
    #[arg(value_name = "BINDING")]
    bindings: Vec<String>,

    /// AMQP connection URI
    #[arg(short = 'U', long = "uri", value_name = "URI")]
    uri: Option<String>,

    /// Output directory for messages; stdout when absent
    #[arg(short = 'd', long = "out-dir", value_name = "DIR")]
    out_dir: Option<PathBuf>,

    /// Consume until stopped instead of exiting once the queues are empty
    #[arg(long)]
    continuous: bool,

    /// Requeue messages after output instead of acking them
    #[arg(long)]
    keep: bool,

    /// Indented JSON
    #[arg(long)]
    pretty: bool,

    /// Tail amq.rabbitmq.log and amq.rabbitmq.trace instead of BINDINGs
    #[arg(long = "rabbitmq-logs")]
    firehose: bool,
}

/// Where and how deliveries are written.
struct Output {
    out_dir: Option<PathBuf>,
    pretty: bool,
    firehose: bool,
}

impl Output {
    async fn emit(&self, delivery: &Delivery) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(dir) = &self.out_dir {
            dump::write_delivery(dir, delivery, self.pretty).await?;
            return Ok(());
        }

        let envelope = DumpEnvelope::from_delivery(delivery);
        if self.firehose {
            println!("{}", envelope.summary_line());
        } else {
            println!("{}", envelope.to_json(self.pretty)?);
        }
        Ok(())
    }
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

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match ToolsConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            return EXIT_FATAL;
        }
    };

    let consume = &config.consume;
    let mut bindings = match consume.binding_set() {
        Ok(bindings) => bindings,
        Err(e) => {
            error!(error = %e, "Invalid binding in config");
            return EXIT_FATAL;
        }
    };
    for value in &args.bindings {
        if let Err(e) = bindings.add(value) {
            error!(error = %e, binding = %value, "Invalid binding");
            return EXIT_FATAL;
        }
    }

    let uri = args
        .uri
        .clone()
        .unwrap_or_else(|| config.broker.connection_uri());
    let continuous = args.continuous || consume.continuous;
    let keep = args.keep || consume.keep;
    let firehose = args.firehose || consume.firehose;
    let output = Output {
        out_dir: args.out_dir.clone().or_else(|| consume.out_dir.clone()),
        pretty: args.pretty || consume.pretty,
        firehose,
    };

    if !firehose && bindings.is_empty() {
        error!("At least one exchange/queue/routing_key binding is required");
        return EXIT_FATAL;
    }

    let shutdown = ShutdownSignal::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new());
    let mode = if continuous {
        ConsumeMode::Continuous
    } else {
        ConsumeMode::Drain
    };

    let started = if firehose {
        LogTailer::new(broker)
            .with_shutdown(shutdown.clone())
            .start(&uri)
            .await
    } else {
        ConsumeMultiplexer::new(broker)
            .with_shutdown(shutdown.clone())
            .start(&uri, &bindings, mode)
            .await
    };

    let session = match started {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Consume setup failed");
            return e.stage().map(|s| s.exit_code()).unwrap_or(EXIT_FATAL);
        }
    };

    info!(
        bindings = bindings.len(),
        continuous = continuous,
        firehose = firehose,
        "Consuming"
    );

    consume_all(session, &output, &bindings, keep, mode).await
}

async fn consume_all(
    mut session: ConsumeSession,
    output: &Output,
    bindings: &BindingSet,
    keep: bool,
    mode: ConsumeMode,
) -> i32 {
    // Requeued messages would be fetched again while draining, so hold them
    // until their queue is done.
    let mut held: Vec<Delivery> = Vec::new();
    let mut handled: u64 = 0;

    while let Some(event) = session.next().await {
        match event {
            ConsumeEvent::Delivery(delivery) => {
                if let Err(e) = output.emit(&delivery).await {
                    warn!(error = %e, tag = delivery.delivery_tag, "Output failed, requeueing");
                    if let Err(e) = delivery.reject(true).await {
                        warn!(error = %e, "Reject failed");
                    }
                    continue;
                }
                handled += 1;

                if !keep {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "Ack failed");
                    }
                } else if mode == ConsumeMode::Drain {
                    held.push(delivery);
                } else if let Err(e) = delivery.reject(true).await {
                    warn!(error = %e, "Reject failed");
                }
            }
            ConsumeEvent::Drained(binding) => {
                info!(binding = %binding, "Binding drained");
                for delivery in held.drain(..) {
                    if let Err(e) = delivery.reject(true).await {
                        warn!(error = %e, "Reject failed");
                    }
                }
            }
        }
    }

    info!(handled = handled, bindings = bindings.len(), "Consume stream closed");
    match session.finish().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Consume session ended with an error");
            EXIT_FATAL
        }
    }
}
