use bashtasks_transport::{AmqpTransport, MemoryBroker, Transport};
use bashtasks_worker::{install_signal_handler, WorkerConfig, WorkerPool};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bt-worker")]
#[command(about = "Consume command requests and run them", long_about = None)]
struct Args {
    /// Broker host
    #[arg(long, env = "BASHTASKS_HOST")]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Broker user
    #[arg(short, long, env = "BASHTASKS_USER")]
    user: Option<String>,

    /// Broker password
    #[arg(short, long, env = "BASHTASKS_PASS", hide_env_values = true)]
    pass: Option<String>,

    /// Broker virtual host
    #[arg(long)]
    vhost: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Tasks each worker runs before the pool stops (unbounded if omitted)
    #[arg(short, long)]
    tasks: Option<u64>,

    /// Retries for requests without their own max_retries
    #[arg(long)]
    max_retries: Option<u32>,

    /// Trace every message
    #[arg(short, long)]
    verbose: bool,

    /// Return codes that are not traced, comma separated
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    ok_returncodes: Option<Vec<i32>>,

    /// Request destination to consume from
    #[arg(short, long)]
    queue: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Run against an in-process broker instead of AMQP
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(user) = args.user {
        config.broker.username = user;
    }
    if let Some(pass) = args.pass {
        config.broker.password = pass;
    }
    if let Some(vhost) = args.vhost {
        config.broker.vhost = vhost;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.tasks.is_some() {
        config.tasks = args.tasks;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if args.verbose {
        config.verbose = true;
    }
    if let Some(ok_returncodes) = args.ok_returncodes {
        config.ok_returncodes = ok_returncodes;
    }
    if let Some(queue) = args.queue {
        config.queue = queue;
    }

    let transport: Arc<dyn Transport> = if args.memory {
        tracing::warn!("Using the in-process broker; nothing outside this process can reach it");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpTransport)
    };

    let pool = WorkerPool::new(config, transport);
    let _signals = install_signal_handler(pool.shutdown_context());

    let reason = pool.run().await?;
    tracing::info!("Executor stopped: {}", reason);

    Ok(())
}
