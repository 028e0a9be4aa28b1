mod report;

use bashtasks_client::BashTasksClient;
use bashtasks_core::{current_time_millis, Destination, TaskRequest, TASK_REQUESTS_POOL};
use bashtasks_transport::{AmqpTransport, BrokerConfig};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bt-exec")]
#[command(about = "Run a command on a bashtasks worker and print the response", long_about = None)]
struct Args {
    /// Command to execute, split on whitespace. Better wrapped in quotes
    #[arg(short, long)]
    command: String,

    /// Retries allowed if the command fails (worker default if omitted)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Post the request and exit without waiting for the response
    #[arg(long)]
    no_wait: bool,

    /// Destination to send the request to
    #[arg(short, long, default_value = TASK_REQUESTS_POOL)]
    destination: String,

    /// Give up waiting after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Broker host
    #[arg(long, env = "BASHTASKS_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Broker port
    #[arg(long, default_value_t = 5672)]
    port: u16,

    /// Broker user
    #[arg(short, long, env = "BASHTASKS_USER", default_value = "guest")]
    user: String,

    /// Broker password
    #[arg(short, long, env = "BASHTASKS_PASS", default_value = "guest", hide_env_values = true)]
    pass: String,

    /// Broker virtual host
    #[arg(long, default_value = "/")]
    vhost: String,
}

/// Whitespace split, no shell quoting
fn build_request(command: &str, max_retries: Option<u32>) -> anyhow::Result<TaskRequest> {
    let request = TaskRequest::builder(command.split_whitespace())
        .max_retries(max_retries)
        .build()?;
    tracing::debug!(
        correlation_id = %request.correlation_id,
        command = ?request.command,
        "Built task request"
    );
    Ok(request)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so the report stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = BrokerConfig {
        host: args.host,
        port: args.port,
        username: args.user,
        password: args.pass,
        vhost: args.vhost,
        connection_name: "bt-exec".to_string(),
    };
    let destination = Destination::named(args.destination);
    let request = build_request(&args.command, args.max_retries)?;

    let client = BashTasksClient::connect(Arc::new(AmqpTransport), config).await?;

    if args.no_wait {
        tracing::debug!(destination = %destination, "Posting without waiting");
        client.post_request(&request, &destination).await?;
        println!("Task posted: {}", request.correlation_id);
        client.close().await?;
        return Ok(());
    }

    tracing::debug!(destination = %destination, timeout = ?args.timeout, "Waiting for response");
    let response = match args.timeout {
        Some(secs) => {
            client
                .execute_timeout(&request, &destination, Duration::from_secs(secs))
                .await?
        }
        None => client.execute_request(&request, &destination).await?,
    };
    client.close().await?;

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&response)?),
        "yaml" => println!("{}", serde_yaml::to_string(&response)?),
        _ => println!("{}", report::render_table(&response, current_time_millis())),
    }

    Ok(())
}
