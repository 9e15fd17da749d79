use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use steward_reconcilers::pools;
use steward_runtime::{RuntimeConfig, WorkerCounts, DEFAULT_TERMINAL_RESYNC_SECS};

mod run;

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward controllers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "STEWARD_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SecretBinding and Bastion controllers until interrupted
    Run(RunArgs),
    /// Print the effective configuration
    Config(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Concurrent SecretBinding workers
    #[arg(long, env = "STEWARD_BINDING_WORKERS", default_value_t = 5)]
    binding_workers: usize,
    /// Concurrent SecretBinding provider-sync workers
    #[arg(long, env = "STEWARD_PROVIDER_WORKERS", default_value_t = 5)]
    provider_workers: usize,
    /// Concurrent Bastion workers
    #[arg(long, env = "STEWARD_BASTION_WORKERS", default_value_t = 5)]
    bastion_workers: usize,
    /// Shutdown drain poll interval
    #[arg(long, env = "STEWARD_DRAIN_POLL_MS", default_value_t = 5_000)]
    drain_poll_ms: u64,
    /// Cache sync poll interval on startup
    #[arg(long, env = "STEWARD_SYNC_POLL_MS", default_value_t = 100)]
    sync_poll_ms: u64,
    /// Re-check interval while a binding's deletion is blocked
    #[arg(long, env = "STEWARD_BLOCKED_REQUEUE_SECS", default_value_t = 15)]
    blocked_requeue_secs: u64,
    /// Re-evaluate terminally failed keys after this many seconds (0 disables)
    #[arg(long, env = "STEWARD_TERMINAL_RESYNC_SECS", default_value_t = DEFAULT_TERMINAL_RESYNC_SECS)]
    terminal_resync_secs: u64,
    /// Drop a key after this many consecutive retryable failures
    #[arg(long, env = "STEWARD_MAX_RETRIES")]
    max_retries: Option<u32>,
    /// Per-key retry backoff base
    #[arg(long, env = "STEWARD_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    /// Per-key retry backoff cap
    #[arg(long, env = "STEWARD_BACKOFF_MAX_SECS", default_value_t = 1_000)]
    backoff_max_secs: u64,
    /// Domain under which bastion hostnames are published
    #[arg(long, env = "STEWARD_BASTION_DOMAIN", default_value = "bastion.local")]
    bastion_domain: String,
}

/// Resolved configuration for one controller run.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Settings {
    pub namespace: Option<String>,
    pub runtime: RuntimeConfig,
    pub workers: WorkerCounts,
    pub blocked_requeue_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub bastion_domain: String,
}

impl Settings {
    fn from_args(namespace: Option<String>, args: RunArgs) -> Self {
        Self {
            namespace,
            runtime: RuntimeConfig {
                drain_poll_ms: args.drain_poll_ms,
                sync_poll_ms: args.sync_poll_ms,
                terminal_resync_secs: (args.terminal_resync_secs > 0).then_some(args.terminal_resync_secs),
                max_retries: args.max_retries,
            },
            workers: WorkerCounts::new()
                .with(pools::SECRET_BINDING, args.binding_workers)
                .with(pools::SECRET_BINDING_PROVIDER, args.provider_workers)
                .with(pools::BASTION, args.bastion_workers),
            blocked_requeue_secs: args.blocked_requeue_secs,
            backoff_base_ms: args.backoff_base_ms,
            backoff_max_secs: args.backoff_max_secs,
            bastion_domain: args.bastion_domain,
        }
    }

    pub fn blocked_requeue(&self) -> Duration { Duration::from_secs(self.blocked_requeue_secs) }
    pub fn backoff_base(&self) -> Duration { Duration::from_millis(self.backoff_base_ms) }
    pub fn backoff_max(&self) -> Duration { Duration::from_secs(self.backoff_max_secs) }

    fn print_human(&self) {
        println!("namespace              {}", self.namespace.as_deref().unwrap_or("(all)"));
        for (kind, n) in self.workers.iter() {
            println!("workers.{:<15} {}", kind, n);
        }
        println!("drain_poll_ms          {}", self.runtime.drain_poll_ms);
        println!("sync_poll_ms           {}", self.runtime.sync_poll_ms);
        println!("blocked_requeue_secs   {}", self.blocked_requeue_secs);
        println!("terminal_resync_secs   {}", opt(self.runtime.terminal_resync_secs));
        println!("max_retries            {}", opt(self.runtime.max_retries));
        println!("backoff                {}ms..{}s", self.backoff_base_ms, self.backoff_max_secs);
        println!("bastion_domain         {}", self.bastion_domain);
    }
}

fn opt<T: ToString>(v: Option<T>) -> String { v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()) }

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(args) => {
            let settings = Settings::from_args(cli.namespace, args);
            match cli.output {
                Output::Human => settings.print_human(),
                Output::Json => println!("{}", serde_json::to_string_pretty(&settings)?),
            }
        }
        Commands::Run(args) => {
            init_metrics();
            run::run(Settings::from_args(cli.namespace, args)).await?;
        }
    }
    Ok(())
}
