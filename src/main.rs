use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connpool::config::{self, Config};
use connpool::factory::TcpConnectionFactory;
use connpool::pool::TracingMetricsSink;
use connpool::PoolRegistry;

#[derive(Parser)]
#[command(name = "connpool")]
#[command(version, about = "Connection pool manager with circuit breaking and health checks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to CONNPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// TCP connect timeout in milliseconds
    #[arg(long, global = true, default_value = "5000")]
    connect_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and list the configured pools
    Check,

    /// Create every pool, print its stats as JSON and shut down
    Stats {
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Create every pool and keep it running until Ctrl-C
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // `check` does no I/O beyond reading the config
    let runtime = match cli.command {
        Commands::Serve => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        _ => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => cmd_check(&config),
        Commands::Stats { pretty } => {
            let registry = build_registry(&config, cli.connect_timeout_ms).await?;
            let result = cmd_stats(&registry, pretty);
            registry.stop().await;
            result
        }
        Commands::Serve => {
            let registry = build_registry(&config, cli.connect_timeout_ms).await?;
            let result = cmd_serve(&registry, config.registry.metrics_interval).await;
            registry.stop().await;
            result
        }
    }
}

async fn build_registry(config: &Config, connect_timeout_ms: u64) -> Result<PoolRegistry> {
    if config.pools.is_empty() {
        anyhow::bail!("No pools configured; set pools in the config file or CONNPOOL_POOLS");
    }

    let factory = Arc::new(TcpConnectionFactory::new(Duration::from_millis(
        connect_timeout_ms,
    )));
    let registry = PoolRegistry::new(config.registry.clone(), Arc::new(TracingMetricsSink))
        .with_default_factory(factory);

    for (name, definition) in &config.pools {
        registry
            .create_pool_from(name, definition)
            .await
            .with_context(|| format!("Failed to create pool '{}'", name))?;
    }

    Ok(registry)
}

fn cmd_check(config: &Config) -> Result<()> {
    println!("Configuration OK: {} pool(s)", config.pools.len());
    for (name, definition) in &config.pools {
        println!(
            "  {:<20} {:<8} {:<30} min={} max={} strategy={}",
            name,
            definition.kind,
            definition.endpoint,
            definition.config.min_connections,
            definition.config.max_connections,
            definition.config.load_balancing_strategy.name(),
        );
    }
    Ok(())
}

fn cmd_stats(registry: &PoolRegistry, pretty: bool) -> Result<()> {
    let stats = registry.get_stats();
    let json = if pretty {
        serde_json::to_string_pretty(&stats)
    } else {
        serde_json::to_string(&stats)
    }
    .context("Failed to serialize pool stats")?;

    println!("{}", json);
    Ok(())
}

async fn cmd_serve(registry: &PoolRegistry, report_interval: Duration) -> Result<()> {
    info!(pools = ?registry.pool_names(), "Serving pools, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(report_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                for (name, stats) in registry.get_stats() {
                    let health = registry
                        .get_pool(&name)
                        .map(|p| p.health().name())
                        .unwrap_or("unknown");
                    info!(
                        pool = %name,
                        health,
                        total = stats.total,
                        active = stats.active,
                        idle = stats.idle,
                        waiting = stats.waiting,
                        failed = stats.failed,
                        "Pool stats"
                    );
                }
            }
        }
    }
}
