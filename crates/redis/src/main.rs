//! gopro-redis operator CLI entry point.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gopro_core::{config::parse_duration, Config, PubSub};
use gopro_redis::Manager;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Operate the Redis coordination layer: health, stats, cleanup and pub/sub.
#[derive(Debug, Parser)]
#[command(name = "gopro-redis")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Deadline for health and stats, e.g. "5s" or "500ms".
    #[arg(long, default_value = "5s", env = "GOPRO_REDIS_TIMEOUT", value_parser = parse_duration)]
    timeout: Duration,

    /// Output format.
    #[arg(long, default_value = "pretty")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Raw JSON output.
    Json,
    /// Human-readable output.
    #[default]
    Pretty,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Round-trip a scratch entry through every component.
    Health,
    /// Pool counters, server info and key counts.
    Stats,
    /// Run every cleanup pass once.
    Cleanup,
    /// Publish a message to a channel.
    Publish { channel: String, message: String },
    /// Print messages from channels until Ctrl+C.
    Subscribe {
        #[arg(required = true)]
        channels: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gopro_redis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let manager = Manager::connect(config)
        .await
        .context("failed to connect to Redis")?;

    let outcome = run(&cli, &manager).await;
    manager.close().await?;
    outcome
}

async fn run(cli: &Cli, manager: &Manager) -> Result<()> {
    match &cli.command {
        Commands::Health => {
            manager.health_check(cli.timeout).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "status": "ok" })),
                OutputFormat::Pretty => println!("Redis: healthy"),
            }
        }
        Commands::Stats => {
            let stats = manager.stats(cli.timeout).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Pretty => {
                    for (key, value) in &stats {
                        if key == "redis_info" {
                            continue;
                        }
                        println!("{key}: {value}");
                    }
                }
            }
        }
        Commands::Cleanup => {
            let report = manager.cleanup_once().await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
                OutputFormat::Pretty => println!(
                    "Cleanup:\n  Sessions: {}\n  Locks: {}\n  Rate limits: {}",
                    report.sessions, report.locks, report.rate_limits
                ),
            }
        }
        Commands::Publish { channel, message } => {
            let receivers = manager.pubsub().publish_string(channel, message).await?;
            tracing::info!(%channel, receivers, "published");
        }
        Commands::Subscribe { channels } => {
            let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
            let mut subscription = manager.pubsub().subscribe(&channels).await?;
            tracing::info!(channels = ?channels, "subscribed, press Ctrl+C to stop");

            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    message = subscription.recv() => {
                        let Some(message) = message else { break };
                        match cli.format {
                            OutputFormat::Json => println!(
                                "{}",
                                serde_json::json!({
                                    "channel": message.channel,
                                    "pattern": message.pattern,
                                    "payload": message.payload,
                                })
                            ),
                            OutputFormat::Pretty => {
                                println!("[{}] {}", message.channel, message.payload)
                            }
                        }
                    }
                }
            }

            let dropped = manager.pubsub().dropped_messages();
            if dropped > 0 {
                tracing::warn!(dropped, "messages dropped by a full subscriber queue");
            }
        }
    }
    Ok(())
}
