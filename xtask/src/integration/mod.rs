//! Integration test infrastructure.
//!
//! Runs the `gopro_redis` test suite against a real Redis server. Without a
//! server those tests skip themselves, so this command is what actually
//! exercises them.
//!
//! # Usage
//!
//! ```bash
//! # Start a Redis container, run the suite, stop the container
//! cargo xtask integration
//!
//! # Use a Redis server that is already running
//! REDIS_HOST=10.0.0.5 cargo xtask integration --no-docker
//!
//! # Leave the container up for debugging
//! cargo xtask integration --keep-containers
//! ```

pub mod error;

pub use error::{IntegrationError, Result};

use std::time::Duration;

use crate::containers::{
    detect_runtime, is_running, start_container, stop_container, wait_for_redis, REDIS_SPEC,
};
use crate::prelude::*;

/// Integration test command.
#[derive(Debug, clap::Parser)]
#[command(long_about = "Run the Redis-backed test suite against a real server.

By default a redis:7-alpine container is started with Docker (or Podman),
the suite runs with REDIS_HOST/REDIS_PORT pointing at it, and the container
is stopped afterwards.

Environment variables:
  REDIS_HOST    - Redis host used with --no-docker (default: localhost)
  REDIS_PORT    - Redis port used with --no-docker (default: 6379)")]
pub struct IntegrationCommand {
    /// Skip container management (assume Redis is already running).
    #[arg(long)]
    pub no_docker: bool,

    /// Keep the container running after the tests complete.
    #[arg(long)]
    pub keep_containers: bool,

    /// Timeout in seconds for the container health check.
    #[arg(long, default_value = "30")]
    pub health_timeout: u64,

    /// Extra arguments passed to `cargo test` (after `--`).
    #[arg(last = true)]
    pub test_args: Vec<String>,
}

/// Main entry point for integration command.
pub async fn run(command: IntegrationCommand, global: crate::Global) -> Result<()> {
    if !global.is_silent() {
        aprintln!("{}", p_b("Integration Tests"));
        aprintln!();
    }

    let (host, port) = if command.no_docker {
        if !global.is_silent() {
            aprintln!(
                "{} {}",
                p_y("⚠️"),
                "Skipping Redis container management (--no-docker)"
            );
        }
        (
            std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string()),
        )
    } else {
        ("localhost".to_string(), REDIS_SPEC.host_port.to_string())
    };

    let runtime = if command.no_docker {
        None
    } else {
        Some(detect_runtime().await?)
    };

    let mut started = false;
    if let Some(runtime) = runtime {
        if is_running(runtime, REDIS_SPEC.name).await? {
            if !global.is_silent() {
                aprintln!("{} {}", p_y("⚠️"), "Redis container already running");
            }
        } else {
            if !global.is_silent() {
                aprintln!("{} {}", p_b("🐳"), "Starting Redis container...");
            }
            start_container(runtime, &REDIS_SPEC).await?;
            started = true;

            if !global.is_silent() {
                aprintln!(
                    "{} {}",
                    p_b("⏳"),
                    format!(
                        "Waiting for Redis health (max {}s)...",
                        command.health_timeout
                    )
                );
            }
            wait_for_redis(
                runtime,
                &REDIS_SPEC,
                Duration::from_secs(command.health_timeout),
            )
            .await?;
            if !global.is_silent() {
                aprintln!("{} {}", p_g("✅"), "Redis is ready");
            }
        }
    }

    let outcome = run_tests(&host, &port, &command.test_args, &global).await;

    if let Some(runtime) = runtime {
        if started && !command.keep_containers {
            if !global.is_silent() {
                aprintln!("{} {}", p_b("🐳"), "Stopping Redis container...");
            }
            stop_container(runtime, REDIS_SPEC.name).await;
        } else if started && !global.is_silent() {
            aprintln!(
                "{} {}",
                p_y("⚠️"),
                "Container left running (--keep-containers)"
            );
        }
    }

    aprintln!();
    if outcome? {
        aprintln!("{} {}", p_g("✅"), p_g("All integration tests passed!"));
        Ok(())
    } else {
        aprintln!("{} {}", p_r("❌"), p_r("Some integration tests failed"));
        Err(IntegrationError::TestFailed(
            "gopro_redis test suite failed".to_string(),
        ))
    }
}

/// Arguments for the `cargo test` invocation.
fn cargo_test_args(extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "test".to_string(),
        "-p".to_string(),
        "gopro_redis".to_string(),
    ];
    if !extra.is_empty() {
        args.push("--".to_string());
        args.extend(extra.iter().cloned());
    }
    args
}

async fn run_tests(host: &str, port: &str, extra: &[String], global: &crate::Global) -> Result<bool> {
    if !global.is_silent() {
        aprintln!(
            "{} Running gopro_redis tests against {}",
            p_b("  →"),
            p_y(&format!("{host}:{port}"))
        );
    }

    let status = tokio::process::Command::new("cargo")
        .args(cargo_test_args(extra))
        .env("REDIS_HOST", host)
        .env("REDIS_PORT", port)
        .status()
        .await?;

    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cargo_test_args() {
        assert_eq!(cargo_test_args(&[]), ["test", "-p", "gopro_redis"]);
        assert_eq!(
            cargo_test_args(&["--nocapture".to_string()]),
            ["test", "-p", "gopro_redis", "--", "--nocapture"]
        );
    }
}
