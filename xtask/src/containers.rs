//! Container management for the integration Redis server.
//!
//! Pure functions build command arguments; the async functions run them
//! through Docker or Podman.

use std::time::Duration;

use tokio::process::Command;

use crate::integration::{IntegrationError, Result};

/// Container runtime (Docker or Podman).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Podman,
}

/// Specification for a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: &'static str,
    pub image: &'static str,
    /// Host port mapped to the container port.
    pub host_port: u16,
    pub container_port: u16,
    pub command: Option<&'static str>,
}

/// Throwaway Redis server for the test suite. Nothing is persisted.
pub const REDIS_SPEC: ContainerSpec = ContainerSpec {
    name: "gopro-redis-test",
    image: "redis:7-alpine",
    host_port: 6379,
    container_port: 6379,
    command: Some("redis-server --appendonly no"),
};

/// Builds arguments for `docker run` / `podman run`.
pub fn container_run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--name".to_string(),
        spec.name.to_string(),
        "-d".to_string(),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
        spec.image.to_string(),
    ];

    if let Some(cmd) = spec.command {
        args.extend(cmd.split_whitespace().map(String::from));
    }

    args
}

pub fn runtime_command(runtime: ContainerRuntime) -> &'static str {
    match runtime {
        ContainerRuntime::Docker => "docker",
        ContainerRuntime::Podman => "podman",
    }
}

/// Returns the first runtime that answers `--version`, Docker first.
pub async fn detect_runtime() -> Result<ContainerRuntime> {
    for runtime in [ContainerRuntime::Docker, ContainerRuntime::Podman] {
        let output = Command::new(runtime_command(runtime))
            .arg("--version")
            .output()
            .await;

        if let Ok(output) = output {
            if output.status.success() {
                return Ok(runtime);
            }
        }
    }

    Err(IntegrationError::DockerNotAvailable(
        "Neither docker nor podman found in PATH".to_string(),
    ))
}

/// Whether a container with `name` is running.
pub async fn is_running(runtime: ContainerRuntime, name: &str) -> Result<bool> {
    let output = Command::new(runtime_command(runtime))
        .args(["ps", "-q", "-f", &format!("name={}", name)])
        .output()
        .await?;

    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

/// Stops and removes a container. Errors are ignored since it might not exist.
pub async fn stop_container(runtime: ContainerRuntime, name: &str) {
    let cmd = runtime_command(runtime);
    let _ = Command::new(cmd).args(["stop", name]).output().await;
    let _ = Command::new(cmd).args(["rm", name]).output().await;
}

/// Replaces any container with the same name and starts a new one.
pub async fn start_container(runtime: ContainerRuntime, spec: &ContainerSpec) -> Result<()> {
    stop_container(runtime, spec.name).await;

    let output = Command::new(runtime_command(runtime))
        .args(container_run_args(spec))
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IntegrationError::ContainerFailed(format!(
            "Failed to start container '{}': {}",
            spec.name, stderr
        )));
    }

    Ok(())
}

/// Polls `redis-cli ping` inside the container until it answers or `timeout` passes.
pub async fn wait_for_redis(
    runtime: ContainerRuntime,
    spec: &ContainerSpec,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    let poll_interval = Duration::from_millis(500);

    while start.elapsed() < timeout {
        if ping(runtime, spec.name).await {
            return Ok(());
        }
        tokio::time::sleep(poll_interval).await;
    }

    Err(IntegrationError::ContainerNotHealthy {
        name: spec.name.to_string(),
        timeout_secs: timeout.as_secs(),
    })
}

async fn ping(runtime: ContainerRuntime, name: &str) -> bool {
    let output = Command::new(runtime_command(runtime))
        .args(["exec", name, "redis-cli", "ping"])
        .output()
        .await;

    match output {
        Ok(output) => {
            output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "PONG"
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_run_args_redis() {
        let args = container_run_args(&REDIS_SPEC);

        assert_eq!(&args[..4], ["run", "--name", "gopro-redis-test", "-d"]);
        assert!(args.contains(&"6379:6379".to_string()));
        assert!(args.contains(&"redis:7-alpine".to_string()));
        assert!(args.contains(&"redis-server".to_string()));
        assert!(args.contains(&"--appendonly".to_string()));
        assert!(args.contains(&"no".to_string()));
    }

    #[test]
    fn test_container_run_args_without_command() {
        let spec = ContainerSpec {
            command: None,
            host_port: 16379,
            ..REDIS_SPEC
        };
        let args = container_run_args(&spec);

        assert_eq!(args.last().map(String::as_str), Some("redis:7-alpine"));
        assert!(args.contains(&"16379:6379".to_string()));
    }

    #[test]
    fn test_runtime_command() {
        assert_eq!(runtime_command(ContainerRuntime::Docker), "docker");
        assert_eq!(runtime_command(ContainerRuntime::Podman), "podman");
    }
}
