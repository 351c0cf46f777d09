//! Container orchestrator boundary.
//!
//! Each instance directory carries a compose project whose `misp` service is
//! the platform. Only two things are asked of the runtime: the address of
//! that service on the internal network, and bringing the project up or
//! down.

use crate::core::error::FleetError;
use crate::core::registry::Instance;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Compose service running the platform.
pub const PLATFORM_SERVICE: &str = "misp";

pub trait ContainerRuntime {
    /// Address of the instance's platform container on `network`.
    fn address(&self, instance: &Instance, network: &str) -> Result<String, FleetError>;
    fn up(&self, instance: &Instance) -> Result<(), FleetError>;
    fn down(&self, instance: &Instance) -> Result<(), FleetError>;
}

/// `docker compose` (or `podman compose`) driven through the CLI.
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    runtime: String,
    sudo: bool,
}

impl ComposeRuntime {
    pub fn new(runtime: &str, sudo: bool) -> Self {
        Self {
            runtime: runtime.to_string(),
            sudo,
        }
    }

    /// Use whichever of docker or podman is installed.
    pub fn detect(sudo: bool) -> Result<Self, FleetError> {
        Ok(Self::new(&find_container_runtime()?, sudo))
    }

    fn command(&self) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.runtime);
            cmd
        } else {
            Command::new(&self.runtime)
        }
    }

    fn run(&self, instance: &Instance, call: &str, args: &[String]) -> Result<String, FleetError> {
        debug!(instance = %instance.name, runtime = %self.runtime, ?args, "container call");
        let output = self
            .command()
            .args(args)
            .current_dir(&instance.dir)
            .output()
            .map_err(|e| FleetError::external(call, format!("{}: {}", self.runtime, e)))?;
        if !output.status.success() {
            return Err(FleetError::external(
                call,
                format!(
                    "{} on {}: {}",
                    self.runtime,
                    instance.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ContainerRuntime for ComposeRuntime {
    fn address(&self, instance: &Instance, network: &str) -> Result<String, FleetError> {
        let container = self.run(instance, "compose ps", &compose_ps_args())?;
        let container = container
            .lines()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                FleetError::external("compose ps", format!("{} is not running", instance.name))
            })?
            .to_string();
        let address = self.run(instance, "inspect", &inspect_args(&container, network))?;
        if address.is_empty() {
            return Err(FleetError::external(
                "inspect",
                format!("{} has no address on network {}", instance.name, network),
            ));
        }
        Ok(address)
    }

    fn up(&self, instance: &Instance) -> Result<(), FleetError> {
        self.run(instance, "compose up", &compose_args(&["up", "-d"]))?;
        info!(instance = %instance.name, "containers up");
        Ok(())
    }

    fn down(&self, instance: &Instance) -> Result<(), FleetError> {
        self.run(instance, "compose down", &compose_args(&["down"]))?;
        info!(instance = %instance.name, "containers down");
        Ok(())
    }
}

fn compose_args(rest: &[&str]) -> Vec<String> {
    std::iter::once("compose")
        .chain(rest.iter().copied())
        .map(String::from)
        .collect()
}

fn compose_ps_args() -> Vec<String> {
    compose_args(&["ps", "-q", PLATFORM_SERVICE])
}

fn inspect_args(container: &str, network: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "-f".to_string(),
        format!("{{{{.NetworkSettings.Networks.{}.IPAddress}}}}", network),
        container.to_string(),
    ]
}

fn find_container_runtime() -> Result<String, FleetError> {
    for candidate in ["docker", "podman"] {
        if command_exists(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(FleetError::NotFound(
        "No container runtime found (docker/podman)".to_string(),
    ))
}

fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
