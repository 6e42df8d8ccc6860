//! Concrete platform agents driving container engines and systemd
//!
//! Each agent wraps the platform's own CLI through `tokio::process` and
//! reports failures with the tool's stderr carried verbatim, so the
//! lifecycle layer can attach its stage label without losing the cause.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::lifecycle::{PlatformAgent, SiteConfig};
use crate::model::SitePlatform;
use crate::{Error, Result};

/// Container name for a site's router instance
fn container_name(namespace: &str) -> String {
    format!("trellis-router-{namespace}")
}

/// systemd user unit for a site's router instance
fn unit_name(namespace: &str) -> String {
    format!("trellis-router-{namespace}.service")
}

/// Run a platform CLI invocation, mapping a non-zero exit to an agent
/// error carrying the tool's stderr
async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!(program = %program, args = ?args, "Running platform command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::agent(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::agent(stderr.trim().to_string()));
    }
    Ok(())
}

/// Controls router instances running as podman containers
pub struct PodmanAgent;

/// Controls router instances running as docker containers
pub struct DockerAgent;

/// Controls router instances running as systemd user units
pub struct SystemdAgent;

/// Shared container-engine implementation; podman and docker expose the
/// same verbs
async fn engine_start(engine: &str, config: &SiteConfig) -> Result<()> {
    run_command(engine, &["start", &container_name(&config.namespace)]).await
}

async fn engine_stop(engine: &str, namespace: &str) -> Result<()> {
    run_command(engine, &["stop", &container_name(namespace)]).await
}

async fn engine_remove(engine: &str) -> Result<()> {
    run_command(
        engine,
        &["container", "prune", "--force", "--filter", "label=app=trellis"],
    )
    .await
}

#[async_trait]
impl PlatformAgent for PodmanAgent {
    async fn start_instance(&self, config: &SiteConfig) -> Result<()> {
        engine_start("podman", config).await
    }

    async fn stop_instance(&self, namespace: &str) -> Result<()> {
        engine_stop("podman", namespace).await
    }

    async fn remove_installation(&self) -> Result<()> {
        engine_remove("podman").await
    }
}

#[async_trait]
impl PlatformAgent for DockerAgent {
    async fn start_instance(&self, config: &SiteConfig) -> Result<()> {
        engine_start("docker", config).await
    }

    async fn stop_instance(&self, namespace: &str) -> Result<()> {
        engine_stop("docker", namespace).await
    }

    async fn remove_installation(&self) -> Result<()> {
        engine_remove("docker").await
    }
}

#[async_trait]
impl PlatformAgent for SystemdAgent {
    async fn start_instance(&self, config: &SiteConfig) -> Result<()> {
        run_command("systemctl", &["--user", "start", &unit_name(&config.namespace)]).await
    }

    async fn stop_instance(&self, namespace: &str) -> Result<()> {
        run_command("systemctl", &["--user", "stop", &unit_name(namespace)]).await
    }

    async fn remove_installation(&self) -> Result<()> {
        run_command("systemctl", &["--user", "daemon-reload"]).await
    }
}

/// Agent for a platform kind
///
/// Kubernetes sites are reconciled by their cluster controller rather
/// than a local agent, so no agent exists for that platform.
pub fn create_agent(platform: SitePlatform) -> Result<Arc<dyn PlatformAgent>> {
    match platform {
        SitePlatform::Podman => Ok(Arc::new(PodmanAgent)),
        SitePlatform::Docker => Ok(Arc::new(DockerAgent)),
        SitePlatform::Linux => Ok(Arc::new(SystemdAgent)),
        SitePlatform::Kubernetes => Err(Error::unsupported_platform(
            "no local agent for kubernetes sites",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_scoped_per_namespace() {
        assert_eq!(container_name("default"), "trellis-router-default");
        assert_eq!(unit_name("east"), "trellis-router-east.service");
    }

    #[test]
    fn factory_covers_the_local_platforms() {
        for platform in [SitePlatform::Podman, SitePlatform::Docker, SitePlatform::Linux] {
            assert!(create_agent(platform).is_ok());
        }
    }

    #[test]
    fn factory_rejects_kubernetes() {
        assert!(matches!(
            create_agent(SitePlatform::Kubernetes),
            Err(Error::UnsupportedPlatform(_))
        ));
    }
}
