//! Platform-portable site lifecycle state machine
//!
//! Controls a site's local runtime through `Absent -> Installed ->
//! Running -> Stopped -> Absent`. All platform side effects go through an
//! injected [`PlatformAgent`]; the destructive uninstall path is guarded
//! by an injected [`ActiveSiteProbe`] unless the caller forces it.
//!
//! The platform a manager controls is chosen once, at construction, and
//! is immutable thereafter - there is no process-wide platform selection
//! state, and shared logic never branches on platform names.

pub mod agents;

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::model::{SitePlatform, SiteState};
use crate::{Error, Result};

/// Local runtime configuration for one site instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteConfig {
    /// Site name
    pub name: String,
    /// Namespace the instance lives in
    pub namespace: String,
}

/// Platform-specific start/stop/remove primitives
///
/// One implementation per platform kind, injected at construction and
/// mockable in tests. The manager owns exactly one agent instance for
/// its selected platform.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformAgent: Send + Sync {
    /// Start the router instance for the given site configuration
    async fn start_instance(&self, config: &SiteConfig) -> Result<()>;

    /// Stop the router instance in the given namespace
    async fn stop_instance(&self, namespace: &str) -> Result<()>;

    /// Remove the platform installation and its registrations
    async fn remove_installation(&self) -> Result<()>;
}

/// Detects whether any site instances remain active
///
/// Consulted only by `uninstall`, and only when force is not set.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ActiveSiteProbe: Send + Sync {
    /// Whether any active sites exist on this host
    async fn check_active_sites(&self) -> Result<bool>;
}

/// Controls the local runtime of sites on one platform
pub struct SiteLifecycleManager {
    /// Selected at construction, immutable thereafter
    platform: SitePlatform,
    agents: HashMap<SitePlatform, Arc<dyn PlatformAgent>>,
    probe: Arc<dyn ActiveSiteProbe>,
    /// Recorded lifecycle state per namespace
    sites: DashMap<String, SiteState>,
    /// Per-namespace locks serializing install/start/stop
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Held shared by per-namespace operations, exclusively by uninstall,
    /// so nothing interleaves with the destructive phase
    ops: RwLock<()>,
}

impl SiteLifecycleManager {
    /// Create a manager with the real platform agents registered
    pub fn new(platform: SitePlatform, probe: Arc<dyn ActiveSiteProbe>) -> Self {
        let mut agents: HashMap<SitePlatform, Arc<dyn PlatformAgent>> = HashMap::new();
        for kind in [SitePlatform::Podman, SitePlatform::Docker, SitePlatform::Linux] {
            if let Ok(agent) = agents::create_agent(kind) {
                agents.insert(kind, agent);
            }
        }
        Self::with_agents(platform, agents, probe)
    }

    /// Create a manager with an explicit agent registry (for tests and
    /// embedders that bring their own platform integration)
    pub fn with_agents(
        platform: SitePlatform,
        agents: HashMap<SitePlatform, Arc<dyn PlatformAgent>>,
        probe: Arc<dyn ActiveSiteProbe>,
    ) -> Self {
        Self {
            platform,
            agents,
            probe,
            sites: DashMap::new(),
            locks: DashMap::new(),
            ops: RwLock::new(()),
        }
    }

    /// The platform this manager controls
    pub fn platform(&self) -> SitePlatform {
        self.platform
    }

    /// Recorded lifecycle state for a namespace
    ///
    /// Lock-free read of the last-committed state; never probes.
    pub fn state(&self, namespace: &str) -> SiteState {
        self.sites
            .get(namespace)
            .map(|s| *s)
            .unwrap_or(SiteState::Absent)
    }

    fn agent(&self) -> Result<Arc<dyn PlatformAgent>> {
        self.agents.get(&self.platform).cloned().ok_or_else(|| {
            Error::unsupported_platform(format!(
                "no platform agent registered for {}",
                self.platform
            ))
        })
    }

    fn lock_for(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Materialize local runtime configuration for a site
    ///
    /// Fails when the selected platform has no registered agent, or when
    /// the namespace already holds an installed site. Two concurrent
    /// installs for the same namespace serialize on the site lock; the
    /// loser sees the winner's installation and fails cleanly.
    pub async fn install(&self, config: &SiteConfig) -> Result<()> {
        let _shared = self.ops.read().await;
        let lock = self.lock_for(&config.namespace);
        let _guard = lock.lock().await;

        self.agent()?;

        if self.state(&config.namespace) != SiteState::Absent {
            return Err(Error::validation(format!(
                "site already installed in namespace {}",
                config.namespace
            )));
        }

        self.sites
            .insert(config.namespace.clone(), SiteState::Installed);
        info!(
            namespace = %config.namespace,
            platform = %self.platform,
            "Site installed"
        );
        Ok(())
    }

    /// Start a site's router instance
    pub async fn start(&self, config: &SiteConfig) -> Result<()> {
        let _shared = self.ops.read().await;
        let lock = self.lock_for(&config.namespace);
        let _guard = lock.lock().await;

        match self.state(&config.namespace) {
            SiteState::Installed | SiteState::Stopped => {}
            SiteState::Running => return Ok(()),
            SiteState::Absent => {
                return Err(Error::validation(format!(
                    "no site installed in namespace {}",
                    config.namespace
                )))
            }
        }

        self.agent()?.start_instance(config).await?;
        self.sites
            .insert(config.namespace.clone(), SiteState::Running);
        info!(namespace = %config.namespace, "Site started");
        Ok(())
    }

    /// Tear down a running site instance
    ///
    /// Idempotent: stopping a site that is not running succeeds without
    /// touching the agent. A failed teardown leaves the recorded state
    /// `Running` - the site did not stop, and the state says so.
    pub async fn stop(&self, namespace: &str) -> Result<()> {
        let _shared = self.ops.read().await;
        let lock = self.lock_for(namespace);
        let _guard = lock.lock().await;

        if self.state(namespace) != SiteState::Running {
            return Ok(());
        }

        if let Err(e) = self.agent()?.stop_instance(namespace).await {
            warn!(namespace = %namespace, error = %e, "Teardown failed");
            return Err(Error::teardown(e.to_string()));
        }

        self.sites.insert(namespace.to_string(), SiteState::Stopped);
        info!(namespace = %namespace, "Site stopped");
        Ok(())
    }

    /// Remove all local configuration and registrations
    ///
    /// Only meaningful for platforms that own local persisted state.
    /// Unless `force` is set, the active-site probe guards the operation:
    /// a probe error propagates verbatim and active sites halt the
    /// uninstall with no destructive action taken. `force` bypasses the
    /// check entirely - the probe is not even queried.
    pub async fn uninstall(&self, force: bool) -> Result<()> {
        if !self.platform.supports_uninstall() {
            return Err(Error::unsupported_platform(
                "the selected platform is not supported by this command. \
                 There is nothing to uninstall",
            ));
        }

        // Exclusive for the whole destructive phase: an install or stop
        // arriving mid-uninstall waits until the outcome is settled
        let _exclusive = self.ops.write().await;

        if !force {
            if self.probe.check_active_sites().await? {
                return Err(Error::ActiveSitesDetected);
            }
        }

        let agent = self.agent()?;

        // Stop anything still running before removing the installation;
        // a failed stop aborts the whole operation with nothing removed
        let running: Vec<String> = self
            .sites
            .iter()
            .filter(|e| *e.value() == SiteState::Running)
            .map(|e| e.key().clone())
            .collect();
        for namespace in running {
            if let Err(e) = agent.stop_instance(&namespace).await {
                return Err(Error::uninstall(e.to_string()));
            }
            self.sites.insert(namespace.clone(), SiteState::Stopped);
        }

        if let Err(e) = agent.remove_installation().await {
            return Err(Error::uninstall(e.to_string()));
        }

        self.sites.clear();
        info!(platform = %self.platform, "Uninstalled");
        Ok(())
    }
}
