//! Data model for sites, router accesses, and links
//!
//! These are the already-parsed records the control engine consumes and
//! the status records it emits. Reading and writing them from manifests
//! or an API server is the command layer's job; nothing in this module
//! touches the filesystem or the network.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_LINK_COST, DEFAULT_LINK_TIMEOUT_SECS};

/// Platform kinds a site can run under
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum SitePlatform {
    /// Kubernetes namespace; runtime is cluster-side, no local agent
    #[default]
    Kubernetes,
    /// Podman container runtime on the local host
    Podman,
    /// Docker container runtime on the local host
    Docker,
    /// Bare linux host driven through systemd units
    Linux,
}

impl SitePlatform {
    /// Whether this platform owns local persisted state that uninstall
    /// can remove
    ///
    /// Kubernetes sites live in the cluster and a bare linux host acts
    /// only as a client, so neither supports a local uninstall.
    pub fn supports_uninstall(&self) -> bool {
        matches!(self, Self::Podman | Self::Docker)
    }
}

impl std::str::FromStr for SitePlatform {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kubernetes" => Ok(Self::Kubernetes),
            "podman" => Ok(Self::Podman),
            "docker" => Ok(Self::Docker),
            "linux" | "linux-systemd" | "systemd" => Ok(Self::Linux),
            _ => Err(crate::Error::validation(format!(
                "invalid platform: {s}, expected one of: kubernetes, podman, docker, linux"
            ))),
        }
    }
}

impl std::fmt::Display for SitePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Podman => write!(f, "podman"),
            Self::Docker => write!(f, "docker"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// Lifecycle states of a site's local runtime
///
/// `Installed` and `Stopped` both mean "not serving traffic"; they differ
/// in whether the site has ever run since configuration was materialized.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteState {
    /// No local configuration exists
    #[default]
    Absent,
    /// Configuration materialized, never started
    Installed,
    /// Router process running
    Running,
    /// Stopped after running; configuration still exists
    Stopped,
}

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Installed => write!(f, "installed"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A deployable participant in the overlay network
///
/// A site's platform is chosen at creation time and immutable thereafter;
/// its lifecycle state is mutated only by the lifecycle manager.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Site {
    /// Site name, unique within its namespace
    pub name: String,
    /// Namespace or scope the site lives in
    pub namespace: String,
    /// Platform kind the site runs under
    pub platform: SitePlatform,
    /// Current lifecycle state
    #[serde(default)]
    pub state: SiteState,
    /// Names of outbound links owned by this site
    #[serde(default)]
    pub links: Vec<String>,
}

/// Role an inbound access endpoint serves
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AccessRole {
    /// Router-to-router traffic between interior sites
    #[default]
    InterRouter,
    /// Edge sites that attach without participating in routing
    Edge,
}

impl std::fmt::Display for AccessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InterRouter => write!(f, "inter-router"),
            Self::Edge => write!(f, "edge"),
        }
    }
}

/// One (role, host, port) tuple a router access declares
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AccessEndpoint {
    /// Role served on this endpoint
    pub role: AccessRole,
    /// Reachable host name or address
    pub host: String,
    /// Listening port
    pub port: u16,
    /// Preference class for this endpoint; lower is tried first
    #[serde(default)]
    pub cost_class: u32,
}

/// CA material a router access uses to issue link credentials
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IssuerMaterial {
    /// PEM-encoded CA certificate
    pub ca_cert_pem: String,
    /// PEM-encoded CA private key
    pub ca_key_pem: String,
}

/// A site's declared inbound connection surface
///
/// Owned by the site that publishes it; read-only to remote sites.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RouterAccess {
    /// Access name, unique within the owning site
    pub name: String,
    /// TLS profile name credentials issued for this access are scoped to
    pub tls_profile: String,
    /// Issuing authority; absent means this access cannot mint credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<IssuerMaterial>,
    /// Declared endpoints, in declaration order
    pub endpoints: Vec<AccessEndpoint>,
}

impl RouterAccess {
    /// All endpoints serving the given role, in declaration order
    pub fn endpoints_for(&self, role: AccessRole) -> impl Iterator<Item = &AccessEndpoint> {
        self.endpoints.iter().filter(move |e| e.role == role)
    }
}

/// A resolved or explicitly supplied connection target
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Endpoint {
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Whether a link-creating call blocks until readiness
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Return immediately once the attempt is recorded
    None,
    /// Block until the remote access confirms the link accepts traffic
    #[default]
    Ready,
    /// Block until the session is established (boolean-truthy state);
    /// weaker than `Ready`, does not require the remote acknowledgment
    True,
}

impl std::str::FromStr for WaitPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "ready" => Ok(Self::Ready),
            "true" => Ok(Self::True),
            _ => Err(crate::Error::validation(format!(
                "invalid wait policy: {s}, expected one of: none, ready, true"
            ))),
        }
    }
}

impl std::fmt::Display for WaitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Ready => write!(f, "ready"),
            Self::True => write!(f, "true"),
        }
    }
}

/// A directed connection intent from one site to another's router access
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LinkSpec {
    /// Link name, unique within the owning site
    pub name: String,
    /// Explicit target; when set, endpoint resolution is bypassed entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Path-preference cost; lower preferred. Unset means the default of 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
    /// Credential bundle id; empty requests auto-generation
    #[serde(default)]
    pub credential: String,
    /// Time budget for establishing the link. Unset means 60s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Wait policy applied by link-creating calls
    #[serde(default)]
    pub wait: WaitPolicy,
}

impl LinkSpec {
    /// A minimal spec with everything defaulted except the name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            cost: None,
            credential: String::new(),
            timeout: None,
            wait: WaitPolicy::default(),
        }
    }

    /// Cost with the default applied
    pub fn effective_cost(&self) -> u32 {
        self.cost.unwrap_or(DEFAULT_LINK_COST)
    }

    /// Timeout with the default applied
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(Duration::from_secs(DEFAULT_LINK_TIMEOUT_SECS))
    }

    /// Reject specs that could never reconcile
    ///
    /// Called before any state is touched; a spec that fails validation
    /// leaves no trace in the reconciler.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::validation("link name must not be empty"));
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.host.is_empty() {
                return Err(crate::Error::validation(format!(
                    "link {}: explicit endpoint host must not be empty",
                    self.name
                )));
            }
            if endpoint.port == 0 {
                return Err(crate::Error::validation(format!(
                    "link {}: explicit endpoint port must not be zero",
                    self.name
                )));
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(crate::Error::validation(format!(
                    "link {}: timeout must be greater than zero",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Observed states a link moves through
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Just created, not yet reconciled
    #[default]
    Unknown,
    /// Target and credential resolved, attempt in progress
    Connecting,
    /// Authenticated, usable session established
    Connected,
    /// Attempt definitively failed; re-entered only on spec change or
    /// explicit re-apply
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Last-observed status snapshot for a link
///
/// Produced by the reconciler, read lock-free by status queries. Reports
/// observed state, never a freshly probed one.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LinkStatus {
    /// Current observed state
    pub state: LinkState,
    /// Message from the most recent failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Effective cost in force
    pub cost: u32,
    /// Target the link points at, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Endpoint>,
    /// Effective time budget in force
    pub timeout: Duration,
}
