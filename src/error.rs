//! Error types for the Trellis control engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for Trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad or missing arguments, rejected before any state change
    #[error("validation error: {0}")]
    Validation(String),

    /// Credential issuance failed (no CA material, key generation, signing)
    #[error("credential issuance failed: {0}")]
    Issuance(String),

    /// Credential export failed (unsupported format, serialization)
    #[error("credential export failed: {0}")]
    Export(String),

    /// No router access matched during endpoint resolution
    #[error("no router access: {0}")]
    NoAccess(String),

    /// Link establishment failed (unreachable target, TLS, authorization)
    #[error("connection failed: {0}")]
    Connect(String),

    /// Link establishment exceeded its configured time budget
    #[error("link attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The requested platform has no registered agent
    ///
    /// The message is caller-supplied because the user-visible wording
    /// differs between operations (install vs. uninstall).
    #[error("{0}")]
    UnsupportedPlatform(String),

    /// Uninstall guard tripped: active sites exist and force was not set
    #[error("Uninstallation halted: Active sites detected.")]
    ActiveSitesDetected,

    /// The active-site check itself failed; propagated verbatim
    #[error("{0}")]
    Probe(String),

    /// A platform agent operation failed
    ///
    /// Carries the agent's own message verbatim; callers wrap it with a
    /// stage label (teardown, uninstall) before it reaches the user.
    #[error("{0}")]
    Agent(String),

    /// Site teardown failed
    #[error("System teardown has failed: {0}")]
    Teardown(String),

    /// Site uninstall failed partway through
    #[error("failed to uninstall : {0}")]
    Uninstall(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a credential issuance error with the given message
    pub fn issuance(msg: impl Into<String>) -> Self {
        Self::Issuance(msg.into())
    }

    /// Create a credential export error with the given message
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Create a resolution error with the given message
    pub fn no_access(msg: impl Into<String>) -> Self {
        Self::NoAccess(msg.into())
    }

    /// Create a connection error with the given message
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create an unsupported-platform error with the given message
    pub fn unsupported_platform(msg: impl Into<String>) -> Self {
        Self::UnsupportedPlatform(msg.into())
    }

    /// Create a probe error carrying the underlying message verbatim
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a platform agent error carrying the message verbatim
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a teardown error with the given underlying cause
    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown(msg.into())
    }

    /// Create an uninstall error with the given underlying cause
    pub fn uninstall(msg: impl Into<String>) -> Self {
        Self::Uninstall(msg.into())
    }

    /// Whether this error is the retry-with-force guard rather than a
    /// hard failure
    ///
    /// Callers use this to distinguish "halted, retry with force" from
    /// failures where force would not help.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::ActiveSitesDetected)
    }
}
