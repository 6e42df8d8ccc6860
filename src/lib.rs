//! Trellis - Link bootstrap and site lifecycle control engine for
//! application network overlays
//!
//! Trellis manages secure overlays ("virtual application networks") that
//! interconnect independent sites - Kubernetes namespaces, or standalone
//! hosts running under podman/docker/systemd - through a mesh of routers.
//! This crate is the control core: it establishes trustworthy,
//! cost-weighted links between sites and keeps each site's local runtime
//! consistent with the declared topology.
//!
//! # Architecture
//!
//! - Bootstrap credentials are issued by the site that publishes a
//!   [`model::RouterAccess`] and redeemed by the peer that wants a link
//! - A declared [`model::LinkSpec`] is driven to observed state
//!   (connecting/connected/failed) by the [`reconciler`]
//! - Each site's local runtime (install/run/stop/uninstall) is controlled
//!   by a platform-portable state machine in [`lifecycle`]
//!
//! The command layer, manifest file I/O, and the router data plane live
//! outside this crate; specifications arrive as already-parsed records and
//! platform side effects are injected capabilities.
//!
//! # Modules
//!
//! - [`model`] - Site, RouterAccess and Link records and their enums
//! - [`credentials`] - TLS credential bundles and bootstrap access grants
//! - [`resolver`] - endpoint resolution for discovery-style link creation
//! - [`reconciler`] - the link state machine (Unknown/Connecting/Connected/Failed)
//! - [`lifecycle`] - the site lifecycle state machine and platform agents
//! - [`retry`] - bounded exponential backoff with deadlines
//! - [`error`] - error types for the control engine

#![deny(missing_docs)]

pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod reconciler;
pub mod resolver;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the defaults applied when a link spec leaves a
// field unset. Centralizing them here keeps spec defaulting, reconciler
// behavior, and test fixtures consistent.

/// Default path-preference cost for a link when the spec does not set one
pub const DEFAULT_LINK_COST: u32 = 1;

/// Default time budget for establishing a link, in seconds
pub const DEFAULT_LINK_TIMEOUT_SECS: u64 = 60;

/// Default time-to-live for a bootstrap access grant, in seconds
pub const DEFAULT_GRANT_TTL_SECS: u64 = 3600;
