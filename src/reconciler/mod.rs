//! Link reconciliation state machine
//!
//! Drives a declared [`LinkSpec`] to an observed state: `Unknown` on
//! creation, `Connecting` while an attempt is in flight, then `Connected`
//! or `Failed`. Transient network errors are retried with bounded backoff
//! inside `Connecting`; a definitively failed link stays `Failed` until
//! its spec changes or it is explicitly re-applied, so a permanently
//! misconfigured target never produces a retry storm.
//!
//! # Concurrency
//!
//! Reconciliation is single-writer per site: attempts for links of the
//! same site serialize on that site's lock, links of different sites run
//! in parallel. Status queries read the last-committed snapshot and never
//! block on an in-flight reconciliation.

use std::sync::Arc;
use std::time::Instant;

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialBundle, CredentialStore};
use crate::model::{Endpoint, LinkSpec, LinkState, LinkStatus, RouterAccess, WaitPolicy};
use crate::resolver::RouterAccessResolver;
use crate::retry::{retry_until, RetryConfig};
use crate::{Error, Result};

/// An authenticated session reported by the connector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    /// Whether the remote router access acknowledged the link is
    /// accepting traffic, as opposed to merely a socket being open
    pub operational: bool,
}

/// Capability that establishes router connectivity
///
/// Injected at construction so the engine never hard-wires the router's
/// wire protocol; tests substitute a mock or a hand-rolled recorder.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt an authenticated session to the target using the bundle
    ///
    /// Must be atomic: either a usable session is returned or an error,
    /// never a half-established connection left behind.
    async fn connect(&self, target: &Endpoint, bundle: &CredentialBundle) -> Result<Session>;
}

/// Options for deleting a link
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    /// Also revoke the credential bundle the link was using
    pub with_credential: bool,
}

#[derive(Clone, Debug)]
struct LinkEntry {
    spec: LinkSpec,
    candidates: Vec<Endpoint>,
    status: LinkStatus,
}

struct Inner {
    credentials: Arc<CredentialStore>,
    resolver: RouterAccessResolver,
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
    /// Link entries keyed by "site/name"
    links: DashMap<String, LinkEntry>,
    /// Per-site reconciliation locks
    site_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Drives declared links to observed state
#[derive(Clone)]
pub struct LinkReconciler {
    inner: Arc<Inner>,
}

fn key_for(site: &str, name: &str) -> String {
    format!("{site}/{name}")
}

impl LinkReconciler {
    /// Create a reconciler with the default retry budget
    pub fn new(credentials: Arc<CredentialStore>, connector: Arc<dyn Connector>) -> Self {
        Self::with_retry_config(credentials, connector, RetryConfig::default())
    }

    /// Create a reconciler with a custom transient-error retry budget
    pub fn with_retry_config(
        credentials: Arc<CredentialStore>,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
    ) -> Self {
        let resolver = RouterAccessResolver::new(credentials.clone());
        Self {
            inner: Arc::new(Inner {
                credentials,
                resolver,
                connector,
                retry,
                links: DashMap::new(),
                site_locks: DashMap::new(),
            }),
        }
    }

    /// Apply a link spec and drive it toward `Connected`
    ///
    /// Validation failures and credential problems are rejected before
    /// any state is recorded. With wait policy `none` the call returns
    /// as soon as the attempt is scheduled; with `ready` or `true` it
    /// blocks until the attempt settles and returns the final snapshot.
    /// Connection failures are never returned as errors - they land in
    /// the status, queryable afterwards.
    pub async fn apply(
        &self,
        site: &str,
        spec: LinkSpec,
        peer_accesses: &[RouterAccess],
    ) -> Result<LinkStatus> {
        spec.validate()?;

        // Candidates come from the caller's spec. A credential the caller
        // supplied may pin the target to its embedded endpoint, but a
        // bundle auto-issued below must not narrow discovery: the full
        // cost-ordered candidate list stays available for fall-through.
        let candidates = self.inner.resolver.resolve_target(&spec, peer_accesses)?;
        let spec = self.resolve_credential(spec, peer_accesses)?;

        let key = key_for(site, &spec.name);
        let name = spec.name.clone();
        let status = LinkStatus {
            state: LinkState::Unknown,
            last_error: None,
            cost: spec.effective_cost(),
            target: candidates.first().cloned(),
            timeout: spec.effective_timeout(),
        };
        let wait = spec.wait;
        self.inner.links.insert(
            key.clone(),
            LinkEntry {
                spec,
                candidates,
                status: status.clone(),
            },
        );

        match wait {
            WaitPolicy::None => {
                let inner = self.inner.clone();
                let site = site.to_string();
                tokio::spawn(async move {
                    reconcile(&inner, &site, &key).await;
                });
                Ok(status)
            }
            WaitPolicy::Ready | WaitPolicy::True => {
                reconcile(&self.inner, site, &key).await;
                Ok(self.status(site, &name).unwrap_or(status))
            }
        }
    }

    /// Update a link's spec
    ///
    /// Cost, credential reference, and timeout change in place without
    /// tearing down a `Connected` link; a target endpoint change forces
    /// the link back through `Connecting`. A `Failed` link re-enters
    /// `Connecting` on any spec change.
    pub async fn update(
        &self,
        site: &str,
        new_spec: LinkSpec,
        peer_accesses: &[RouterAccess],
    ) -> Result<LinkStatus> {
        new_spec.validate()?;

        let key = key_for(site, &new_spec.name);
        let (old_spec, old_state) = {
            let entry = self.inner.links.get(&key).ok_or_else(|| {
                Error::validation(format!("unknown link: {}", new_spec.name))
            })?;
            (entry.spec.clone(), entry.status.state)
        };

        let endpoint_changed = old_spec.endpoint != new_spec.endpoint;
        let anything_changed = old_spec != new_spec;

        if old_state == LinkState::Connected && !endpoint_changed {
            // In-place update; the established session is untouched. An
            // unset credential keeps the bundle already in use; a set one
            // must reference a live bundle, same as apply.
            let mut new_spec = new_spec;
            if new_spec.credential.is_empty() {
                new_spec.credential = old_spec.credential.clone();
            } else if !self.inner.credentials.is_usable(&new_spec.credential) {
                return Err(Error::validation(format!(
                    "link {}: credential {} is unknown or revoked",
                    new_spec.name, new_spec.credential
                )));
            }
            let mut entry = self
                .inner
                .links
                .get_mut(&key)
                .ok_or_else(|| Error::validation(format!("unknown link: {}", new_spec.name)))?;
            entry.status.cost = new_spec.effective_cost();
            entry.status.timeout = new_spec.effective_timeout();
            entry.spec = new_spec;
            debug!(link = %key, "Updated link spec in place");
            return Ok(entry.status.clone());
        }

        if old_state == LinkState::Failed && !anything_changed {
            // Unchanged spec does not resurrect a failed link. A
            // concurrent delete may have removed the entry since the
            // snapshot above, so the re-read cannot assume presence.
            return self
                .inner
                .links
                .get(&key)
                .map(|e| e.status.clone())
                .ok_or_else(|| Error::validation(format!("unknown link: {}", new_spec.name)));
        }

        self.apply(site, new_spec, peer_accesses).await
    }

    /// Explicitly re-drive a link, typically one that is `Failed`
    pub async fn reapply(&self, site: &str, name: &str) -> Result<LinkStatus> {
        let key = key_for(site, name);
        if !self.inner.links.contains_key(&key) {
            return Err(Error::validation(format!("unknown link: {}", name)));
        }
        reconcile(&self.inner, site, &key).await;
        self.status(site, name)
            .ok_or_else(|| Error::validation(format!("unknown link: {}", name)))
    }

    /// Last observed status for a link; never blocks, never probes
    pub fn status(&self, site: &str, name: &str) -> Option<LinkStatus> {
        self.inner
            .links
            .get(&key_for(site, name))
            .map(|e| e.status.clone())
    }

    /// Remove a link's connector configuration
    ///
    /// Idempotent: deleting a link that does not exist is not an error.
    /// With `with_credential`, the bundle the link referenced is revoked
    /// as well (forward-only, per the credential store's semantics).
    pub fn delete(&self, site: &str, name: &str, opts: DeleteOptions) -> Result<()> {
        let key = key_for(site, name);
        if let Some((_, entry)) = self.inner.links.remove(&key) {
            info!(link = %key, "Deleted link");
            if opts.with_credential && !entry.spec.credential.is_empty() {
                self.inner.credentials.revoke(&entry.spec.credential);
            }
        }
        Ok(())
    }

    /// Resolve the credential reference, issuing a fresh bundle when the
    /// spec leaves it empty
    fn resolve_credential(
        &self,
        mut spec: LinkSpec,
        peer_accesses: &[RouterAccess],
    ) -> Result<LinkSpec> {
        if spec.credential.is_empty() {
            let issuing = peer_accesses
                .iter()
                .find(|a| a.issuer.is_some())
                .ok_or_else(|| {
                    Error::issuance(format!(
                        "link {}: no credential supplied and no router access can issue one",
                        spec.name
                    ))
                })?;
            let bundle = self.inner.credentials.issue(issuing)?;
            spec.credential = bundle.id;
        } else if !self.inner.credentials.is_usable(&spec.credential) {
            return Err(Error::validation(format!(
                "link {}: credential {} is unknown or revoked",
                spec.name, spec.credential
            )));
        }
        Ok(spec)
    }
}

impl Inner {
    fn site_lock(&self, site: &str) -> Arc<Mutex<()>> {
        self.site_locks
            .entry(site.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn set_status(&self, key: &str, f: impl FnOnce(&mut LinkStatus)) {
        if let Some(mut entry) = self.links.get_mut(key) {
            f(&mut entry.status);
        }
    }
}

/// Drive one link through Connecting to Connected or Failed
///
/// Holds the site lock for the whole attempt so writes to the same
/// site's router configuration never race. The configured timeout is a
/// monotonic deadline: candidates are walked in resolution order until
/// one succeeds, the retry budget is spent, or the deadline passes.
async fn reconcile(inner: &Inner, site: &str, key: &str) {
    let lock = inner.site_lock(site);
    let _guard = lock.lock().await;

    // Snapshot under the lock; the entry may have been deleted while we
    // waited for it
    let (spec, candidates) = match inner.links.get(key) {
        Some(entry) => (entry.spec.clone(), entry.candidates.clone()),
        None => return,
    };

    let bundle = match inner.credentials.get(&spec.credential) {
        Some(b) => b,
        None => {
            inner.set_status(key, |s| {
                s.state = LinkState::Failed;
                s.last_error = Some(format!("credential {} no longer exists", spec.credential));
            });
            return;
        }
    };

    let timeout = spec.effective_timeout();
    let deadline = Instant::now() + timeout;
    let wait = spec.wait;

    inner.set_status(key, |s| {
        s.state = LinkState::Connecting;
        s.last_error = None;
    });

    let mut last_error: Option<Error> = None;
    for candidate in &candidates {
        if Instant::now() >= deadline {
            break;
        }

        inner.set_status(key, |s| s.target = Some(candidate.clone()));
        debug!(link = %key, target = %candidate, "Attempting link");

        let attempt = retry_until(&inner.retry, deadline, key, || {
            let bundle = bundle.clone();
            let connector = inner.connector.clone();
            let candidate = candidate.clone();
            async move {
                // The deadline bounds the in-flight attempt too: on
                // expiry it is abandoned, not awaited to completion
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout(timeout));
                }
                let session =
                    match tokio::time::timeout(remaining, connector.connect(&candidate, &bundle))
                        .await
                    {
                        Ok(result) => result?,
                        Err(_) => return Err(Error::Timeout(timeout)),
                    };
                // wait=ready success means the remote access accepts
                // traffic, not merely that a session exists
                if wait == WaitPolicy::Ready && !session.operational {
                    return Err(Error::connect("session established but link is not operational"));
                }
                Ok(())
            }
        })
        .await;

        match attempt {
            Ok(()) => {
                info!(link = %key, target = %candidate, "Link connected");
                inner.set_status(key, |s| {
                    s.state = LinkState::Connected;
                    s.last_error = None;
                    s.target = Some(candidate.clone());
                });
                return;
            }
            Err(e) => {
                warn!(link = %key, target = %candidate, error = %e, "Candidate failed");
                last_error = Some(e);
            }
        }
    }

    let error = if Instant::now() >= deadline {
        Error::Timeout(timeout)
    } else {
        last_error.unwrap_or_else(|| Error::connect("no candidate endpoints"))
    };

    warn!(link = %key, error = %error, "Link failed");
    inner.set_status(key, |s| {
        s.state = LinkState::Failed;
        s.last_error = Some(error.to_string());
    });
}
