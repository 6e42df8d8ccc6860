//! Endpoint resolution for discovery-style link creation
//!
//! When a link spec names an explicit target, resolution is bypassed
//! entirely. Otherwise the resolver derives candidate endpoints from the
//! peer site's router access declarations, ordered by cost class then by
//! declaration order so that retries walk the same sequence every time.

use std::sync::Arc;

use tracing::debug;

use crate::credentials::CredentialStore;
use crate::model::{AccessRole, Endpoint, LinkSpec, RouterAccess};
use crate::{Error, Result};

/// Resolves the endpoints a peer should use to reach a site
pub struct RouterAccessResolver {
    credentials: Arc<CredentialStore>,
}

impl RouterAccessResolver {
    /// Create a resolver backed by the given credential store
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Candidate endpoints for the given role, in deterministic order
    ///
    /// Ordering is by declared cost class, ties broken by declaration
    /// order (stable sort), so repeated resolution yields the same
    /// retry sequence. Fails when no access declares the role.
    pub fn resolve(&self, accesses: &[RouterAccess], role: AccessRole) -> Result<Vec<Endpoint>> {
        let mut candidates: Vec<(u32, Endpoint)> = Vec::new();
        for access in accesses {
            for endpoint in access.endpoints_for(role) {
                candidates.push((
                    endpoint.cost_class,
                    Endpoint {
                        host: endpoint.host.clone(),
                        port: endpoint.port,
                    },
                ));
            }
        }

        if candidates.is_empty() {
            return Err(Error::no_access(format!(
                "no router access declares role {}",
                role
            )));
        }

        candidates.sort_by_key(|(cost_class, _)| *cost_class);
        Ok(candidates.into_iter().map(|(_, e)| e).collect())
    }

    /// Candidate targets for a link spec
    ///
    /// An explicitly supplied host/port overrides resolution entirely.
    /// Failing that, a referenced credential bundle with an embedded
    /// endpoint pins the target to what the bundle was issued for.
    /// Resolution against the peer's accesses runs only in the
    /// generate-with-discovery case.
    pub fn resolve_target(
        &self,
        spec: &LinkSpec,
        peer_accesses: &[RouterAccess],
    ) -> Result<Vec<Endpoint>> {
        if let Some(endpoint) = &spec.endpoint {
            debug!(link = %spec.name, target = %endpoint, "Explicit target, resolution bypassed");
            return Ok(vec![endpoint.clone()]);
        }

        if !spec.credential.is_empty() {
            if let Some(bundle) = self.credentials.get(&spec.credential) {
                if let Some(endpoint) = bundle.endpoint {
                    debug!(
                        link = %spec.name,
                        bundle = %bundle.id,
                        target = %endpoint,
                        "Using endpoint embedded in credential bundle"
                    );
                    return Ok(vec![endpoint]);
                }
            }
        }

        self.resolve(peer_accesses, AccessRole::InterRouter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::generate_issuer;
    use crate::model::AccessEndpoint;

    fn resolver() -> RouterAccessResolver {
        RouterAccessResolver::new(Arc::new(CredentialStore::new()))
    }

    fn endpoint(role: AccessRole, host: &str, port: u16, cost_class: u32) -> AccessEndpoint {
        AccessEndpoint {
            role,
            host: host.into(),
            port,
            cost_class,
        }
    }

    fn access(name: &str, endpoints: Vec<AccessEndpoint>) -> RouterAccess {
        RouterAccess {
            name: name.into(),
            tls_profile: format!("{name}-profile"),
            issuer: None,
            endpoints,
        }
    }

    #[test]
    fn candidates_order_by_cost_class_then_declaration() {
        let accesses = vec![
            access(
                "primary",
                vec![
                    endpoint(AccessRole::InterRouter, "backup.example.com", 55671, 5),
                    endpoint(AccessRole::InterRouter, "main.example.com", 55671, 0),
                ],
            ),
            access(
                "secondary",
                // Same cost class as main; declared later, so tried later
                vec![endpoint(AccessRole::InterRouter, "alt.example.com", 55671, 0)],
            ),
        ];

        let candidates = resolver().resolve(&accesses, AccessRole::InterRouter).unwrap();
        let hosts: Vec<&str> = candidates.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(
            hosts,
            vec!["main.example.com", "alt.example.com", "backup.example.com"]
        );

        // Deterministic: resolving again walks the same sequence
        let again = resolver().resolve(&accesses, AccessRole::InterRouter).unwrap();
        assert_eq!(candidates, again);
    }

    #[test]
    fn missing_role_is_a_no_access_error() {
        let accesses = vec![access(
            "edge-only",
            vec![endpoint(AccessRole::Edge, "edge.example.com", 45671, 0)],
        )];

        let err = resolver()
            .resolve(&accesses, AccessRole::InterRouter)
            .unwrap_err();
        assert!(matches!(err, Error::NoAccess(_)));
    }

    /// Story: a manual target short-circuits resolution
    ///
    /// An explicit host/port on the spec wins even when the peer
    /// declares cheaper candidates.
    #[test]
    fn story_explicit_target_overrides_resolution() {
        let accesses = vec![access(
            "primary",
            vec![endpoint(AccessRole::InterRouter, "cheap.example.com", 55671, 0)],
        )];

        let spec = LinkSpec {
            endpoint: Some(Endpoint {
                host: "manual.example.com".into(),
                port: 45443,
            }),
            ..LinkSpec::named("manual-link")
        };

        let candidates = resolver().resolve_target(&spec, &accesses).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].host, "manual.example.com");
        assert_eq!(candidates[0].port, 45443);
    }

    /// Story: a credential's embedded endpoint pins the target
    #[test]
    fn story_bundle_endpoint_pins_target() {
        let credentials = Arc::new(CredentialStore::new());
        let issuing_access = RouterAccess {
            name: "east-ra".into(),
            tls_profile: "east-ra-profile".into(),
            issuer: Some(generate_issuer("east CA").unwrap()),
            endpoints: vec![endpoint(AccessRole::InterRouter, "east.example.com", 55671, 0)],
        };
        let bundle = credentials.issue(&issuing_access).unwrap();

        let resolver = RouterAccessResolver::new(credentials);
        let spec = LinkSpec {
            credential: bundle.id.clone(),
            ..LinkSpec::named("to-east")
        };

        // Peer declarations would point elsewhere; the bundle wins
        let other = vec![access(
            "other",
            vec![endpoint(AccessRole::InterRouter, "other.example.com", 55671, 0)],
        )];
        let candidates = resolver.resolve_target(&spec, &other).unwrap();
        assert_eq!(candidates[0].host, "east.example.com");
    }

    #[test]
    fn discovery_falls_back_to_peer_accesses() {
        let spec = LinkSpec::named("discovered");
        let accesses = vec![access(
            "primary",
            vec![endpoint(AccessRole::InterRouter, "east.example.com", 55671, 0)],
        )];

        let candidates = resolver().resolve_target(&spec, &accesses).unwrap();
        assert_eq!(candidates[0].host, "east.example.com");
    }
}
