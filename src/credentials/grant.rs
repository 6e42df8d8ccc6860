//! Bootstrap access grants
//!
//! A grant is the redeemable half of the link bootstrap handshake: the
//! publishing site creates one, hands its secret code to a peer out of
//! band, and the peer redeems it to receive a freshly issued credential
//! bundle for the grant's router access. Grants are TTL'd and
//! redemption-counted so a leaked code has a bounded blast radius.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;

use super::{CredentialBundle, CredentialStore};
use crate::model::RouterAccess;
use crate::{Error, Result, DEFAULT_GRANT_TTL_SECS};

/// The secret half of an access grant
#[derive(Clone)]
pub struct GrantCode {
    /// The raw code bytes
    raw: Vec<u8>,
    /// The code as a string
    string: String,
}

impl GrantCode {
    /// Generate a new random grant code
    pub fn generate() -> Self {
        let mut raw = vec![0u8; 32];
        aws_lc_rs::rand::fill(&mut raw).expect("random generation failed");

        let string = URL_SAFE_NO_PAD.encode(&raw);

        Self { raw, string }
    }

    /// Reconstruct a code from its string form (for redemption)
    pub fn from_string(s: &str) -> Self {
        let raw = URL_SAFE_NO_PAD.decode(s).unwrap_or_default();
        Self {
            raw,
            string: s.to_string(),
        }
    }

    /// Get the code as a string
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// Get a SHA-256 hash of the code (for storage)
    pub fn hash(&self) -> String {
        use aws_lc_rs::digest::{digest, SHA256};
        let hash = digest(&SHA256, &self.raw);
        URL_SAFE_NO_PAD.encode(hash.as_ref())
    }
}

impl std::fmt::Debug for GrantCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret in debug output
        f.debug_struct("GrantCode").field("hash", &self.hash()).finish()
    }
}

impl std::fmt::Display for GrantCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string)
    }
}

/// Grant metadata kept by the store; never holds the raw code
#[derive(Clone, Debug)]
pub struct GrantMetadata {
    /// Hash of the grant code
    pub code_hash: String,
    /// When the grant expires
    pub expires_at: Instant,
    /// How many redemptions the grant allows in total
    pub redemptions_allowed: u32,
    /// How many redemptions have happened
    pub redeemed: u32,
    /// Router access this grant issues credentials for
    pub router_access: String,
}

impl GrantMetadata {
    fn redeemable(&self, now: Instant) -> bool {
        now < self.expires_at && self.redeemed < self.redemptions_allowed
    }
}

/// Thread-safe store of outstanding access grants
pub struct GrantStore {
    /// Grants indexed by name
    grants: DashMap<String, GrantMetadata>,
    /// Default TTL for new grants
    default_ttl: Duration,
}

impl GrantStore {
    /// Create a store with the default one hour TTL
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
            default_ttl: Duration::from_secs(DEFAULT_GRANT_TTL_SECS),
        }
    }

    /// Create a store with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            grants: DashMap::new(),
            default_ttl: ttl,
        }
    }

    /// Create a grant for the given router access
    ///
    /// Returns the secret code; only its hash is stored. The default of
    /// one allowed redemption makes grants one-shot unless the caller
    /// opts into more.
    pub fn create(
        &self,
        name: &str,
        router_access: &str,
        redemptions_allowed: u32,
    ) -> Result<GrantCode> {
        if redemptions_allowed == 0 {
            return Err(Error::validation(format!(
                "grant {}: redemptions allowed must be at least 1",
                name
            )));
        }

        let code = GrantCode::generate();
        let metadata = GrantMetadata {
            code_hash: code.hash(),
            expires_at: Instant::now() + self.default_ttl,
            redemptions_allowed,
            redeemed: 0,
            router_access: router_access.to_string(),
        };

        self.grants.insert(name.to_string(), metadata);
        Ok(code)
    }

    /// Check whether a grant would accept the given code, without
    /// consuming a redemption
    pub fn validate(&self, name: &str, code: &str) -> bool {
        match self.grants.get(name) {
            Some(metadata) => {
                metadata.redeemable(Instant::now())
                    && GrantCode::from_string(code).hash() == metadata.code_hash
            }
            None => false,
        }
    }

    /// Redeem a grant: consume one redemption and mint a fresh bundle
    ///
    /// The supplied access must be the one the grant was created for;
    /// expired, exhausted, forged, and misdirected redemptions are all
    /// rejected without touching the credential store.
    pub fn redeem(
        &self,
        name: &str,
        code: &str,
        access: &RouterAccess,
        credentials: &CredentialStore,
    ) -> Result<CredentialBundle> {
        {
            let mut metadata = self
                .grants
                .get_mut(name)
                .ok_or_else(|| Error::issuance(format!("unknown access grant: {}", name)))?;

            if !metadata.redeemable(Instant::now()) {
                return Err(Error::issuance(format!(
                    "access grant {} is expired or exhausted",
                    name
                )));
            }
            if GrantCode::from_string(code).hash() != metadata.code_hash {
                return Err(Error::issuance(format!(
                    "access grant {}: code rejected",
                    name
                )));
            }
            if metadata.router_access != access.name {
                return Err(Error::issuance(format!(
                    "access grant {} was created for router access '{}', not '{}'",
                    name, metadata.router_access, access.name
                )));
            }

            metadata.redeemed += 1;
        }

        // Redemption is committed; issuance failure does not refund it,
        // matching the one-shot semantics of a consumed code.
        credentials.issue(access)
    }

    /// Remove expired grants (for cleanup)
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.grants.retain(|_, v| now < v.expires_at);
    }

    /// Number of grants in the store
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl Default for GrantStore {
    fn default() -> Self {
        Self::new()
    }
}
