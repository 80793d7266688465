//! Caller identity resolution.
//!
//! A throttle keys its history on an identity string. How that string is
//! derived is a policy decision, so it is expressed as the [`IdentityResolver`]
//! strategy rather than baked into the throttle.

use serde::{Deserialize, Serialize};

/// What the hosting application knows about the connection making a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMeta {
    /// Address of the peer that opened the connection
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Raw `X-Forwarded-For` value, if any
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Id of the authenticated principal, if the request is authenticated
    #[serde(default)]
    pub principal: Option<String>,
}

impl ConnectionMeta {
    /// Metadata for a direct connection from `remote_addr`.
    pub fn from_remote(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            ..Self::default()
        }
    }

    /// Attach a forwarded-for chain.
    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    /// Attach an authenticated principal id.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// Strategy for turning connection metadata into a throttle identity.
///
/// Implementations must be deterministic and free of side effects. An empty
/// string means no identity could be established; the throttle admits such
/// requests without consulting the store.
pub trait IdentityResolver: Send + Sync + std::fmt::Debug {
    /// Resolve the identity for a connection.
    fn resolve(&self, meta: &ConnectionMeta) -> String;
}

/// Identifies callers by network address, honoring a trusted proxy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressResolver {
    num_proxies: Option<usize>,
}

impl AddressResolver {
    /// Create a resolver that trusts `num_proxies` proxies in front of the
    /// service.
    ///
    /// - `Some(0)` ignores `X-Forwarded-For` entirely.
    /// - `Some(n)` picks the `n`th address from the right of the chain.
    /// - `None` means the proxy depth is unknown, so the whole chain (with
    ///   whitespace removed) becomes the identity.
    pub fn new(num_proxies: Option<usize>) -> Self {
        Self { num_proxies }
    }

    /// Number of trusted proxies.
    pub fn num_proxies(&self) -> Option<usize> {
        self.num_proxies
    }
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new(Some(1))
    }
}

impl IdentityResolver for AddressResolver {
    fn resolve(&self, meta: &ConnectionMeta) -> String {
        let remote = || meta.remote_addr.as_deref().map(str::trim).unwrap_or("").to_string();

        match (self.num_proxies, meta.forwarded_for.as_deref()) {
            (Some(0), _) | (Some(_), None) => remote(),
            (Some(n), Some(chain)) => {
                let addrs: Vec<&str> = chain.split(',').collect();
                let index = addrs.len() - n.min(addrs.len());
                addrs[index].trim().to_string()
            }
            (None, Some(chain)) if !chain.is_empty() => {
                chain.split_whitespace().collect::<String>()
            }
            (None, _) => remote(),
        }
    }
}

/// Prefers the authenticated principal, falling back to another resolver for
/// anonymous requests.
#[derive(Debug, Clone, Default)]
pub struct PrincipalResolver<R = AddressResolver> {
    fallback: R,
}

impl<R: IdentityResolver> PrincipalResolver<R> {
    /// Create a resolver that uses `fallback` when no principal is present.
    pub fn new(fallback: R) -> Self {
        Self { fallback }
    }
}

impl<R: IdentityResolver> IdentityResolver for PrincipalResolver<R> {
    fn resolve(&self, meta: &ConnectionMeta) -> String {
        match meta.principal.as_deref().map(str::trim) {
            Some(principal) if !principal.is_empty() => principal.to_string(),
            _ => self.fallback.resolve(meta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_connection_uses_remote_addr() {
        let meta = ConnectionMeta::from_remote("10.0.0.7");
        assert_eq!(AddressResolver::new(Some(1)).resolve(&meta), "10.0.0.7");
        assert_eq!(AddressResolver::new(None).resolve(&meta), "10.0.0.7");
    }

    #[test]
    fn test_zero_proxies_ignores_forwarded_chain() {
        let meta = ConnectionMeta::from_remote("10.0.0.7").with_forwarded_for("1.1.1.1, 2.2.2.2");
        assert_eq!(AddressResolver::new(Some(0)).resolve(&meta), "10.0.0.7");
    }

    #[test]
    fn test_picks_from_the_right_of_the_chain() {
        let meta = ConnectionMeta::from_remote("10.0.0.7")
            .with_forwarded_for(" 203.0.113.9 , 198.51.100.2,192.0.2.1 ");

        assert_eq!(AddressResolver::new(Some(1)).resolve(&meta), "192.0.2.1");
        assert_eq!(AddressResolver::new(Some(2)).resolve(&meta), "198.51.100.2");
        assert_eq!(AddressResolver::new(Some(3)).resolve(&meta), "203.0.113.9");
    }

    #[test]
    fn test_proxy_count_is_clamped_to_chain_length() {
        let meta = ConnectionMeta::from_remote("10.0.0.7").with_forwarded_for("203.0.113.9, 192.0.2.1");
        assert_eq!(AddressResolver::new(Some(5)).resolve(&meta), "203.0.113.9");
    }

    #[test]
    fn test_unknown_proxy_depth_uses_whole_chain() {
        let meta = ConnectionMeta::from_remote("10.0.0.7").with_forwarded_for("203.0.113.9, 192.0.2.1");
        assert_eq!(AddressResolver::new(None).resolve(&meta), "203.0.113.9,192.0.2.1");
    }

    #[test]
    fn test_no_metadata_yields_empty_identity() {
        let meta = ConnectionMeta::default();
        assert_eq!(AddressResolver::default().resolve(&meta), "");
        assert_eq!(PrincipalResolver::<AddressResolver>::default().resolve(&meta), "");
    }

    #[test]
    fn test_principal_wins_over_address() {
        let resolver = PrincipalResolver::new(AddressResolver::new(Some(1)));

        let meta = ConnectionMeta::from_remote("10.0.0.7").with_principal("user-42");
        assert_eq!(resolver.resolve(&meta), "user-42");

        let anonymous = ConnectionMeta::from_remote("10.0.0.7").with_principal("  ");
        assert_eq!(resolver.resolve(&anonymous), "10.0.0.7");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = PrincipalResolver::<AddressResolver>::default();
        let meta = ConnectionMeta::from_remote("10.0.0.7").with_forwarded_for("1.1.1.1");
        assert_eq!(resolver.resolve(&meta), resolver.resolve(&meta.clone()));
    }
}
