//! Scope registry: named quota classes and their rate strings.
//!
//! A registry is built once from configuration and is read-only afterwards.
//! Changing a scope's rate requires building a new registry (and new
//! throttles from it).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::rate::RateSpec;
use crate::error::{Result, SlidegateError};

/// Mapping of scope name to rate string.
///
/// A scope mapped to `None` (`~` in YAML) is deliberately unthrottled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeRegistry {
    rates: BTreeMap<String, Option<String>>,
}

impl ScopeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scope while building the registry.
    pub fn with_scope(mut self, scope: impl Into<String>, rate: Option<&str>) -> Self {
        self.rates.insert(scope.into(), rate.map(str::to_string));
        self
    }

    /// Parse a registry from a YAML mapping such as:
    ///
    /// ```yaml
    /// user: 1000/d
    /// anon: 60/m
    /// internal: ~
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let registry: ScopeRegistry = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Configuration(format!("Failed to parse scope rates: {}", e)))?;
        info!(scopes = registry.len(), "Loaded scope registry");
        Ok(registry)
    }

    /// Look up the rate string for a scope.
    ///
    /// Fails when no scope is given or the scope is not registered. A
    /// registered-but-unthrottled scope yields `Ok(None)`.
    pub fn rate_for(&self, scope: Option<&str>) -> Result<Option<&str>> {
        let scope = scope.filter(|s| !s.is_empty()).ok_or_else(|| {
            SlidegateError::Configuration("either a scope or an explicit rate must be set".to_string())
        })?;

        self.rates
            .get(scope)
            .map(|rate| rate.as_deref())
            .ok_or_else(|| {
                SlidegateError::Configuration(format!("no throttle rate configured for scope {:?}", scope))
            })
    }

    /// Look up and parse the quota for a scope.
    pub fn spec_for(&self, scope: Option<&str>) -> Result<Option<RateSpec>> {
        RateSpec::parse(self.rate_for(scope)?)
    }

    /// Parse every configured rate, failing on the first malformed one.
    pub fn validate(&self) -> Result<()> {
        for rate in self.rates.values() {
            RateSpec::parse(rate.as_deref())?;
        }
        Ok(())
    }

    /// Iterate over `(scope, rate)` pairs in scope order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.rates.iter().map(|(scope, rate)| (scope.as_str(), rate.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}
