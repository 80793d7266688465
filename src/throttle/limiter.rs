//! The sliding-window throttle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::identity::{AddressResolver, ConnectionMeta, IdentityResolver, PrincipalResolver};
use super::rate::RateSpec;
use super::registry::ScopeRegistry;
use crate::error::{Result, SlidegateError};
use crate::store::HistoryStore;

/// Prefix of every history key. Keys look like `throttle_<scope>_<identity>`
/// and must stay stable to share state with existing deployments.
pub const CACHE_KEY_PREFIX: &str = "throttle";

/// Default number of compare-and-set attempts in [`Consistency::Atomic`] mode.
pub const DEFAULT_MAX_RETRIES: u32 = 16;

/// How the read-prune-write cycle is applied to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Plain `get` then `set`. Concurrent checks on one key may overwrite
    /// each other's timestamps, so a window can admit more than its quota.
    #[default]
    BestEffort,
    /// `get` then `compare_and_set`, retried on conflict. Never admits more
    /// than the quota, but requires a store that supports compare-and-set.
    Atomic,
}

/// Outcome of a single throttle check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Suggested spacing before the next request, in seconds
    pub wait_seconds: Option<f64>,
    /// Free slots left in the window after this check; `None` when the
    /// request was not throttled at all
    pub remaining: Option<u64>,
}

impl Decision {
    fn unthrottled() -> Self {
        Self {
            admitted: true,
            wait_seconds: None,
            remaining: None,
        }
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// Retry-after hint in seconds.
    ///
    /// This spreads the rest of the window over the slots that must free up,
    /// so it is a pacing hint rather than the exact unblock time. `None` means
    /// no estimate is available.
    pub fn estimate_wait(&self) -> Option<f64> {
        self.wait_seconds
    }

    /// [`Decision::estimate_wait`] as a `Duration`, e.g. for `Retry-After`.
    pub fn retry_after(&self) -> Option<Duration> {
        self.wait_seconds
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// History after a check, paired with the decision it produced.
struct Outcome {
    history: Vec<f64>,
    decision: Decision,
}

/// A sliding-window throttle for one scope.
///
/// Holds no per-identity state itself; every check reads and writes the
/// identity's history in the shared [`HistoryStore`], so throttles in
/// different processes pointed at the same store enforce one quota.
pub struct Throttle {
    scope: String,
    spec: Option<RateSpec>,
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn IdentityResolver>,
    consistency: Consistency,
    max_retries: u32,
}

impl Throttle {
    /// Start building a throttle.
    pub fn builder<'a>() -> ThrottleBuilder<'a> {
        ThrottleBuilder::default()
    }

    /// Name of the scope this throttle enforces.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The quota, or `None` if the scope is unthrottled.
    pub fn spec(&self) -> Option<RateSpec> {
        self.spec
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// Store key holding the history for `identity`.
    pub fn cache_key(&self, identity: &str) -> String {
        format!("{}_{}_{}", CACHE_KEY_PREFIX, self.scope, identity)
    }

    /// Resolve the caller's identity from connection metadata and check it.
    pub async fn check(&self, meta: &ConnectionMeta) -> Result<Decision> {
        let identity = self.resolver.resolve(meta);
        self.check_and_record(&identity).await
    }

    /// Decide whether `identity` may make another request, recording it if so.
    ///
    /// Unthrottled scopes and empty identities are admitted without touching
    /// the store. Store failures are returned as-is.
    pub async fn check_and_record(&self, identity: &str) -> Result<Decision> {
        let Some(spec) = self.spec else {
            return Ok(Decision::unthrottled());
        };

        if identity.is_empty() {
            trace!(scope = %self.scope, "No caller identity, admitting");
            return Ok(Decision::unthrottled());
        }

        let key = self.cache_key(identity);
        trace!(key = %key, rate = %spec, "Checking throttle");

        let decision = match self.consistency {
            Consistency::BestEffort => {
                let history = self.store.get(&key).await?;
                let outcome = self.evaluate(spec, history);
                self.store
                    .set(&key, &outcome.history, spec.window().duration())
                    .await?;
                outcome.decision
            }
            Consistency::Atomic => self.check_atomic(spec, &key).await?,
        };

        if !decision.admitted {
            debug!(
                key = %key,
                rate = %spec,
                wait_seconds = ?decision.wait_seconds,
                "Throttle limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn check_atomic(&self, spec: RateSpec, key: &str) -> Result<Decision> {
        let ttl = spec.window().duration();

        for attempt in 1..=self.max_retries {
            let seen = self.store.get(key).await?;
            let outcome = self.evaluate(spec, seen.clone());

            if self
                .store
                .compare_and_set(key, &seen, &outcome.history, ttl)
                .await?
            {
                return Ok(outcome.decision);
            }

            debug!(key = %key, attempt = attempt, "History changed during check, retrying");
        }

        warn!(key = %key, attempts = self.max_retries, "Giving up on contended throttle key");
        Err(SlidegateError::Contention {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }

    /// Prune `history` to the current window and decide.
    fn evaluate(&self, spec: RateSpec, mut history: Vec<f64>) -> Outcome {
        let now = self.clock.now();
        let window = spec.window_secs();

        // Newest first, so expired entries sit at the tail.
        while history.last().is_some_and(|&t| t <= now - window) {
            history.pop();
        }

        let admitted = (history.len() as u64) < spec.count();
        if admitted {
            history.insert(0, now);
        }

        let decision = Decision {
            admitted,
            wait_seconds: wait_estimate(spec, &history, now),
            remaining: Some(spec.count().saturating_sub(history.len() as u64)),
        };

        Outcome { history, decision }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("scope", &self.scope)
            .field("spec", &self.spec)
            .field("clock", &self.clock)
            .field("resolver", &self.resolver)
            .field("consistency", &self.consistency)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn wait_estimate(spec: RateSpec, history: &[f64], now: f64) -> Option<f64> {
    let window = spec.window_secs();
    let remaining = match history.last() {
        Some(&oldest) => window - (now - oldest),
        None => window,
    };

    let available = spec.count() as i64 - history.len() as i64 + 1;
    if available <= 0 {
        return None;
    }
    Some(remaining / available as f64)
}

/// Builder for [`Throttle`].
///
/// The quota comes from an explicit rate if one is given, otherwise from the
/// registry entry for the scope.
#[derive(Default)]
pub struct ThrottleBuilder<'a> {
    scope: Option<String>,
    rate: Option<Option<String>>,
    registry: Option<&'a ScopeRegistry>,
    store: Option<Arc<dyn HistoryStore>>,
    clock: Option<Arc<dyn Clock>>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    consistency: Consistency,
    max_retries: Option<u32>,
}

impl<'a> ThrottleBuilder<'a> {
    /// Scope name, used for the registry lookup and in history keys.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Use this rate instead of looking the scope up.
    pub fn rate(mut self, rate: impl Into<String>) -> Self {
        self.rate = Some(Some(rate.into()));
        self
    }

    /// Never throttle, regardless of the registry.
    pub fn unthrottled(mut self) -> Self {
        self.rate = Some(None);
        self
    }

    pub fn registry(mut self, registry: &'a ScopeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Shared history store. Required.
    pub fn store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Identity policy for [`Throttle::check`]; defaults to
    /// [`PrincipalResolver`] over a one-proxy [`AddressResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Compare-and-set attempts per check in atomic mode.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Resolve the quota and build the throttle.
    ///
    /// Fails with a configuration error when neither a rate nor a registered
    /// scope is available, or no store was given, and with a malformed-rate
    /// error when the rate cannot be parsed.
    pub fn build(self) -> Result<Throttle> {
        let rate = match self.rate {
            Some(explicit) => explicit,
            None => {
                let empty = ScopeRegistry::new();
                self.registry
                    .unwrap_or(&empty)
                    .rate_for(self.scope.as_deref())?
                    .map(str::to_string)
            }
        };
        let spec = RateSpec::parse(rate.as_deref())?;

        let store = self.store.ok_or_else(|| {
            SlidegateError::Configuration("a history store is required to build a throttle".to_string())
        })?;

        let scope = self.scope.unwrap_or_default();
        debug!(
            scope = %scope,
            rate = ?spec.map(|s| s.to_string()),
            consistency = ?self.consistency,
            "Creating throttle"
        );

        Ok(Throttle {
            scope,
            spec,
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(PrincipalResolver::<AddressResolver>::default())),
            consistency: self.consistency,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
        })
    }
}
