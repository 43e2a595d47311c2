//! The limiter facade.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use super::backend::{WindowEntry, WindowStore};
use super::clock::{duration_ms, Clock, SystemClock};
use super::hook::{self, LockoutEvent};
use super::key::{WindowKey, DEFAULT_NAMESPACE};
use super::policy::{Policy, PolicyRegistry, PolicyRegistryBuilder, WILDCARD_ACTION};
use super::window::{self, Decision, EntryTicket};
use crate::config::FloodgateConfig;
use crate::error::{FloodgateError, Result};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::store::{LocalStore, LocalStoreConfig, RedisStore};

/// How a guarded action ended, reported after an admitted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action completed
    Succeeded,
    /// The action failed
    Failed,
}

/// Per-actor, per-action sliding-window rate limiter.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
pub struct Limiter {
    store: Arc<dyn WindowStore>,
    /// Kept so the sweeper can be stopped on shutdown
    local: Option<Arc<LocalStore>>,
    policies: PolicyRegistry,
    metrics: MetricsAggregator,
    clock: Arc<dyn Clock>,
    namespace: String,
    /// Actions that reached a policy only through the wildcard, so
    /// `reset_limits` can find their keys. Grows with every distinct action
    /// name routed through `*`; callers should not pass unbounded action
    /// names to a limiter with a wildcard policy.
    wildcard_actions: DashSet<String>,
}

impl Limiter {
    /// Start building a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Build a limiter from configuration.
    ///
    /// `policies` carries code-side registrations such as lockout hooks;
    /// configured policies are applied over it. When a shared store is
    /// configured but cannot be reached, the limiter falls back to the
    /// local store.
    pub async fn from_config(config: &FloodgateConfig, policies: PolicyRegistryBuilder) -> Result<Self> {
        config.validate()?;

        let registry = policies.overrides(config.policies.clone()).build()?;
        let mut builder = Limiter::builder()
            .policies(registry)
            .namespace(config.limiter.namespace.clone())
            .local_store_config(config.limiter.local_store());

        if let Some(shared) = &config.shared {
            match RedisStore::connect(shared.redis_store()).await {
                Ok(store) => builder = builder.store(Arc::new(store)),
                Err(e) => {
                    warn!(
                        url = %shared.url,
                        error = %e,
                        "Shared store unreachable, falling back to local rate limiting"
                    );
                }
            }
        }

        builder.build()
    }

    /// Check and count one attempt of `action` by `identifier`.
    ///
    /// Store failures never surface here; they produce an allowed decision
    /// with [`Decision::error`] set.
    #[instrument(level = "debug", skip(self), fields(backend = self.store.name()))]
    pub async fn check_limit(&self, action: &str, identifier: &str) -> Result<Decision> {
        validate(action, identifier)?;
        let now = self.clock.now_ms();

        let Some(policy) = self.resolve(action) else {
            warn!(
                action = %action,
                "No rate limit policy registered for action, allowing"
            );
            self.metrics.record(action, identifier, false, false);
            return Ok(Decision::unlimited(now));
        };

        let key = self.storage_key(action, identifier);
        let entry = WindowEntry::new(now);

        // Under skip_failed a rejected attempt is never logged.
        let counted = if policy.skip_failed {
            self.store
                .purge_count_admit(&key, &entry, policy.window, policy.max)
                .await
        } else {
            self.store
                .purge_count_insert(&key, &entry, policy.window)
                .await
        };

        let count = match counted {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    action = %action,
                    identifier = %identifier,
                    error = %e,
                    "Window store failed, allowing request"
                );
                self.metrics.record(action, identifier, false, true);
                return Ok(Decision::degraded(policy.max, policy.window, now, e.to_string()));
            }
        };

        let mut decision = window::decide(count, policy.max, policy.window, now);

        if decision.allowed {
            if policy.skip_successful || policy.skip_failed {
                decision.ticket = Some(EntryTicket {
                    action: action.to_string(),
                    identifier: identifier.to_string(),
                    member: entry.member.clone(),
                    at_ms: entry.at_ms,
                });
            }
            trace!(
                key = %key,
                count = count,
                remaining = decision.remaining,
                "Rate limit check passed"
            );
        } else {
            debug!(
                key = %key,
                count = count,
                limit = policy.max,
                "Rate limit exceeded"
            );

            if let Some(lockout_hook) = &policy.lockout_hook {
                hook::fire(
                    lockout_hook.clone(),
                    LockoutEvent {
                        identifier: identifier.to_string(),
                        action: action.to_string(),
                        count,
                        limit: policy.max,
                        reset_at: decision.reset_at,
                    },
                );
            }
        }

        self.metrics.record(action, identifier, !decision.allowed, false);
        Ok(decision)
    }

    /// How long until a check would be admitted, without counting anything.
    #[instrument(level = "debug", skip(self))]
    pub async fn time_until_allowed(&self, action: &str, identifier: &str) -> Result<Duration> {
        validate(action, identifier)?;
        let Some(policy) = self.resolve(action) else {
            return Ok(Duration::ZERO);
        };

        let now = self.clock.now_ms();
        let key = self.storage_key(action, identifier);
        let window_start = now.saturating_sub(duration_ms(policy.window));

        match self.store.live_entries(&key, window_start).await {
            Ok(live) => Ok(window::wait_time(&live, policy.max, policy.window, now)),
            Err(e) => {
                warn!(
                    action = %action,
                    identifier = %identifier,
                    error = %e,
                    "Window store failed, reporting no wait"
                );
                Ok(Duration::ZERO)
            }
        }
    }

    /// Report how an admitted action ended.
    ///
    /// Retracts the ticket's entry when the policy does not count that
    /// outcome. Returns whether an entry was retracted.
    pub async fn report_outcome(&self, ticket: &EntryTicket, outcome: Outcome) -> Result<bool> {
        let Some(policy) = self.resolve(&ticket.action) else {
            return Ok(false);
        };

        let uncounted = match outcome {
            Outcome::Succeeded => policy.skip_successful,
            Outcome::Failed => policy.skip_failed,
        };
        if !uncounted {
            return Ok(false);
        }

        let key = self.storage_key(&ticket.action, &ticket.identifier);
        let entry = WindowEntry {
            member: ticket.member.clone(),
            at_ms: ticket.at_ms,
        };
        let retracted = self.store.retract(&key, &entry).await?;

        debug!(key = %key, outcome = ?outcome, retracted = retracted, "Outcome reported");
        Ok(retracted)
    }

    /// Drop every window held for `identifier` and forget its metrics.
    ///
    /// Policies are untouched. Returns `false` if the store failed.
    #[instrument(level = "debug", skip(self))]
    pub async fn reset_limits(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;

        // Registered actions include `*` itself, which callers may check directly.
        let mut actions: Vec<String> = self
            .policies
            .actions()
            .into_iter()
            .map(str::to_string)
            .collect();
        actions.extend(self.wildcard_actions.iter().map(|a| a.key().clone()));

        let keys: Vec<String> = actions
            .iter()
            .map(|action| self.storage_key(action, identifier))
            .collect();

        match self.store.clear(&keys).await {
            Ok(removed) => {
                self.metrics.clear_identifier(identifier);
                info!(identifier = %identifier, removed = removed, "Rate limits reset");
                Ok(true)
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to reset rate limits");
                Ok(false)
            }
        }
    }

    /// Copy of the current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The live counters.
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// The policy registry in use.
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Name of the active store: `"local"` or `"redis"`.
    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    /// Stop background work owned by the limiter.
    pub async fn shutdown(&self) {
        if let Some(local) = &self.local {
            local.shutdown().await;
        }
    }

    fn resolve(&self, action: &str) -> Option<Arc<Policy>> {
        let policy = self.policies.resolve(action)?;
        if policy.action == WILDCARD_ACTION && action != WILDCARD_ACTION {
            self.wildcard_actions.insert(action.to_string());
        }
        Some(policy.clone())
    }

    fn storage_key(&self, action: &str, identifier: &str) -> String {
        WindowKey::new(&self.namespace, action, identifier).to_storage_key()
    }
}

fn validate(action: &str, identifier: &str) -> Result<()> {
    if action.trim().is_empty() {
        return Err(FloodgateError::InvalidArgument(
            "action must not be empty".to_string(),
        ));
    }
    validate_identifier(identifier)
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(FloodgateError::InvalidArgument(
            "identifier must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder {
    policies: Option<PolicyRegistry>,
    namespace: String,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn WindowStore>>,
    local_config: LocalStoreConfig,
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self {
            policies: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            clock: Arc::new(SystemClock),
            store: None,
            local_config: LocalStoreConfig::default(),
        }
    }
}

impl LimiterBuilder {
    /// Use this registry instead of the built-in table.
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Prefix for every stored key.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Time source, mostly for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an explicit store. Without one, a local store is started.
    pub fn store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Settings for the local store, if one is started.
    pub fn local_store_config(mut self, config: LocalStoreConfig) -> Self {
        self.local_config = config;
        self
    }

    /// Build the limiter. Must be called from within a Tokio runtime when
    /// no explicit store was given.
    pub fn build(self) -> Result<Limiter> {
        if self.namespace.is_empty() {
            return Err(FloodgateError::Config("namespace must not be empty".to_string()));
        }

        let policies = match self.policies {
            Some(policies) => policies,
            None => PolicyRegistry::with_defaults()?,
        };

        let (store, local): (Arc<dyn WindowStore>, Option<Arc<LocalStore>>) = match self.store {
            Some(store) => (store, None),
            None => {
                let local = Arc::new(LocalStore::start(self.local_config, self.clock.clone()));
                let store: Arc<dyn WindowStore> = local.clone();
                (store, Some(local))
            }
        };

        info!(
            backend = store.name(),
            namespace = %self.namespace,
            policies = policies.len(),
            "Rate limiter initialized"
        );

        Ok(Limiter {
            store,
            local,
            policies,
            metrics: MetricsAggregator::new(),
            clock: self.clock,
            namespace: self.namespace,
            wildcard_actions: DashSet::new(),
        })
    }
}
