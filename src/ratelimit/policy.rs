//! Rate limit policies and their registry.
//!
//! A policy says how many events an action admits per sliding window. The
//! registry is assembled once at startup from the built-in table, any
//! configured overrides and any lockout hooks registered in code; after
//! that it is read-only.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::hook::LockoutHook;
use crate::error::{FloodgateError, Result};

/// Action name of the catch-all policy.
pub const WILDCARD_ACTION: &str = "*";

/// Serializable definition of a policy, as found in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum counted events per window
    pub max: u64,
    /// Do not count attempts that end up succeeding
    #[serde(default)]
    pub skip_successful: bool,
    /// Do not count attempts that are rejected or end up failing
    #[serde(default)]
    pub skip_failed: bool,
}

impl PolicyConfig {
    /// Shorthand for a policy that counts every attempt.
    pub fn new(window: Duration, max: u64) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max,
            skip_successful: false,
            skip_failed: false,
        }
    }
}

/// A resolved, validated policy for one action.
#[derive(Clone)]
pub struct Policy {
    /// The action this policy governs
    pub action: String,
    /// Window length
    pub window: Duration,
    /// Maximum counted events per window
    pub max: u64,
    /// Do not count attempts that end up succeeding
    pub skip_successful: bool,
    /// Do not count attempts that are rejected or end up failing
    pub skip_failed: bool,
    /// Invoked after a rejection
    pub lockout_hook: Option<Arc<dyn LockoutHook>>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("action", &self.action)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .field("lockout_hook", &self.lockout_hook.is_some())
            .finish()
    }
}

impl Policy {
    fn from_config(action: &str, config: &PolicyConfig) -> Result<Self> {
        if config.window_ms == 0 {
            return Err(FloodgateError::Config(format!(
                "policy '{}' must have a window greater than zero",
                action
            )));
        }
        if config.max == 0 {
            return Err(FloodgateError::Config(format!(
                "policy '{}' must allow at least one event",
                action
            )));
        }

        Ok(Self {
            action: action.to_string(),
            window: Duration::from_millis(config.window_ms),
            max: config.max,
            skip_successful: config.skip_successful,
            skip_failed: config.skip_failed,
            lockout_hook: None,
        })
    }

    /// The serializable form of this policy.
    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            window_ms: u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            max: self.max,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
        }
    }
}

/// The built-in policy table for the marketplace's guarded actions.
pub fn default_policies() -> BTreeMap<String, PolicyConfig> {
    [
        ("messages", PolicyConfig::new(Duration::from_secs(60), 30)),
        ("uploads", PolicyConfig::new(Duration::from_secs(3600), 10)),
        ("connections", PolicyConfig::new(Duration::from_secs(60), 5)),
        ("conversations", PolicyConfig::new(Duration::from_secs(3600), 10)),
        ("typing", PolicyConfig::new(Duration::from_secs(10), 20)),
        ("global", PolicyConfig::new(Duration::from_secs(15 * 60), 100)),
    ]
    .into_iter()
    .map(|(action, policy)| (action.to_string(), policy))
    .collect()
}

/// Read-only map from action name to policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// Start building a registry.
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    /// A registry holding only the built-in table.
    pub fn with_defaults() -> Result<Self> {
        Self::builder().defaults().build()
    }

    /// Find the policy for an action, falling back to the wildcard.
    pub fn resolve(&self, action: &str) -> Option<&Arc<Policy>> {
        self.policies
            .get(action)
            .or_else(|| self.policies.get(WILDCARD_ACTION))
    }

    /// Look up an action without the wildcard fallback.
    pub fn get(&self, action: &str) -> Option<&Arc<Policy>> {
        self.policies.get(action)
    }

    /// Names of all explicitly registered actions, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    /// Whether a wildcard policy is registered.
    pub fn has_wildcard(&self) -> bool {
        self.policies.contains_key(WILDCARD_ACTION)
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policy is registered.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Builder for [`PolicyRegistry`].
#[derive(Default)]
pub struct PolicyRegistryBuilder {
    configs: BTreeMap<String, PolicyConfig>,
    hooks: HashMap<String, Arc<dyn LockoutHook>>,
}

impl PolicyRegistryBuilder {
    /// Add the built-in table. Later calls override these entries.
    pub fn defaults(mut self) -> Self {
        self.configs.extend(default_policies());
        self
    }

    /// Add or replace one policy.
    pub fn policy(mut self, action: impl Into<String>, config: PolicyConfig) -> Self {
        self.configs.insert(action.into(), config);
        self
    }

    /// Add or replace many policies, typically from configuration.
    pub fn overrides<I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, PolicyConfig)>,
    {
        for (action, config) in overrides {
            debug!(action = %action, max = config.max, window_ms = config.window_ms, "Policy override");
            self.configs.insert(action, config);
        }
        self
    }

    /// Attach a lockout hook to an action.
    pub fn lockout_hook(mut self, action: impl Into<String>, hook: Arc<dyn LockoutHook>) -> Self {
        self.hooks.insert(action.into(), hook);
        self
    }

    /// Validate everything and freeze the registry.
    pub fn build(mut self) -> Result<PolicyRegistry> {
        let mut policies = HashMap::with_capacity(self.configs.len());

        for (action, config) in &self.configs {
            if action.is_empty() {
                return Err(FloodgateError::Config(
                    "policy action name must not be empty".to_string(),
                ));
            }
            let mut policy = Policy::from_config(action, config)?;
            policy.lockout_hook = self.hooks.remove(action);
            policies.insert(action.clone(), Arc::new(policy));
        }

        if let Some(action) = self.hooks.keys().next() {
            return Err(FloodgateError::Config(format!(
                "lockout hook registered for unknown action '{}'",
                action
            )));
        }

        info!(policies = policies.len(), "Policy registry built");
        Ok(PolicyRegistry { policies })
    }
}
