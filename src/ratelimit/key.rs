//! Window key generation and handling.

/// Default namespace prefixed to every stored key.
pub const DEFAULT_NAMESPACE: &str = "ratelimit";

/// A key that uniquely identifies one sliding window.
///
/// The key is composed of the namespace, the action and the identifier, so
/// windows are never shared across actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Namespace shared by all keys of one limiter
    pub namespace: String,
    /// The action being limited
    pub action: String,
    /// The actor being limited
    pub identifier: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(namespace: &str, action: &str, identifier: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            action: action.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// The storage representation, `<namespace>:<action>:<identifier>`.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.action, self.identifier)
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
