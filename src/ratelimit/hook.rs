//! Lockout hooks fired when a limit is breached.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error};

/// Details passed to a lockout hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutEvent {
    /// The actor that was rejected
    pub identifier: String,
    /// The action that was rejected
    pub action: String,
    /// Live entries in the window when the attempt arrived
    pub count: u64,
    /// The policy's maximum
    pub limit: u64,
    /// When the rejected attempt leaves the window
    pub reset_at: DateTime<Utc>,
}

/// Callback invoked after a rejection, for alerting or escalation.
///
/// Hooks run detached from the check that triggered them. Errors and
/// panics are logged and never reach the caller of `check_limit`.
#[async_trait]
pub trait LockoutHook: Send + Sync {
    /// Handle one lockout.
    async fn on_lockout(&self, event: LockoutEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> LockoutHook for F
where
    F: Fn(LockoutEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_lockout(&self, event: LockoutEvent) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Run `hook` on its own task.
pub(crate) fn fire(hook: Arc<dyn LockoutHook>, event: LockoutEvent) {
    tokio::spawn(async move {
        let action = event.action.clone();
        let identifier = event.identifier.clone();

        match AssertUnwindSafe(hook.on_lockout(event)).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(action = %action, identifier = %identifier, "Lockout hook completed");
            }
            Ok(Err(e)) => {
                error!(
                    action = %action,
                    identifier = %identifier,
                    error = %e,
                    "Lockout hook failed"
                );
            }
            Err(_) => {
                error!(action = %action, identifier = %identifier, "Lockout hook panicked");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn event() -> LockoutEvent {
        LockoutEvent {
            identifier: "user-1".to_string(),
            action: "messages".to_string(),
            count: 3,
            limit: 3,
            reset_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_closure_hook_receives_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hook: Arc<dyn LockoutHook> = Arc::new(move |event: LockoutEvent| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok::<(), anyhow::Error>(())
            }
        });

        fire(hook, event());

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.identifier, "user-1");
        assert_eq!(received.limit, 3);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let hook: Arc<dyn LockoutHook> = Arc::new(|_event: LockoutEvent| async move {
            if true {
                panic!("hook blew up");
            }
            Ok::<(), anyhow::Error>(())
        });

        fire(hook, event());

        // Hooks fired afterwards still run.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let follow_up: Arc<dyn LockoutHook> = Arc::new(move |event: LockoutEvent| {
            let tx = tx.clone();
            async move {
                tx.send(event.action)?;
                Ok::<(), anyhow::Error>(())
            }
        });
        fire(follow_up, event());

        let action = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action, "messages");
    }
}
