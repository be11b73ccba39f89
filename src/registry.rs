use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Live sessions by process id, used to route cancel requests arriving on other connections.
///
/// Cheap to clone; every clone refers to the same table.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    last_pid: AtomicI32,
    sessions: Mutex<HashMap<i32, Handle>>,
}

struct Handle {
    secret_key: i32,
    /// Cancels the query currently running on the session, if any.
    running: Option<CancellationToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<i32, Handle>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a process id for a new session.
    pub fn next_pid(&self) -> i32 {
        self.inner.last_pid.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, pid: i32, secret_key: i32) {
        self.sessions().insert(
            pid,
            Handle {
                secret_key,
                running: None,
            },
        );
    }

    pub fn unregister(&self, pid: i32) {
        self.sessions().remove(&pid);
    }

    /// Cancels the running query of `pid` if the secret matches. Returns whether a query was
    /// interrupted.
    pub fn cancel(&self, pid: i32, secret_key: i32) -> bool {
        let sessions = self.sessions();
        match sessions.get(&pid) {
            Some(handle) if handle.secret_key == secret_key => match &handle.running {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => {
                    debug!(pid, "cancel request with no running query");
                    false
                }
            },
            _ => {
                debug!(pid, "cancel request for unknown session or wrong key");
                false
            }
        }
    }

    /// Marks the start of a query on `pid`. The returned guard owns the query's cancellation
    /// token, a child of `parent`, and clears it when dropped.
    pub fn begin_query(&self, pid: i32, parent: &CancellationToken) -> QueryGuard {
        let token = parent.child_token();
        if let Some(handle) = self.sessions().get_mut(&pid) {
            handle.running = Some(token.clone());
        }
        QueryGuard {
            registry: self.clone(),
            pid,
            token,
        }
    }
}

pub struct QueryGuard {
    registry: CancelRegistry,
    pid: i32,
    token: CancellationToken,
}

impl QueryGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.registry.sessions().get_mut(&self.pid) {
            handle.running = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_unique() {
        let registry = CancelRegistry::new();

        assert_ne!(registry.next_pid(), registry.next_pid());
    }

    #[test]
    fn cancel_requires_matching_secret() {
        let registry = CancelRegistry::new();
        registry.register(1, 42);
        let guard = registry.begin_query(1, &CancellationToken::new());

        assert!(!registry.cancel(1, 7));
        assert!(!guard.token().is_cancelled());

        assert!(registry.cancel(1, 42));
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn cancel_without_running_query_is_ignored() {
        let registry = CancelRegistry::new();
        registry.register(1, 42);
        drop(registry.begin_query(1, &CancellationToken::new()));

        assert!(!registry.cancel(1, 42));
    }

    #[test]
    fn unregistered_sessions_cannot_be_cancelled() {
        let registry = CancelRegistry::new();
        registry.register(1, 42);
        let guard = registry.begin_query(1, &CancellationToken::new());
        registry.unregister(1);

        assert!(!registry.cancel(1, 42));
        assert!(!guard.token().is_cancelled());
    }

    #[test]
    fn cancelling_the_parent_cancels_the_query() {
        let registry = CancelRegistry::new();
        let shutdown = CancellationToken::new();
        registry.register(1, 42);
        let guard = registry.begin_query(1, &shutdown);

        shutdown.cancel();

        assert!(guard.token().is_cancelled());
    }
}
