//! Session registry
//!
//! Maps usernames to session records and serializes spawn/stop work per
//! user. The per-user mutex is the only in-process synchronization
//! primitive: no code path mutates a session without holding it, and
//! operations for distinct users never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::SpawnError;
use crate::session::SessionState;

/// In-memory registry of live sessions
pub struct SessionRegistry {
    max_sessions: usize,
    /// Per-user operation locks; entries live for the process lifetime
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            locks: StdMutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire the operation lock for one user
    ///
    /// All spawn/stop work for a user happens under this guard, which
    /// orders operations for the same user without blocking others.
    pub async fn lock_user(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            Arc::clone(
                locks
                    .entry(username.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Acquire the operation lock without waiting
    ///
    /// `None` means a spawn or stop for this user is already in flight;
    /// spawn treats that as a conflict rather than queueing behind it.
    pub fn try_lock_user(&self, username: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            Arc::clone(
                locks
                    .entry(username.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.try_lock_owned().ok()
    }

    pub async fn get(&self, username: &str) -> Option<SessionState> {
        self.sessions.read().await.get(username).cloned()
    }

    /// Insert the record for a fresh spawn
    ///
    /// Rejects a second non-terminal record for the same user (the
    /// at-most-one-spawn invariant) and enforces the session cap.
    pub async fn insert(&self, session: SessionState) -> Result<(), SpawnError> {
        let username = session.identity.username.clone();
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&username) {
            if !existing.is_terminal() {
                return Err(SpawnError::SubmitConflict(username));
            }
        }
        if sessions.len() >= self.max_sessions && !sessions.contains_key(&username) {
            return Err(SpawnError::QuotaExceeded(format!(
                "maximum of {} concurrent sessions reached",
                self.max_sessions
            )));
        }
        sessions.insert(username, session);
        Ok(())
    }

    /// Apply a mutation to a session record atomically
    ///
    /// Returns the updated record, or `None` if the user has no session.
    pub async fn update<F>(&self, username: &str, mutate: F) -> Option<SessionState>
    where
        F: FnOnce(&mut SessionState),
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(username).map(|session| {
            mutate(session);
            session.clone()
        })
    }

    pub async fn remove(&self, username: &str) -> Option<SessionState> {
        self.sessions.write().await.remove(username)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Snapshot of every record, for reconciliation and the idle sweep
    pub async fn all(&self) -> Vec<SessionState> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ImageClass, ImageReference};
    use crate::identity::UserIdentity;
    use crate::session::Phase;

    fn session(username: &str) -> SessionState {
        SessionState::new(
            UserIdentity::new(username, 1000),
            ImageReference {
                reference: "r.io/lab:w_2024_10".to_string(),
                tag: "w_2024_10".to_string(),
                digest: String::new(),
                display_name: "Weekly 10".to_string(),
                class: ImageClass::Weekly,
                recommended: false,
            },
            format!("lab-{username}"),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = SessionRegistry::new(10);
        registry.insert(session("alice")).await.unwrap();
        let got = registry.get("alice").await.unwrap();
        assert_eq!(got.pod_name, "lab-alice");
        assert!(registry.get("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_second_nonterminal_insert_conflicts() {
        let registry = SessionRegistry::new(10);
        registry.insert(session("alice")).await.unwrap();
        let err = registry.insert(session("alice")).await.unwrap_err();
        assert!(matches!(err, SpawnError::SubmitConflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_record_can_be_replaced() {
        let registry = SessionRegistry::new(10);
        registry.insert(session("alice")).await.unwrap();
        registry
            .update("alice", |s| s.transition(Phase::Failed))
            .await
            .unwrap();
        assert!(registry.insert(session("alice")).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_cap() {
        let registry = SessionRegistry::new(1);
        registry.insert(session("alice")).await.unwrap();
        let err = registry.insert(session("bob")).await.unwrap_err();
        assert!(matches!(err, SpawnError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_update_is_atomic_with_get() {
        let registry = SessionRegistry::new(10);
        registry.insert(session("alice")).await.unwrap();
        let updated = registry
            .update("alice", |s| s.transition(Phase::Running))
            .await
            .unwrap();
        assert_eq!(updated.phase, Phase::Running);
        assert_eq!(registry.get("alice").await.unwrap().phase, Phase::Running);
    }

    #[tokio::test]
    async fn test_per_user_locks_are_independent() {
        let registry = Arc::new(SessionRegistry::new(10));
        let alice_guard = registry.lock_user("alice").await;
        // Bob's lock is immediately available even while alice's is held
        let bob_guard = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            registry.lock_user("bob"),
        )
        .await;
        assert!(bob_guard.is_ok());
        drop(alice_guard);
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let registry = SessionRegistry::new(10);
        let guard = registry.try_lock_user("alice").unwrap();
        assert!(registry.try_lock_user("alice").is_none());
        assert!(registry.try_lock_user("bob").is_some());
        drop(guard);
        assert!(registry.try_lock_user("alice").is_some());
    }

    #[tokio::test]
    async fn test_same_user_lock_serializes() {
        let registry = Arc::new(SessionRegistry::new(10));
        let guard = registry.lock_user("alice").await;
        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            registry.lock_user("alice"),
        )
        .await;
        assert!(attempt.is_err());
        drop(guard);
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            registry.lock_user("alice"),
        )
        .await
        .is_ok());
    }
}
