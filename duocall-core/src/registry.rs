//! Process-wide session registry
//!
//! Maps usernames to sessions (one entry per logged-in identity, however
//! many handles share it) and transport handles to their sessions. The
//! username map sits behind a single lock held only for the map operation
//! itself; handle resolution, which runs once per packet, goes through a
//! sharded concurrent map instead so it never contends with signaling.

use crate::error::{Error, Result};
use crate::gateway::Authorizer;
use crate::session::UserSession;
use crate::types::HandleId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SessionRegistry {
    by_username: RwLock<HashMap<String, Arc<UserSession>>>,
    by_handle: DashMap<HandleId, Arc<UserSession>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_username: RwLock::new(HashMap::new()),
            by_handle: DashMap::new(),
        }
    }

    /// Bind a username to a session. Fails when the username is already
    /// bound to a *different* session; duplicate logins for the same
    /// identity are handled by the caller attaching the new handle to the
    /// session found via [`Self::lookup`].
    pub fn register(&self, username: &str, session: &Arc<UserSession>) -> Result<()> {
        let mut map = self.by_username.write();
        if let Some(existing) = map.get(username) {
            if !Arc::ptr_eq(existing, session) {
                return Err(Error::UsernameTaken(username.to_string()));
            }
            return Ok(());
        }
        map.insert(username.to_string(), Arc::clone(session));
        info!(%username, "user registered");
        Ok(())
    }

    /// A strong reference to the session behind a username, valid until
    /// dropped regardless of concurrent teardown.
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<Arc<UserSession>> {
        self.by_username.read().get(username).map(Arc::clone)
    }

    /// Remove a username mapping; refused while transport handles remain.
    pub fn unregister(&self, username: &str) -> bool {
        let mut map = self.by_username.write();
        match map.get(username) {
            Some(session) if session.handle_count() == 0 => {
                map.remove(username);
                info!(%username, "user unregistered");
                true
            }
            Some(_) => {
                debug!(%username, "unregister skipped, handles remain");
                false
            }
            None => false,
        }
    }

    #[must_use]
    pub fn usernames(&self) -> Vec<String> {
        self.by_username.read().keys().cloned().collect()
    }

    pub(crate) fn bind_handle(&self, handle: HandleId, session: Arc<UserSession>) {
        self.by_handle.insert(handle, session);
    }

    /// Re-point a handle at another session (duplicate login attaching a
    /// second device to an existing identity).
    pub(crate) fn rebind_handle(&self, handle: HandleId, session: Arc<UserSession>) {
        self.by_handle.insert(handle, session);
    }

    pub(crate) fn unbind_handle(&self, handle: HandleId) -> Option<Arc<UserSession>> {
        self.by_handle.remove(&handle).map(|(_, session)| session)
    }

    #[must_use]
    pub(crate) fn session_for_handle(&self, handle: HandleId) -> Option<Arc<UserSession>> {
        self.by_handle
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authorized-username set: a static allow-list, or everyone when
/// constructed permissive. Hosts with a real account system provide their
/// own [`Authorizer`] instead.
pub struct StaticAuthorizer {
    allowed: RwLock<HashSet<String>>,
    allow_all: bool,
}

impl StaticAuthorizer {
    /// Authorize every username.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed: RwLock::new(HashSet::new()),
            allow_all: true,
        }
    }

    /// Authorize only the given usernames.
    pub fn with_allowed<I, S>(usernames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: RwLock::new(usernames.into_iter().map(Into::into).collect()),
            allow_all: false,
        }
    }

    pub fn allow(&self, username: impl Into<String>) {
        self.allowed.write().insert(username.into());
    }

    pub fn revoke(&self, username: &str) {
        self.allowed.write().remove(username);
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_username_authorized(&self, username: &str) -> bool {
        self.allow_all || self.allowed.read().contains(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let session = Arc::new(UserSession::new());
        registry.register("alice", &session).expect("registers");
        let found = registry.lookup("alice").expect("found");
        assert!(Arc::ptr_eq(&found, &session));
        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn test_username_taken_by_other_session() {
        let registry = SessionRegistry::new();
        let first = Arc::new(UserSession::new());
        let second = Arc::new(UserSession::new());
        registry.register("alice", &first).expect("registers");
        let err = registry.register("alice", &second).expect_err("taken");
        assert_eq!(err.code(), 476);
        // Re-registering the same session is fine.
        registry.register("alice", &first).expect("idempotent");
    }

    #[test]
    fn test_unregister_requires_zero_handles() {
        let registry = SessionRegistry::new();
        let session = Arc::new(UserSession::new());
        session.attach_handle(HandleId::new(1));
        registry.register("alice", &session).expect("registers");

        assert!(!registry.unregister("alice"));
        assert!(registry.lookup("alice").is_some());

        session.detach_handle(HandleId::new(1));
        assert!(registry.unregister("alice"));
        assert!(registry.lookup("alice").is_none());
    }

    #[test]
    fn test_handle_binding_and_rebinding() {
        let registry = SessionRegistry::new();
        let anon = Arc::new(UserSession::new());
        let existing = Arc::new(UserSession::new());
        let handle = HandleId::new(7);

        registry.bind_handle(handle, Arc::clone(&anon));
        assert!(Arc::ptr_eq(
            &registry.session_for_handle(handle).expect("bound"),
            &anon
        ));

        registry.rebind_handle(handle, Arc::clone(&existing));
        assert!(Arc::ptr_eq(
            &registry.session_for_handle(handle).expect("rebound"),
            &existing
        ));

        registry.unbind_handle(handle);
        assert!(registry.session_for_handle(handle).is_none());
    }

    #[test]
    fn test_lookup_survives_concurrent_removal() {
        let registry = SessionRegistry::new();
        let session = Arc::new(UserSession::new());
        registry.register("alice", &session).expect("registers");
        let held = registry.lookup("alice").expect("strong ref");
        assert!(registry.unregister("alice"));
        // The held reference stays valid after removal.
        assert!(held.username().is_none());
    }

    #[test]
    fn test_static_authorizer() {
        let auth = StaticAuthorizer::with_allowed(["alice"]);
        assert!(auth.is_username_authorized("alice"));
        assert!(!auth.is_username_authorized("bob"));
        auth.allow("bob");
        assert!(auth.is_username_authorized("bob"));
        auth.revoke("bob");
        assert!(!auth.is_username_authorized("bob"));

        assert!(StaticAuthorizer::permissive().is_username_authorized("anyone"));
    }
}
