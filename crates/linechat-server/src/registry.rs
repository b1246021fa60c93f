//! Session registry: exclusive names and the live-session set.
//!
//! Two maps behind one lock:
//! - live set: every admitted session, from accept until reclamation
//! - name map: name → session, from successful registration until
//!   reclamation
//!
//! The lock is held only for map operations. Anything that touches a
//! session's I/O (broadcast, termination) works on a snapshot taken under the
//! lock and iterated after it is released.
//!
//! Once [`Registry::close`] has run, no session can be admitted again. The
//! close and its snapshot happen atomically, so a session admitted
//! concurrently with shutdown is either in the snapshot or rejected.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{
    error::RegistryError,
    session::{Session, SessionId},
};

#[derive(Default)]
struct Inner {
    live: HashMap<SessionId, Arc<Session>>,
    names: HashMap<String, Arc<Session>>,
    closed: bool,
}

/// Result of removing a reclaimed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed {
    /// Sessions still live after the removal
    pub remaining: usize,
    /// The registry was closed by shutdown
    pub closed: bool,
}

impl Reclaimed {
    /// Shutdown is in progress and this was the last live session.
    pub fn drained(self) -> bool {
        self.closed && self.remaining == 0
    }
}

/// Registry of live sessions and their names.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves both maps consistent, so a poisoned lock
    // is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a freshly accepted session to the live set.
    ///
    /// Returns `false` if the registry is closed; the caller must then drop
    /// the session without starting it.
    pub fn admit(&self, session: Arc<Session>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        let previous = inner.live.insert(session.id(), session);
        assert!(previous.is_none(), "invariant: session admitted twice");
        true
    }

    /// Claim `name` for `session`.
    ///
    /// First caller for a name wins. On success the session's name is set
    /// while the lock is held, so no broadcast can see the session in the
    /// name map without a name.
    pub fn register(&self, name: &str, session: &Arc<Session>) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut inner = self.lock();
        if inner.names.contains_key(name) {
            return Err(RegistryError::NameTaken(name.to_string()));
        }
        session.set_name(name);
        inner.names.insert(name.to_string(), Arc::clone(session));
        Ok(())
    }

    /// Release a name. No-op if it is not registered.
    pub fn remove(&self, name: &str) {
        self.lock().names.remove(name);
    }

    /// Look up the session owning `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<Session>> {
        self.lock().names.get(name).cloned()
    }

    /// Snapshot of all live sessions, named or not.
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.lock().live.values().cloned().collect()
    }

    /// Snapshot of the sessions that completed registration.
    pub fn named_sessions(&self) -> Vec<Arc<Session>> {
        self.lock().names.values().cloned().collect()
    }

    /// Queue `message` on every named session except `sender`.
    ///
    /// Returns the number of sessions the message was queued on.
    pub fn broadcast(&self, sender: SessionId, message: &Bytes) -> usize {
        let mut delivered = 0;
        for receiver in self.named_sessions() {
            if receiver.id() != sender && receiver.send_message(message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close the registry and snapshot the live set, atomically.
    pub fn close(&self) -> Vec<Arc<Session>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.live.values().cloned().collect()
    }

    /// Remove a fully quiesced session from both maps.
    ///
    /// # Panics
    ///
    /// If the session is not in the live set: it was reclaimed twice or never
    /// admitted, and the handshake is broken.
    pub fn reclaim(&self, session: &Session) -> Reclaimed {
        let mut inner = self.lock();
        if let Some(name) = session.name() {
            inner.names.remove(name);
        }
        let removed = inner.live.remove(&session.id());
        assert!(removed.is_some(), "invariant: session {} reclaimed twice", session.id());
        Reclaimed { remaining: inner.live.len(), closed: inner.closed }
    }

    /// Number of live sessions.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Number of registered names.
    pub fn name_count(&self) -> usize {
        self.lock().names.len()
    }

    /// True once shutdown has closed the registry.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
