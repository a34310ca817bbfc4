//! Connection registry.
//!
//! Tracks live client connections and the one session each may own. The
//! registry is the single place where supersession and disconnect turn into
//! interrupt flags being raised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use genstream_core::{
    ConnectionId, GenerationError, InterruptFlag, InterruptReason, LivenessProbe, Result, SessionId,
};

/// The session currently owned by a connection.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub flag: InterruptFlag,
}

#[derive(Debug)]
struct ConnectionRecord {
    alive: AtomicBool,
    active: Mutex<Option<ActiveSession>>,
    /// Most recently started session; not cleared when it finishes.
    latest: Mutex<Option<SessionId>>,
}

impl ConnectionRecord {
    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Registers a new live connection.
    pub fn connect(&self) -> ConnectionId {
        let id = ConnectionId::new();
        let record = Arc::new(ConnectionRecord {
            alive: AtomicBool::new(true),
            active: Mutex::new(None),
            latest: Mutex::new(None),
        });
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
        tracing::info!(target: "connection", connection_id = %id, "connected");
        id
    }

    /// Marks the connection dead, interrupts its active session and forgets it.
    ///
    /// Returns `false` if the connection was unknown (already disconnected).
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some(record) = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        else {
            return false;
        };
        record.alive.store(false, Ordering::SeqCst);
        let active = record.active().take();
        if let Some(active) = active {
            active.flag.raise(InterruptReason::Disconnected);
            tracing::info!(
                target: "connection",
                connection_id = %id,
                session_id = %active.session_id,
                "disconnected, session interrupted"
            );
        } else {
            tracing::info!(target: "connection", connection_id = %id, "disconnected");
        }
        true
    }

    /// True until the connection is disconnected. Unknown ids are not alive.
    pub fn is_alive(&self, id: ConnectionId) -> bool {
        self.record(id)
            .is_some_and(|record| record.alive.load(Ordering::SeqCst))
    }

    /// Makes `session` the connection's active session.
    ///
    /// The previous active session, if any, is interrupted with
    /// [`InterruptReason::Superseded`] before it is replaced.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::ConnectionClosed` if the connection is gone.
    /// In that case `session`'s flag is raised with `Disconnected`.
    pub fn set_active(&self, id: ConnectionId, session: ActiveSession) -> Result<Option<SessionId>> {
        let Some(record) = self.record(id) else {
            session.flag.raise(InterruptReason::Disconnected);
            return Err(GenerationError::connection_closed(id));
        };
        let mut active = record.active();
        if !record.alive.load(Ordering::SeqCst) {
            session.flag.raise(InterruptReason::Disconnected);
            return Err(GenerationError::connection_closed(id));
        }
        let new_id = session.session_id;
        if let Some(prior) = active.as_ref().filter(|p| p.session_id != new_id) {
            prior.flag.raise(InterruptReason::Superseded);
        }
        let prior = active.replace(session);
        *record.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(new_id);
        drop(active);

        let Some(prior) = prior.filter(|p| p.session_id != new_id) else {
            return Ok(None);
        };
        tracing::info!(
            target: "connection",
            connection_id = %id,
            superseded = %prior.session_id,
            session_id = %new_id,
            "session superseded"
        );
        Ok(Some(prior.session_id))
    }

    /// The session currently running for the connection, if any.
    ///
    /// Cleared when that session finishes, unlike
    /// [`latest_session`](Self::latest_session).
    pub fn active_session(&self, id: ConnectionId) -> Option<SessionId> {
        let record = self.record(id)?;
        let active = record.active();
        active.as_ref().map(|a| a.session_id)
    }

    /// The most recently started session, even if it already finished.
    pub fn latest_session(&self, id: ConnectionId) -> Option<SessionId> {
        let record = self.record(id)?;
        let latest = *record.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest
    }

    /// Raises the active session's flag without detaching it.
    pub fn interrupt_active(&self, id: ConnectionId, reason: InterruptReason) -> Option<SessionId> {
        let record = self.record(id)?;
        let active = record.active();
        let session = active.as_ref()?;
        session.flag.raise(reason);
        Some(session.session_id)
    }

    /// Detaches `session_id` if it is still the active session.
    pub fn clear_active(&self, id: ConnectionId, session_id: SessionId) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut active = record.active();
        if active.as_ref().is_some_and(|a| a.session_id == session_id) {
            *active = None;
            true
        } else {
            false
        }
    }

    /// A probe the session worker polls to learn that its connection died or
    /// moved on to another session.
    pub fn watch(&self, id: ConnectionId, session_id: SessionId) -> ConnectionWatch {
        ConnectionWatch {
            record: self.record(id),
            session_id,
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Liveness and identity check for one session on one connection.
#[derive(Debug)]
pub struct ConnectionWatch {
    record: Option<Arc<ConnectionRecord>>,
    session_id: SessionId,
}

impl LivenessProbe for ConnectionWatch {
    fn check(&self) -> Option<InterruptReason> {
        let Some(record) = &self.record else {
            return Some(InterruptReason::Disconnected);
        };
        if !record.alive.load(Ordering::SeqCst) {
            return Some(InterruptReason::Disconnected);
        }
        match record.active().as_ref() {
            Some(active) if active.session_id == self.session_id => None,
            _ => Some(InterruptReason::Superseded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ActiveSession {
        ActiveSession {
            session_id: SessionId::new(),
            flag: InterruptFlag::new(),
        }
    }

    #[test]
    fn connect_and_disconnect() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        assert!(registry.is_alive(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.disconnect(id));
        assert!(!registry.is_alive(id));
        assert!(!registry.disconnect(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn new_session_supersedes_prior() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        let first = session();
        let second = session();

        assert_eq!(registry.set_active(id, first.clone()).unwrap(), None);
        assert_eq!(
            registry.set_active(id, second.clone()).unwrap(),
            Some(first.session_id)
        );
        assert_eq!(first.flag.reason(), Some(InterruptReason::Superseded));
        assert!(!second.flag.is_raised());
        assert_eq!(registry.active_session(id), Some(second.session_id));
    }

    #[test]
    fn disconnect_interrupts_active_session_once() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        let active = session();
        registry.set_active(id, active.clone()).unwrap();

        registry.disconnect(id);
        assert_eq!(active.flag.reason(), Some(InterruptReason::Disconnected));
        assert_eq!(registry.active_session(id), None);
    }

    #[test]
    fn set_active_on_closed_connection_fails() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        registry.disconnect(id);
        let late = session();
        let err = registry.set_active(id, late.clone()).unwrap_err();
        assert!(err.is_connection_closed());
        assert!(late.flag.is_raised());
    }

    #[test]
    fn clear_active_only_for_same_session() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        let first = session();
        let second = session();
        registry.set_active(id, first.clone()).unwrap();
        registry.set_active(id, second.clone()).unwrap();

        assert!(!registry.clear_active(id, first.session_id));
        assert_eq!(registry.active_session(id), Some(second.session_id));
        assert!(registry.clear_active(id, second.session_id));
        assert_eq!(registry.active_session(id), None);
        assert_eq!(registry.latest_session(id), Some(second.session_id));
    }

    #[test]
    fn watch_reports_supersession_and_disconnect() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        let first = session();
        registry.set_active(id, first.clone()).unwrap();
        let watch = registry.watch(id, first.session_id);
        assert_eq!(watch.check(), None);

        let second = session();
        registry.set_active(id, second.clone()).unwrap();
        assert_eq!(watch.check(), Some(InterruptReason::Superseded));

        let watch = registry.watch(id, second.session_id);
        registry.disconnect(id);
        assert_eq!(watch.check(), Some(InterruptReason::Disconnected));
        assert_eq!(
            registry.watch(id, second.session_id).check(),
            Some(InterruptReason::Disconnected)
        );
    }

    #[test]
    fn interrupt_active_keeps_session_attached() {
        let registry = ConnectionRegistry::new();
        let id = registry.connect();
        let active = session();
        registry.set_active(id, active.clone()).unwrap();
        assert_eq!(
            registry.interrupt_active(id, InterruptReason::Requested),
            Some(active.session_id)
        );
        assert_eq!(active.flag.reason(), Some(InterruptReason::Requested));
        assert_eq!(registry.active_session(id), Some(active.session_id));
    }

    #[test]
    fn replacement_is_never_visible_before_prior_is_interrupted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = registry.connect();
        for _ in 0..200 {
            let first = session();
            let second = session();
            registry.set_active(id, first.clone()).unwrap();

            let observer = {
                let registry = Arc::clone(&registry);
                let second_id = second.session_id;
                let first_flag = first.flag.clone();
                std::thread::spawn(move || {
                    while registry.active_session(id) != Some(second_id) {
                        std::hint::spin_loop();
                    }
                    first_flag.is_raised()
                })
            };
            registry.set_active(id, second).unwrap();
            assert!(observer.join().unwrap());
        }
    }
}
