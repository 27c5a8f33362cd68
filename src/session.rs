//! Session - per-connection state and the registry that tracks it
//!
//! Each WebSocket connection gets one `Session`: the store opened by its
//! last `LOGIN` plus the hashes of files it has synchronized. The registry
//! maps connection ids to sessions so the accept loop and disconnect cleanup
//! can add and drop entries concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::graph::TripleStore;

/// Unique identifier for a client connection
pub type ConnectionId = u64;

/// Session state for a client connection
///
/// Created when a client connects and destroyed when it disconnects.
pub struct Session {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Store opened by the last LOGIN (None before the first one)
    store: Option<Box<dyn TripleStore>>,
    /// Stored file name -> last known SHA-256 hex digest
    pub file_hashes: HashMap<String, String>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            store: None,
            file_hashes: HashMap::new(),
        }
    }

    /// Install a freshly opened store.
    ///
    /// The previous store, if any, is closed without committing.
    pub fn set_store(&mut self, store: Box<dyn TripleStore>) -> Result<()> {
        match self.store.replace(store) {
            Some(previous) => previous.close(false),
            None => Ok(()),
        }
    }

    /// Current store, or `NoSession` before the first LOGIN.
    pub fn store_mut(&mut self) -> Result<&mut Box<dyn TripleStore>> {
        self.store.as_mut().ok_or(SyncError::NoSession)
    }

    /// Move the store out so it can be used off the async worker.
    ///
    /// Hand it back with [`Session::restore_store`]; until then the session
    /// reports `NoSession`.
    pub fn take_store(&mut self) -> Result<Box<dyn TripleStore>> {
        self.store.take().ok_or(SyncError::NoSession)
    }

    /// Put back a store taken with [`Session::take_store`].
    pub fn restore_store(&mut self, store: Box<dyn TripleStore>) {
        debug_assert!(self.store.is_none());
        self.store = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Close the store without committing pending changes.
    pub fn close_store(&mut self) -> Result<()> {
        match self.store.take() {
            Some(store) => store.close(false),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close_store() {
            warn!(connection = self.id, error = %e, "Failed to close store on drop");
        }
    }
}

/// Shared handle to one connection's session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id and register an empty session for it.
    pub fn open(&self) -> (ConnectionId, SessionHandle) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(Session::new(id)));
        self.sessions.write().insert(id, Arc::clone(&session));
        (id, session)
    }

    pub fn get(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.sessions.write().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::graph::{Triple, TriplePattern};
    use std::sync::atomic::AtomicUsize;

    /// Records how it was closed.
    struct RecordingStore {
        closed_with: Arc<Mutex<Vec<bool>>>,
    }

    impl TripleStore for RecordingStore {
        fn add(&mut self, _triple: Triple) -> Result<()> {
            Ok(())
        }
        fn remove(&mut self, _triple: &Triple) -> Result<()> {
            Ok(())
        }
        fn triples(&self, _pattern: &TriplePattern) -> Result<Vec<Triple>> {
            Ok(Vec::new())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(self: Box<Self>, commit_pending: bool) -> Result<()> {
            self.closed_with.try_lock().unwrap().push(commit_pending);
            Ok(())
        }
    }

    fn recording_store() -> (Box<dyn TripleStore>, Arc<Mutex<Vec<bool>>>) {
        let closed_with = Arc::new(Mutex::new(Vec::new()));
        let store = RecordingStore {
            closed_with: Arc::clone(&closed_with),
        };
        (Box::new(store), closed_with)
    }

    #[test]
    fn test_session_new() {
        let mut session = Session::new(7);

        assert_eq!(session.id, 7);
        assert!(!session.has_store());
        assert!(session.file_hashes.is_empty());
        assert!(matches!(session.store_mut(), Err(SyncError::NoSession)));
    }

    #[test]
    fn test_relogin_closes_previous_store_without_commit() {
        let mut session = Session::new(1);
        let (first, first_log) = recording_store();
        let (second, second_log) = recording_store();

        session.set_store(first).unwrap();
        session.set_store(second).unwrap();

        assert_eq!(*first_log.try_lock().unwrap(), vec![false]);
        assert!(second_log.try_lock().unwrap().is_empty());
        assert!(session.has_store());
    }

    #[test]
    fn test_take_and_restore_store() {
        let mut session = Session::new(3);
        assert!(matches!(session.take_store(), Err(SyncError::NoSession)));

        let (store, log) = recording_store();
        session.set_store(store).unwrap();

        let taken = session.take_store().unwrap();
        assert!(!session.has_store());
        assert!(matches!(session.store_mut(), Err(SyncError::NoSession)));

        session.restore_store(taken);
        assert!(session.has_store());
        assert!(log.try_lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_closes_store() {
        let (store, log) = recording_store();
        {
            let mut session = Session::new(1);
            session.set_store(store).unwrap();
        }
        assert_eq!(*log.try_lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_registry_open_and_remove() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.open();
        let (b, _) = registry.open();

        assert_ne!(a, b);
        assert_eq!(registry.ids(), vec![a, b]);

        assert!(registry.remove(a).is_some());
        assert!(!registry.contains(a));
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());
        assert!(registry.remove(a).is_none());
    }

    #[test]
    fn test_registry_concurrent_open_remove() {
        use std::thread;

        let registry = Arc::new(SessionRegistry::new());
        let opened = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            let opened = Arc::clone(&opened);
            handles.push(thread::spawn(move || {
                let (id, _) = registry.open();
                opened.fetch_add(1, Ordering::SeqCst);
                registry.remove(id);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(opened.load(Ordering::SeqCst), 10);
        assert!(registry.is_empty());
    }
}
