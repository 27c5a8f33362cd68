//! Store collaborator traits

use super::{Triple, TriplePattern};
use crate::error::Result;
use crate::session::ConnectionId;

/// Statement store behind one session.
///
/// `Send` so a session can move between runtime threads, but not `Sync`:
/// a connection processes one request at a time, so a store is only ever
/// touched by its own connection task.
pub trait TripleStore: Send {
    /// Stage a statement for addition.
    fn add(&mut self, triple: Triple) -> Result<()>;

    /// Stage a statement for removal.
    fn remove(&mut self, triple: &Triple) -> Result<()>;

    /// Statements matching `pattern`, pending changes included.
    fn triples(&self, pattern: &TriplePattern) -> Result<Vec<Triple>>;

    /// Durably apply pending changes.
    fn commit(&mut self) -> Result<()>;

    /// Discard pending changes.
    fn rollback(&mut self) -> Result<()>;

    /// Store-specific side effect. No-op unless overridden.
    fn run(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the store, committing pending changes first if asked to.
    fn close(self: Box<Self>, commit_pending: bool) -> Result<()>;
}

/// Builds stores on `LOGIN` and hears about disconnects.
pub trait StoreFactory: Send + Sync {
    /// Open a store for the opaque login payload.
    fn open(&self, login: &str) -> Result<Box<dyn TripleStore>>;

    /// Called after a connection's store was closed and its session removed.
    fn disconnected(&self, _connection: ConnectionId) {}
}
