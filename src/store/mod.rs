//! The local transactional store boundary. The replication core drives the
//! store through these traits: the driver thread uses its own handle for
//! leader commits and serial application, and parallel replication workers
//! check handles out of a [`Pool`].

pub mod memory;
pub mod pool;

pub use memory::Memory;
pub use pool::Pool;

use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};

/// A commit content hash: a fingerprint of the database state at a given
/// commit count, used to detect divergence between nodes. Empty at commit 0.
pub type Hash = Vec<u8>;

/// A committed transaction, as stored and replicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The commit count, a monotonic sequence starting at 1.
    pub count: u64,
    /// The content hash of the database state at this commit.
    pub hash: Hash,
    /// The write statements applied by this commit.
    pub query: String,
}

/// A shared transactional store. The store itself is thread-safe and serves
/// committed state; transactions run through [`Handle`]s.
pub trait Store: Send + Sync {
    /// Returns the current commit count and content hash, as a consistent
    /// pair.
    fn committed(&self) -> (u64, Hash);

    /// Returns the committed transaction at the given commit count, if any.
    fn transaction(&self, count: u64) -> Result<Option<Transaction>>;

    /// Opens a new transaction handle onto the store.
    fn handle(&self) -> Box<dyn Handle>;

    /// Returns the current commit count.
    fn commit_count(&self) -> u64 {
        self.committed().0
    }
}

/// A store transaction handle. A handle runs at most one transaction at a
/// time and is not thread-safe: each thread takes its own, e.g. from a
/// [`Pool`]. Conflicting writes across handles are detected at commit.
pub trait Handle: Send {
    /// Begins a transaction. Errors if one is already in progress.
    fn begin(&mut self) -> Result<()>;

    /// Stages write statements in the current transaction.
    fn mutate(&mut self, query: &str) -> Result<()>;

    /// Executes a read-only statement against committed state. Reads don't
    /// require a transaction and may run on any node regardless of role.
    fn read(&self, query: &str) -> Result<Vec<u8>>;

    /// Returns the commit count and hash the current transaction would commit
    /// at if committed now. Tentative: concurrent commits on other handles
    /// can move the position until this handle commits.
    fn prepare(&mut self) -> Result<Transaction>;

    /// Commits the current transaction, returning the committed record.
    /// Fails with [`Error::Conflict`] if the transaction lost a write
    /// conflict; the caller may roll back and retry.
    fn commit(&mut self) -> Result<Transaction>;

    /// Rolls back the current transaction, if any.
    fn rollback(&mut self) -> Result<()>;

    /// Applies a replicated transaction at its recorded position, verifying
    /// the content hash before committing. Intended for serial application
    /// (synchronization and serial replication) where the prepared position
    /// is exact.
    fn apply(&mut self, txn: &Transaction) -> Result<()> {
        self.begin()?;
        if let Err(err) = self.mutate(&txn.query) {
            self.rollback()?;
            return Err(err);
        }
        let prepared = self.prepare()?;
        if prepared.count != txn.count || prepared.hash != txn.hash {
            self.rollback()?;
            return Err(Error::HashMismatch(format!(
                "commit {} hash {} does not match prepared commit {} hash {}",
                txn.count,
                hex::encode(&txn.hash),
                prepared.count,
                hex::encode(&prepared.hash),
            )));
        }
        self.commit()?;
        Ok(())
    }
}
