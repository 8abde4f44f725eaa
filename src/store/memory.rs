//! An in-memory transactional store. Data is not persisted.

use super::{Handle, Hash, Store, Transaction};
use crate::error::{Error, Result};
use crate::{errinput, invalid_state};

use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// An in-memory transactional store. Commits form a SHA-256 hash chain: each
/// commit's hash covers the previous hash, the commit count, and the query,
/// so two stores with the same hash at the same count have identical
/// histories.
///
/// Statements are `SET key value` and `DEL key`; `GET key` reads. Other
/// statements are accepted as opaque writes that only enter the commit log
/// and hash chain. Statements prefixed with `!error` fail, and commit
/// conflicts can be injected, both for failure testing (writers are otherwise
/// serialized internally and never conflict on their own).
#[derive(Clone, Default)]
pub struct Memory {
    shared: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Committed transactions in commit order; log[n-1] is commit n.
    log: Vec<Transaction>,
    /// Key/value state produced by SET/DEL statements.
    data: HashMap<String, String>,
    /// Number of upcoming commits to fail with Error::Conflict.
    fail_commits: u32,
    /// Number of upcoming mutations to fail with Error::InvalidInput.
    fail_mutates: u32,
}

impl Memory {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` commits across all handles with
    /// Error::Conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().fail_commits += count;
    }

    /// Fails the next `count` mutations across all handles with
    /// Error::InvalidInput.
    pub fn inject_mutate_failures(&self, count: u32) {
        self.lock().fail_mutates += count;
    }

    /// Returns the committed value for a key, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Inner {
    /// Computes the position and hash a transaction with the given statements
    /// would commit at now.
    fn chain(&self, statements: &[String]) -> Transaction {
        let count = self.log.len() as u64 + 1;
        let query = statements.join("; ");
        let mut hasher = Sha256::new();
        hasher.update(self.log.last().map(|t| t.hash.as_slice()).unwrap_or_default());
        hasher.update(count.to_be_bytes());
        hasher.update(query.as_bytes());
        Transaction { count, hash: hasher.finalize().to_vec(), query }
    }
}

impl Store for Memory {
    fn committed(&self) -> (u64, Hash) {
        let inner = self.lock();
        (inner.log.len() as u64, inner.log.last().map(|t| t.hash.clone()).unwrap_or_default())
    }

    fn transaction(&self, count: u64) -> Result<Option<Transaction>> {
        if count == 0 {
            return Ok(None);
        }
        Ok(self.lock().log.get(count as usize - 1).cloned())
    }

    fn handle(&self) -> Box<dyn Handle> {
        Box::new(MemoryHandle { shared: self.shared.clone(), statements: None })
    }
}

/// A transaction handle onto a [`Memory`] store.
pub struct MemoryHandle {
    shared: Arc<Mutex<Inner>>,
    /// Statements staged by the current transaction, if one is in progress.
    statements: Option<Vec<String>>,
}

impl MemoryHandle {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Handle for MemoryHandle {
    fn begin(&mut self) -> Result<()> {
        if self.statements.is_some() {
            return invalid_state!("transaction already in progress");
        }
        self.statements = Some(Vec::new());
        Ok(())
    }

    fn mutate(&mut self, query: &str) -> Result<()> {
        let Some(statements) = &mut self.statements else {
            return invalid_state!("no transaction in progress");
        };
        if self.shared.lock().map(|mut inner| {
            let fail = inner.fail_mutates > 0;
            inner.fail_mutates -= u32::from(fail);
            fail
        })? {
            return errinput!("injected mutation failure");
        }
        for statement in query.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if statement.starts_with("!error") {
                return errinput!("invalid statement: {statement}");
            }
            statements.push(statement.to_string());
        }
        Ok(())
    }

    fn read(&self, query: &str) -> Result<Vec<u8>> {
        match query.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["GET", key] => {
                Ok(self.lock().data.get(*key).cloned().unwrap_or_default().into_bytes())
            }
            _ => errinput!("invalid read: {query}"),
        }
    }

    fn prepare(&mut self) -> Result<Transaction> {
        let Some(statements) = &self.statements else {
            return invalid_state!("no transaction in progress");
        };
        Ok(self.lock().chain(statements))
    }

    fn commit(&mut self) -> Result<Transaction> {
        let Some(statements) = &self.statements else {
            return invalid_state!("no transaction in progress");
        };
        let mut inner = self.lock();
        if inner.fail_commits > 0 {
            inner.fail_commits -= 1;
            return Err(Error::Conflict);
        }
        let txn = inner.chain(statements);
        for statement in statements {
            match statement.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["SET", key, value @ ..] => {
                    inner.data.insert(key.to_string(), value.join(" "));
                }
                ["DEL", key] => {
                    inner.data.remove(*key);
                }
                _ => {} // opaque write, enters the log and hash chain only
            }
        }
        inner.log.push(txn.clone());
        drop(inner);
        self.statements = None;
        Ok(txn)
    }

    fn rollback(&mut self) -> Result<()> {
        self.statements = None;
        Ok(())
    }
}
