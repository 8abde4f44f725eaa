use super::message::{CommitCount, Envelope, Message, PeerID, TransactionID};
use super::node::{Node, Shared};
use super::notifier::Wait;
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::store::{Hash, Pool};

use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Spawns a worker thread replicating one inbound transaction. The worker is
/// counted in `Shared::replication_threads` until it exits.
pub(super) fn spawn(
    node: &mut Node,
    id: TransactionID,
    count: CommitCount,
    hash: Hash,
    query: String,
) {
    let replicator = Replicator {
        shared: node.shared.clone(),
        transport: node.transport.clone(),
        pool: node.pool.clone(),
        node_id: node.id,
        index: node.next_worker,
    };
    node.next_worker += 1;
    node.shared.replication_threads.fetch_add(1, Ordering::SeqCst);
    std::thread::spawn(move || replicator.run(id, count, hash, query));
}

/// A parallel replication worker: applies one leader transaction to the
/// local store, in leader commit order. Transactions begin in parallel; the
/// two sequential notifiers enforce that each commits only after the leader
/// commits it and after all prior local commits have landed.
struct Replicator {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    pool: Arc<Pool>,
    node_id: PeerID,
    /// Monotonic worker index, distributing workers across pool handles.
    index: u64,
}

/// Decrements the live worker count and wakes the driver when the worker
/// exits, however it exits.
struct Exit(Arc<Shared>);

impl Drop for Exit {
    fn drop(&mut self) {
        self.0.replication_threads.fetch_sub(1, Ordering::SeqCst);
        self.0.wake();
    }
}

impl Replicator {
    fn run(self, id: TransactionID, count: CommitCount, hash: Hash, query: String) {
        let _exit = Exit(self.shared.clone());
        match self.replicate(id, count, &hash, &query) {
            // Cancellation is a clean exit: shutdown or role loss.
            Ok(()) | Err(Error::Canceled) => {}
            Err(err) => {
                error!("Replication of commit {count} failed: {err}");
                self.shared.divergence.store(true, Ordering::SeqCst);
                self.shared.wake();
            }
        }
    }

    fn replicate(&self, id: TransactionID, count: CommitCount, hash: &Hash, query: &str) -> Result<()> {
        let mut db = self.pool.handle(self.index)?;
        let cancel = &self.shared.replication_exit;
        let mut approved = false;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return db.rollback();
            }
            db.begin()?;
            if let Err(err) = db.mutate(query) {
                db.rollback()?;
                warn!("Denying transaction {id} at commit {count}: {err}");
                self.respond(Message::DenyTransaction { id, count })?;
                return match self.shared.leader_commits.wait_for(count, cancel) {
                    // The cluster advanced past a transaction we can't apply.
                    Wait::Complete => Err(Error::HashMismatch(format!(
                        "leader committed denied transaction {count}"
                    ))),
                    Wait::Canceled | Wait::RolledBack => Ok(()),
                };
            }
            let prepared = db.prepare()?;
            debug!("Prepared transaction {id} at tentative commit {}", prepared.count);
            if !approved {
                self.respond(Message::ApproveTransaction { id, count })?;
                approved = true;
            }
            // Wait for the leader to commit this transaction.
            match self.shared.leader_commits.wait_for(count, cancel) {
                Wait::Complete => {}
                Wait::Canceled => return db.rollback(),
                Wait::RolledBack => {
                    info!("Rolling back transaction {id} at commit {count}");
                    return db.rollback();
                }
            }
            // Wait for all prior local commits, so apply order matches the
            // leader exactly.
            match self.shared.local_commits.wait_for(count.saturating_sub(1), cancel) {
                Wait::Complete => {}
                Wait::Canceled => return db.rollback(),
                Wait::RolledBack => {
                    info!("Abandoning transaction {id} after a prior rollback");
                    return db.rollback();
                }
            }
            // The position is now exact; verify it against the leader before
            // committing.
            let prepared = db.prepare()?;
            if prepared.count != count || &prepared.hash != hash {
                db.rollback()?;
                return Err(Error::HashMismatch(format!(
                    "prepared commit {} hash {} does not match leader commit {count} hash {}",
                    prepared.count,
                    hex::encode(&prepared.hash),
                    hex::encode(hash),
                )));
            }
            match db.commit() {
                Ok(txn) => {
                    debug!("Committed replicated transaction {id} at commit {}", txn.count);
                    self.shared.local_commits.notify_through(count);
                    return Ok(());
                }
                Err(Error::Conflict) => {
                    debug!("Commit {count} conflicted, retrying");
                    db.rollback()?;
                }
                Err(err) => {
                    db.rollback()?;
                    return Err(err);
                }
            }
        }
    }

    /// Sends a response to the lead peer, holding the lead-peer read lock
    /// across the send so the leader stays consistent. Fails as canceled if
    /// there is no leader anymore.
    fn respond(&self, message: Message) -> Result<()> {
        let lead = self.shared.lead_peer.read().unwrap_or_else(|p| p.into_inner());
        match *lead {
            Some(to) => self.transport.send(Envelope { from: self.node_id, to, message }),
            None => Err(Error::Canceled),
        }
    }
}
