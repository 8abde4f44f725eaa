use super::escalation::CommandID;
use super::node::State;
use crate::error::Result;
use crate::store::{Hash, Transaction};

use serde_derive::{Deserialize, Serialize};

/// A peer ID: the 1-based position of the node in the configured cluster
/// list. Stable across the cluster, since every node shares the same fixed
/// configuration.
pub type PeerID = u64;

/// A commit count: a monotonic integer identifying a committed transaction
/// on the store.
pub type CommitCount = u64;

/// A node priority. The highest eligible priority stands up as leader.
/// Priority 0 never leads (permafollowers); -1 is the not-ready sentinel
/// announced during shutdown.
pub type Priority = i64;

/// A logical clock interval as a number of driver ticks.
pub type Ticks = u64;

/// A replicated transaction ID, unique per issuing node. Correlates the
/// begin/approve/deny/commit/rollback messages of one transaction.
pub type TransactionID = u64;

/// An envelope wrapping a message between two peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: PeerID,
    /// The recipient.
    pub to: PeerID,
    /// The message payload.
    pub message: Message,
}

/// A message passed between cluster peers: one variant per semantic event.
/// The variant names are a stable wire vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sent to a peer when a connection is established, identifying the
    /// sender and its replication position.
    Login {
        name: String,
        version: String,
        priority: Priority,
        state: State,
        commit_count: CommitCount,
        hash: Hash,
        /// The address where the sender's command server accepts commands.
        command_address: String,
    },

    /// A keepalive probe. `sent_at` is the sender's wall clock in
    /// microseconds, echoed back to measure latency.
    Ping { sent_at: u64 },

    /// A keepalive reply, echoing the probe timestamp.
    Pong { sent_at: u64 },

    /// A role broadcast, sent to all peers on every state change.
    State { state: State, priority: Priority, commit_count: CommitCount, hash: Hash },

    /// A candidate announces its intent to lead and solicits votes from all
    /// peers. The state change count correlates the responses.
    Standup { state_change_count: u64, priority: Priority, commit_count: CommitCount },

    /// A standup vote. Echoes the candidate's state change count so stale
    /// responses to old standup attempts are discarded.
    StandupResponse { state_change_count: u64, response: PeerResponse, reason: Option<String> },

    /// A follower asks the leader for a subscription, stating its position.
    /// The leader confirms with SynchronizeResponse carrying all commits the
    /// subscriber is missing.
    Subscribe { commit_count: CommitCount, hash: Hash },

    /// A lagging node requests commits past its position from a peer.
    Synchronize { commit_count: CommitCount, hash: Hash },

    /// Commits for a synchronizing or subscribing peer, plus the responder's
    /// own position so the requester knows when it has caught up.
    SynchronizeResponse { commits: Vec<Transaction>, commit_count: CommitCount, hash: Hash },

    /// The leader begins a replicated transaction on subscribed followers.
    /// `count` and `hash` are the position the transaction will commit at.
    BeginTransaction {
        id: TransactionID,
        count: CommitCount,
        hash: Hash,
        query: String,
        level: ConsistencyLevel,
    },

    /// A follower has prepared the transaction and will commit it on order.
    ApproveTransaction { id: TransactionID, count: CommitCount },

    /// A follower cannot apply the transaction.
    DenyTransaction { id: TransactionID, count: CommitCount },

    /// The leader commits a replicated transaction.
    CommitTransaction { id: TransactionID, count: CommitCount, hash: Hash },

    /// The leader rolls back a replicated transaction.
    RollbackTransaction { id: TransactionID, count: CommitCount },

    /// A follower forwards a mutating command to the leader.
    Escalate { id: CommandID, request: String },

    /// The leader returns the result of an escalated command.
    EscalateResponse { id: CommandID, response: Result<Vec<u8>> },

    /// A follower abandons an escalated command.
    EscalateCancel { id: CommandID },
}

/// The write consistency level of a replicated commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Fully asynchronous write, no follower approval required.
    Async,
    /// Requires one approval (likely from a peer on the same LAN).
    One,
    /// Requires approval from a strict majority of subscribed followers and
    /// the leader itself.
    Quorum,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyLevel::Async => write!(f, "ASYNC"),
            ConsistencyLevel::One => write!(f, "ONE"),
            ConsistencyLevel::Quorum => write!(f, "QUORUM"),
        }
    }
}

/// A peer's vote on a standup or transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    /// No response yet.
    #[default]
    None,
    Approve,
    Deny,
}

impl std::fmt::Display for PeerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerResponse::None => write!(f, "NONE"),
            PeerResponse::Approve => write!(f, "APPROVE"),
            PeerResponse::Deny => write!(f, "DENY"),
        }
    }
}
