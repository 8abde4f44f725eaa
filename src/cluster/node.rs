use super::escalation::{Command, CommandID, CommandServer, Escalations};
use super::message::{
    CommitCount, ConsistencyLevel, Envelope, Message, PeerID, PeerResponse, Priority, Ticks,
    TransactionID,
};
use super::notifier::Notifier;
use super::peer::Peers;
use super::replicator;
use super::server::Request;
use super::transport::{Event, Transport};
use crate::error::{Error, Result};
use crate::invalid_state;
use crate::store::{Hash, Store, Transaction};

use crossbeam::atomic::AtomicCell;
use crossbeam::channel::Sender;
use itertools::Itertools as _;
use log::{debug, error, info, warn};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The priority announced while not ready to lead, during shutdown.
pub const PRIORITY_NOT_READY: Priority = -1;

/// The default steady-state timeout for transient states, in ticks.
const STATE_TIMEOUT: Ticks = 50;

/// The default timeout for the first search after startup, in ticks. Longer,
/// so a cold cluster can finish connecting before anyone stands up.
const FIRST_TIMEOUT: Ticks = 100;

/// The default random jitter added to the Searching timeout, in ticks.
const SEARCH_JITTER: Ticks = 10;

/// The default interval between keepalive pings, in ticks.
const PING_INTERVAL: Ticks = 20;

/// The default number of ticks without traffic from a logged-in peer before
/// its connection is forced down.
const RECV_TIMEOUT: Ticks = 300;

/// The default maximum number of commits per synchronize chunk.
const SYNCHRONIZE_CHUNK: u64 = 256;

/// The default wall-clock bound between quorum commits. A commit starting
/// later than this after the last quorum commit is upgraded to QUORUM.
const QUORUM_CHECKPOINT: Duration = Duration::from_secs(60);

/// Node options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Timeout for the first search after startup, in ticks.
    pub first_timeout: Ticks,
    /// Steady-state timeout for transient states, in ticks.
    pub state_timeout: Ticks,
    /// Random jitter added to the Searching timeout, in ticks.
    pub search_jitter: Ticks,
    /// Interval between keepalive pings, in ticks.
    pub ping_interval: Ticks,
    /// Ticks without traffic from a logged-in peer before reconnecting it.
    pub recv_timeout: Ticks,
    /// Maximum commits per synchronize chunk.
    pub synchronize_chunk: u64,
    /// Wall-clock bound between quorum commits.
    pub quorum_checkpoint: Duration,
    /// Whether inbound transactions replicate on parallel worker threads.
    /// When false, they apply inline on the driver thread, in strict order.
    pub parallel_replication: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            first_timeout: FIRST_TIMEOUT,
            state_timeout: STATE_TIMEOUT,
            search_jitter: SEARCH_JITTER,
            ping_interval: PING_INTERVAL,
            recv_timeout: RECV_TIMEOUT,
            synchronize_chunk: SYNCHRONIZE_CHUNK,
            quorum_checkpoint: QUORUM_CHECKPOINT,
            parallel_replication: true,
        }
    }
}

/// A node role state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// No known state (e.g. a peer we haven't heard from).
    Unknown,
    /// Searching for peers and a stable role. The default resting state.
    Searching,
    /// Catching up to a peer with a higher commit count.
    Synchronizing,
    /// Caught up, waiting for an opportunity to lead or follow.
    Waiting,
    /// Soliciting standup approval from all peers.
    StandingUp,
    /// Leading the cluster.
    Leading,
    /// Giving up leadership, draining in-flight work.
    StandingDown,
    /// Subscribing to the lead peer.
    Subscribing,
    /// Following the lead peer.
    Following,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Searching => "SEARCHING",
            State::Synchronizing => "SYNCHRONIZING",
            State::Waiting => "WAITING",
            State::StandingUp => "STANDINGUP",
            State::Leading => "LEADING",
            State::StandingDown => "STANDINGDOWN",
            State::Subscribing => "SUBSCRIBING",
            State::Following => "FOLLOWING",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(State::Unknown),
            "SEARCHING" => Ok(State::Searching),
            "SYNCHRONIZING" => Ok(State::Synchronizing),
            "WAITING" => Ok(State::Waiting),
            "STANDINGUP" => Ok(State::StandingUp),
            "LEADING" => Ok(State::Leading),
            "STANDINGDOWN" => Ok(State::StandingDown),
            "SUBSCRIBING" => Ok(State::Subscribing),
            "FOLLOWING" => Ok(State::Following),
            name => Err(Error::InvalidInput(format!("unknown state {name}"))),
        }
    }
}

/// The state of the current commit. Advances strictly forward within one
/// transaction, then resets for the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    /// No transaction since startup or the last completed one.
    Uninitialized,
    /// A commit was requested but not yet begun on followers.
    Waiting,
    /// The transaction is broadcast and awaiting approvals.
    Committing,
    /// The last commit succeeded.
    Success,
    /// The last commit failed and was rolled back.
    Failed,
}

/// Node state shared with replication workers and thread-safe handles.
pub struct Shared {
    pub state: AtomicCell<State>,
    pub commit_state: AtomicCell<CommitState>,
    pub priority: AtomicI64,
    pub state_change_count: AtomicU64,
    /// The lead peer, if any. Replication workers hold the read lock while
    /// sending acknowledgments, so the leader stays consistent across a send.
    pub lead_peer: RwLock<Option<PeerID>>,
    /// Signals replication workers to exit.
    pub replication_exit: AtomicBool,
    /// The number of live replication workers.
    pub replication_threads: AtomicI64,
    /// Set by a worker that detected divergence from the leader; the driver
    /// falls back to Searching.
    pub divergence: AtomicBool,
    /// This node's applied commits.
    pub local_commits: Notifier,
    /// Commits the leader has told us to apply.
    pub leader_commits: Notifier,
    wake: Sender<()>,
}

impl Shared {
    fn new(wake: Sender<()>) -> Self {
        Self {
            state: AtomicCell::new(State::Searching),
            commit_state: AtomicCell::new(CommitState::Uninitialized),
            priority: AtomicI64::new(0),
            state_change_count: AtomicU64::new(0),
            lead_peer: RwLock::new(None),
            replication_exit: AtomicBool::new(false),
            replication_threads: AtomicI64::new(0),
            divergence: AtomicBool::new(false),
            local_commits: Notifier::new(),
            leader_commits: Notifier::new(),
            wake,
        }
    }

    /// Wakes the driver loop. Never blocks.
    pub fn wake(&self) {
        let _ = self.wake.try_send(());
    }
}

/// An in-progress leader commit.
struct PendingCommit {
    id: TransactionID,
    level: ConsistencyLevel,
    /// The followers subscribed when the transaction was broadcast; approvals
    /// are counted among these.
    recipients: Vec<PeerID>,
    count: CommitCount,
    hash: Hash,
}

/// A replicated transaction staged inline by serial replication, awaiting
/// the leader's commit.
struct SerialTransaction {
    id: TransactionID,
    count: CommitCount,
}

/// The outcome of a message handler: carry on, or drop the peer's connection
/// and let it reconnect.
enum Flow {
    Continue,
    Reconnect(String),
}

/// A point-in-time snapshot of node and peer state, for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub state: State,
    pub priority: Priority,
    pub commit_count: CommitCount,
    pub hash: Hash,
    pub state_change_count: u64,
    pub leader: Option<String>,
    pub escalated: usize,
    pub replication_threads: i64,
    pub peers: Vec<PeerStatus>,
}

/// A peer's slice of a [`Status`] snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub state: State,
    pub logged_in: bool,
    pub subscribed: bool,
    pub commit_count: CommitCount,
    pub priority: Priority,
    pub latency: u64,
    pub failed_connections: u32,
}

/// A replication node: the role state machine, the replication engine, and
/// the escalation protocol, driven by a single driver thread via step(),
/// tick(), and update(). Thread-safe entry points go through
/// [`super::NodeHandle`] and the request channel.
pub struct Node {
    pub(super) id: PeerID,
    name: String,
    version: String,
    command_address: String,
    /// The configured priority. `priority` drops to PRIORITY_NOT_READY when
    /// shutdown begins.
    original_priority: Priority,
    priority: Priority,
    state: State,
    peers: Peers,
    pub(super) transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    /// The driver's own store handle, for leader commits and serial
    /// application. Commands executing on the leader stage writes here.
    db: Box<dyn crate::store::Handle>,
    pub(super) pool: Arc<crate::store::Pool>,
    server: Arc<dyn CommandServer>,
    pub(super) shared: Arc<Shared>,
    opts: Options,

    /// Monotonic driver tick counter.
    ticks: Ticks,
    /// Ticks spent in the current state.
    state_ticks: Ticks,
    /// Tick bound for the current state, after which it gives up.
    state_timeout: Ticks,
    /// Whether the node has stood up before; the first standup waits the
    /// longer first timeout.
    first_standup: bool,
    /// Bumped on every state change; stale standup responses are discarded
    /// by comparing against it.
    state_change_count: u64,
    /// The peer we're synchronizing from, while Synchronizing.
    sync_peer: Option<PeerID>,
    commit: Option<PendingCommit>,
    commit_state: CommitState,
    next_transaction_id: TransactionID,
    /// The last commit streamed to followers while leading.
    last_sent_transaction: CommitCount,
    /// Monotonic replication worker counter, for pool distribution.
    pub(super) next_worker: u64,
    escalations: Escalations,
    serial: Option<SerialTransaction>,
    /// The end of the last quorum commit.
    last_quorum: Instant,
    shutdown_deadline: Option<Instant>,
}

impl Node {
    pub fn new(
        id: PeerID,
        name: &str,
        version: &str,
        priority: Priority,
        command_address: &str,
        peers: Peers,
        store: Arc<dyn Store>,
        pool: Arc<crate::store::Pool>,
        server: Arc<dyn CommandServer>,
        transport: Arc<dyn Transport>,
        wake: Sender<()>,
        opts: Options,
    ) -> Result<Node> {
        if priority < 0 {
            return Err(Error::InvalidInput("priority must be 0 or positive".into()));
        }
        let shared = Arc::new(Shared::new(wake));
        shared.priority.store(priority, Ordering::Relaxed);
        let db = store.handle();
        let commit_count = store.commit_count();
        info!("Node {name} starting at commit {commit_count} with priority {priority}");
        Ok(Node {
            id,
            name: name.into(),
            version: version.into(),
            command_address: command_address.into(),
            original_priority: priority,
            priority,
            state: State::Searching,
            peers,
            transport,
            store,
            db,
            pool,
            server,
            shared,
            state_timeout: opts.first_timeout,
            opts,
            ticks: 0,
            state_ticks: 0,
            first_standup: true,
            state_change_count: 0,
            sync_peer: None,
            commit: None,
            commit_state: CommitState::Uninitialized,
            next_transaction_id: 1,
            last_sent_transaction: commit_count,
            next_worker: 0,
            escalations: Escalations::new(),
            serial: None,
            last_quorum: Instant::now(),
            shutdown_deadline: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The priority this node was configured with, regardless of shutdown.
    pub fn configured_priority(&self) -> Priority {
        self.original_priority
    }

    pub fn state_change_count(&self) -> u64 {
        self.state_change_count
    }

    pub fn commit_state(&self) -> CommitState {
        self.commit_state
    }

    /// True from start_commit() until the commit has been sent to (and, if
    /// it required replication, acknowledged by) peers.
    pub fn commit_in_progress(&self) -> bool {
        matches!(self.commit_state, CommitState::Waiting | CommitState::Committing)
    }

    /// True if the last commit succeeded. False while one is in progress.
    pub fn commit_succeeded(&self) -> bool {
        self.commit_state == CommitState::Success
    }

    /// True if we're Leading with enough subscribed followers for a quorum
    /// commit: the followers plus this node form a strict majority of the
    /// cluster.
    pub fn has_quorum(&self) -> bool {
        self.state == State::Leading && self.peers.subscribed() + 1 >= self.peers.quorum_size()
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// The driver's store handle. Commands executing on the leader stage
    /// their writes here before start_commit().
    pub fn db(&mut self) -> &mut dyn crate::store::Handle {
        self.db.as_mut()
    }

    /// The state of the lead peer, or Unknown if there is no lead peer.
    pub fn leader_state(&self) -> State {
        self.lead_peer()
            .and_then(|id| self.peers.get(id))
            .map(|p| p.state.load())
            .unwrap_or(State::Unknown)
    }

    /// The command address of the current leader, if any.
    pub fn leader_command_address(&self) -> Option<String> {
        self.lead_peer().and_then(|id| self.peers.get(id)).map(|p| p.command_address())
    }

    /// The request payloads of outstanding escalations, for diagnostics.
    pub fn escalated_requests(&self) -> Vec<String> {
        self.escalations.requests()
    }

    fn lead_peer(&self) -> Option<PeerID> {
        *self.shared.lead_peer.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_lead_peer(&self, lead: Option<PeerID>) {
        *self.shared.lead_peer.write().unwrap_or_else(|p| p.into_inner()) = lead;
    }

    /// Sends a message to a peer. A no-op if the peer is not connected.
    fn send(&self, to: PeerID, message: Message) -> Result<()> {
        debug!("Sending {message:?} to peer {to}");
        self.transport.send(Envelope { from: self.id, to, message })
    }

    /// Broadcasts a message to all peers, or only to subscribed followers.
    /// Peers are visited in ID order for test determinism.
    fn broadcast(&self, message: Message, subscribed_only: bool) -> Result<()> {
        for peer in self.peers.iter().sorted_by_key(|p| p.id) {
            if subscribed_only && !peer.is_subscribed() {
                continue;
            }
            self.send(peer.id, message.clone())?;
        }
        Ok(())
    }

    /// Processes a transport event. Only the driver thread may call this.
    pub fn step(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Connected(id) => self.on_connect(id),
            Event::Disconnected(id) => self.on_disconnect(id),
            Event::Message(envelope) => self.on_envelope(envelope),
        }
    }

    fn on_connect(&mut self, id: PeerID) -> Result<()> {
        let Some(peer) = self.peers.get(id).cloned() else {
            warn!("Connection event for unknown peer {id}");
            return Ok(());
        };
        peer.connected();
        debug!("Connected to peer {}, logging in", peer.name);
        let (commit_count, hash) = self.store.committed();
        self.send(
            id,
            Message::Login {
                name: self.name.clone(),
                version: self.version.clone(),
                priority: self.priority,
                state: self.state,
                commit_count,
                hash,
                command_address: self.command_address.clone(),
            },
        )
    }

    fn on_disconnect(&mut self, id: PeerID) -> Result<()> {
        let Some(peer) = self.peers.get(id).cloned() else {
            return Ok(());
        };
        info!("Disconnected from peer {}", peer.name);
        peer.reset();
        if self.lead_peer() == Some(id) {
            warn!("Lost lead peer {}", peer.name);
            self.change_state(State::Searching)?;
        } else if self.state == State::Synchronizing && self.sync_peer == Some(id) {
            warn!("Lost synchronization peer {}", peer.name);
            self.change_state(State::Searching)?;
        }
        Ok(())
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.to != self.id {
            debug!("Dropping message addressed to node {}", envelope.to);
            return Ok(());
        }
        let Some(peer) = self.peers.get(envelope.from).cloned() else {
            warn!("Message from unknown peer {}", envelope.from);
            return Ok(());
        };
        peer.last_recv.store(self.ticks, Ordering::Relaxed);
        debug!("Received {:?} from peer {}", envelope.message, peer.name);
        match self.on_message(&peer, envelope.message) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Reconnect(reason)) => {
                warn!("Reconnecting peer {}: {reason}", peer.name);
                self.transport.reconnect(peer.id);
            }
            // Divergence demotes us; other errors are reported and dropped so
            // a misbehaving peer can't stop the driver.
            Err(Error::HashMismatch(msg)) => {
                error!("Divergence detected via peer {}: {msg}", peer.name);
                self.demote()?;
            }
            Err(err) => error!("Failed handling message from peer {}: {err}", peer.name),
        }
        Ok(())
    }

    /// Dispatches a message from a peer to its handler.
    fn on_message(&mut self, peer: &Arc<super::peer::Peer>, message: Message) -> Result<Flow> {
        // Position-bearing messages update the peer's (commit, hash) pair.
        match &message {
            Message::Login { commit_count, hash, .. }
            | Message::State { commit_count, hash, .. }
            | Message::Subscribe { commit_count, hash }
            | Message::Synchronize { commit_count, hash } => {
                peer.set_commit(*commit_count, hash.clone())
            }
            _ => {}
        }

        match message {
            Message::Login { name, version, priority, state, command_address, .. } => {
                self.on_login(peer, name, version, priority, state, command_address)
            }
            Message::Ping { sent_at } => {
                self.send(peer.id, Message::Pong { sent_at })?;
                Ok(Flow::Continue)
            }
            Message::Pong { sent_at } => {
                peer.latency.store(now_micros().saturating_sub(sent_at), Ordering::Relaxed);
                Ok(Flow::Continue)
            }
            Message::State { state, priority, .. } => self.on_state(peer, state, priority),
            Message::Standup { state_change_count, priority, commit_count } => {
                self.on_standup(peer, state_change_count, priority, commit_count)
            }
            Message::StandupResponse { state_change_count, response, reason } => {
                self.on_standup_response(peer, state_change_count, response, reason)
            }
            Message::Subscribe { .. } => self.on_subscribe(peer),
            Message::Synchronize { .. } => self.on_synchronize(peer),
            Message::SynchronizeResponse { commits, commit_count, hash } => {
                self.on_synchronize_response(peer, commits, commit_count, hash)
            }
            Message::BeginTransaction { id, count, hash, query, level } => {
                self.on_begin_transaction(peer, id, count, hash, query, level)
            }
            Message::ApproveTransaction { id, count } => {
                self.on_transaction_response(peer, id, count, PeerResponse::Approve)
            }
            Message::DenyTransaction { id, count } => {
                self.on_transaction_response(peer, id, count, PeerResponse::Deny)
            }
            Message::CommitTransaction { id, count, hash } => {
                self.on_commit_transaction(peer, id, count, hash)
            }
            Message::RollbackTransaction { id, count } => {
                self.on_rollback_transaction(peer, id, count)
            }
            Message::Escalate { id, request } => self.on_escalate(peer, id, request),
            Message::EscalateResponse { id, response } => {
                self.on_escalate_response(peer, id, response)
            }
            Message::EscalateCancel { id } => self.on_escalate_cancel(peer, id),
        }
    }

    fn on_login(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        name: String,
        version: String,
        priority: Priority,
        state: State,
        command_address: String,
    ) -> Result<Flow> {
        if name != peer.name {
            return Ok(Flow::Reconnect(format!(
                "peer identifies as {name}, expected {}",
                peer.name
            )));
        }
        if peer.perma_follower && priority > 0 {
            warn!("Permafollower {} announces leadable priority {priority}", peer.name);
        }
        peer.priority.store(priority, Ordering::Relaxed);
        peer.state.store(state);
        peer.set_version(version);
        peer.set_command_address(command_address);
        peer.logged_in.store(true, Ordering::Relaxed);
        info!("Peer {} logged in with priority {priority}, state {state}", peer.name);
        Ok(Flow::Continue)
    }

    fn on_state(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        state: State,
        priority: Priority,
    ) -> Result<Flow> {
        let old = peer.state.swap(state);
        peer.priority.store(priority, Ordering::Relaxed);
        if old != state {
            debug!("Peer {} changed state {old} → {state}", peer.name);
        }
        // A follower that takes any other role loses its subscription.
        if !matches!(state, State::Subscribing | State::Following) {
            peer.subscribed.store(false, Ordering::Relaxed);
        }
        // Our leader stopped leading.
        if self.lead_peer() == Some(peer.id)
            && !matches!(state, State::Leading | State::StandingDown)
        {
            warn!("Lead peer {} stood down", peer.name);
            self.change_state(State::Searching)?;
            return Ok(Flow::Continue);
        }
        // Another leader: the node with the lesser claim stands down.
        if self.state == State::Leading && state == State::Leading {
            let (commit_count, _) = self.store.committed();
            let (peer_commit, _) = peer.commit();
            if (priority, peer_commit, peer.name.as_str())
                > (self.priority, commit_count, self.name.as_str())
            {
                warn!("Peer {} leads with a higher claim, standing down", peer.name);
                self.change_state(State::StandingDown)?;
            } else {
                warn!("Peer {} also leads with a lesser claim, expecting it to yield", peer.name);
            }
        }
        Ok(Flow::Continue)
    }

    fn on_standup(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        state_change_count: u64,
        priority: Priority,
        commit_count: CommitCount,
    ) -> Result<Flow> {
        peer.state.store(State::StandingUp);
        peer.priority.store(priority, Ordering::Relaxed);
        let (response, reason) = self.standup_vote(peer, priority, commit_count);
        match &reason {
            Some(reason) => info!("Denying standup of peer {}: {reason}", peer.name),
            None => info!("Approving standup of peer {}", peer.name),
        }
        self.send(peer.id, Message::StandupResponse { state_change_count, response, reason })?;
        Ok(Flow::Continue)
    }

    /// Decides a standup vote for a candidate peer. Returns the vote and a
    /// reason when denying.
    fn standup_vote(
        &self,
        peer: &super::peer::Peer,
        priority: Priority,
        commit_count: CommitCount,
    ) -> (PeerResponse, Option<String>) {
        let deny = |reason: String| (PeerResponse::Deny, Some(reason));
        if peer.perma_follower || priority <= 0 {
            return deny("permafollowers can't lead".into());
        }
        if matches!(self.state, State::Leading | State::StandingUp | State::StandingDown) {
            return deny(format!("this node is {}", self.state));
        }
        if self.lead_peer().is_some() {
            return deny("this node already has a leader".into());
        }
        let (ours, _) = self.store.committed();
        if commit_count < ours {
            return deny(format!("candidate is behind ({commit_count} < {ours})"));
        }
        let candidate = (priority, commit_count, peer.name.as_str());
        if self.priority > 0 && (self.priority, ours, self.name.as_str()) > candidate {
            return deny("this node outranks the candidate".into());
        }
        for other in self.peers.iter() {
            if other.id == peer.id || !other.is_logged_in() || other.perma_follower {
                continue;
            }
            let (other_commit, _) = other.commit();
            if (other.priority.load(Ordering::Relaxed), other_commit, other.name.as_str())
                > candidate
            {
                return deny(format!("peer {} outranks the candidate", other.name));
            }
        }
        (PeerResponse::Approve, None)
    }

    fn on_standup_response(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        state_change_count: u64,
        response: PeerResponse,
        reason: Option<String>,
    ) -> Result<Flow> {
        if self.state != State::StandingUp || state_change_count != self.state_change_count {
            debug!("Dropping stale standup response from peer {}", peer.name);
            return Ok(Flow::Continue);
        }
        if peer.standup_response.load() == PeerResponse::None {
            peer.standup_response.store(response);
            if response == PeerResponse::Deny {
                warn!(
                    "Peer {} denied standup: {}",
                    peer.name,
                    reason.as_deref().unwrap_or("no reason")
                );
            }
        }
        Ok(Flow::Continue)
    }

    fn on_subscribe(&mut self, peer: &Arc<super::peer::Peer>) -> Result<Flow> {
        if self.state != State::Leading {
            info!("Refusing subscription from peer {} while {}", peer.name, self.state);
            return Ok(Flow::Reconnect("not leading".into()));
        }
        let (peer_commit, peer_hash) = peer.commit();
        let response = match synchronize_response(
            self.store.as_ref(),
            peer_commit,
            &peer_hash,
            true,
            self.opts.synchronize_chunk,
        ) {
            Ok(response) => response,
            // The subscriber's divergence, not ours.
            Err(Error::HashMismatch(msg)) => return Ok(Flow::Reconnect(msg)),
            Err(err) => return Err(err),
        };
        peer.subscribed.store(true, Ordering::Relaxed);
        info!("Peer {} subscribed at commit {peer_commit}", peer.name);
        self.send(peer.id, response)?;
        Ok(Flow::Continue)
    }

    fn on_synchronize(&mut self, peer: &Arc<super::peer::Peer>) -> Result<Flow> {
        let (peer_commit, peer_hash) = peer.commit();
        match synchronize_response(
            self.store.as_ref(),
            peer_commit,
            &peer_hash,
            false,
            self.opts.synchronize_chunk,
        ) {
            Ok(response) => {
                debug!("Synchronizing peer {} from commit {peer_commit}", peer.name);
                self.send(peer.id, response)?;
                Ok(Flow::Continue)
            }
            Err(Error::HashMismatch(msg)) => Ok(Flow::Reconnect(msg)),
            Err(err) => Err(err),
        }
    }

    fn on_synchronize_response(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        commits: Vec<Transaction>,
        commit_count: CommitCount,
        hash: Hash,
    ) -> Result<Flow> {
        peer.set_commit(commit_count, hash);
        match self.state {
            State::Synchronizing if self.sync_peer == Some(peer.id) => {
                self.apply_synchronize(&commits)?;
                let (ours, our_hash) = self.store.committed();
                if ours >= commit_count {
                    info!("Synchronized with peer {} at commit {ours}", peer.name);
                    self.change_state(State::Waiting)?;
                } else {
                    // Ask for the next chunk; progress restarts the timeout.
                    self.state_ticks = 0;
                    self.send(
                        peer.id,
                        Message::Synchronize { commit_count: ours, hash: our_hash },
                    )?;
                }
                Ok(Flow::Continue)
            }
            State::Subscribing if self.lead_peer() == Some(peer.id) => {
                self.apply_synchronize(&commits)?;
                info!(
                    "Subscription to leader {} confirmed at commit {}",
                    peer.name,
                    self.store.commit_count()
                );
                self.change_state(State::Following)?;
                Ok(Flow::Continue)
            }
            _ => {
                debug!("Dropping unsolicited synchronize response from peer {}", peer.name);
                Ok(Flow::Continue)
            }
        }
    }

    /// Applies synchronized commits in order. Replays of already applied
    /// commits are no-ops if the hashes match, and divergence otherwise.
    fn apply_synchronize(&mut self, commits: &[Transaction]) -> Result<()> {
        for txn in commits {
            let (committed, _) = self.store.committed();
            if txn.count <= committed {
                match self.store.transaction(txn.count)? {
                    Some(existing) if existing.hash == txn.hash => {
                        debug!("Skipping already applied commit {}", txn.count);
                        continue;
                    }
                    _ => {
                        return Err(Error::HashMismatch(format!(
                            "already committed {} with a different hash",
                            txn.count
                        )))
                    }
                }
            }
            self.db.apply(txn)?;
            debug!("Applied synchronized commit {}", txn.count);
        }
        Ok(())
    }

    fn on_begin_transaction(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: TransactionID,
        count: CommitCount,
        hash: Hash,
        query: String,
        level: ConsistencyLevel,
    ) -> Result<Flow> {
        if self.state != State::Following || self.lead_peer() != Some(peer.id) {
            debug!("Ignoring transaction {id} from peer {} while {}", peer.name, self.state);
            return Ok(Flow::Continue);
        }
        debug!("Replicating {level} transaction {id} at commit {count}");
        if self.opts.parallel_replication {
            replicator::spawn(self, id, count, hash, query);
            Ok(Flow::Continue)
        } else {
            self.serial_begin(peer, id, count, hash, query)
        }
    }

    fn on_transaction_response(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: TransactionID,
        count: CommitCount,
        response: PeerResponse,
    ) -> Result<Flow> {
        match &self.commit {
            Some(pending) if self.state == State::Leading && pending.id == id => {}
            _ => {
                debug!("Dropping stale transaction response {id} from peer {}", peer.name);
                return Ok(Flow::Continue);
            }
        }
        if peer.transaction_response.load() == PeerResponse::None {
            peer.transaction_response.store(response);
            if response == PeerResponse::Deny {
                warn!("Peer {} denied transaction {id} at commit {count}", peer.name);
            }
        }
        Ok(Flow::Continue)
    }

    fn on_commit_transaction(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: TransactionID,
        count: CommitCount,
        hash: Hash,
    ) -> Result<Flow> {
        if self.state != State::Following || self.lead_peer() != Some(peer.id) {
            debug!("Ignoring commit {count} from peer {} while {}", peer.name, self.state);
            return Ok(Flow::Continue);
        }
        if self.opts.parallel_replication {
            // Idempotent: replaying an already committed count is a no-op.
            self.shared.leader_commits.notify_through(count);
            Ok(Flow::Continue)
        } else {
            self.serial_commit(id, count, hash)
        }
    }

    fn on_rollback_transaction(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: TransactionID,
        count: CommitCount,
    ) -> Result<Flow> {
        if self.state != State::Following || self.lead_peer() != Some(peer.id) {
            debug!("Ignoring rollback {count} from peer {} while {}", peer.name, self.state);
            return Ok(Flow::Continue);
        }
        info!("Leader rolled back transaction {id} at commit {count}");
        if self.opts.parallel_replication {
            self.shared.leader_commits.rollback(count);
            self.shared.local_commits.rollback(count);
            Ok(Flow::Continue)
        } else {
            self.serial_rollback(id, count)
        }
    }

    /// Serial replication: begins and prepares a transaction inline on the
    /// driver thread, voting on it immediately.
    fn serial_begin(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: TransactionID,
        count: CommitCount,
        hash: Hash,
        query: String,
    ) -> Result<Flow> {
        if let Some(stale) = self.serial.take() {
            warn!("Dropping stale serial transaction {}", stale.id);
            self.db.rollback()?;
        }
        let deny = |node: &Node, reason: String| -> Result<Flow> {
            warn!("Denying transaction {id} at commit {count}: {reason}");
            node.send(peer.id, Message::DenyTransaction { id, count })?;
            Ok(Flow::Continue)
        };
        self.db.begin()?;
        if let Err(err) = self.db.mutate(&query) {
            self.db.rollback()?;
            return deny(self, err.to_string());
        }
        let prepared = self.db.prepare()?;
        if prepared.count != count || prepared.hash != hash {
            self.db.rollback()?;
            return deny(
                self,
                format!("prepared commit {} does not match leader commit {count}", prepared.count),
            );
        }
        self.serial = Some(SerialTransaction { id, count });
        self.send(peer.id, Message::ApproveTransaction { id, count })?;
        Ok(Flow::Continue)
    }

    /// Serial replication: commits the staged transaction on the leader's
    /// signal.
    fn serial_commit(&mut self, id: TransactionID, count: CommitCount, hash: Hash) -> Result<Flow> {
        let Some(serial) = self.serial.take() else {
            debug!("Ignoring commit {count} with no staged transaction");
            return Ok(Flow::Continue);
        };
        if serial.id != id || serial.count != count {
            self.db.rollback()?;
            return Err(Error::HashMismatch(format!(
                "leader committed {count}, staged transaction is at {}",
                serial.count
            )));
        }
        let txn = self.db.commit()?;
        if txn.count != count || txn.hash != hash {
            return Err(Error::HashMismatch(format!(
                "committed {} does not match leader commit {count}",
                txn.count
            )));
        }
        self.shared.local_commits.notify_through(count);
        debug!("Committed replicated transaction {id} at commit {count}");
        Ok(Flow::Continue)
    }

    /// Serial replication: rolls back the staged transaction.
    fn serial_rollback(&mut self, id: TransactionID, _count: CommitCount) -> Result<Flow> {
        if let Some(serial) = self.serial.take() {
            if serial.id != id {
                warn!("Rollback {id} does not match staged transaction {}", serial.id);
            }
            self.db.rollback()?;
        }
        Ok(Flow::Continue)
    }

    fn on_escalate(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: CommandID,
        request: String,
    ) -> Result<Flow> {
        if self.state != State::Leading {
            info!("Refusing escalation {id} from peer {} while {}", peer.name, self.state);
            self.send(
                peer.id,
                Message::EscalateResponse {
                    id,
                    response: Err(Error::InvalidState(format!(
                        "node {} is not leading",
                        self.name
                    ))),
                },
            )?;
            return Ok(Flow::Continue);
        }
        info!("Accepting escalated command {id} from peer {}", peer.name);
        self.server.accept_command(Command {
            id,
            request,
            read_only: false,
            response: None,
            complete: false,
            initiating_peer: Some(peer.id),
        });
        Ok(Flow::Continue)
    }

    fn on_escalate_response(
        &mut self,
        peer: &Arc<super::peer::Peer>,
        id: CommandID,
        response: Result<Vec<u8>>,
    ) -> Result<Flow> {
        if self.lead_peer() != Some(peer.id) {
            debug!("Dropping escalation response {id} from non-leader {}", peer.name);
            return Ok(Flow::Continue);
        }
        let Some(mut command) = self.escalations.remove(&id) else {
            debug!("Dropping response for unknown escalation {id}");
            return Ok(Flow::Continue);
        };
        debug!("Escalated command {id} completed");
        command.response = Some(response);
        command.complete = true;
        self.server.complete_command(command);
        Ok(Flow::Continue)
    }

    fn on_escalate_cancel(&mut self, peer: &Arc<super::peer::Peer>, id: CommandID) -> Result<Flow> {
        if self.state == State::Leading {
            info!("Peer {} canceled escalated command {id}", peer.name);
            self.server.cancel_command(id);
        }
        Ok(Flow::Continue)
    }

    /// Advances time by one tick: sends keepalives and reconnects silent
    /// peers. Only the driver thread may call this.
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        self.state_ticks += 1;
        if self.ticks % self.opts.ping_interval == 0 {
            for peer in self.peers.iter().filter(|p| p.is_logged_in()).sorted_by_key(|p| p.id) {
                self.send(peer.id, Message::Ping { sent_at: now_micros() })?;
            }
        }
        for peer in self.peers.iter().filter(|p| p.is_logged_in()) {
            if self.ticks.saturating_sub(peer.last_recv.load(Ordering::Relaxed))
                > self.opts.recv_timeout
            {
                warn!("Peer {} went silent, reconnecting", peer.name);
                self.transport.reconnect(peer.id);
            }
        }
        Ok(())
    }

    /// Advances the role state machine one step. Returns true if the state
    /// changed and the caller should update() again before servicing I/O.
    /// Only the driver thread may call this.
    pub fn update(&mut self) -> Result<bool> {
        if self.shared.divergence.swap(false, Ordering::SeqCst) {
            error!("Replication diverged from the leader, resynchronizing");
            self.demote()?;
            return Ok(true);
        }
        let before = self.state_change_count;
        match self.state {
            State::Unknown => self.change_state(State::Searching)?,
            State::Searching => self.update_searching()?,
            State::Synchronizing => self.update_synchronizing()?,
            State::Waiting => self.update_waiting()?,
            State::StandingUp => self.update_standingup()?,
            State::Leading => self.update_leading()?,
            State::StandingDown => self.update_standingdown()?,
            State::Subscribing => self.update_subscribing()?,
            State::Following => self.update_following()?,
        }
        Ok(self.state_change_count != before)
    }

    fn update_searching(&mut self) -> Result<()> {
        // A node on its way out rests here until shutdown completes.
        if self.graceful_shutdown() {
            return Ok(());
        }
        // Follow or catch up to an existing leader.
        if let Some(leader) = self.find_leader() {
            if leader.commit_count() > self.store.commit_count() {
                return self.start_synchronizing();
            }
            return self.change_state(State::Waiting);
        }
        let timeout = self.state_ticks >= self.state_timeout;
        let all = self.peers.logged_in() == self.peers.len();
        if !timeout && !all {
            return Ok(());
        }
        if self.peers.logged_in() + 1 < self.peers.quorum_size() {
            return Ok(()); // keep searching for a majority
        }
        if self.sync_target().is_some() {
            return self.start_synchronizing();
        }
        if timeout && self.stands_highest() {
            return self.stand_up();
        }
        self.change_state(State::Waiting)
    }

    fn update_synchronizing(&mut self) -> Result<()> {
        if self.state_ticks >= self.state_timeout {
            warn!("Synchronization timed out, searching");
            return self.change_state(State::Searching);
        }
        Ok(())
    }

    fn update_waiting(&mut self) -> Result<()> {
        // A node on its way out rests here until shutdown completes.
        if self.graceful_shutdown() {
            return Ok(());
        }
        // A peer got ahead of us, catch up again.
        if self.sync_target().is_some() {
            return self.change_state(State::Searching);
        }
        if let Some(leader) = self.find_leader() {
            self.change_state(State::Subscribing)?;
            self.set_lead_peer(Some(leader.id));
            info!("Subscribing to leader {}", leader.name);
            let (commit_count, hash) = self.store.committed();
            return self.send(leader.id, Message::Subscribe { commit_count, hash });
        }
        let majority = self.peers.logged_in() + 1 >= self.peers.quorum_size();
        if majority && self.stands_highest() {
            return self.stand_up();
        }
        Ok(())
    }

    /// Announces our intent to lead and solicits votes from all peers.
    fn stand_up(&mut self) -> Result<()> {
        self.change_state(State::StandingUp)?;
        let (commit_count, _) = self.store.committed();
        info!("Standing up with priority {} at commit {commit_count}", self.priority);
        self.broadcast(
            Message::Standup {
                state_change_count: self.state_change_count,
                priority: self.priority,
                commit_count,
            },
            false,
        )
    }

    fn update_standingup(&mut self) -> Result<()> {
        if self.state_ticks >= self.state_timeout {
            warn!("Standup timed out, searching");
            return self.change_state(State::Searching);
        }
        let (mut denied, mut all_approved) = (false, true);
        for peer in self.peers.iter().filter(|p| p.is_logged_in()) {
            match peer.standup_response.load() {
                PeerResponse::Approve => {}
                PeerResponse::Deny => denied = true,
                PeerResponse::None => all_approved = false,
            }
        }
        if denied {
            warn!("Standup denied, searching");
            return self.change_state(State::Searching);
        }
        if all_approved {
            info!("Standup approved by all logged-in peers, leading");
            return self.change_state(State::Leading);
        }
        Ok(())
    }

    fn update_leading(&mut self) -> Result<()> {
        self.advance_commit()?;
        self.send_outstanding_transactions(None)?;
        if self.graceful_shutdown() && !self.commit_in_progress() {
            info!("Shutting down, standing down");
            return self.change_state(State::StandingDown);
        }
        Ok(())
    }

    fn update_standingdown(&mut self) -> Result<()> {
        // Finish in-flight work, then yield.
        self.advance_commit()?;
        if self.commit_in_progress() && self.state_ticks < self.state_timeout {
            return Ok(());
        }
        if self.commit_in_progress() {
            warn!("Standdown timed out with a commit in progress, failing it");
            self.fail_commit()?;
        }
        self.send_outstanding_transactions(None)?;
        info!("Standdown complete, searching");
        self.change_state(State::Searching)
    }

    fn update_subscribing(&mut self) -> Result<()> {
        if self.state_ticks >= self.state_timeout {
            warn!("Subscription timed out, searching");
            return self.change_state(State::Searching);
        }
        Ok(())
    }

    fn update_following(&mut self) -> Result<()> {
        if self.graceful_shutdown()
            && self.escalations.is_empty()
            && self.serial.is_none()
            && self.shared.replication_threads.load(Ordering::SeqCst) == 0
        {
            info!("Shutting down, leaving the cluster");
            return self.change_state(State::Searching);
        }
        Ok(())
    }

    /// Returns the logged-in peer currently leading, if any.
    fn find_leader(&self) -> Option<Arc<super::peer::Peer>> {
        self.peers
            .iter()
            .find(|p| p.is_logged_in() && p.state.load() == State::Leading)
            .cloned()
    }

    /// Returns the best peer to synchronize from: the logged-in peer with
    /// the highest commit count above ours.
    fn sync_target(&self) -> Option<Arc<super::peer::Peer>> {
        let ours = self.store.commit_count();
        self.peers
            .iter()
            .filter(|p| p.is_logged_in() && p.commit_count() > ours)
            .max_by_key(|p| p.commit_count())
            .cloned()
    }

    /// True if this node outranks every logged-in, non-permafollower peer by
    /// (priority, commit count, name), and is itself eligible to lead.
    fn stands_highest(&self) -> bool {
        if self.priority <= 0 {
            return false;
        }
        let ours = self.store.commit_count();
        let claim = (self.priority, ours, self.name.as_str());
        self.peers.iter().filter(|p| p.is_logged_in() && !p.perma_follower).all(|p| {
            let (peer_commit, _) = p.commit();
            claim > (p.priority.load(Ordering::Relaxed), peer_commit, p.name.as_str())
        })
    }

    fn start_synchronizing(&mut self) -> Result<()> {
        let Some(peer) = self.sync_target() else {
            return Ok(());
        };
        self.change_state(State::Synchronizing)?;
        self.sync_peer = Some(peer.id);
        info!("Synchronizing from peer {} at commit {}", peer.name, peer.commit_count());
        let (commit_count, hash) = self.store.committed();
        self.send(peer.id, Message::Synchronize { commit_count, hash })
    }

    /// Falls back to Searching and reconnects all peers, after divergence.
    fn demote(&mut self) -> Result<()> {
        self.change_state(State::Searching)?;
        for peer in self.peers.iter().sorted_by_key(|p| p.id) {
            self.transport.reconnect(peer.id);
        }
        Ok(())
    }

    /// Transitions to a new state: runs leaving/entering cleanup, bumps the
    /// state change counter, and broadcasts the new state to all peers.
    fn change_state(&mut self, new: State) -> Result<()> {
        if new == self.state {
            return Ok(());
        }
        let old = self.state;
        info!("State transition {old} → {new}");

        match old {
            State::Leading | State::StandingDown => {
                if self.commit_in_progress() {
                    warn!("Leaving {old} with a commit in progress, failing it");
                    self.fail_commit()?;
                }
                for peer in self.peers.iter() {
                    peer.subscribed.store(false, Ordering::Relaxed);
                }
            }
            State::Following | State::Subscribing => self.stop_following()?,
            State::Synchronizing => self.sync_peer = None,
            State::StandingUp => {
                for peer in self.peers.iter() {
                    peer.standup_response.store(PeerResponse::None);
                }
            }
            _ => {}
        }

        self.state = new;
        self.shared.state.store(new);
        self.state_change_count += 1;
        self.shared.state_change_count.store(self.state_change_count, Ordering::Relaxed);
        self.state_ticks = 0;
        self.state_timeout = self.gen_state_timeout(new);

        match new {
            State::Searching => {
                self.set_lead_peer(None);
                self.sync_peer = None;
            }
            State::Leading => {
                self.set_lead_peer(None);
                self.last_sent_transaction = self.store.commit_count();
                self.last_quorum = Instant::now();
                self.shared.local_commits.reset(self.last_sent_transaction);
            }
            State::Following => {
                self.shared.replication_exit.store(false, Ordering::SeqCst);
                let commit_count = self.store.commit_count();
                self.shared.local_commits.reset(commit_count);
                self.shared.leader_commits.reset(commit_count);
            }
            _ => {}
        }

        let (commit_count, hash) = self.store.committed();
        self.broadcast(
            Message::State { state: new, priority: self.priority, commit_count, hash },
            false,
        )
    }

    /// Generates the timeout for a newly entered state, in ticks. The first
    /// standup waits the longer first timeout; Searching gets random jitter
    /// so peers don't stand up in lockstep.
    fn gen_state_timeout(&mut self, state: State) -> Ticks {
        match state {
            State::StandingUp if self.first_standup => {
                self.first_standup = false;
                self.opts.first_timeout
            }
            State::Searching if self.opts.search_jitter > 0 => {
                self.opts.state_timeout + rand::thread_rng().gen_range(0..=self.opts.search_jitter)
            }
            _ => self.opts.state_timeout,
        }
    }

    /// Stops replication and abandons the leader: signals workers to exit
    /// and drains them, resets the notifiers, rolls back any staged serial
    /// transaction, and requeues escalated commands locally.
    fn stop_following(&mut self) -> Result<()> {
        self.set_lead_peer(None);
        self.shared.replication_exit.store(true, Ordering::SeqCst);
        self.shared.local_commits.wake();
        self.shared.leader_commits.wake();
        while self.shared.replication_threads.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shared.local_commits.reset(0);
        self.shared.leader_commits.reset(0);
        if self.serial.take().is_some() {
            self.db.rollback()?;
        }
        for mut command in self.escalations.drain() {
            info!("Requeueing escalated command {} locally", command.id);
            command.initiating_peer = None;
            self.server.accept_command(command);
        }
        Ok(())
    }

    /// Begins committing the transaction staged on the driver's store handle
    /// at the given consistency level. The commit completes asynchronously;
    /// watch commit_in_progress() and commit_succeeded().
    pub fn start_commit(&mut self, level: ConsistencyLevel) -> Result<()> {
        if self.state != State::Leading {
            return invalid_state!("can't commit while {}", self.state);
        }
        if self.commit_in_progress() {
            return invalid_state!("commit already in progress");
        }
        let mut level = level;
        if level != ConsistencyLevel::Quorum
            && self.last_quorum.elapsed() >= self.opts.quorum_checkpoint
        {
            info!("Quorum checkpoint interval elapsed, upgrading commit to QUORUM");
            level = ConsistencyLevel::Quorum;
        } else if level == ConsistencyLevel::Quorum && !self.has_quorum() {
            return invalid_state!("QUORUM commit without a quorum of subscribed followers");
        }
        self.commit = Some(PendingCommit {
            id: self.next_transaction_id,
            level,
            recipients: Vec::new(),
            count: 0,
            hash: Hash::default(),
        });
        self.next_transaction_id += 1;
        self.set_commit_state(CommitState::Waiting);
        Ok(())
    }

    /// Drives the current commit: broadcasts the transaction when newly
    /// started, then evaluates follower votes per the consistency level.
    fn advance_commit(&mut self) -> Result<()> {
        match self.commit_state {
            CommitState::Waiting => self.begin_commit(),
            CommitState::Committing => self.evaluate_commit(),
            _ => Ok(()),
        }
    }

    /// Prepares the staged transaction and broadcasts it to subscribed
    /// followers.
    fn begin_commit(&mut self) -> Result<()> {
        let txn = match self.db.prepare() {
            Ok(txn) => txn,
            Err(err) => {
                error!("Failed to prepare commit: {err}");
                return self.fail_commit();
            }
        };
        let Some(pending) = &mut self.commit else {
            self.set_commit_state(CommitState::Uninitialized);
            return Ok(());
        };
        pending.count = txn.count;
        pending.hash = txn.hash.clone();
        let (id, level) = (pending.id, pending.level);
        let mut recipients = Vec::new();
        for peer in self.peers.iter() {
            peer.transaction_response.store(PeerResponse::None);
            if peer.is_subscribed() {
                recipients.push(peer.id);
            }
        }
        pending.recipients = recipients;
        info!("Beginning {level} transaction {id} at commit {}", txn.count);
        self.set_commit_state(CommitState::Committing);
        self.broadcast(
            Message::BeginTransaction {
                id,
                count: txn.count,
                hash: txn.hash,
                query: txn.query,
                level,
            },
            true,
        )?;
        self.evaluate_commit()
    }

    /// Evaluates follower votes for the in-flight commit, committing or
    /// rolling back once its consistency level is decided.
    fn evaluate_commit(&mut self) -> Result<()> {
        let Some(pending) = &self.commit else {
            return Ok(());
        };
        let (level, count, recipients) = (pending.level, pending.count, pending.recipients.clone());

        // Count votes among recipients that are still subscribed.
        let (mut approvals, mut live, mut denied) = (0usize, 0usize, false);
        for id in &recipients {
            let Some(peer) = self.peers.get(*id) else { continue };
            if !peer.is_subscribed() {
                continue;
            }
            live += 1;
            match peer.transaction_response.load() {
                PeerResponse::Approve => approvals += 1,
                PeerResponse::Deny => denied = true,
                PeerResponse::None => {}
            }
        }
        if denied {
            warn!("Commit {count} denied by a follower, rolling back");
            return self.fail_commit();
        }
        let decided = match level {
            ConsistencyLevel::Async => true,
            ConsistencyLevel::One => {
                if approvals >= 1 {
                    true
                } else if live == 0 {
                    warn!("Commit {count} has no subscribed follower left to approve it");
                    return self.fail_commit();
                } else {
                    false
                }
            }
            // Strictly more than half of the subscribed followers plus self,
            // counting our own vote, and the group itself must still be a
            // cluster quorum.
            ConsistencyLevel::Quorum => {
                if live + 1 < self.peers.quorum_size() {
                    warn!("Commit {count} lost its quorum of subscribed followers");
                    return self.fail_commit();
                }
                (approvals + 1) * 2 > live + 1
            }
        };
        if !decided {
            return Ok(());
        }
        self.finish_commit()
    }

    /// Commits the approved transaction locally and streams the commit to
    /// followers.
    fn finish_commit(&mut self) -> Result<()> {
        let Some(pending) = self.commit.take() else {
            return Ok(());
        };
        let txn = match self.db.commit() {
            Ok(txn) => txn,
            Err(err) => {
                error!("Local commit {} failed: {err}", pending.count);
                self.commit = Some(pending);
                return self.fail_commit();
            }
        };
        if txn.count != pending.count || txn.hash != pending.hash {
            self.set_commit_state(CommitState::Failed);
            return Err(Error::HashMismatch(format!(
                "prepared commit {} but committed {}",
                pending.count, txn.count
            )));
        }
        if pending.level == ConsistencyLevel::Quorum {
            self.last_quorum = Instant::now();
        }
        self.set_commit_state(CommitState::Success);
        self.shared.local_commits.notify_through(txn.count);
        info!("Committed {} transaction {} at commit {}", pending.level, pending.id, txn.count);
        self.send_outstanding_transactions(Some((txn.count, pending.id)))
    }

    /// Rolls back the in-flight commit and tells followers to do the same.
    fn fail_commit(&mut self) -> Result<()> {
        let Some(pending) = self.commit.take() else {
            return Ok(());
        };
        let broadcasted = self.commit_state == CommitState::Committing;
        if let Err(err) = self.db.rollback() {
            error!("Rollback of commit {} failed: {err}", pending.count);
        }
        self.set_commit_state(CommitState::Failed);
        warn!("Rolled back transaction {} at commit {}", pending.id, pending.count);
        if broadcasted {
            self.broadcast(
                Message::RollbackTransaction { id: pending.id, count: pending.count },
                true,
            )?;
        }
        Ok(())
    }

    fn set_commit_state(&mut self, commit_state: CommitState) {
        self.commit_state = commit_state;
        self.shared.commit_state.store(commit_state);
    }

    /// Streams committed transactions newer than the last sent one to
    /// subscribed followers as begin/commit pairs, or as a commit alone for
    /// the transaction the leader already began via the commit path.
    fn send_outstanding_transactions(
        &mut self,
        commit_only: Option<(CommitCount, TransactionID)>,
    ) -> Result<()> {
        if !matches!(self.state, State::Leading | State::StandingDown) {
            return Ok(());
        }
        let commit_count = self.store.commit_count();
        while self.last_sent_transaction < commit_count {
            let count = self.last_sent_transaction + 1;
            let Some(txn) = self.store.transaction(count)? else {
                error!("Transaction {count} missing from the local store");
                break;
            };
            match commit_only {
                Some((only, id)) if only == count => {
                    self.broadcast(Message::CommitTransaction { id, count, hash: txn.hash }, true)?;
                }
                _ => {
                    let id = self.next_transaction_id;
                    self.next_transaction_id += 1;
                    debug!("Streaming outstanding commit {count} to followers");
                    self.broadcast(
                        Message::BeginTransaction {
                            id,
                            count,
                            hash: txn.hash.clone(),
                            query: txn.query,
                            level: ConsistencyLevel::Async,
                        },
                        true,
                    )?;
                    self.broadcast(Message::CommitTransaction { id, count, hash: txn.hash }, true)?;
                }
            }
            self.last_sent_transaction = count;
            self.shared.local_commits.notify_through(count);
        }
        Ok(())
    }

    /// Handles a commit wake-up: another thread committed on the shared
    /// store, so stream it to followers.
    pub fn on_notify_commit(&mut self) -> Result<()> {
        self.send_outstanding_transactions(None)
    }

    /// Processes a thread-safe entry-point request. Invalid-state errors are
    /// reported and ignored, per the entry-point contract.
    pub fn request(&mut self, request: Request) -> Result<()> {
        match request {
            Request::StartCommit(level) => {
                if let Err(err) = self.start_commit(level) {
                    error!("Can't start commit: {err}");
                }
                Ok(())
            }
            Request::Escalate { command, forget } => self.escalate_command(command, forget),
            Request::CancelEscalation(id) => self.cancel_escalation(id),
            Request::SendResponse(command) => {
                if let Err(err) = self.send_response(&command) {
                    error!("Can't respond to escalation: {err}");
                }
                Ok(())
            }
            Request::Broadcast(message) => self.broadcast(message, false),
            Request::BeginShutdown(wait) => {
                self.begin_shutdown(wait);
                Ok(())
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
        }
    }

    /// Escalates a mutating command to the leader, taking ownership until the
    /// response arrives. Forgetful escalations are sent and dropped without
    /// awaiting a response. Commands that can't be escalated are completed
    /// with an error.
    pub fn escalate_command(&mut self, mut command: Command, forget: bool) -> Result<()> {
        let lead = match self.state {
            State::Following if !self.graceful_shutdown() => self.lead_peer(),
            _ => None,
        };
        let Some(to) = lead else {
            debug!("Can't escalate command {} while {}", command.id, self.state);
            command.response = Some(invalid_state!("node {} can't escalate", self.name));
            command.complete = true;
            self.server.complete_command(command);
            return Ok(());
        };
        info!("Escalating command {} to the leader", command.id);
        self.send(to, Message::Escalate { id: command.id, request: command.request.clone() })?;
        if !forget {
            self.escalations.insert(command);
        }
        Ok(())
    }

    /// Abandons an escalated command, telling the leader to drop it.
    pub fn cancel_escalation(&mut self, id: CommandID) -> Result<()> {
        if self.escalations.remove(&id).is_some() {
            info!("Canceling escalated command {id}");
            if let Some(to) = self.lead_peer() {
                self.send(to, Message::EscalateCancel { id })?;
            }
        }
        Ok(())
    }

    /// Returns a completed command's response to the peer that escalated it.
    /// Calling this when not leading, or for a command without an initiating
    /// peer, is a programming error.
    pub fn send_response(&mut self, command: &Command) -> Result<()> {
        if self.state != State::Leading {
            return invalid_state!("can't respond to escalations while {}", self.state);
        }
        let Some(to) = command.initiating_peer else {
            return invalid_state!("command {} has no initiating peer", command.id);
        };
        let response = command.response.clone().unwrap_or(Ok(Vec::new()));
        self.send(to, Message::EscalateResponse { id: command.id, response })
    }

    /// Begins a graceful shutdown: lowers our priority so peers stop
    /// electing this node, and arms the deadline after which shutdown is
    /// forced.
    pub fn begin_shutdown(&mut self, wait: Duration) {
        info!("Beginning graceful shutdown, forced after {wait:?}");
        self.shutdown_deadline = Some(Instant::now() + wait);
        self.priority = PRIORITY_NOT_READY;
        self.shared.priority.store(PRIORITY_NOT_READY, Ordering::Relaxed);
        let (commit_count, hash) = self.store.committed();
        if let Err(err) = self.broadcast(
            Message::State { state: self.state, priority: self.priority, commit_count, hash },
            false,
        ) {
            error!("Failed to announce shutdown: {err}");
        }
    }

    /// Whether a graceful shutdown is in progress.
    pub fn graceful_shutdown(&self) -> bool {
        self.shutdown_deadline.is_some()
    }

    /// True when shutdown can complete: nothing is in flight and the node is
    /// in a resting state, or the deadline has passed, which forces
    /// replication workers to exit and permits a hard close.
    pub fn shutdown_complete(&self) -> bool {
        let Some(deadline) = self.shutdown_deadline else {
            return false;
        };
        if Instant::now() >= deadline {
            warn!("Graceful shutdown deadline elapsed, forcing");
            self.shared.replication_exit.store(true, Ordering::SeqCst);
            self.shared.local_commits.wake();
            self.shared.leader_commits.wake();
            return true;
        }
        !self.commit_in_progress()
            && self.escalations.is_empty()
            && self.shared.replication_threads.load(Ordering::SeqCst) == 0
            && matches!(self.state, State::Searching | State::Waiting)
    }

    /// Builds a status snapshot of this node and its peers.
    pub fn status(&self) -> Status {
        let (commit_count, hash) = self.store.committed();
        Status {
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            commit_count,
            hash,
            state_change_count: self.state_change_count,
            leader: self
                .lead_peer()
                .and_then(|id| self.peers.get(id))
                .map(|p| p.name.clone()),
            escalated: self.escalations.len(),
            replication_threads: self.shared.replication_threads.load(Ordering::SeqCst),
            peers: self
                .peers
                .iter()
                .sorted_by_key(|p| p.id)
                .map(|p| {
                    let (peer_commit, _) = p.commit();
                    PeerStatus {
                        name: p.name.clone(),
                        state: p.state.load(),
                        logged_in: p.is_logged_in(),
                        subscribed: p.is_subscribed(),
                        commit_count: peer_commit,
                        priority: p.priority.load(Ordering::Relaxed),
                        latency: p.latency.load(Ordering::Relaxed),
                        failed_connections: p.failed_connections.load(Ordering::Relaxed),
                    }
                })
                .collect(),
        }
    }
}

/// Builds a SynchronizeResponse for a peer at the given position. Pure: reads
/// only the store, so it can serve any requester regardless of node state.
/// Verifies that the requester's position matches our history, returning
/// commits past it: everything through the current commit when `send_all`,
/// otherwise at most `chunk` commits.
pub(super) fn synchronize_response(
    store: &dyn Store,
    peer_commit: CommitCount,
    peer_hash: &Hash,
    send_all: bool,
    chunk: u64,
) -> Result<Message> {
    let (commit_count, hash) = store.committed();
    if peer_commit > commit_count {
        return Err(Error::HashMismatch(format!(
            "peer is at commit {peer_commit}, ahead of ours at {commit_count}"
        )));
    }
    if peer_commit > 0 {
        match store.transaction(peer_commit)? {
            Some(txn) if &txn.hash == peer_hash => {}
            _ => {
                return Err(Error::HashMismatch(format!(
                    "peer hash at commit {peer_commit} does not match our history"
                )))
            }
        }
    }
    let last = if send_all { commit_count } else { commit_count.min(peer_commit + chunk) };
    let mut commits = Vec::new();
    for count in peer_commit + 1..=last {
        match store.transaction(count)? {
            Some(txn) => commits.push(txn),
            None => break,
        }
    }
    Ok(Message::SynchronizeResponse { commits, commit_count, hash })
}

/// The wall clock in microseconds since the Unix epoch.
fn now_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::super::transport::Mesh;
    use super::*;
    use crate::store::{Memory, Pool};
    use pretty_assertions::assert_eq;

    /// A command server that discards everything.
    struct NullServer;

    impl CommandServer for NullServer {
        fn accept_command(&self, _: Command) {}
        fn complete_command(&self, _: Command) {}
    }

    /// Builds a standalone node with two configured (but unconnected) peers.
    fn test_node(priority: Priority) -> Node {
        let mesh = Mesh::new();
        let (_, peers) =
            Peers::parse("localhost:1?name=a,localhost:2?name=b,localhost:3?name=c", "a").unwrap();
        let store: Arc<dyn Store> = Arc::new(Memory::new());
        let pool = Arc::new(Pool::new(store.as_ref(), 2));
        let (wake, _) = crossbeam::channel::bounded(1);
        Node::new(
            1,
            "a",
            "0.0.0",
            priority,
            "localhost:0",
            peers,
            store,
            pool,
            Arc::new(NullServer),
            Arc::new(mesh.join(1)),
            wake,
            Options { search_jitter: 0, ..Options::default() },
        )
        .unwrap()
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            State::Unknown,
            State::Searching,
            State::Synchronizing,
            State::Waiting,
            State::StandingUp,
            State::Leading,
            State::StandingDown,
            State::Subscribing,
            State::Following,
        ] {
            assert_eq!(state.name().parse::<State>().unwrap(), state);
        }
        assert!("BOGUS".parse::<State>().is_err());
    }

    #[test]
    fn first_timeouts_are_longer() {
        let mut node = test_node(100);
        // The initial search uses the first timeout.
        assert_eq!(node.state_timeout, node.opts.first_timeout);
        // The first standup does too; subsequent ones use the steady value.
        assert_eq!(node.gen_state_timeout(State::StandingUp), node.opts.first_timeout);
        assert_eq!(node.gen_state_timeout(State::StandingUp), node.opts.state_timeout);
        // Steady-state searches use the steady value (jitter disabled here).
        assert_eq!(node.gen_state_timeout(State::Searching), node.opts.state_timeout);
    }

    #[test]
    fn quorum_arithmetic() {
        let mut node = test_node(100);
        assert_eq!(node.peers.cluster_size(), 3);
        assert_eq!(node.peers.quorum_size(), 2);

        // Not leading: no quorum regardless of subscriptions.
        assert!(!node.has_quorum());

        node.state = State::Leading;
        assert!(!node.has_quorum());
        node.peers.get(2).unwrap().subscribed.store(true, Ordering::Relaxed);
        assert!(node.has_quorum());
    }

    #[test]
    fn standup_votes() {
        let mut node = test_node(50);
        let b = node.peers.get(2).unwrap().clone();
        let c = node.peers.get(3).unwrap().clone();

        // Candidate outranked by us.
        let (vote, _) = node.standup_vote(&b, 10, 0);
        assert_eq!(vote, PeerResponse::Deny);

        // Candidate outranks us.
        let (vote, reason) = node.standup_vote(&b, 100, 0);
        assert_eq!((vote, reason), (PeerResponse::Approve, None));

        // Candidate outranked by another logged-in peer.
        c.logged_in.store(true, Ordering::Relaxed);
        c.priority.store(200, Ordering::Relaxed);
        let (vote, _) = node.standup_vote(&b, 100, 0);
        assert_eq!(vote, PeerResponse::Deny);
        c.logged_in.store(false, Ordering::Relaxed);

        // Zero priority can't lead.
        let (vote, _) = node.standup_vote(&b, 0, 0);
        assert_eq!(vote, PeerResponse::Deny);

        // No votes granted while leading.
        node.state = State::Leading;
        let (vote, _) = node.standup_vote(&b, 100, 0);
        assert_eq!(vote, PeerResponse::Deny);
        node.state = State::Searching;

        // Candidates behind our commit count are denied.
        node.db.begin().unwrap();
        node.db.mutate("SET a 1").unwrap();
        node.db.commit().unwrap();
        let (vote, _) = node.standup_vote(&b, 100, 0);
        assert_eq!(vote, PeerResponse::Deny);
        let (vote, _) = node.standup_vote(&b, 100, 1);
        assert_eq!(vote, PeerResponse::Approve);
    }

    #[test]
    fn quorum_checkpoint_upgrades_commits() {
        let mut node = test_node(100);
        node.state = State::Leading;
        node.opts.quorum_checkpoint = Duration::from_secs(0);
        node.db.begin().unwrap();
        node.db.mutate("SET a 1").unwrap();
        node.start_commit(ConsistencyLevel::Async).unwrap();
        assert_eq!(node.commit.as_ref().unwrap().level, ConsistencyLevel::Quorum);
    }

    #[test]
    fn start_commit_requires_leading() {
        let mut node = test_node(100);
        assert!(node.start_commit(ConsistencyLevel::Async).is_err());
        assert!(!node.commit_in_progress());

        node.state = State::Leading;
        // Quorum commits require a quorum.
        assert!(node.start_commit(ConsistencyLevel::Quorum).is_err());

        node.db.begin().unwrap();
        node.db.mutate("SET a 1").unwrap();
        node.start_commit(ConsistencyLevel::Async).unwrap();
        assert!(node.commit_in_progress());
        assert!(node.start_commit(ConsistencyLevel::Async).is_err());

        // With no followers, an async commit completes on the next update.
        node.advance_commit().unwrap();
        assert!(node.commit_succeeded());
        assert_eq!(node.store.commit_count(), 1);
    }

    #[test]
    fn synchronize_responses_verify_and_chunk() -> Result<()> {
        let store = Memory::new();
        let mut db = store.handle();
        for i in 0..5 {
            db.begin()?;
            db.mutate(&format!("SET key{i} {i}"))?;
            db.commit()?;
        }
        let (count, hash) = store.committed();
        assert_eq!(count, 5);

        // Full synchronization from scratch.
        let Message::SynchronizeResponse { commits, commit_count, .. } =
            synchronize_response(&store, 0, &Hash::default(), true, 2)?
        else {
            panic!("expected SynchronizeResponse");
        };
        assert_eq!(commit_count, 5);
        assert_eq!(commits.len(), 5);

        // Chunked synchronization from a matching position.
        let two = store.transaction(2)?.unwrap();
        let Message::SynchronizeResponse { commits, .. } =
            synchronize_response(&store, 2, &two.hash, false, 2)?
        else {
            panic!("expected SynchronizeResponse");
        };
        assert_eq!(commits.iter().map(|t| t.count).collect::<Vec<_>>(), vec![3, 4]);

        // A diverged or future position fails.
        assert!(synchronize_response(&store, 2, &hash, false, 2).is_err());
        assert!(synchronize_response(&store, 9, &hash, false, 2).is_err());
        Ok(())
    }
}
