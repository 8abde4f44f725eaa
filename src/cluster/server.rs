use super::escalation::{Command, CommandID, CommandServer};
use super::message::{ConsistencyLevel, Message, PeerID, Priority};
use super::node::{CommitState, Node, Options, Shared, State, Status};
use super::peer::Peers;
use super::transport::{Event, Transport};
use crate::error::{Error, Result};
use crate::store::{Pool, Store};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::info;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// The default driver tick interval.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A request into the driver loop from a [`NodeHandle`].
pub enum Request {
    StartCommit(ConsistencyLevel),
    Escalate { command: Command, forget: bool },
    CancelEscalation(CommandID),
    SendResponse(Command),
    Broadcast(Message),
    BeginShutdown(Duration),
    Status(Sender<Status>),
}

/// The node driver: a single thread servicing transport events, handle
/// requests, commit wake-ups, and ticks, running the state machine between
/// them until it makes no further progress.
pub struct Server {
    node: Node,
    events: Receiver<Event>,
    requests: Receiver<Request>,
    wake: Receiver<()>,
    transport: Arc<dyn Transport>,
    tick_interval: Duration,
}

impl Server {
    /// Creates a server and the thread-safe handle to it.
    pub fn new(
        id: PeerID,
        name: &str,
        version: &str,
        priority: Priority,
        command_address: &str,
        peers: Peers,
        store: Arc<dyn Store>,
        pool: Arc<Pool>,
        command_server: Arc<dyn CommandServer>,
        transport: Arc<dyn Transport>,
        opts: Options,
    ) -> Result<(Server, NodeHandle)> {
        let (request_tx, request_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let node = Node::new(
            id,
            name,
            version,
            priority,
            command_address,
            peers,
            store,
            pool,
            command_server,
            transport.clone(),
            wake_tx.clone(),
            opts,
        )?;
        let handle =
            NodeHandle { requests: request_tx, wake: wake_tx, shared: node.shared().clone() };
        let events = transport.receiver();
        let server = Server {
            node,
            events,
            requests: request_rx,
            wake: wake_rx,
            transport,
            tick_interval: TICK_INTERVAL,
        };
        Ok((server, handle))
    }

    /// Overrides the driver tick interval. Tests shrink it.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Runs the driver loop until a graceful shutdown completes. Consumes
    /// the server; run it on a dedicated thread.
    pub fn serve(mut self) -> Result<()> {
        let ticker = crossbeam::channel::tick(self.tick_interval);
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => self.node.tick()?,
                recv(self.events) -> event => match event {
                    Ok(event) => self.node.step(event)?,
                    Err(_) => return Err(Error::IO("transport event channel closed".into())),
                },
                recv(self.requests) -> request => match request {
                    Ok(request) => self.node.request(request)?,
                    // All handles dropped; keep serving without them.
                    Err(_) => self.requests = crossbeam::channel::never(),
                },
                recv(self.wake) -> _ => self.node.on_notify_commit()?,
            }
            while self.node.update()? {}
            if self.node.graceful_shutdown() && self.node.shutdown_complete() {
                break;
            }
        }
        info!("Node {} shut down", self.node.name());
        self.transport.shutdown();
        Ok(())
    }
}

/// A cloneable, thread-safe handle to a node: the entry points callable from
/// outside the driver thread. State reads come from the shared atomics;
/// operations are queued onto the driver loop.
#[derive(Clone)]
pub struct NodeHandle {
    requests: Sender<Request>,
    wake: Sender<()>,
    shared: Arc<Shared>,
}

impl NodeHandle {
    pub fn state(&self) -> State {
        self.shared.state.load()
    }

    pub fn commit_state(&self) -> CommitState {
        self.shared.commit_state.load()
    }

    /// True while a commit is being replicated.
    pub fn commit_in_progress(&self) -> bool {
        matches!(self.commit_state(), CommitState::Waiting | CommitState::Committing)
    }

    /// True if the last commit succeeded.
    pub fn commit_succeeded(&self) -> bool {
        self.commit_state() == CommitState::Success
    }

    pub fn priority(&self) -> Priority {
        self.shared.priority.load(Ordering::Relaxed)
    }

    pub fn state_change_count(&self) -> u64 {
        self.shared.state_change_count.load(Ordering::Relaxed)
    }

    /// Begins committing the transaction staged on the driver's store
    /// handle. Watch commit_in_progress()/commit_succeeded() for the
    /// outcome.
    pub fn start_commit(&self, level: ConsistencyLevel) -> Result<()> {
        Ok(self.requests.send(Request::StartCommit(level))?)
    }

    /// Escalates a mutating command to the leader. The command returns
    /// through CommandServer::complete_command when the leader responds,
    /// unless `forget` is set.
    pub fn escalate_command(&self, command: Command, forget: bool) -> Result<()> {
        Ok(self.requests.send(Request::Escalate { command, forget })?)
    }

    /// Abandons an escalated command.
    pub fn cancel_escalation(&self, id: CommandID) -> Result<()> {
        Ok(self.requests.send(Request::CancelEscalation(id))?)
    }

    /// Returns a completed escalated command's response to the peer that
    /// sent it.
    pub fn send_response(&self, command: Command) -> Result<()> {
        Ok(self.requests.send(Request::SendResponse(command))?)
    }

    /// Broadcasts a message to all peers.
    pub fn broadcast(&self, message: Message) -> Result<()> {
        Ok(self.requests.send(Request::Broadcast(message))?)
    }

    /// Begins a graceful shutdown with the given deadline; serve() returns
    /// once it completes.
    pub fn begin_shutdown(&self, wait: Duration) -> Result<()> {
        Ok(self.requests.send(Request::BeginShutdown(wait))?)
    }

    /// Tells the node another thread committed on the shared store, so it
    /// can interrupt its poll and stream the commit to followers. Never
    /// blocks.
    pub fn notify_commit(&self) {
        let _ = self.wake.try_send(());
    }

    /// Fetches a status snapshot from the driver.
    pub fn status(&self) -> Result<Status> {
        let (reply_tx, reply_rx) = bounded(1);
        self.requests.send(Request::Status(reply_tx))?;
        Ok(reply_rx.recv()?)
    }
}
