//! End-to-end cluster scenarios, run in-process over the Channel transport.
//! The test drives each node's step/tick/update cycle directly (playing the
//! role of the driver loop), which keeps elections and message routing
//! deterministic; replication worker threads still run concurrently.

use meshdb::cluster::transport::{Channel, Mesh, Transport};
use meshdb::cluster::{
    Command, CommandServer, ConsistencyLevel, Event, Node, Options, Peers, Server, State,
};
use meshdb::error::Result;
use meshdb::store::{Memory, Pool, Store};

use crossbeam::channel::Receiver;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NAMES: [&str; 5] = ["a", "b", "c", "d", "e"];

/// How many tick rounds to run before declaring a scenario stuck.
const MAX_TICKS: usize = 500;

/// A command server that records everything it is handed.
#[derive(Default)]
struct Commands {
    accepted: Mutex<Vec<Command>>,
    completed: Mutex<Vec<Command>>,
}

impl Commands {
    fn accepted(&self) -> Vec<Command> {
        self.accepted.lock().unwrap().clone()
    }

    fn completed(&self) -> Vec<Command> {
        self.completed.lock().unwrap().clone()
    }
}

impl CommandServer for Commands {
    fn accept_command(&self, command: Command) {
        self.accepted.lock().unwrap().push(command);
    }

    fn complete_command(&self, command: Command) {
        self.completed.lock().unwrap().push(command);
    }
}

struct TestNode {
    node: Node,
    events: Receiver<Event>,
    store: Memory,
    commands: Arc<Commands>,
    dead: bool,
}

struct Cluster {
    mesh: Arc<Mesh>,
    nodes: Vec<TestNode>,
}

/// Shrunken timeouts, with jitter disabled for determinism.
fn options() -> Options {
    Options {
        first_timeout: 8,
        state_timeout: 4,
        search_jitter: 0,
        ping_interval: 1000,
        recv_timeout: 10000,
        ..Options::default()
    }
}

/// Builds an n-node cluster with the given priorities. Priority 0 nodes are
/// configured as permafollowers.
fn cluster(priorities: &[i64], opts: Options) -> Result<Cluster> {
    let mesh = Mesh::new();
    let list = priorities
        .iter()
        .enumerate()
        .map(|(i, priority)| {
            let mut entry = format!("localhost:{}?name={}", 9700 + i, NAMES[i]);
            if *priority == 0 {
                entry.push_str("&permafollower=true");
            }
            entry
        })
        .collect::<Vec<_>>()
        .join(",");

    let mut nodes = Vec::new();
    for (i, priority) in priorities.iter().enumerate() {
        let (id, peers) = Peers::parse(&list, NAMES[i])?;
        let transport: Arc<Channel> = Arc::new(mesh.join(id));
        let events = transport.receiver();
        let store = Memory::new();
        let store_arc: Arc<dyn Store> = Arc::new(store.clone());
        let pool = Arc::new(Pool::new(store_arc.as_ref(), 4));
        let commands = Arc::new(Commands::default());
        let (wake, _) = crossbeam::channel::bounded(1);
        let node = Node::new(
            id,
            NAMES[i],
            "0.0.0",
            *priority,
            &format!("localhost:{}", 9600 + i),
            peers,
            store_arc,
            pool,
            commands.clone(),
            transport,
            wake,
            opts.clone(),
        )?;
        nodes.push(TestNode { node, events, store, commands, dead: false });
    }
    Ok(Cluster { mesh, nodes })
}

impl Cluster {
    /// Delivers pending events and runs every state machine until nothing
    /// makes progress.
    fn settle(&mut self) -> Result<()> {
        loop {
            let mut progress = false;
            for tn in self.nodes.iter_mut().filter(|tn| !tn.dead) {
                while let Ok(event) = tn.events.try_recv() {
                    tn.node.step(event)?;
                    progress = true;
                }
                while tn.node.update()? {
                    progress = true;
                }
            }
            if !progress {
                return Ok(());
            }
        }
    }

    /// Settles, ticks every node once, and settles again.
    fn tick(&mut self) -> Result<()> {
        self.settle()?;
        for tn in self.nodes.iter_mut().filter(|tn| !tn.dead) {
            tn.node.tick()?;
        }
        self.settle()
    }

    /// Ticks until the condition holds, panicking if it never does. Sleeps
    /// briefly between rounds so replication workers can make progress.
    fn run_until(&mut self, f: impl Fn(&Cluster) -> bool) -> Result<()> {
        for _ in 0..MAX_TICKS {
            self.settle()?;
            if f(self) {
                return Ok(());
            }
            self.tick()?;
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("cluster did not reach the expected condition; states: {:?}", self.states());
    }

    /// Crashes a node: removes it from the mesh and stops driving it.
    fn crash(&mut self, i: usize) {
        self.mesh.leave(self.nodes[i].node_id());
        self.nodes[i].dead = true;
    }

    fn states(&self) -> Vec<State> {
        self.nodes.iter().map(|tn| tn.node.state()).collect()
    }

    fn commit_counts(&self) -> Vec<u64> {
        self.nodes.iter().map(|tn| tn.store.commit_count()).collect()
    }

    /// Runs until the cluster has elected the given leader and everyone else
    /// alive is following.
    fn elect(&mut self, leader: usize) -> Result<()> {
        self.run_until(|c| {
            c.nodes.iter().enumerate().all(|(i, tn)| {
                tn.dead
                    || (i == leader && tn.node.state() == State::Leading)
                    || (i != leader && tn.node.state() == State::Following)
            })
        })
    }
}

impl TestNode {
    /// The node's peer ID: its 1-based position in the shared cluster list.
    fn node_id(&self) -> u64 {
        NAMES.iter().position(|n| *n == self.node.name()).unwrap() as u64 + 1
    }
}

/// Scenario: clean election. Three fresh nodes with priorities 100/50/10;
/// the highest priority leads, the others follow, each in three state
/// changes from SEARCHING.
#[test]
fn clean_election() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;
    assert_eq!(c.states(), vec![State::Leading, State::Following, State::Following]);
    for tn in &c.nodes {
        assert_eq!(tn.node.state_change_count(), 3, "node {}", tn.node.name());
    }
    // Followers know the leader's command address.
    assert_eq!(c.nodes[1].node.leader_command_address().as_deref(), Some("localhost:9600"));
    Ok(())
}

/// Scenario: a QUORUM commit on a three-node cluster reaches every store
/// with an identical hash.
#[test]
fn quorum_commit() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    c.nodes[0].node.db().begin()?;
    c.nodes[0].node.db().mutate("SET x 1")?;
    c.nodes[0].node.start_commit(ConsistencyLevel::Quorum)?;

    c.run_until(|c| c.nodes[0].node.commit_succeeded() && c.commit_counts() == vec![1, 1, 1])?;

    let (count, hash) = c.nodes[0].store.committed();
    assert_eq!(count, 1);
    for tn in &c.nodes[1..] {
        assert_eq!(tn.store.committed(), (1, hash.clone()), "node {}", tn.node.name());
        assert_eq!(tn.store.get("x").as_deref(), Some("1"));
    }
    Ok(())
}

/// Scenario: a follower that cannot apply a transaction denies it, and the
/// leader rolls back cluster-wide. Uses serial replication so the deny
/// reaches the leader deterministically before it gathers a quorum.
#[test]
fn follower_denies() -> Result<()> {
    let opts = Options { parallel_replication: false, ..options() };
    let mut c = cluster(&[100, 50, 10], opts)?;
    c.elect(0)?;

    // The first follower fails the mutation and denies.
    c.nodes[1].store.inject_mutate_failures(1);

    c.nodes[0].node.db().begin()?;
    c.nodes[0].node.db().mutate("SET x 1")?;
    c.nodes[0].node.start_commit(ConsistencyLevel::Quorum)?;

    c.run_until(|c| {
        c.nodes[0].node.commit_state() == meshdb::cluster::CommitState::Failed
    })?;
    c.settle()?;

    assert_eq!(c.commit_counts(), vec![0, 0, 0]);
    assert!(!c.nodes[0].node.commit_succeeded());
    Ok(())
}

/// Scenario: the leader crashes after broadcasting a transaction but before
/// committing it. Followers abandon the commit, elect the next-highest
/// priority, and the store is unchanged.
#[test]
fn leader_crash_mid_commit() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    // Broadcast the begin, then crash the leader before it can commit.
    c.nodes[0].node.db().begin()?;
    c.nodes[0].node.db().mutate("SET x 1")?;
    c.nodes[0].node.start_commit(ConsistencyLevel::Quorum)?;
    while c.nodes[0].node.update()? {}
    assert!(c.nodes[0].node.commit_in_progress());
    c.crash(0);

    c.elect(1)?;
    assert_eq!(c.nodes[1].node.state(), State::Leading);
    assert_eq!(c.nodes[2].node.state(), State::Following);
    // The abandoned commit was never applied.
    assert_eq!(c.nodes[1].store.commit_count(), 0);
    assert_eq!(c.nodes[2].store.commit_count(), 0);

    // The new leader's next commit takes the abandoned commit number.
    c.nodes[1].node.db().begin()?;
    c.nodes[1].node.db().mutate("SET y 2")?;
    c.nodes[1].node.start_commit(ConsistencyLevel::Quorum)?;
    c.run_until(|c| c.nodes[1].node.commit_succeeded() && c.nodes[2].store.commit_count() == 1)?;
    assert_eq!(c.nodes[1].store.committed(), c.nodes[2].store.committed());
    Ok(())
}

/// Scenario: a follower escalates a write to the leader, the leader commits
/// it and responds, and the follower's command completes with the response.
#[test]
fn escalation_round_trip() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    let command = Command::new("SET y 2", false);
    let id = command.id;
    c.nodes[1].node.escalate_command(command, false)?;
    c.run_until(|c| !c.nodes[0].commands.accepted().is_empty())?;

    // Play the leader's command server: execute and respond.
    let mut escalated = c.nodes[0].commands.accepted().remove(0);
    assert_eq!(escalated.id, id);
    assert_eq!(escalated.request, "SET y 2");
    assert!(escalated.initiating_peer.is_some());

    c.nodes[0].node.db().begin()?;
    c.nodes[0].node.db().mutate(&escalated.request)?;
    c.nodes[0].node.start_commit(ConsistencyLevel::One)?;
    c.run_until(|c| c.nodes[0].node.commit_succeeded())?;

    escalated.response = Some(Ok(b"done".to_vec()));
    c.nodes[0].node.send_response(&escalated)?;
    c.run_until(|c| !c.nodes[1].commands.completed().is_empty())?;

    let completed = c.nodes[1].commands.completed().remove(0);
    assert_eq!(completed.id, id);
    assert!(completed.complete);
    assert_eq!(completed.response, Some(Ok(b"done".to_vec())));

    // The write replicated back to the escalating follower.
    c.run_until(|c| c.nodes[1].store.commit_count() == 1)?;
    assert_eq!(c.nodes[1].store.get("y").as_deref(), Some("2"));
    Ok(())
}

/// Escalated commands are requeued locally when the leader is lost before
/// responding.
#[test]
fn escalation_requeued_on_leader_loss() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    let command = Command::new("SET y 2", false);
    let id = command.id;
    c.nodes[1].node.escalate_command(command, false)?;
    c.crash(0);
    c.elect(1)?;

    let requeued = c.nodes[1].commands.accepted();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].id, id);
    assert_eq!(requeued[0].initiating_peer, None);
    assert!(!requeued[0].complete);
    Ok(())
}

/// Scenario: back-to-back commits replicate in parallel but apply in strict
/// commit order on every follower, leaving identical histories.
#[test]
fn parallel_replication_ordering() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    // Commit three transactions on the leader's store from outside the node,
    // then notify it, as an external command thread would.
    let store = c.nodes[0].store.clone();
    let mut db = store.handle();
    for i in 1..=3 {
        db.begin()?;
        db.mutate(&format!("SET key{i} {i}"))?;
        db.commit()?;
    }
    c.nodes[0].node.on_notify_commit()?;

    c.run_until(|c| c.commit_counts() == vec![3, 3, 3])?;
    let (_, hash) = c.nodes[0].store.committed();
    for tn in &c.nodes[1..] {
        assert_eq!(tn.store.committed(), (3, hash.clone()), "node {}", tn.node.name());
        for i in 1..=3u64 {
            assert_eq!(
                tn.store.transaction(i)?,
                c.nodes[0].store.transaction(i)?,
                "node {} commit {i}",
                tn.node.name()
            );
        }
    }
    Ok(())
}

/// Invariant: a permafollower never stands up, even when it is the only
/// other node.
#[test]
fn permafollower_never_leads() -> Result<()> {
    let mut c = cluster(&[100, 0], options())?;
    c.elect(0)?;
    assert_eq!(c.states(), vec![State::Leading, State::Following]);
    // Three changes means the permafollower went straight to following and
    // never through STANDINGUP.
    assert_eq!(c.nodes[1].node.state_change_count(), 3);
    Ok(())
}

/// A graceful shutdown with nothing in flight completes as soon as the node
/// returns to a resting state; peers see its not-ready priority.
#[test]
fn graceful_shutdown_idle_follower() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    c.nodes[1].node.begin_shutdown(Duration::from_secs(60));
    c.run_until(|c| c.nodes[1].node.state() == State::Searching)?;
    assert!(c.nodes[1].node.graceful_shutdown());
    assert!(c.nodes[1].node.shutdown_complete());

    // The leader sees the not-ready priority and the cluster stays led.
    let status = c.nodes[0].node.status();
    let b = status.peers.iter().find(|p| p.name == "b").unwrap();
    assert_eq!(b.priority, meshdb::cluster::PRIORITY_NOT_READY);
    assert_eq!(c.nodes[0].node.state(), State::Leading);
    Ok(())
}

/// A shutdown deadline in the past forces completion immediately.
#[test]
fn shutdown_deadline_forces() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;
    c.nodes[2].node.begin_shutdown(Duration::ZERO);
    assert!(c.nodes[2].node.shutdown_complete());
    Ok(())
}

/// A leader shuts down by standing down first; the remaining nodes elect a
/// new leader.
#[test]
fn graceful_shutdown_leader_stands_down() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;
    c.elect(0)?;

    c.nodes[0].node.begin_shutdown(Duration::from_secs(60));
    c.run_until(|c| c.nodes[0].node.shutdown_complete())?;

    // The remaining nodes re-elect among themselves.
    c.run_until(|c| c.nodes[1].node.state() == State::Leading)?;
    Ok(())
}

/// Serial replication produces the same results as parallel replication.
#[test]
fn serial_replication() -> Result<()> {
    let opts = Options { parallel_replication: false, ..options() };
    let mut c = cluster(&[100, 50, 10], opts)?;
    c.elect(0)?;

    c.nodes[0].node.db().begin()?;
    c.nodes[0].node.db().mutate("SET x 1")?;
    c.nodes[0].node.start_commit(ConsistencyLevel::Quorum)?;
    c.run_until(|c| c.nodes[0].node.commit_succeeded() && c.commit_counts() == vec![1, 1, 1])?;

    let (_, hash) = c.nodes[0].store.committed();
    assert_eq!(c.nodes[1].store.committed(), (1, hash.clone()));
    assert_eq!(c.nodes[2].store.committed(), (1, hash));
    Ok(())
}

/// The Server driver loop elects a lone node, serves status requests through
/// the handle, and exits on graceful shutdown.
#[test]
fn server_drives_single_node() -> Result<()> {
    let mesh = Mesh::new();
    let (id, peers) = Peers::parse("localhost:9700?name=a", "a")?;
    let transport: Arc<Channel> = Arc::new(mesh.join(id));
    let store: Arc<dyn Store> = Arc::new(Memory::new());
    let pool = Arc::new(Pool::new(store.as_ref(), 2));
    let (server, handle) = Server::new(
        id,
        "a",
        "0.0.0",
        100,
        "localhost:9600",
        peers,
        store,
        pool,
        Arc::new(Commands::default()),
        transport,
        options(),
    )?;
    let server = server.with_tick_interval(Duration::from_millis(1));
    let thread = std::thread::spawn(move || server.serve());

    // A lone node elects itself.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while handle.state() != State::Leading {
        assert!(std::time::Instant::now() < deadline, "node never led");
        std::thread::sleep(Duration::from_millis(5));
    }
    let status = handle.status()?;
    assert_eq!(status.name, "a");
    assert_eq!(status.state, State::Leading);
    assert_eq!(status.commit_count, 0);

    handle.begin_shutdown(Duration::from_secs(5))?;
    thread.join().expect("server thread panicked")?;
    Ok(())
}

/// A node that joins behind synchronizes from the most advanced peer before
/// taking a role.
#[test]
fn lagging_node_synchronizes() -> Result<()> {
    let mut c = cluster(&[100, 50, 10], options())?;

    // Give the eventual leader a head start before anyone connects.
    let mut db = c.nodes[0].store.handle();
    for i in 1..=5 {
        db.begin()?;
        db.mutate(&format!("SET key{i} {i}"))?;
        db.commit()?;
    }

    c.elect(0)?;
    assert_eq!(c.commit_counts(), vec![5, 5, 5]);
    let (_, hash) = c.nodes[0].store.committed();
    assert_eq!(c.nodes[1].store.committed(), (5, hash.clone()));
    assert_eq!(c.nodes[2].store.committed(), (5, hash));
    Ok(())
}
