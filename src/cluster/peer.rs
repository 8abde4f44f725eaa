use super::message::{CommitCount, PeerID, PeerResponse};
use super::node::State;
use crate::errinput;
use crate::error::Result;
use crate::store::Hash;

use crossbeam::atomic::AtomicCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The reconnect backoff base delay.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// The reconnect backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Returns the reconnect delay after the given number of consecutive failed
/// connections: 250 ms, doubled per failure, capped at 5 seconds.
pub fn backoff(failed_connections: u32) -> Duration {
    let factor = 2u32.saturating_pow(failed_connections.saturating_sub(1).min(16));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

/// A peer node in the cluster. The identity fields are immutable; the rest
/// are written by the driver thread and readable from any thread without
/// further synchronization, except the (commit count, hash) pair which is
/// only read and written together, under a lock.
pub struct Peer {
    pub name: String,
    pub host: String,
    pub id: PeerID,
    /// Parameters parsed from the peer list entry.
    pub params: HashMap<String, String>,
    /// A permafollower never stands up as leader, but counts toward quorum.
    pub perma_follower: bool,

    /// Consecutive failed connection attempts, cleared on connect.
    pub failed_connections: AtomicU32,
    /// Measured round-trip latency, in microseconds.
    pub latency: AtomicU64,
    pub logged_in: AtomicBool,
    pub subscribed: AtomicBool,
    pub priority: AtomicI64,
    pub state: AtomicCell<State>,
    pub standup_response: AtomicCell<PeerResponse>,
    pub transaction_response: AtomicCell<PeerResponse>,
    /// The earliest time to redial after a disconnect.
    pub next_reconnect: AtomicCell<Option<Instant>>,
    /// The driver tick at which a message last arrived from this peer.
    pub last_recv: AtomicU64,

    commit: Mutex<(CommitCount, Hash)>,
    version: Mutex<String>,
    command_address: Mutex<String>,
}

impl Peer {
    /// Creates a peer from its configured identity.
    pub fn new(id: PeerID, name: String, host: String, params: HashMap<String, String>) -> Self {
        let perma_follower = params.get("permafollower").map(|v| v == "true").unwrap_or(false);
        Self {
            name,
            host,
            id,
            params,
            perma_follower,
            failed_connections: AtomicU32::new(0),
            latency: AtomicU64::new(0),
            logged_in: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            priority: AtomicI64::new(0),
            state: AtomicCell::new(State::Unknown),
            standup_response: AtomicCell::new(PeerResponse::None),
            transaction_response: AtomicCell::new(PeerResponse::None),
            next_reconnect: AtomicCell::new(None),
            last_recv: AtomicU64::new(0),
            commit: Mutex::new((0, Hash::default())),
            version: Mutex::new(String::new()),
            command_address: Mutex::new(String::new()),
        }
    }

    /// Atomically sets the peer's commit count and hash as a pair.
    pub fn set_commit(&self, count: CommitCount, hash: Hash) {
        *self.commit.lock().unwrap_or_else(|p| p.into_inner()) = (count, hash);
    }

    /// Atomically reads the peer's commit count and hash as a pair.
    pub fn commit(&self) -> (CommitCount, Hash) {
        self.commit.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The peer's commit count.
    pub fn commit_count(&self) -> CommitCount {
        self.commit.lock().unwrap_or_else(|p| p.into_inner()).0
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> String {
        self.version.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_version(&self, version: String) {
        *self.version.lock().unwrap_or_else(|p| p.into_inner()) = version;
    }

    pub fn command_address(&self) -> String {
        self.command_address.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_command_address(&self, address: String) {
        *self.command_address.lock().unwrap_or_else(|p| p.into_inner()) = address;
    }

    /// Resets the peer after a disconnect: clears login, subscription, and
    /// votes, and schedules the next reconnect with exponential backoff.
    pub fn reset(&self) {
        self.logged_in.store(false, Ordering::Relaxed);
        self.subscribed.store(false, Ordering::Relaxed);
        self.standup_response.store(PeerResponse::None);
        self.transaction_response.store(PeerResponse::None);
        self.state.store(State::Unknown);
        let failed = self.failed_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.next_reconnect.store(Some(Instant::now() + backoff(failed)));
    }

    /// Clears failure tracking after a successful connection.
    pub fn connected(&self) {
        self.failed_connections.store(0, Ordering::Relaxed);
        self.next_reconnect.store(None);
    }
}

/// The fixed registry of the node's peers, constructed from configuration at
/// startup. The local node is not in the registry.
#[derive(Clone)]
pub struct Peers {
    peers: Vec<Arc<Peer>>,
}

impl Peers {
    /// Creates a registry from a list of peers.
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        Self { peers }
    }

    /// Parses a cluster list string into the local node's ID and its peer
    /// registry. Entries are comma-separated `host:port?key=value&...`
    /// parameter maps; the `name` parameter defaults to the host, and
    /// `permafollower=true` marks permafollowers. The entry whose name equals
    /// `local` is the local node. IDs are 1-based list positions.
    pub fn parse(list: &str, local: &str) -> Result<(PeerID, Peers)> {
        let mut local_id = None;
        let mut peers = Vec::new();
        for (i, entry) in list.split(',').map(str::trim).enumerate() {
            let (name, host, params) = parse_peer(entry)?;
            let id = i as PeerID + 1;
            if name == local {
                local_id = Some(id);
            } else {
                peers.push(Arc::new(Peer::new(id, name, host, params)));
            }
        }
        let Some(local_id) = local_id else {
            return errinput!("local node {local} not in peer list");
        };
        Ok((local_id, Peers::new(peers)))
    }

    /// Looks up a peer by ID.
    pub fn get(&self, id: PeerID) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Iterates over the peers, in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The cluster size, including the local node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// The cluster quorum size (strict majority).
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// The number of peers currently logged in.
    pub fn logged_in(&self) -> usize {
        self.peers.iter().filter(|p| p.is_logged_in()).count()
    }

    /// The number of peers currently subscribed.
    pub fn subscribed(&self) -> usize {
        self.peers.iter().filter(|p| p.is_subscribed()).count()
    }
}

/// Parses one peer list entry into (name, host, params).
fn parse_peer(entry: &str) -> Result<(String, String, HashMap<String, String>)> {
    let (host, query) = entry.split_once('?').unwrap_or((entry, ""));
    if host.is_empty() {
        return errinput!("empty peer entry");
    }
    let mut params = HashMap::new();
    for kv in query.split('&').filter(|kv| !kv.is_empty()) {
        let Some((key, value)) = kv.split_once('=') else {
            return errinput!("invalid peer parameter {kv}");
        };
        params.insert(key.to_string(), value.to_string());
    }
    let name = params.get("name").cloned().unwrap_or_else(|| host.to_string());
    Ok((name, host.to_string(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_doubles_to_cap() {
        assert_eq!(backoff(1), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_millis(500));
        assert_eq!(backoff(3), Duration::from_secs(1));
        assert_eq!(backoff(5), Duration::from_secs(4));
        assert_eq!(backoff(6), Duration::from_secs(5));
        assert_eq!(backoff(100), Duration::from_secs(5));

        // Monotone in the number of failures.
        for failed in 1..32 {
            assert!(backoff(failed) <= backoff(failed + 1));
        }
    }

    #[test]
    fn parse_peer_list() -> Result<()> {
        let list = "10.0.0.1:9705?name=a,10.0.0.2:9705?name=b&permafollower=true,10.0.0.3:9705";
        let (id, peers) = Peers::parse(list, "a")?;
        assert_eq!(id, 1);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.cluster_size(), 3);
        assert_eq!(peers.quorum_size(), 2);

        let b = peers.get(2).expect("no peer b");
        assert_eq!(b.name, "b");
        assert_eq!(b.host, "10.0.0.2:9705");
        assert!(b.perma_follower);

        // Unnamed peers take their host as name.
        let c = peers.get(3).expect("no peer c");
        assert_eq!(c.name, "10.0.0.3:9705");
        assert!(!c.perma_follower);

        assert!(Peers::parse(list, "nope").is_err());
        assert!(Peers::parse("host?bad", "host").is_err());
        Ok(())
    }

    #[test]
    fn reset_schedules_reconnect() {
        let peer = Peer::new(1, "a".into(), "localhost:1".into(), HashMap::new());
        peer.logged_in.store(true, Ordering::Relaxed);
        peer.subscribed.store(true, Ordering::Relaxed);
        peer.standup_response.store(PeerResponse::Approve);

        peer.reset();
        assert!(!peer.is_logged_in());
        assert!(!peer.is_subscribed());
        assert_eq!(peer.standup_response.load(), PeerResponse::None);
        assert_eq!(peer.failed_connections.load(Ordering::Relaxed), 1);
        assert!(peer.next_reconnect.load().is_some());

        peer.connected();
        assert_eq!(peer.failed_connections.load(Ordering::Relaxed), 0);
        assert!(peer.next_reconnect.load().is_none());
    }
}
