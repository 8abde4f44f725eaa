//! Message transport between cluster peers. The transport owns the sockets
//! and supplies buffered message delivery; all protocol state stays with the
//! node driver.

use super::message::{Envelope, PeerID};
use super::peer::{backoff, Peer, Peers};
use crate::error::Result;

use bincode::Options as _;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A transport event delivered to the node driver.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The outbound connection to a peer was established.
    Connected(PeerID),
    /// The outbound connection to a peer was lost.
    Disconnected(PeerID),
    /// A message arrived from a peer.
    Message(Envelope),
}

/// Buffered message delivery between cluster peers.
pub trait Transport: Send + Sync {
    /// Returns the inbound event channel.
    fn receiver(&self) -> Receiver<Event>;

    /// Sends a message. Best-effort: messages to disconnected peers are
    /// dropped and logged at debug level.
    fn send(&self, envelope: Envelope) -> Result<()>;

    /// Drops the connection to a peer and redials with backoff.
    fn reconnect(&self, peer: PeerID);

    /// Closes all connections and stops background threads.
    fn shutdown(&self);
}

/// A command to a per-peer sender thread.
enum PeerCmd {
    Send(Envelope),
    Reconnect,
    Shutdown,
}

/// A TCP transport. Outbound messages to each peer flow over a dedicated
/// connection owned by a per-peer sender thread, which redials with
/// exponential backoff; inbound messages arrive over connections accepted
/// from peers. Messages are bincode frames.
pub struct Tcp {
    event_rx: Receiver<Event>,
    senders: HashMap<PeerID, Sender<PeerCmd>>,
    stop: Arc<AtomicBool>,
}

impl Tcp {
    /// Creates a TCP transport listening on `addr` and dialing every peer.
    pub fn new(addr: &str, peers: &Peers) -> Result<Tcp> {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let listener = TcpListener::bind(addr)?;
        {
            let (event_tx, stop) = (event_tx.clone(), stop.clone());
            std::thread::spawn(move || Self::accept(listener, event_tx, stop));
        }

        let mut senders = HashMap::new();
        for peer in peers.iter() {
            let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
            senders.insert(peer.id, cmd_tx);
            let (peer, event_tx) = (peer.clone(), event_tx.clone());
            std::thread::spawn(move || Self::send_peer(peer, cmd_rx, event_tx));
        }
        Ok(Tcp { event_rx, senders, stop })
    }

    /// Accepts inbound connections, spawning a reader per connection.
    fn accept(listener: TcpListener, event_tx: Sender<Event>, stop: Arc<AtomicBool>) {
        for socket in listener.incoming() {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match socket {
                Ok(socket) => {
                    let event_tx = event_tx.clone();
                    std::thread::spawn(move || {
                        if let Err(err) = Self::receive(socket, event_tx) {
                            warn!("Peer connection failed: {err}");
                        }
                    });
                }
                Err(err) => error!("Accept failed: {err}"),
            }
        }
    }

    /// Receives messages from one inbound connection until it closes.
    fn receive(socket: TcpStream, event_tx: Sender<Event>) -> Result<()> {
        let peer_addr = socket.peer_addr()?;
        debug!("Peer connection from {peer_addr}");
        let mut reader = BufReader::new(socket);
        while let Some(envelope) = read_envelope(&mut reader)? {
            if event_tx.send(Event::Message(envelope)).is_err() {
                break; // driver gone
            }
        }
        debug!("Peer connection from {peer_addr} closed");
        Ok(())
    }

    /// Sends messages to one peer, redialing with backoff between sessions.
    fn send_peer(peer: Arc<Peer>, cmd_rx: Receiver<PeerCmd>, event_tx: Sender<Event>) {
        let mut attempts = 0u32;
        loop {
            match TcpStream::connect(&peer.host) {
                Ok(socket) => {
                    attempts = 0;
                    debug!("Connected to peer {}", peer.name);
                    if event_tx.send(Event::Connected(peer.id)).is_err() {
                        return;
                    }
                    match Self::send_session(socket, &cmd_rx) {
                        Ok(true) => return,
                        Ok(false) => debug!("Reconnecting to peer {}", peer.name),
                        Err(err) => warn!("Failed sending to peer {}: {err}", peer.name),
                    }
                    if event_tx.send(Event::Disconnected(peer.id)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    attempts += 1;
                    debug!("Failed connecting to peer {} (attempt {attempts}): {err}", peer.name);
                }
            }
            // Keep draining commands while backing off, dropping sends: the
            // peer isn't connected, so sendMessage is a no-op.
            let deadline = Instant::now() + backoff(attempts.max(1));
            loop {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    break;
                };
                match cmd_rx.recv_timeout(remaining) {
                    Ok(PeerCmd::Send(envelope)) => {
                        debug!("Not connected to {}, dropping {:?}", peer.name, envelope.message)
                    }
                    Ok(PeerCmd::Reconnect) => {}
                    Ok(PeerCmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }
        }
    }

    /// Sends messages over one session until it fails or is told to stop.
    /// Returns true on shutdown, false on a requested reconnect.
    fn send_session(socket: TcpStream, cmd_rx: &Receiver<PeerCmd>) -> Result<bool> {
        socket.set_nodelay(true)?;
        let mut writer = BufWriter::new(socket);
        loop {
            match cmd_rx.recv() {
                Ok(PeerCmd::Send(envelope)) => write_envelope(&mut writer, &envelope)?,
                Ok(PeerCmd::Reconnect) => return Ok(false),
                Ok(PeerCmd::Shutdown) | Err(_) => return Ok(true),
            }
        }
    }
}

/// Writes one envelope to the stream and flushes it. Envelopes travel as
/// bincode values with variable-length integers; bincode's own framing
/// delimits them on the stream.
fn write_envelope<W: std::io::Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    bincode::DefaultOptions::new().serialize_into(&mut *writer, envelope)?;
    Ok(writer.flush()?)
}

/// Reads the next envelope from the stream, or None once the peer has closed
/// the connection.
fn read_envelope<R: std::io::Read>(reader: &mut R) -> Result<Option<Envelope>> {
    match bincode::DefaultOptions::new().deserialize_from(&mut *reader) {
        Ok(envelope) => Ok(Some(envelope)),
        // A close between frames surfaces as EOF or a connection reset.
        Err(err) => match err.as_ref() {
            bincode::ErrorKind::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

impl Transport for Tcp {
    fn receiver(&self) -> Receiver<Event> {
        self.event_rx.clone()
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        match self.senders.get(&envelope.to) {
            Some(cmd_tx) => {
                let _ = cmd_tx.send(PeerCmd::Send(envelope));
            }
            None => debug!("No sender for peer {}, dropping message", envelope.to),
        }
        Ok(())
    }

    fn reconnect(&self, peer: PeerID) {
        if let Some(cmd_tx) = self.senders.get(&peer) {
            let _ = cmd_tx.send(PeerCmd::Reconnect);
        }
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for cmd_tx in self.senders.values() {
            let _ = cmd_tx.send(PeerCmd::Shutdown);
        }
    }
}

/// An in-process transport: nodes join a shared mesh and exchange messages
/// over channels. Used by tests and single-process clusters.
pub struct Channel {
    id: PeerID,
    mesh: Arc<Mesh>,
    event_rx: Receiver<Event>,
}

/// The shared state of a [`Channel`] mesh.
#[derive(Default)]
pub struct Mesh {
    nodes: Mutex<HashMap<PeerID, Sender<Event>>>,
}

impl Mesh {
    pub fn new() -> Arc<Mesh> {
        Arc::new(Mesh::default())
    }

    /// Joins the mesh as `id`. All current members and the new member see
    /// each other connect.
    pub fn join(self: &Arc<Mesh>, id: PeerID) -> Channel {
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let mut nodes = self.nodes.lock().unwrap_or_else(|p| p.into_inner());
        for (peer, peer_tx) in nodes.iter() {
            let _ = peer_tx.send(Event::Connected(id));
            let _ = event_tx.send(Event::Connected(*peer));
        }
        nodes.insert(id, event_tx);
        Channel { id, mesh: self.clone(), event_rx }
    }

    /// Removes a member, e.g. to simulate a crash. Remaining members see it
    /// disconnect, and messages to it are dropped.
    pub fn leave(&self, id: PeerID) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|p| p.into_inner());
        nodes.remove(&id);
        for peer_tx in nodes.values() {
            let _ = peer_tx.send(Event::Disconnected(id));
        }
    }
}

impl Transport for Channel {
    fn receiver(&self) -> Receiver<Event> {
        self.event_rx.clone()
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        let nodes = self.mesh.nodes.lock()?;
        match nodes.get(&envelope.to) {
            Some(peer_tx) => {
                let _ = peer_tx.send(Event::Message(envelope));
            }
            None => debug!("No mesh member {}, dropping message", envelope.to),
        }
        Ok(())
    }

    fn reconnect(&self, peer: PeerID) {
        // Channels don't actually disconnect; emit the event pair so the
        // driver resets its peer state.
        let nodes = self.mesh.nodes.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(own_tx) = nodes.get(&self.id) {
            let _ = own_tx.send(Event::Disconnected(peer));
            if nodes.contains_key(&peer) {
                let _ = own_tx.send(Event::Connected(peer));
            }
        }
    }

    fn shutdown(&self) {
        self.mesh.leave(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::message::Message;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mesh_connects_and_routes() -> Result<()> {
        let mesh = Mesh::new();
        let a = mesh.join(1);
        let b = mesh.join(2);

        assert_eq!(a.receiver().try_recv(), Ok(Event::Connected(2)));
        assert_eq!(b.receiver().try_recv(), Ok(Event::Connected(1)));

        let envelope = Envelope { from: 1, to: 2, message: Message::Ping { sent_at: 7 } };
        a.send(envelope.clone())?;
        assert_eq!(b.receiver().try_recv(), Ok(Event::Message(envelope)));

        // Messages to absent members are dropped.
        a.send(Envelope { from: 1, to: 9, message: Message::Ping { sent_at: 7 } })?;

        mesh.leave(2);
        assert_eq!(a.receiver().try_recv(), Ok(Event::Disconnected(2)));
        Ok(())
    }

    /// A connection closed between frames reads as end of stream, not as an
    /// error.
    #[test]
    fn closed_connections_end_the_envelope_stream() -> Result<()> {
        let ping = Envelope { from: 1, to: 2, message: Message::Ping { sent_at: 7 } };
        let pong = Envelope { from: 2, to: 1, message: Message::Pong { sent_at: 7 } };

        let mut buffer = Vec::new();
        write_envelope(&mut buffer, &ping)?;
        write_envelope(&mut buffer, &pong)?;

        let mut reader = buffer.as_slice();
        assert_eq!(read_envelope(&mut reader)?, Some(ping));
        assert_eq!(read_envelope(&mut reader)?, Some(pong));
        assert_eq!(read_envelope(&mut reader)?, None);
        Ok(())
    }

    #[test]
    fn reconnect_emits_event_pair() {
        let mesh = Mesh::new();
        let a = mesh.join(1);
        let _b = mesh.join(2);
        let events = a.receiver();
        assert_eq!(events.try_recv(), Ok(Event::Connected(2)));

        a.reconnect(2);
        assert_eq!(events.try_recv(), Ok(Event::Disconnected(2)));
        assert_eq!(events.try_recv(), Ok(Event::Connected(2)));
    }
}
