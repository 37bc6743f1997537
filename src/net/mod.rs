//! UDP/TCP network driver.
//!
//! Binds dual-stack sockets on one port, keeps a registry of remote peers,
//! and moves opaque frames between nodes. Incoming frames are attributed to
//! a node by the sender's registered address (unknown senders are dropped),
//! handed to the optional receive callback, then parked in a bounded FIFO
//! until the poller drains them.
//!
//! Threading: one UDP reader, one TCP acceptor, one reader per TCP stream.
//! All loops watch a shared `running` flag so `shutdown()` converges without
//! signals. The peer registry and the receive queue are guarded by separate
//! mutexes; callers never need more than one of them at a time.

pub mod node_id;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
    UdpSocket,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use thiserror::Error;

use crate::message::NodeId;

/// Largest accepted UDP datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Upper bound on a TCP frame body; larger prefixes indicate stream desync.
const MAX_TCP_FRAME: usize = 1024 * 1024;

/// Socket read timeout / accept poll interval used by the receiver threads.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Policy applied when the receive queue is at its bound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the arriving packet.
    #[default]
    DropNewest,
    /// Evict the queue head, keep the arrival.
    DropOldest,
}

/// Transport used for a registered peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// One datagram per frame, no handshake.
    #[default]
    Udp,
    /// Persistent stream; frames carry a 4-byte big-endian length prefix.
    Tcp,
}

/// Driver configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Preferred local id; 0 auto-detects (and persists when a dir is set).
    #[serde(default)]
    pub node_id: NodeId,
    /// UDP+TCP port to bind. 0 lets the OS pick (local-only use).
    #[serde(default)]
    pub port: u16,
    /// Receive queue bound; 0 means unbounded.
    #[serde(default)]
    pub max_queue_length: usize,
    /// Policy for a full receive queue.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Directory for persisting an auto-detected node id.
    #[serde(default)]
    pub node_id_dir: Option<PathBuf>,
}

impl Config {
    /// Shorthand for the common (id, port) case.
    pub fn new(node_id: NodeId, port: u16) -> Self {
        Self {
            node_id,
            port,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            port: 0,
            max_queue_length: 0,
            overflow: OverflowPolicy::default(),
            node_id_dir: None,
        }
    }
}

/// One received frame, attributed to its sending node.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Registered id of the sender.
    pub src_node: NodeId,
    /// Frame body, exactly as transmitted.
    pub payload: Vec<u8>,
}

/// Callback invoked on the receiver thread for every arriving packet.
pub type RecvCallback = Box<dyn Fn(&Packet) + Send + Sync>;

/// Driver failures.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket creation or bind failed; fatal to `init`.
    #[error("bind failed: {0}")]
    Bind(io::Error),
    /// Host could not be resolved to an address.
    #[error("cannot resolve host {0:?}")]
    Resolve(String),
    /// TCP connect to a registered peer failed.
    #[error("tcp connect failed: {0}")]
    Connect(io::Error),
    /// No peer registered under the destination node id.
    #[error("no peer registered for node {0}")]
    UnknownPeer(NodeId),
    /// Node id 0 cannot name a peer.
    #[error("node id 0 is reserved")]
    ReservedNode,
    /// Transmit-time socket failure.
    #[error("socket i/o failure: {0}")]
    Io(io::Error),
    /// Operation on a driver that has been shut down.
    #[error("driver is shut down")]
    ShutDown,
}

struct Peer {
    addr: SocketAddr,
    proto: Protocol,
    stream: Option<TcpStream>,
}

#[derive(Default)]
struct AddrIndex {
    exact: HashMap<SocketAddr, NodeId>,
    by_ip: HashMap<IpAddr, NodeId>,
}

struct Shared {
    running: AtomicBool,
    local_node: AtomicU64,
    max_queue_length: usize,
    overflow: OverflowPolicy,
    queue: Mutex<VecDeque<Packet>>,
    callback: Mutex<Option<RecvCallback>>,
    peers: Mutex<HashMap<NodeId, Peer>>,
    addr_index: Mutex<AddrIndex>,
    conns: Mutex<Vec<TcpStream>>,
    reader_threads: Mutex<Vec<JoinHandle<()>>>,
    send_broken: AtomicBool,
}

impl Shared {
    fn new(max_queue_length: usize, overflow: OverflowPolicy) -> Self {
        Self {
            running: AtomicBool::new(true),
            local_node: AtomicU64::new(0),
            max_queue_length,
            overflow,
            queue: Mutex::new(VecDeque::new()),
            callback: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            addr_index: Mutex::new(AddrIndex::default()),
            conns: Mutex::new(Vec::new()),
            reader_threads: Mutex::new(Vec::new()),
            send_broken: AtomicBool::new(false),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Maps a source address to the registered node, exact match first,
    /// then bare IP (TCP peers connect from ephemeral ports).
    fn resolve_source(&self, addr: SocketAddr) -> Option<NodeId> {
        let idx = self.addr_index.lock().ok()?;
        idx.exact
            .get(&addr)
            .copied()
            .or_else(|| idx.by_ip.get(&addr.ip()).copied())
    }

    /// Callback, then enqueue under the overflow policy.
    fn deliver(&self, pkt: Packet) {
        if let Ok(cb) = self.callback.lock() {
            if let Some(cb) = cb.as_ref() {
                cb(&pkt);
            }
        }
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        if self.max_queue_length > 0 && queue.len() >= self.max_queue_length {
            match self.overflow {
                OverflowPolicy::DropNewest => {
                    trace!("receive queue full, dropping arrival from node {}", pkt.src_node);
                    return;
                }
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                }
            }
        }
        queue.push_back(pkt);
    }

    /// Spawns a frame reader for a TCP stream. `bound` pins the source node
    /// for streams we initiated; accepted streams resolve per frame.
    fn spawn_reader(self: &Arc<Self>, stream: TcpStream, bound: Option<NodeId>) {
        if let Ok(clone) = stream.try_clone() {
            if let Ok(mut conns) = self.conns.lock() {
                conns.push(clone);
            }
        }
        let shared = Arc::clone(self);
        let handle = thread::spawn(move || tcp_read_loop(shared, stream, bound));
        if let Ok(mut readers) = self.reader_threads.lock() {
            readers.push(handle);
        }
    }
}

/// The network driver. One instance per node; all methods are thread-safe.
pub struct NetDriver {
    shared: Arc<Shared>,
    udp: Mutex<Option<UdpSocket>>,
    udp_is_v6: bool,
    port: u16,
    core_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetDriver {
    /// Binds the sockets, establishes the local node id, and starts the
    /// receiver threads. Bind failure is fatal.
    pub fn init(cfg: Config) -> Result<Self, NetError> {
        let node = if cfg.node_id != 0 {
            cfg.node_id
        } else {
            node_id::establish(cfg.node_id_dir.as_deref())
        };

        let (udp, udp_is_v6) = bind_udp(cfg.port)?;
        let port = udp.local_addr().map_err(NetError::Bind)?.port();
        let listener = bind_tcp(cfg.port)?;
        listener.set_nonblocking(true).map_err(NetError::Bind)?;

        let udp_recv = udp.try_clone().map_err(NetError::Bind)?;
        udp_recv
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(NetError::Bind)?;

        let shared = Arc::new(Shared::new(cfg.max_queue_length, cfg.overflow));
        shared.local_node.store(node, Ordering::Release);

        let udp_shared = Arc::clone(&shared);
        let tcp_shared = Arc::clone(&shared);
        let threads = vec![
            thread::spawn(move || udp_read_loop(udp_shared, udp_recv)),
            thread::spawn(move || accept_loop(tcp_shared, listener)),
        ];

        info!("net driver up: node {} on port {} (udp+tcp)", node, port);
        Ok(Self {
            shared,
            udp: Mutex::new(Some(udp)),
            udp_is_v6,
            port,
            core_threads: Mutex::new(threads),
        })
    }

    /// Stable local node identifier. Never zero after `init`.
    pub fn local_node(&self) -> NodeId {
        self.shared.local_node.load(Ordering::Acquire)
    }

    /// Port the driver actually bound (relevant when configured with 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers (or replaces) a remote peer. TCP peers are connected
    /// immediately; a connect failure fails the registration.
    pub fn add_remote(
        &self,
        node: NodeId,
        host: &str,
        port: u16,
        proto: Protocol,
    ) -> Result<(), NetError> {
        if !self.shared.running() {
            return Err(NetError::ShutDown);
        }
        if node == 0 {
            return Err(NetError::ReservedNode);
        }

        let addr = resolve_host(host, port)?;
        let stream = match proto {
            Protocol::Tcp => Some(self.open_stream(node, addr)?),
            Protocol::Udp => None,
        };

        let Ok(mut peers) = self.shared.peers.lock() else {
            return Err(NetError::ShutDown);
        };
        if let Some(old) = peers.remove(&node) {
            if let Ok(mut idx) = self.shared.addr_index.lock() {
                idx.exact.remove(&old.addr);
                idx.by_ip.remove(&old.addr.ip());
            }
            if let Some(s) = old.stream {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
        if let Ok(mut idx) = self.shared.addr_index.lock() {
            idx.exact.insert(addr, node);
            idx.by_ip.insert(addr.ip(), node);
        }
        peers.insert(node, Peer { addr, proto, stream });
        info!("peer {} registered at {} ({:?})", node, addr, proto);
        Ok(())
    }

    /// Installs the receive callback, replacing any prior one. The callback
    /// runs on the receiver thread and must not block.
    pub fn set_recv_callback(&self, cb: impl Fn(&Packet) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.callback.lock() {
            *slot = Some(Box::new(cb));
        }
    }

    /// Transmits one frame to a registered peer.
    pub fn send(&self, node: NodeId, payload: &[u8]) -> Result<(), NetError> {
        if !self.shared.running() {
            return Err(NetError::ShutDown);
        }
        if self.shared.send_broken.load(Ordering::Acquire) {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "socket closed",
            )));
        }

        let (addr, proto, stream) = {
            let Ok(peers) = self.shared.peers.lock() else {
                return Err(NetError::ShutDown);
            };
            let peer = peers.get(&node).ok_or(NetError::UnknownPeer(node))?;
            let stream = peer.stream.as_ref().and_then(|s| s.try_clone().ok());
            (peer.addr, peer.proto, stream)
        };

        match proto {
            Protocol::Udp => self.send_udp(addr, payload),
            Protocol::Tcp => self.send_tcp(node, addr, stream, payload),
        }
    }

    /// Non-blocking dequeue of the next received packet.
    pub fn recv(&self) -> Option<Packet> {
        self.shared.queue.lock().ok()?.pop_front()
    }

    /// Clears the receive queue without touching sockets or peers.
    pub fn reset(&self) {
        if let Ok(mut q) = self.shared.queue.lock() {
            q.clear();
        }
    }

    /// Stops the receiver threads, closes sockets, and clears all state.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("net driver node {} shutting down", self.local_node());

        if let Ok(mut conns) = self.shared.conns.lock() {
            for c in conns.drain(..) {
                let _ = c.shutdown(Shutdown::Both);
            }
        }
        if let Ok(mut peers) = self.shared.peers.lock() {
            for (_, peer) in peers.drain() {
                if let Some(s) = peer.stream {
                    let _ = s.shutdown(Shutdown::Both);
                }
            }
        }
        if let Ok(mut idx) = self.shared.addr_index.lock() {
            idx.exact.clear();
            idx.by_ip.clear();
        }
        if let Ok(mut udp) = self.udp.lock() {
            udp.take();
        }

        let mut handles = Vec::new();
        if let Ok(mut t) = self.core_threads.lock() {
            handles.append(&mut t);
        }
        if let Ok(mut t) = self.shared.reader_threads.lock() {
            handles.append(&mut t);
        }
        for h in handles {
            let _ = h.join();
        }

        if let Ok(mut q) = self.shared.queue.lock() {
            q.clear();
        }
        if let Ok(mut cb) = self.shared.callback.lock() {
            cb.take();
        }
    }

    /// Test hook: closes the transmit sockets so subsequent sends fail.
    pub fn simulate_socket_failure(&self) {
        self.shared.send_broken.store(true, Ordering::Release);
        if let Ok(mut udp) = self.udp.lock() {
            udp.take();
        }
        if let Ok(peers) = self.shared.peers.lock() {
            for peer in peers.values() {
                if let Some(s) = &peer.stream {
                    let _ = s.shutdown(Shutdown::Both);
                }
            }
        }
    }

    fn open_stream(&self, node: NodeId, addr: SocketAddr) -> Result<TcpStream, NetError> {
        let stream = TcpStream::connect(addr).map_err(NetError::Connect)?;
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone().map_err(NetError::Connect)?;
        self.shared.spawn_reader(reader, Some(node));
        Ok(stream)
    }

    fn send_udp(&self, addr: SocketAddr, payload: &[u8]) -> Result<(), NetError> {
        let Ok(guard) = self.udp.lock() else {
            return Err(NetError::ShutDown);
        };
        let sock = guard.as_ref().ok_or_else(|| {
            NetError::Io(io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
        })?;
        let target = if self.udp_is_v6 { map_to_v6(addr) } else { addr };
        sock.send_to(payload, target).map_err(NetError::Io)?;
        Ok(())
    }

    fn send_tcp(
        &self,
        node: NodeId,
        addr: SocketAddr,
        stream: Option<TcpStream>,
        payload: &[u8],
    ) -> Result<(), NetError> {
        if payload.len() > MAX_TCP_FRAME {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame exceeds length prefix range",
            )));
        }
        if let Some(mut s) = stream {
            if write_frame(&mut s, payload).is_ok() {
                return Ok(());
            }
            debug!("tcp write to node {} failed, reconnecting once", node);
        }

        let mut fresh = TcpStream::connect(addr).map_err(|e| {
            self.clear_stream(node);
            NetError::Io(e)
        })?;
        let _ = fresh.set_nodelay(true);
        write_frame(&mut fresh, payload).map_err(|e| {
            self.clear_stream(node);
            NetError::Io(e)
        })?;
        if let Ok(reader) = fresh.try_clone() {
            self.shared.spawn_reader(reader, Some(node));
        }
        if let Ok(mut peers) = self.shared.peers.lock() {
            if let Some(peer) = peers.get_mut(&node) {
                peer.stream = Some(fresh);
            }
        }
        Ok(())
    }

    fn clear_stream(&self, node: NodeId) {
        if let Ok(mut peers) = self.shared.peers.lock() {
            if let Some(peer) = peers.get_mut(&node) {
                peer.stream = None;
            }
        }
    }
}

impl Drop for NetDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_udp(port: u16) -> Result<(UdpSocket, bool), NetError> {
    match bind_udp6(port) {
        Ok(sock) => Ok((sock, true)),
        Err(e) => {
            debug!("dual-stack udp bind unavailable ({}), using ipv4", e);
            let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(NetError::Bind)?;
            sock.set_reuse_address(true).map_err(NetError::Bind)?;
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            sock.bind(&addr.into()).map_err(NetError::Bind)?;
            Ok((sock.into(), false))
        }
    }
}

fn bind_udp6(port: u16) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.set_only_v6(false)?;
    sock.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

fn bind_tcp(port: u16) -> Result<TcpListener, NetError> {
    match bind_tcp6(port) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!("dual-stack tcp bind unavailable ({}), using ipv4", e);
            let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(NetError::Bind)?;
            sock.set_reuse_address(true).map_err(NetError::Bind)?;
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            sock.bind(&addr.into()).map_err(NetError::Bind)?;
            sock.listen(128).map_err(NetError::Bind)?;
            Ok(sock.into())
        }
    }
}

fn bind_tcp6(port: u16) -> io::Result<TcpListener> {
    let sock = Socket::new(Domain::IPV6, Type::STREAM, Some(socket2::Protocol::TCP))?;
    sock.set_only_v6(false)?;
    sock.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    sock.bind(&addr.into())?;
    sock.listen(128)?;
    Ok(sock.into())
}

fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = (bare, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve(host.to_string()))?;
    addrs
        .next()
        .map(canonical)
        .ok_or_else(|| NetError::Resolve(host.to_string()))
}

/// Rewrites v4-mapped IPv6 addresses back to plain IPv4 so registry lookups
/// see one spelling per peer.
fn canonical(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = addr {
        if let Some(v4) = v6.ip().to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), addr.port());
        }
    }
    addr
}

fn map_to_v6(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V4(v4) = addr {
        return SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port());
    }
    addr
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

fn udp_read_loop(shared: Arc<Shared>, sock: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while shared.running() {
        match sock.recv_from(&mut buf) {
            Ok((n, from)) => {
                let from = canonical(from);
                match shared.resolve_source(from) {
                    Some(node) => shared.deliver(Packet {
                        src_node: node,
                        payload: buf[..n].to_vec(),
                    }),
                    None => debug!("udp frame from unknown sender {} dropped", from),
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                if shared.running() {
                    warn!("udp receive failed: {}", e);
                }
                break;
            }
        }
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running() {
        match listener.accept() {
            Ok((stream, from)) => {
                debug!("tcp connection accepted from {}", canonical(from));
                let _ = stream.set_nodelay(true);
                shared.spawn_reader(stream, None);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                if shared.running() {
                    warn!("tcp accept failed: {}", e);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn tcp_read_loop(shared: Arc<Shared>, mut stream: TcpStream, bound: Option<NodeId>) {
    let peer = stream.peer_addr().ok().map(canonical);
    let mut len_buf = [0u8; 4];
    while shared.running() {
        if stream.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TCP_FRAME {
            warn!("tcp frame length {} out of range, closing stream", len);
            break;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }
        let node = bound.or_else(|| peer.and_then(|p| shared.resolve_source(p)));
        match node {
            Some(n) => shared.deliver(Packet {
                src_node: n,
                payload,
            }),
            None => debug!("tcp frame from unknown sender dropped"),
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
