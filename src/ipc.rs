//! IPC protocol: connect / listen / send / recv, plus the network poller.
//!
//! One [`IpcCore`] is the IPC substrate of a node. The channel graph sits
//! behind a single mutex paired with a condition variable, forming a classic
//! monitor. Local delivery either hands off directly to a listening
//! receiver (inbox write, scheduler wake, yield) or appends to the channel
//! queue. Remote delivery seals the message with the channel secret and
//! hands a fixed-size frame to the network driver; the poller reverses the
//! pipeline on the way in, silently dropping anything that fails the length
//! gate or the AEAD tag.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use thiserror::Error;

use crate::aead;
use crate::graph::{Graph, ANY_NODE};
use crate::message::{Message, NodeId, Pid, MESSAGE_WIRE_SIZE};
use crate::net::{NetDriver, Packet};
use crate::pqcrypto::{KeyExchange, KyberExchange};
use crate::sched::Scheduler;

/// Upper bound on a blocking receive.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Pid header on every wire frame: source and destination.
const FRAME_HEADER_SIZE: usize = 16;

/// Total size of a wire frame. Anything else is discarded unread.
pub const FRAME_SIZE: usize =
    FRAME_HEADER_SIZE + aead::NONCE_SIZE + MESSAGE_WIRE_SIZE + aead::TAG_SIZE;

/// Blocking behavior of send and recv.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IpcFlags {
    /// Wait for the operation to make progress (bounded for recv).
    #[default]
    Blocking,
    /// Fail immediately instead of queueing or waiting.
    NonBlock,
}

/// Send failures surfaced to callers.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// Non-blocking send found no listener; nothing was queued.
    #[error("destination is not listening")]
    TryAgain,
    /// The network driver could not transmit the frame.
    #[error("network transport failure")]
    Io,
    /// The destination argument is invalid.
    #[error("invalid destination")]
    BadDest,
}

/// Receive failures surfaced to callers.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    /// Nothing pending (non-blocking), or nothing arrived in time.
    #[error("no message available")]
    NoMessage,
}

/// The IPC substrate of one node.
pub struct IpcCore {
    state: Mutex<Graph>,
    wakeup: Condvar,
    driver: Arc<NetDriver>,
    sched: Arc<dyn Scheduler>,
    kem: Box<dyn KeyExchange>,
}

impl IpcCore {
    /// New core over an initialized driver and the surrounding scheduler.
    pub fn new(driver: Arc<NetDriver>, sched: Arc<dyn Scheduler>) -> Self {
        Self::with_key_exchange(driver, sched, Box::new(KyberExchange))
    }

    /// Same, with an explicit key-exchange implementation.
    pub fn with_key_exchange(
        driver: Arc<NetDriver>,
        sched: Arc<dyn Scheduler>,
        kem: Box<dyn KeyExchange>,
    ) -> Self {
        Self {
            state: Mutex::new(Graph::new()),
            wakeup: Condvar::new(),
            driver,
            sched,
            kem,
        }
    }

    fn state(&self) -> MutexGuard<'_, Graph> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Establishes the channel pair (src→dst, dst→src) on `node` and keys
    /// both directions with one freshly derived secret. `node == 0` means
    /// the local node. A pair that already carries a key is left untouched:
    /// channel identity and key are immutable once established.
    pub fn connect(&self, src: Pid, dst: Pid, node: NodeId) {
        let node = if node == 0 {
            self.driver.local_node()
        } else {
            node
        };

        let mut g = self.state();
        if let Some(ch) = g.find(src, dst, node) {
            if ch.secret.iter().any(|&b| b != 0) {
                return;
            }
        }

        let a = self.kem.generate_keypair();
        let b = self.kem.generate_keypair();
        let secret = self.kem.channel_secret(&a, &b);
        if secret.is_null() {
            error!("channel {}<->{} on node {}: refusing null secret", src, dst, node);
            return;
        }
        debug!(
            "channel {}<->{} on node {} keyed ({})",
            src,
            dst,
            node,
            secret.fingerprint()
        );

        g.connect(src, dst, node).secret = *secret.as_bytes();
        g.connect(dst, src, node).secret = *secret.as_bytes();
    }

    /// Marks `pid` as awaiting a direct hand-off. Idempotent.
    pub fn listen(&self, pid: Pid) {
        self.state().set_listening(pid, true);
    }

    /// Sends `msg` from `src` to `dst`.
    ///
    /// A channel is created on the local node if none exists for the pair.
    /// Remote channels transmit immediately and never block on the receiver;
    /// local sends hand off directly when `dst` is listening, otherwise
    /// queue (blocking) or fail with [`SendError::TryAgain`] (non-blocking).
    pub fn send(&self, src: Pid, dst: Pid, msg: &Message, flags: IpcFlags) -> Result<(), SendError> {
        if dst == 0 {
            return Err(SendError::BadDest);
        }
        let local = self.driver.local_node();

        let mut g = self.state();
        let (key, secret) = match g.find(src, dst, ANY_NODE).map(|ch| (ch.key(), ch.secret)) {
            Some(found) => found,
            None => {
                let ch = g.connect(src, dst, local);
                (ch.key(), ch.secret)
            }
        };

        if key.node != local {
            drop(g);
            return self.send_remote(src, dst, key.node, &secret, msg);
        }

        if g.is_listening(dst) {
            let mut m = *msg;
            m.source = src;
            g.set_listening(dst, false);
            g.inbox.insert(dst, m);
            self.sched.unblock(dst);
            self.wakeup.notify_all();
            drop(g);
            self.sched.yield_to(dst);
            return Ok(());
        }

        if flags == IpcFlags::NonBlock {
            return Err(SendError::TryAgain);
        }

        let mut m = *msg;
        m.source = src;
        if let Some(ch) = g.channel_mut(&key) {
            ch.queue.push_back(m);
        }
        if g.is_listening(dst) {
            g.set_listening(dst, false);
            self.sched.unblock(dst);
            self.wakeup.notify_all();
        }
        Ok(())
    }

    /// Receives the next message for `pid`: hand-off inbox first, then the
    /// local channel queues, then (blocking only) a bounded wait.
    pub fn recv(&self, pid: Pid, flags: IpcFlags) -> Result<Message, RecvError> {
        let local = self.driver.local_node();
        let mut g = self.state();

        if let Some(m) = g.take_inbox(pid) {
            g.set_listening(pid, false);
            return Ok(m);
        }
        if let Some(m) = g.pop_queued(pid, local) {
            g.set_listening(pid, false);
            return Ok(m);
        }
        if flags == IpcFlags::NonBlock {
            return Err(RecvError::NoMessage);
        }

        g.set_listening(pid, true);
        self.sched.block_on(pid, Some(RECV_TIMEOUT));
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some(m) = g.take_inbox(pid) {
                g.set_listening(pid, false);
                self.sched.unblock(pid);
                return Ok(m);
            }
            if let Some(m) = g.pop_queued(pid, local) {
                g.set_listening(pid, false);
                self.sched.unblock(pid);
                return Ok(m);
            }
            let now = Instant::now();
            if now >= deadline {
                g.set_listening(pid, false);
                self.sched.unblock(pid);
                return Err(RecvError::NoMessage);
            }
            let (guard, _) = self
                .wakeup
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = guard;
        }
    }

    /// Drains the driver queue, routing every well-formed frame onto its
    /// channel and waking the receiver when one is listening.
    pub fn poll_network(&self) {
        while let Some(pkt) = self.driver.recv() {
            self.dispatch_frame(&pkt);
        }
    }

    /// Drops every channel, listener flag, and inbox entry. Queued messages
    /// are lost; keyed channels must be re-connected.
    pub fn reset(&self) {
        *self.state() = Graph::new();
    }

    /// True while `pid` awaits a direct hand-off.
    pub fn is_listening(&self, pid: Pid) -> bool {
        self.state().is_listening(pid)
    }

    /// Queue depth of the exact channel, if it exists.
    pub fn channel_depth(&self, src: Pid, dst: Pid, node: NodeId) -> Option<usize> {
        self.state().find(src, dst, node).map(|ch| ch.queued())
    }

    fn send_remote(
        &self,
        src: Pid,
        dst: Pid,
        node: NodeId,
        secret: &[u8; 32],
        msg: &Message,
    ) -> Result<(), SendError> {
        let mut m = *msg;
        m.source = src;
        let (nonce, sealed) = aead::seal(&m.to_wire(), secret).map_err(|_| SendError::Io)?;

        let mut frame = Vec::with_capacity(FRAME_SIZE);
        frame.extend_from_slice(&src.to_le_bytes());
        frame.extend_from_slice(&dst.to_le_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);

        self.driver.send(node, &frame).map_err(|e| {
            warn!("remote send {}->{} via node {} failed: {}", src, dst, node, e);
            SendError::Io
        })
    }

    fn dispatch_frame(&self, pkt: &Packet) {
        if pkt.payload.len() != FRAME_SIZE {
            debug!(
                "frame of {} bytes from node {} dropped (want {})",
                pkt.payload.len(),
                pkt.src_node,
                FRAME_SIZE
            );
            return;
        }

        let mut pid_bytes = [0u8; 8];
        pid_bytes.copy_from_slice(&pkt.payload[0..8]);
        let src = Pid::from_le_bytes(pid_bytes);
        pid_bytes.copy_from_slice(&pkt.payload[8..16]);
        let dst = Pid::from_le_bytes(pid_bytes);

        let mut nonce = [0u8; aead::NONCE_SIZE];
        nonce.copy_from_slice(&pkt.payload[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + aead::NONCE_SIZE]);
        let sealed = &pkt.payload[FRAME_HEADER_SIZE + aead::NONCE_SIZE..];

        // Accept remote-initiated channels: the peer performed the same key
        // exchange, so find-or-create and let the tag check arbitrate.
        let secret = {
            let mut g = self.state();
            g.connect(src, dst, pkt.src_node).secret
        };

        let Some(plain) = aead::open(sealed, &secret, &nonce) else {
            debug!(
                "frame {}->{} from node {} failed authentication, dropped",
                src, dst, pkt.src_node
            );
            return;
        };
        if plain.len() != MESSAGE_WIRE_SIZE {
            return;
        }
        let mut raw = [0u8; MESSAGE_WIRE_SIZE];
        raw.copy_from_slice(&plain);
        let mut msg = Message::from_wire(&raw);
        msg.source = src;

        let mut g = self.state();
        if g.is_listening(dst) {
            g.set_listening(dst, false);
            g.inbox.insert(dst, msg);
            self.sched.unblock(dst);
            self.wakeup.notify_all();
        } else {
            g.connect(src, dst, pkt.src_node).queue.push_back(msg);
            self.wakeup.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Config, Protocol};
    use crate::pqcrypto::PresharedExchange;
    use crate::sched::HostScheduler;
    use std::thread;

    fn core_on(driver: Arc<NetDriver>, seed: [u8; 32]) -> IpcCore {
        IpcCore::with_key_exchange(
            driver,
            Arc::new(HostScheduler::new()),
            Box::new(PresharedExchange::new(seed)),
        )
    }

    fn poll_recv(core: &IpcCore, pid: Pid) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            core.poll_network();
            match core.recv(pid, IpcFlags::NonBlock) {
                Ok(m) => return m,
                Err(RecvError::NoMessage) => {
                    assert!(Instant::now() < deadline, "no frame arrived in time");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[test]
    fn connect_keys_both_directions_identically() {
        let driver = Arc::new(NetDriver::init(Config::new(7, 0)).unwrap());
        let core = IpcCore::new(driver, Arc::new(HostScheduler::new()));
        core.connect(1, 2, 0);

        let mut g = core.state();
        let fwd = g.find(1, 2, 7).map(|ch| ch.secret).unwrap();
        let bwd = g.find(2, 1, 7).map(|ch| ch.secret).unwrap();
        assert_eq!(fwd, bwd);
        assert!(fwd.iter().any(|&b| b != 0));
    }

    #[test]
    fn reconnect_does_not_rekey_an_established_pair() {
        let driver = Arc::new(NetDriver::init(Config::new(7, 0)).unwrap());
        let core = IpcCore::new(driver, Arc::new(HostScheduler::new()));
        core.connect(1, 2, 0);
        let before = core.state().find(1, 2, 7).map(|ch| ch.secret).unwrap();

        core.connect(1, 2, 0);
        let after = core.state().find(1, 2, 7).map(|ch| ch.secret).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn malformed_frame_lengths_are_ignored() {
        let driver = Arc::new(NetDriver::init(Config::new(7, 0)).unwrap());
        let core = IpcCore::new(driver, Arc::new(HostScheduler::new()));

        core.dispatch_frame(&Packet {
            src_node: 5,
            payload: vec![0u8; FRAME_SIZE - 1],
        });
        core.dispatch_frame(&Packet {
            src_node: 5,
            payload: vec![0u8; FRAME_SIZE + 1],
        });
        assert!(core.state().edges.is_empty());
    }

    #[test]
    fn remote_round_trip_between_two_nodes() {
        let p_driver = Arc::new(
            NetDriver::init(Config {
                node_id: 0,
                port: 17940,
                ..Config::default()
            })
            .unwrap(),
        );
        let c_driver = Arc::new(NetDriver::init(Config::new(1, 17941)).unwrap());

        let p_node = p_driver.local_node();
        let c_node = c_driver.local_node();
        assert_ne!(p_node, 0);
        assert_ne!(p_node, c_node);

        p_driver
            .add_remote(c_node, "127.0.0.1", 17941, Protocol::Udp)
            .unwrap();
        c_driver
            .add_remote(p_node, "127.0.0.1", 17940, Protocol::Udp)
            .unwrap();

        let seed = [9u8; 32];
        let p = core_on(Arc::clone(&p_driver), seed);
        let c = core_on(Arc::clone(&c_driver), seed);

        // Each side performs the exchange; both derive the same secret.
        p.connect(1, 2, c_node);
        c.connect(2, 1, p_node);

        p.send(1, 2, &Message::new(0x1234), IpcFlags::Blocking).unwrap();
        let got = poll_recv(&c, 2);
        assert_eq!(got.mtype, 0x1234);
        assert_eq!(got.source, 1);

        c.send(2, 1, &Message::new(c_node as i64), IpcFlags::Blocking)
            .unwrap();
        let reply = poll_recv(&p, 1);
        assert_eq!(reply.mtype, c_node as i64);
        assert_eq!(reply.source, 2);
    }

    #[test]
    fn corrupted_ciphertext_is_dropped_silently() {
        let p_driver = Arc::new(NetDriver::init(Config::new(31, 17944)).unwrap());
        let c_driver = Arc::new(NetDriver::init(Config::new(32, 17945)).unwrap());

        p_driver.add_remote(32, "127.0.0.1", 17945, Protocol::Udp).unwrap();
        c_driver.add_remote(31, "127.0.0.1", 17944, Protocol::Udp).unwrap();

        let seed = [3u8; 32];
        let p = core_on(Arc::clone(&p_driver), seed);
        let c = core_on(Arc::clone(&c_driver), seed);
        p.connect(1, 2, 32);
        c.connect(2, 1, 31);

        p.send(1, 2, &Message::new(55), IpcFlags::Blocking).unwrap();

        // Intercept the frame before the poller sees it and flip one
        // ciphertext bit.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut pkt = loop {
            if let Some(pkt) = c_driver.recv() {
                break pkt;
            }
            assert!(Instant::now() < deadline, "frame never arrived");
            thread::sleep(Duration::from_millis(5));
        };
        pkt.payload[FRAME_HEADER_SIZE + aead::NONCE_SIZE] ^= 0x01;
        c.dispatch_frame(&pkt);

        assert_eq!(c.recv(2, IpcFlags::NonBlock), Err(RecvError::NoMessage));
        assert_eq!(c.channel_depth(1, 2, 31), Some(0));
    }

    #[test]
    fn remote_send_to_unregistered_node_reports_io() {
        let driver = Arc::new(NetDriver::init(Config::new(7, 0)).unwrap());
        let core = IpcCore::new(driver, Arc::new(HostScheduler::new()));

        core.connect(1, 2, 99);
        let rc = core.send(1, 2, &Message::new(1), IpcFlags::Blocking);
        assert_eq!(rc, Err(SendError::Io));
    }

    #[test]
    fn send_to_pid_zero_is_a_bad_destination() {
        let driver = Arc::new(NetDriver::init(Config::new(7, 0)).unwrap());
        let core = IpcCore::new(driver, Arc::new(HostScheduler::new()));
        assert_eq!(
            core.send(1, 0, &Message::new(1), IpcFlags::Blocking),
            Err(SendError::BadDest)
        );
    }
}
