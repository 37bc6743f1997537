//! Channel graph: directed edges between pids, listener flags, and the
//! direct-hand-off inboxes.
//!
//! The graph is plain data. The IPC layer owns the single mutex around it;
//! nothing here blocks or performs I/O.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::message::{Message, NodeId, Pid};
use crate::pqcrypto::CHANNEL_SECRET_SIZE;

/// Lookup sentinel meaning "match any node". Never a real node id.
pub const ANY_NODE: NodeId = NodeId::MAX;

/// Channel identity. Ordered lexicographically by (src, dst, node).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    /// Sending pid.
    pub src: Pid,
    /// Receiving pid.
    pub dst: Pid,
    /// Node the destination lives on.
    pub node: NodeId,
}

/// One directed channel: immutable identity and secret, FIFO queue.
pub struct Channel {
    src: Pid,
    dst: Pid,
    node: NodeId,
    /// AEAD key shared with the reverse channel. Written once by connect.
    pub(crate) secret: [u8; CHANNEL_SECRET_SIZE],
    /// Messages awaiting recv, oldest first.
    pub(crate) queue: VecDeque<Message>,
}

impl Channel {
    fn new(src: Pid, dst: Pid, node: NodeId) -> Self {
        Self {
            src,
            dst,
            node,
            secret: [0u8; CHANNEL_SECRET_SIZE],
            queue: VecDeque::new(),
        }
    }

    /// The (src, dst, node) identity triple.
    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            src: self.src,
            dst: self.dst,
            node: self.node,
        }
    }

    /// Node component of the identity.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Number of queued messages.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// All channels of one node, plus listener and inbox state.
#[derive(Default)]
pub struct Graph {
    pub(crate) edges: BTreeMap<ChannelKey, Channel>,
    listening: HashSet<Pid>,
    pub(crate) inbox: HashMap<Pid, Message>,
}

impl Graph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel for the exact key, creating it if absent.
    pub fn connect(&mut self, src: Pid, dst: Pid, node: NodeId) -> &mut Channel {
        self.edges
            .entry(ChannelKey { src, dst, node })
            .or_insert_with(|| Channel::new(src, dst, node))
    }

    /// Exact lookup, or the first (src, dst) match when `node == ANY_NODE`.
    pub fn find(&mut self, src: Pid, dst: Pid, node: NodeId) -> Option<&mut Channel> {
        if node != ANY_NODE {
            return self.edges.get_mut(&ChannelKey { src, dst, node });
        }
        self.edges
            .values_mut()
            .find(|ch| ch.src == src && ch.dst == dst)
    }

    pub(crate) fn channel_mut(&mut self, key: &ChannelKey) -> Option<&mut Channel> {
        self.edges.get_mut(key)
    }

    /// Whether `pid` awaits a direct hand-off.
    pub fn is_listening(&self, pid: Pid) -> bool {
        self.listening.contains(&pid)
    }

    /// Sets or clears the listener flag for `pid`.
    pub fn set_listening(&mut self, pid: Pid, flag: bool) {
        if flag {
            self.listening.insert(pid);
        } else {
            self.listening.remove(&pid);
        }
    }

    /// Takes the hand-off message for `pid`, if one is waiting.
    pub(crate) fn take_inbox(&mut self, pid: Pid) -> Option<Message> {
        self.inbox.remove(&pid)
    }

    /// Pops the head of the first non-empty local queue destined for `pid`.
    pub(crate) fn pop_queued(&mut self, pid: Pid, local: NodeId) -> Option<Message> {
        self.edges
            .values_mut()
            .find(|ch| ch.dst == pid && ch.node == local && !ch.queue.is_empty())
            .and_then(|ch| ch.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_is_idempotent() {
        let mut g = Graph::new();
        g.connect(1, 2, 9).queue.push_back(Message::new(1));
        assert_eq!(g.connect(1, 2, 9).queued(), 1);
        assert_eq!(g.edges.len(), 1);
    }

    #[test]
    fn find_with_any_node_matches_first_pair() {
        let mut g = Graph::new();
        g.connect(1, 2, 9);
        assert!(g.find(1, 2, ANY_NODE).is_some());
        assert!(g.find(1, 2, 8).is_none());
        assert!(g.find(2, 1, ANY_NODE).is_none());
    }

    #[test]
    fn channel_keys_order_lexicographically() {
        let a = ChannelKey { src: 1, dst: 2, node: 3 };
        let b = ChannelKey { src: 1, dst: 2, node: 4 };
        let c = ChannelKey { src: 1, dst: 3, node: 0 };
        assert!(a < b && b < c);
    }

    #[test]
    fn queues_are_fifo() {
        let mut g = Graph::new();
        let ch = g.connect(1, 2, 9);
        ch.queue.push_back(Message::new(1));
        ch.queue.push_back(Message::new(2));
        assert_eq!(g.pop_queued(2, 9).map(|m| m.mtype), Some(1));
        assert_eq!(g.pop_queued(2, 9).map(|m| m.mtype), Some(2));
        assert_eq!(g.pop_queued(2, 9).map(|m| m.mtype), None);
    }

    #[test]
    fn listener_flag_toggles() {
        let mut g = Graph::new();
        assert!(!g.is_listening(4));
        g.set_listening(4, true);
        assert!(g.is_listening(4));
        g.set_listening(4, false);
        assert!(!g.is_listening(4));
    }
}
