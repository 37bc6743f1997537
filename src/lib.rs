//! Lattice IPC: capability-scoped, post-quantum-secured message passing.
//!
//! Processes exchange fixed-size messages over directed channels keyed by
//! `(src pid, dst pid, node)`. Every channel pair shares a 32-byte secret
//! derived from Kyber-512 key material; every cross-node frame is sealed
//! with XChaCha20-Poly1305. Local delivery hands off directly to a
//! listening receiver (with a scheduler yield) or queues; remote delivery
//! rides the UDP/TCP [`net::NetDriver`] and is fed back into channel queues
//! by [`IpcCore::poll_network`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use lattice_ipc::{Config, HostScheduler, IpcCore, IpcFlags, Message, NetDriver};
//!
//! let driver = Arc::new(NetDriver::init(Config::new(1, 12000))?);
//! let ipc = IpcCore::new(driver, Arc::new(HostScheduler::new()));
//!
//! ipc.connect(1, 2, 0);
//! ipc.send(1, 2, &Message::new(42), IpcFlags::Blocking)?;
//! let got = ipc.recv(2, IpcFlags::Blocking)?;
//! assert_eq!(got.mtype, 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod graph;
pub mod ipc;
pub mod message;
pub mod net;
pub mod pqcrypto;
pub mod sched;

pub use graph::{Channel, ChannelKey, Graph, ANY_NODE};
pub use ipc::{IpcCore, IpcFlags, RecvError, SendError, FRAME_SIZE, RECV_TIMEOUT};
pub use message::{Message, NodeId, Pid, MESSAGE_BODY_SIZE, MESSAGE_WIRE_SIZE};
pub use net::{Config, NetDriver, NetError, OverflowPolicy, Packet, Protocol};
pub use pqcrypto::{
    compute_shared_secret, generate_keypair, KeyExchange, KeyPair, KyberExchange, SharedSecret,
};
#[cfg(any(test, feature = "preshared-kem"))]
pub use pqcrypto::PresharedExchange;
pub use sched::{HostScheduler, Scheduler};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
