//! Stable node self-identification.
//!
//! Resolution order when the configured id is zero:
//!   1. `{dir}/node_id`, if it parses as a non-zero decimal,
//!   2. rolling hash (multiplier 131) of the first up, non-loopback
//!      interface's MAC address,
//!   3. same hash over the first non-loopback IPv4 address,
//!   4. same hash over the hostname.
//! A freshly detected id is persisted with write-temp-then-rename so the
//! value survives restarts. An unwritable directory downgrades persistence
//! to a warning; the id stays stable for the lifetime of the process.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::message::NodeId;

/// Name of the persistence file inside `node_id_dir`.
pub const NODE_ID_FILE: &str = "node_id";

/// Detected ids are masked into the positive 31-bit range.
const NODE_ID_MASK: u64 = 0x7fff_ffff;

/// Resolves the local node id, persisting a fresh detection when possible.
pub(crate) fn establish(dir: Option<&Path>) -> NodeId {
    if let Some(dir) = dir {
        if let Some(id) = read_persisted(dir) {
            debug!("node id {} loaded from {}", id, dir.display());
            return id;
        }
    }

    let id = detect();
    if let Some(dir) = dir {
        if let Err(e) = persist(dir, id) {
            warn!("node id {} not persisted to {}: {}", id, dir.display(), e);
        }
    }
    id
}

fn read_persisted(dir: &Path) -> Option<NodeId> {
    let text = fs::read_to_string(dir.join(NODE_ID_FILE)).ok()?;
    match text.trim().parse::<NodeId>() {
        Ok(id) if id != 0 => Some(id),
        _ => None,
    }
}

fn persist(dir: &Path, id: NodeId) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(".node_id.tmp");
    fs::write(&tmp, format!("{}\n", id))?;
    fs::rename(&tmp, dir.join(NODE_ID_FILE))
}

/// Derives an id from host identity. Deterministic per host configuration.
pub(crate) fn detect() -> NodeId {
    let mut first_v4: Option<[u8; 4]> = None;

    if let Ok(ifaddrs) = getifaddrs() {
        for ifa in ifaddrs {
            if !ifa.flags.contains(InterfaceFlags::IFF_UP)
                || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            {
                continue;
            }
            let Some(addr) = ifa.address else { continue };
            if let Some(link) = addr.as_link_addr() {
                if let Some(mac) = link.addr() {
                    if mac != [0u8; 6] {
                        return mask_nonzero(poly131(&mac));
                    }
                }
            }
            if first_v4.is_none() {
                if let Some(sin) = addr.as_sockaddr_in() {
                    let v4: std::net::SocketAddrV4 = (*sin).into();
                    first_v4 = Some(v4.ip().octets());
                }
            }
        }
    }

    if let Some(octets) = first_v4 {
        return mask_nonzero(poly131(&octets));
    }

    let host = nix::unistd::gethostname()
        .map(|h| h.into_encoded_bytes())
        .unwrap_or_else(|_| b"localhost".to_vec());
    mask_nonzero(poly131(&host))
}

/// Rolling polynomial hash, multiplier 131.
pub(crate) fn poly131(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_mul(131).wrapping_add(b as u64))
}

fn mask_nonzero(value: u64) -> NodeId {
    let id = value & NODE_ID_MASK;
    if id == 0 {
        1
    } else {
        id
    }
}
