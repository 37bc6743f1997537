//! Demo IPC node: binds the driver, registers peers, and echoes traffic.
//!
//! The loopback key exchange carries no ciphertext, so a default build keys
//! every channel from the CSRNG and two separate processes cannot decrypt
//! each other's frames. A closed demo mesh therefore needs the non-default
//! `preshared-kem` feature, which adds `--channel-psk`: nodes derive channel
//! secrets from a shared seed, and a receiver keys its side of a channel up
//! front with `--accept`. Two terminals on one machine make a working pair:
//!
//! ```text
//! cargo run --features preshared-kem --bin lattice-node -- --node-id 2 \
//!     --port 13001 --pid 2 --peer 1@127.0.0.1:13000 \
//!     --channel-psk 0011...ff --accept 1@1
//! cargo run --features preshared-kem --bin lattice-node -- --node-id 1 \
//!     --port 13000 --pid 1 --peer 2@127.0.0.1:13001 \
//!     --channel-psk 0011...ff --send-to 2@2 --mtype 42
//! ```

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;

use lattice_ipc::{
    Config, HostScheduler, IpcCore, IpcFlags, KeyExchange, KyberExchange, Message, NetDriver,
    NodeId, Pid, Protocol, RecvError,
};
#[cfg(feature = "preshared-kem")]
use lattice_ipc::PresharedExchange;

#[derive(Parser, Debug)]
#[command(name = "lattice-node", version)]
#[command(about = "Post-quantum IPC node: bind, register peers, echo messages")]
struct Cli {
    /// Local node id (0 auto-detects)
    #[arg(long, default_value_t = 0)]
    node_id: NodeId,

    /// UDP+TCP port to bind
    #[arg(long, default_value_t = 13000)]
    port: u16,

    /// Directory for persisting an auto-detected node id
    #[arg(long)]
    node_id_dir: Option<PathBuf>,

    /// Pid this node receives for
    #[arg(long, default_value_t = 1)]
    pid: Pid,

    /// Peer registration, repeatable: node@host:port[/tcp]
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// JSON peers file: [{"node":2,"host":"127.0.0.1","port":13001,"protocol":"Udp"}]
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// 64-hex-char pre-shared seed for channel secrets across the mesh
    #[cfg(feature = "preshared-kem")]
    #[arg(long)]
    channel_psk: Option<String>,

    /// Pre-establish a channel with a remote sender, repeatable: pid@node
    #[arg(long = "accept")]
    accepts: Vec<String>,

    /// Optional one-shot send before the echo loop: pid@node
    #[arg(long)]
    send_to: Option<String>,

    /// Message type for --send-to
    #[arg(long, default_value_t = 1)]
    mtype: i64,
}

#[derive(Debug, Deserialize)]
struct PeerSpec {
    node: NodeId,
    host: String,
    port: u16,
    #[serde(default)]
    protocol: Protocol,
}

fn parse_peer(spec: &str) -> Result<PeerSpec> {
    let (node, rest) = spec
        .split_once('@')
        .ok_or_else(|| anyhow!("peer spec {:?} is not node@host:port[/tcp]", spec))?;
    let (addr, proto) = match rest.rsplit_once('/') {
        Some((addr, "tcp")) => (addr, Protocol::Tcp),
        Some((addr, "udp")) => (addr, Protocol::Udp),
        _ => (rest, Protocol::Udp),
    };
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("peer spec {:?} is missing a port", spec))?;
    Ok(PeerSpec {
        node: node.parse().context("peer node id")?,
        host: host.to_string(),
        port: port.parse().context("peer port")?,
        protocol: proto,
    })
}

#[cfg(feature = "preshared-kem")]
fn parse_psk(hex_seed: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(hex_seed).context("--channel-psk is not hex")?;
    let seed: [u8; 32] = raw
        .try_into()
        .map_err(|_| anyhow!("--channel-psk must be exactly 32 bytes"))?;
    Ok(seed)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let driver = Arc::new(NetDriver::init(Config {
        node_id: cli.node_id,
        port: cli.port,
        node_id_dir: cli.node_id_dir.clone(),
        ..Config::default()
    })?);
    info!(
        "node {} listening on port {} as pid {}",
        driver.local_node(),
        driver.port(),
        cli.pid
    );

    let mut peers: Vec<PeerSpec> = Vec::new();
    for spec in &cli.peers {
        peers.push(parse_peer(spec)?);
    }
    if let Some(path) = &cli.peers_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        peers.extend(serde_json::from_str::<Vec<PeerSpec>>(&text)?);
    }
    for peer in &peers {
        driver.add_remote(peer.node, &peer.host, peer.port, peer.protocol)?;
    }

    #[cfg(feature = "preshared-kem")]
    let kem: Box<dyn KeyExchange> = match &cli.channel_psk {
        Some(seed) => Box::new(PresharedExchange::new(parse_psk(seed)?)),
        None => {
            if !peers.is_empty() {
                warn!("no --channel-psk: remote frames will fail authentication");
            }
            Box::new(KyberExchange)
        }
    };
    #[cfg(not(feature = "preshared-kem"))]
    let kem: Box<dyn KeyExchange> = {
        if !peers.is_empty() {
            warn!(
                "channels are keyed from the CSRNG: remote frames will fail \
                 authentication (build with the preshared-kem feature for a \
                 keyed demo mesh)"
            );
        }
        Box::new(KyberExchange)
    };
    let ipc = IpcCore::with_key_exchange(Arc::clone(&driver), Arc::new(HostScheduler::new()), kem);

    for accept in &cli.accepts {
        let (pid, node) = parse_endpoint(accept).context("--accept wants pid@node")?;
        ipc.connect(cli.pid, pid, node);
        info!("accepting traffic from pid {} on node {}", pid, node);
    }

    if let Some(target) = &cli.send_to {
        let (pid, node) = parse_endpoint(target).context("--send-to wants pid@node")?;
        ipc.connect(cli.pid, pid, node);
        if ipc.send(cli.pid, pid, &Message::new(cli.mtype), IpcFlags::Blocking).is_err() {
            bail!("initial send to {}@{} failed", pid, node);
        }
        info!("sent type {} to pid {} on node {}", cli.mtype, pid, node);
    }

    // A node that initiated traffic only logs replies; pure receivers echo
    // back over the channel pair established by connect.
    let echo = cli.send_to.is_none();
    loop {
        ipc.poll_network();
        match ipc.recv(cli.pid, IpcFlags::NonBlock) {
            Ok(msg) => {
                info!("pid {} received type {} from pid {}", cli.pid, msg.mtype, msg.source);
                if echo {
                    if let Err(e) =
                        ipc.send(cli.pid, msg.source, &Message::new(msg.mtype), IpcFlags::Blocking)
                    {
                        warn!("echo to pid {} failed: {}", msg.source, e);
                    }
                }
            }
            Err(RecvError::NoMessage) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

fn parse_endpoint(spec: &str) -> Result<(Pid, NodeId)> {
    let (pid, node) = spec
        .split_once('@')
        .ok_or_else(|| anyhow!("endpoint {:?} is not pid@node", spec))?;
    Ok((pid.parse()?, node.parse()?))
}
