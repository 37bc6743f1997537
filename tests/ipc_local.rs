//! Local IPC semantics: queued delivery, direct hand-off, non-blocking
//! variants, and the bounded blocking receive.
//!
//! Drivers bind port 0 (OS-assigned); no cross-node traffic is involved.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lattice_ipc::{
    Config, HostScheduler, IpcCore, IpcFlags, Message, NetDriver, RecvError, SendError,
    RECV_TIMEOUT,
};

const LOCAL: u64 = 7;

fn local_core() -> (IpcCore, Arc<HostScheduler>) {
    let driver = Arc::new(NetDriver::init(Config::new(LOCAL, 0)).unwrap());
    let sched = Arc::new(HostScheduler::new());
    (IpcCore::new(driver, sched.clone()), sched)
}

/* ===== QUEUED DELIVERY ===== */

#[test]
fn queued_delivery_roundtrip() {
    let (ipc, _) = local_core();
    ipc.connect(1, 2, 0);

    ipc.send(1, 2, &Message::new(42), IpcFlags::Blocking).unwrap();
    let got = ipc.recv(2, IpcFlags::Blocking).unwrap();
    assert_eq!(got.mtype, 42);
    assert_eq!(got.source, 1);

    assert_eq!(ipc.channel_depth(1, 2, LOCAL), Some(0));
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock), Err(RecvError::NoMessage));
}

#[test]
fn message_bytes_survive_the_queue() {
    let (ipc, _) = local_core();
    let mut m = Message::new(-3);
    for (i, b) in m.body.iter_mut().enumerate() {
        *b = i as u8;
    }
    ipc.send(1, 2, &m, IpcFlags::Blocking).unwrap();

    let got = ipc.recv(2, IpcFlags::Blocking).unwrap();
    assert_eq!(got.mtype, -3);
    assert_eq!(got.body, m.body);
}

#[test]
fn queues_deliver_in_fifo_order() {
    let (ipc, _) = local_core();
    ipc.connect(1, 2, 0);
    for t in 1..=3 {
        ipc.send(1, 2, &Message::new(t), IpcFlags::Blocking).unwrap();
    }
    for t in 1..=3 {
        assert_eq!(ipc.recv(2, IpcFlags::Blocking).unwrap().mtype, t);
    }
}

#[test]
fn senders_on_distinct_channels_both_deliver() {
    let (ipc, _) = local_core();
    ipc.send(1, 2, &Message::new(10), IpcFlags::Blocking).unwrap();
    ipc.send(3, 2, &Message::new(30), IpcFlags::Blocking).unwrap();

    let mut sources = vec![
        ipc.recv(2, IpcFlags::Blocking).unwrap().source,
        ipc.recv(2, IpcFlags::Blocking).unwrap().source,
    ];
    sources.sort();
    assert_eq!(sources, vec![1, 3]);
}

/* ===== DIRECT HAND-OFF ===== */

#[test]
fn listening_receiver_gets_a_direct_handoff() {
    let (ipc, sched) = local_core();
    ipc.connect(1, 2, 0);

    ipc.listen(2);
    assert!(ipc.is_listening(2));

    ipc.send(1, 2, &Message::new(99), IpcFlags::Blocking).unwrap();
    assert!(!ipc.is_listening(2));
    assert_eq!(sched.current(), 2);
    // Hand-off bypassed the queue entirely.
    assert_eq!(ipc.channel_depth(1, 2, LOCAL), Some(0));

    let got = ipc.recv(2, IpcFlags::NonBlock).unwrap();
    assert_eq!(got.mtype, 99);
    assert_eq!(got.source, 1);
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock), Err(RecvError::NoMessage));
}

#[test]
fn listen_is_idempotent() {
    let (ipc, _) = local_core();
    ipc.listen(2);
    ipc.listen(2);
    ipc.send(1, 2, &Message::new(5), IpcFlags::Blocking).unwrap();
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock).unwrap().mtype, 5);
}

#[test]
fn inbox_is_drained_before_any_queue() {
    let (ipc, _) = local_core();
    // A message waits in the queue...
    ipc.send(1, 2, &Message::new(1), IpcFlags::Blocking).unwrap();
    // ...then a hand-off lands in the inbox.
    ipc.listen(2);
    ipc.send(3, 2, &Message::new(3), IpcFlags::Blocking).unwrap();

    assert_eq!(ipc.recv(2, IpcFlags::Blocking).unwrap().source, 3);
    assert_eq!(ipc.recv(2, IpcFlags::Blocking).unwrap().source, 1);
}

/* ===== NON-BLOCKING VARIANTS ===== */

#[test]
fn nonblocking_send_without_listener_queues_nothing() {
    let (ipc, _) = local_core();
    ipc.connect(1, 2, 0);

    assert_eq!(
        ipc.send(1, 2, &Message::new(7), IpcFlags::NonBlock),
        Err(SendError::TryAgain)
    );
    assert_eq!(ipc.channel_depth(1, 2, LOCAL), Some(0));
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock), Err(RecvError::NoMessage));
}

#[test]
fn nonblocking_send_to_a_listener_hands_off() {
    let (ipc, _) = local_core();
    ipc.listen(2);
    ipc.send(1, 2, &Message::new(8), IpcFlags::NonBlock).unwrap();
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock).unwrap().mtype, 8);
}

/* ===== BLOCKING RECEIVE ===== */

#[test]
fn blocking_recv_times_out_after_the_deadline() {
    let (ipc, _) = local_core();
    let start = Instant::now();
    assert_eq!(ipc.recv(9, IpcFlags::Blocking), Err(RecvError::NoMessage));
    let elapsed = start.elapsed();

    assert!(elapsed >= RECV_TIMEOUT - Duration::from_millis(5));
    assert!(elapsed < Duration::from_secs(2));
    assert!(!ipc.is_listening(9));
}

#[test]
fn reset_discards_channels_and_queues() {
    let (ipc, _) = local_core();
    ipc.connect(1, 2, 0);
    ipc.send(1, 2, &Message::new(4), IpcFlags::Blocking).unwrap();

    ipc.reset();
    assert_eq!(ipc.channel_depth(1, 2, LOCAL), None);
    assert_eq!(ipc.recv(2, IpcFlags::NonBlock), Err(RecvError::NoMessage));
}

#[test]
fn blocking_recv_wakes_when_a_send_arrives() {
    let (ipc, _) = local_core();
    let ipc = Arc::new(ipc);

    let sender = {
        let ipc = Arc::clone(&ipc);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ipc.send(1, 2, &Message::new(64), IpcFlags::Blocking).unwrap();
        })
    };

    let start = Instant::now();
    let got = ipc.recv(2, IpcFlags::Blocking).unwrap();
    assert_eq!(got.mtype, 64);
    assert!(start.elapsed() < Duration::from_secs(2));
    sender.join().unwrap();
}
