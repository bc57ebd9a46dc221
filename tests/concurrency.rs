//! Many senders and receivers on the same ports and sets.
//!
//! Every message must be received exactly once, sequence numbers on each
//! port must be handed out without gaps or repeats, and sends to a dead
//! port must be discarded rather than fail.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use mach_ipc::ipc::mach_msg::MachMsgOption;
use mach_ipc::ipc::{ipc_mqueue_send, IpcError, MachPortSeqno, Port, PortSet, ReceiveTarget};
use mach_ipc::kern::sched_prim::IpcThread;

const SENDERS: i32 = 4;
const PER_SENDER: i32 = 200;
const PORT_STRIDE: i32 = 1_000_000;

#[test]
fn every_message_received_exactly_once() {
    let ports: Vec<_> = (0..2).map(|_| Port::with_qlimit(4)).collect();
    let pset = PortSet::new();
    for port in &ports {
        pset.add_member(port).unwrap();
    }

    let total = (SENDERS * PER_SENDER) as usize;
    let received = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Vec<(i32, MachPortSeqno)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut receivers = Vec::new();
    // Three threads on the set, one directly on the first port
    let targets = [
        ReceiveTarget::PortSet(Arc::clone(&pset)),
        ReceiveTarget::PortSet(Arc::clone(&pset)),
        ReceiveTarget::PortSet(Arc::clone(&pset)),
        ReceiveTarget::Port(Arc::clone(&ports[0])),
    ];
    for target in targets {
        let received = Arc::clone(&received);
        let seen = Arc::clone(&seen);
        receivers.push(thread::spawn(move || {
            let thread = IpcThread::current();
            while received.load(Ordering::SeqCst) < total {
                match try_recv(&thread, &target, Duration::from_millis(20)) {
                    Ok((kmsg, seqno)) => {
                        seen.lock().unwrap().push((kmsg.id(), seqno));
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(IpcError::TimedOut) => {}
                    Err(error) => panic!("unexpected receive error: {}", error),
                }
            }
        }));
    }

    let senders: Vec<_> = (0..SENDERS)
        .map(|s| {
            let ports = ports.clone();
            thread::spawn(move || {
                let thread = IpcThread::current();
                for i in 0..PER_SENDER {
                    let index = (i % 2) as usize;
                    let id = index as i32 * PORT_STRIDE + s * PER_SENDER + i;
                    send(&thread, &ports[index], id);
                }
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }
    for receiver in receivers {
        receiver.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), total);

    let mut ids: Vec<i32> = seen.iter().map(|&(id, _)| id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total, "a message was delivered twice");

    let mut per_port: BTreeMap<i32, Vec<MachPortSeqno>> = BTreeMap::new();
    for &(id, seqno) in seen.iter() {
        per_port.entry(id / PORT_STRIDE).or_default().push(seqno);
    }
    for (index, mut seqnos) in per_port {
        seqnos.sort_unstable();
        let expected: Vec<MachPortSeqno> = (0..seqnos.len() as MachPortSeqno).collect();
        assert_eq!(seqnos, expected, "port {} seqnos", index);
        assert_eq!(ports[index as usize].seqno() as usize, expected.len());
    }
    for port in &ports {
        assert_eq!(port.msgcount(), 0);
    }
}

#[test]
fn per_sender_order_is_preserved() {
    let port = Port::with_qlimit(2);
    let sender = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            let thread = IpcThread::current();
            for id in 0..100 {
                send(&thread, &port, id);
            }
        })
    };

    let thread = IpcThread::current();
    let target = ReceiveTarget::Port(Arc::clone(&port));
    for expected in 0..100 {
        let (kmsg, seqno) = try_recv(&thread, &target, Duration::from_secs(10)).unwrap();
        assert_eq!(kmsg.id(), expected);
        assert_eq!(seqno, expected as MachPortSeqno);
    }
    sender.join().unwrap();
}

#[test]
fn membership_churn_does_not_lose_messages() {
    let port = Port::with_qlimit(16);
    let sets: Vec<_> = (0..2).map(|_| PortSet::new()).collect();
    let count = 300;

    let mover = {
        let port = Arc::clone(&port);
        let sets = sets.clone();
        thread::spawn(move || {
            for round in 0..200 {
                let set = &sets[round % 2];
                set.add_member(&port).unwrap();
                thread::yield_now();
                set.remove_member(&port).unwrap();
            }
        })
    };

    let sender = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            let thread = IpcThread::current();
            for id in 0..count {
                send(&thread, &port, id);
            }
        })
    };

    let thread = IpcThread::current();
    let target = ReceiveTarget::Port(Arc::clone(&port));
    let mut ids = Vec::new();
    while ids.len() < count as usize {
        match try_recv(&thread, &target, Duration::from_millis(20)) {
            Ok((kmsg, _)) => ids.push(kmsg.id()),
            Err(IpcError::TimedOut) | Err(IpcError::PortChanged) => {}
            Err(error) => panic!("unexpected receive error: {}", error),
        }
    }
    mover.join().unwrap();
    sender.join().unwrap();
    assert_eq!(ids, (0..count).collect::<Vec<_>>());
}

#[test]
fn blocked_senders_discard_when_port_dies() {
    let port = Port::with_qlimit(1);
    let thread = IpcThread::current();
    send(&thread, &port, 0);

    let senders: Vec<_> = (1..=3)
        .map(|id| {
            let port = Arc::clone(&port);
            thread::spawn(move || {
                let thread = IpcThread::current();
                ipc_mqueue_send(&thread, &port, msg(id), MachMsgOption::empty(), None)
                    .map_err(|e| e.error)
            })
        })
        .collect();
    wait_until("three blocked senders", || port.status().blocked_senders == 3);

    port.destroy();
    for sender in senders {
        assert_eq!(sender.join().unwrap(), Ok(()));
    }
    assert_eq!(port.msgcount(), 0);

    send(&thread, &port, 4);
    assert_eq!(port.msgcount(), 0);
    assert_eq!(
        try_recv(&thread, &ReceiveTarget::Port(port), Duration::ZERO).err(),
        Some(IpcError::PortDied)
    );
}

#[test]
fn timeouts_leave_no_trace() {
    let port = Port::with_qlimit(1);
    let thread = IpcThread::current();
    let target = ReceiveTarget::Port(Arc::clone(&port));

    assert_eq!(
        try_recv(&thread, &target, Duration::from_millis(5)).err(),
        Some(IpcError::TimedOut)
    );
    let status = port.status();
    assert_eq!((status.blocked_receivers, status.seqno), (0, 0));

    send(&thread, &port, 1);
    let err = ipc_mqueue_send(
        &thread,
        &port,
        msg(2),
        MachMsgOption::SEND_TIMEOUT,
        Some(Duration::from_millis(5)),
    )
    .unwrap_err();
    assert_eq!(err.error, IpcError::TimedOut);
    assert_eq!(err.message.id(), 2);

    let status = port.status();
    assert_eq!((status.msgcount, status.blocked_senders), (1, 0));
    let (kmsg, seqno) = try_recv(&thread, &target, Duration::ZERO).unwrap();
    assert_eq!((kmsg.id(), seqno), (1, 0));
}
