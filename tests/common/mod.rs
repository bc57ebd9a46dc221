//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mach_ipc::ipc::mach_msg::MachMsgOption;
use mach_ipc::ipc::{
    ipc_mqueue_receive, ipc_mqueue_send, IpcKmsg, MachPortSeqno, Port, ReceiveTarget,
};
use mach_ipc::kern::sched_prim::IpcThread;
use mach_ipc::IpcResult;

/// Receive buffer large enough for every test message
pub const BUF: usize = 4096;

/// Spin until `cond` holds, failing the test after a few seconds
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(10), "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn msg(id: i32) -> Box<IpcKmsg> {
    IpcKmsg::simple(1, id, id.to_le_bytes().to_vec())
}

pub fn send(thread: &IpcThread, port: &Arc<Port>, id: i32) {
    ipc_mqueue_send(thread, port, msg(id), MachMsgOption::empty(), None).unwrap();
}

pub fn try_recv(
    thread: &IpcThread,
    target: &ReceiveTarget,
    timeout: Duration,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    ipc_mqueue_receive(thread, target, MachMsgOption::empty(), BUF, Some(timeout))
}
