//! Mach Message System Call
//!
//! Based on Mach4 ipc/mach_msg.c by CMU (1987-1991)
//!
//! This module implements mach_msg() on top of the queue engine: names are
//! resolved in the caller's space, the entry reference is released before
//! the thread can block, and the send and receive halves run in order.
//!
//! ## Options
//!
//! - SEND_MSG / RCV_MSG: which halves to run
//! - SEND_TIMEOUT / RCV_TIMEOUT: honor the timeout for that half
//! - RCV_LARGE: leave a too-large message queued and report its size
//! - SEND_ALWAYS: enqueue even if the queue is full

use alloc::boxed::Box;
use core::time::Duration;
use thiserror::Error;

use super::entry::{MachPortName, MachPortRight};
use super::kmsg::{
    kmsg_destroy, IpcKmsg, MachPortSeqno, MACH_MSG_TYPE_PORT_SEND, MACH_MSG_TYPE_PORT_SEND_ONCE,
};
use super::mqueue::{ipc_mqueue_receive, ipc_mqueue_send, ReceiveTarget};
use super::space::IpcSpace;
use super::{IpcError, IpcResult};
use crate::counter;
use crate::kern::counters::{C_IPC_RECEIVE, C_IPC_TOO_LARGE};
use crate::kern::sched_prim::IpcThread;
use crate::kern::KernReturn;

// ============================================================================
// Message Option Flags
// ============================================================================

bitflags::bitflags! {
    /// Options for mach_msg (mach_msg_option_t)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MachMsgOption: u32 {
        /// Send a message
        const SEND_MSG = 0x0000_0001;
        /// Receive a message
        const RCV_MSG = 0x0000_0002;
        /// Report oversized messages without dequeuing them
        const RCV_LARGE = 0x0000_0004;
        const SEND_TIMEOUT = 0x0000_0010;
        const RCV_TIMEOUT = 0x0000_0100;
        /// Enqueue even past the queue limit (kernel internal)
        const SEND_ALWAYS = 0x0001_0000;
    }
}

// ============================================================================
// Message Return Codes
// ============================================================================

/// Operation successful
pub const MACH_MSG_SUCCESS: KernReturn = 0;

/// Invalid data (message, buffer, etc.)
pub const MACH_SEND_INVALID_DATA: KernReturn = 0x10000002;
/// Invalid destination port
pub const MACH_SEND_INVALID_DEST: KernReturn = 0x10000003;
/// Operation timed out
pub const MACH_SEND_TIMED_OUT: KernReturn = 0x10000004;
/// Operation interrupted
pub const MACH_SEND_INTERRUPTED: KernReturn = 0x10000007;
/// Message smaller than its header
pub const MACH_SEND_MSG_TOO_SMALL: KernReturn = 0x10000008;
/// Invalid port right
pub const MACH_SEND_INVALID_RIGHT: KernReturn = 0x1000000a;
/// Resource shortage
pub const MACH_SEND_NO_BUFFER: KernReturn = 0x1000000d;

/// Invalid receive name
pub const MACH_RCV_INVALID_NAME: KernReturn = 0x10004002;
/// Operation timed out
pub const MACH_RCV_TIMED_OUT: KernReturn = 0x10004003;
/// Message too large for buffer
pub const MACH_RCV_TOO_LARGE: KernReturn = 0x10004004;
/// Operation interrupted
pub const MACH_RCV_INTERRUPTED: KernReturn = 0x10004005;
/// Port changed (moved into or out of a set)
pub const MACH_RCV_PORT_CHANGED: KernReturn = 0x10004006;
/// Port died during receive
pub const MACH_RCV_PORT_DIED: KernReturn = 0x10004009;
/// Header error
pub const MACH_RCV_HEADER_ERROR: KernReturn = 0x1000400b;

// ============================================================================
// Errors
// ============================================================================

/// Failure of one half of mach_msg
#[derive(Debug, Error)]
pub enum MachMsgError {
    /// The send failed; the message is handed back
    #[error("send failed: {error}")]
    Send {
        error: IpcError,
        message: Box<IpcKmsg>,
    },
    #[error("receive failed: {0}")]
    Receive(IpcError),
    /// SEND_MSG given without a message
    #[error("no message to send")]
    NoMessage,
}

impl MachMsgError {
    /// mach_msg return code
    pub fn return_code(&self) -> KernReturn {
        match self {
            MachMsgError::Send { error, .. } => error.send_return(),
            MachMsgError::Receive(error) => error.rcv_return(),
            MachMsgError::NoMessage => MACH_SEND_INVALID_DATA,
        }
    }

    /// The underlying IPC error, if any
    pub fn ipc_error(&self) -> Option<IpcError> {
        match self {
            MachMsgError::Send { error, .. } | MachMsgError::Receive(error) => Some(*error),
            MachMsgError::NoMessage => None,
        }
    }

    /// Take back the message of a failed send
    pub fn into_message(self) -> Option<Box<IpcKmsg>> {
        match self {
            MachMsgError::Send { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ============================================================================
// Send
// ============================================================================

/// Send `kmsg` to the port named by its remote port field.
///
/// The name may hold a send, send-once or receive right. A send-once right
/// is taken out of the space for the duration of the send and consumed if
/// the send goes through; on failure it is put back, under its old name if
/// that is still free.
pub fn mach_msg_send(
    thread: &IpcThread,
    space: &IpcSpace,
    mut kmsg: Box<IpcKmsg>,
    option: MachMsgOption,
    timeout: Option<Duration>,
) -> Result<(), MachMsgError> {
    let name = kmsg.header.msgh_remote_port;
    let timeout = if option.contains(MachMsgOption::SEND_TIMEOUT) {
        timeout
    } else {
        None
    };

    let (right, port) = match space.lookup(name) {
        Ok(entry) => (entry.right(), entry.port().cloned()),
        Err(error) => return Err(MachMsgError::Send { error, message: kmsg }),
    };

    match (right, port) {
        (MachPortRight::Send | MachPortRight::Receive, Some(port)) => {
            // The destination type comes from the right, not from the caller
            kmsg.header.set_remote_type(MACH_MSG_TYPE_PORT_SEND);
            ipc_mqueue_send(thread, &port, kmsg, option, timeout).map_err(|e| MachMsgError::Send {
                error: e.error,
                message: e.message,
            })
        }
        (MachPortRight::SendOnce, _) => {
            let entry = match space.take_entry(name, MachPortRight::SendOnce) {
                Ok(entry) => entry,
                Err(error) => return Err(MachMsgError::Send { error, message: kmsg }),
            };
            let Some(port) = entry.object().as_port().cloned() else {
                // Unreachable for a send-once entry; put it back untouched
                if let Err(error) = space.restore_entry(name, entry) {
                    log::warn!("mach_msg: send-once right {:#x} lost: {}", name, error);
                }
                return Err(MachMsgError::Send {
                    error: IpcError::InvalidName,
                    message: kmsg,
                });
            };
            kmsg.header.set_remote_type(MACH_MSG_TYPE_PORT_SEND_ONCE);
            match ipc_mqueue_send(thread, &port, kmsg, option, timeout) {
                Ok(()) => {
                    drop(entry);
                    Ok(())
                }
                Err(e) => {
                    if let Err(error) = space.restore_entry(name, entry) {
                        log::warn!("mach_msg: send-once right {:#x} lost: {}", name, error);
                    }
                    Err(MachMsgError::Send {
                        error: e.error,
                        message: e.message,
                    })
                }
            }
        }
        _ => Err(MachMsgError::Send {
            error: IpcError::InvalidName,
            message: kmsg,
        }),
    }
}

// ============================================================================
// Receive
// ============================================================================

/// Receive from the port or port set called `name` in `space`
pub fn mach_msg_receive(
    thread: &IpcThread,
    space: &IpcSpace,
    name: MachPortName,
    option: MachMsgOption,
    max_size: usize,
    timeout: Option<Duration>,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    let target = {
        let entry = space.lookup(name)?;
        match (entry.right(), entry.object()) {
            (MachPortRight::Receive, object) => {
                ReceiveTarget::Port(object.as_port().cloned().ok_or(IpcError::InvalidName)?)
            }
            (MachPortRight::PortSet, object) => {
                ReceiveTarget::PortSet(object.as_port_set().cloned().ok_or(IpcError::InvalidName)?)
            }
            _ => return Err(IpcError::InvalidName),
        }
        // The entry reference is released here, before we can block
    };
    let timeout = if option.contains(MachMsgOption::RCV_TIMEOUT) {
        timeout
    } else {
        None
    };
    ipc_mqueue_receive(thread, &target, option, max_size, timeout)
}

/// Hand over a reply left on the thread by a kernel object.
///
/// A reply that does not fit stays on the thread under `RCV_LARGE`, where
/// `IpcThread::take_kernel_reply` can collect it.
fn receive_kernel_reply(
    thread: &IpcThread,
    reply: Box<IpcKmsg>,
    option: MachMsgOption,
    max_size: usize,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    let required = reply.receive_size();
    if required > max_size {
        counter!(C_IPC_TOO_LARGE);
        if option.contains(MachMsgOption::RCV_LARGE) {
            thread.set_kernel_reply(reply);
        }
        return Err(IpcError::TooLarge { required });
    }
    counter!(C_IPC_RECEIVE);
    let seqno = reply.seqno();
    Ok((reply, seqno))
}

// ============================================================================
// mach_msg
// ============================================================================

/// Combined send and receive.
///
/// Sends `msg` if `SEND_MSG` is set, then receives from `rcv_name` if
/// `RCV_MSG` is set. A reply produced by a kernel object during this call's
/// send satisfies the receive without touching `rcv_name`; a reply left over
/// from an earlier call never does. Returns the received message, or `None`
/// for a send-only call.
pub fn mach_msg(
    thread: &IpcThread,
    space: &IpcSpace,
    msg: Option<Box<IpcKmsg>>,
    option: MachMsgOption,
    rcv_name: MachPortName,
    max_size: usize,
    timeout: Option<Duration>,
) -> Result<Option<(Box<IpcKmsg>, MachPortSeqno)>, MachMsgError> {
    let sending = option.contains(MachMsgOption::SEND_MSG);
    if sending {
        let kmsg = msg.ok_or(MachMsgError::NoMessage)?;
        if let Some(stale) = thread.take_kernel_reply() {
            log::warn!("mach_msg: unclaimed kernel reply {} discarded", stale.id());
            kmsg_destroy(stale);
        }
        mach_msg_send(thread, space, kmsg, option, timeout)?;
    }

    if !option.contains(MachMsgOption::RCV_MSG) {
        return Ok(None);
    }

    let reply = if sending { thread.take_kernel_reply() } else { None };
    let result = match reply {
        Some(reply) => receive_kernel_reply(thread, reply, option, max_size),
        None => mach_msg_receive(thread, space, rcv_name, option, max_size, timeout),
    };
    result.map(Some).map_err(MachMsgError::Receive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ipc_object::IpcObject;
    use crate::ipc::kmsg::{
        mach_msgh_bits, MACH_MSG_HEADER_SIZE, MACH_MSG_TYPE_MOVE_SEND_ONCE, MAX_TRAILER_SIZE,
    };
    use crate::ipc::port::Port;
    use crate::ipc::port_ops::mach_port_allocate_kernel;
    use crate::kern::ipc_kobject::{FnKobject, KobjectType};
    use alloc::sync::Arc;
    use alloc::vec;

    /// Kernel port answering every request with `id + 100` and a 64-byte body
    fn kernel_port(space: &IpcSpace) -> MachPortName {
        let handler = Arc::new(FnKobject::new(KobjectType::Host, |request: Box<IpcKmsg>| {
            Some(IpcKmsg::simple(request.header.msgh_local_port, request.id() + 100, vec![0; 64]))
        }));
        mach_port_allocate_kernel(space, handler).unwrap().0
    }

    fn setup() -> (Arc<IpcThread>, Arc<IpcSpace>, MachPortName, Arc<Port>) {
        let thread = IpcThread::current();
        let space = IpcSpace::new();
        let port = Port::new();
        let (name, _entry) = space
            .alloc(IpcObject::Port(Arc::clone(&port)), MachPortRight::Receive)
            .unwrap();
        (thread, space, name, port)
    }

    #[test]
    fn test_send_receive_by_name() {
        let (thread, space, name, port) = setup();
        let send = space.insert_send_right(&port).unwrap();

        let kmsg = IpcKmsg::simple(send, 5, vec![1, 2, 3]);
        mach_msg_send(&thread, &space, kmsg, MachMsgOption::SEND_MSG, None).unwrap();
        let (kmsg, seqno) = mach_msg_receive(
            &thread,
            &space,
            name,
            MachMsgOption::RCV_MSG | MachMsgOption::RCV_TIMEOUT,
            256,
            Some(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(kmsg.id(), 5);
        assert_eq!(kmsg.body(), [1, 2, 3]);
        assert_eq!(seqno, 0);
    }

    #[test]
    fn test_send_to_unknown_name_returns_message() {
        let (thread, space, _, _) = setup();
        let kmsg = IpcKmsg::simple(99, 1, vec![]);
        let err = mach_msg_send(&thread, &space, kmsg, MachMsgOption::SEND_MSG, None).unwrap_err();
        assert_eq!(err.return_code(), MACH_SEND_INVALID_DEST);
        assert_eq!(err.into_message().map(|m| m.id()), Some(1));
    }

    #[test]
    fn test_send_once_consumed() {
        let (thread, space, name, port) = setup();
        let once = space.insert_send_once_right(&port).unwrap();
        assert_eq!(port.status().sorights, 1);

        let kmsg = IpcKmsg::simple(once, 1, vec![]);
        mach_msg_send(&thread, &space, kmsg, MachMsgOption::SEND_MSG, None).unwrap();
        assert_eq!(space.lookup(once).err(), Some(IpcError::InvalidName));
        assert_eq!(port.status().sorights, 0);

        let (kmsg, _) =
            mach_msg_receive(&thread, &space, name, MachMsgOption::RCV_MSG, 256, None).unwrap();
        assert_eq!(kmsg.header.remote_type(), MACH_MSG_TYPE_PORT_SEND_ONCE);
    }

    #[test]
    fn test_full_queue_send_once_passes_send_times_out() {
        let (thread, space, _, port) = setup();
        port.set_qlimit(0);
        let once = space.insert_send_once_right(&port).unwrap();
        let kmsg = IpcKmsg::simple(once, 1, vec![]);
        mach_msg_send(&thread, &space, kmsg, MachMsgOption::SEND_MSG, None).unwrap();
        assert_eq!(port.msgcount(), 1);

        let send = space.insert_send_right(&port).unwrap();
        let err = mach_msg_send(
            &thread,
            &space,
            IpcKmsg::simple(send, 2, vec![]),
            MachMsgOption::SEND_MSG | MachMsgOption::SEND_TIMEOUT,
            Some(Duration::ZERO),
        )
        .unwrap_err();
        assert_eq!(err.return_code(), MACH_SEND_TIMED_OUT);
        assert_eq!(space.get_refs(send), Ok(1));
    }

    #[test]
    fn test_forged_send_once_bits_do_not_skip_limit() {
        let (thread, space, _, port) = setup();
        port.set_qlimit(1);
        let send = space.insert_send_right(&port).unwrap();

        let forged = |id| {
            let mut kmsg = IpcKmsg::simple(send, id, vec![]);
            kmsg.header.msgh_bits = mach_msgh_bits(MACH_MSG_TYPE_MOVE_SEND_ONCE, 0);
            kmsg
        };
        let option = MachMsgOption::SEND_MSG | MachMsgOption::SEND_TIMEOUT;
        mach_msg_send(&thread, &space, forged(1), option, Some(Duration::ZERO)).unwrap();
        let err =
            mach_msg_send(&thread, &space, forged(2), option, Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.return_code(), MACH_SEND_TIMED_OUT);
        assert_eq!(port.msgcount(), 1);
    }

    #[test]
    fn test_receive_on_send_right_is_invalid() {
        let (thread, space, _, port) = setup();
        let send = space.insert_send_right(&port).unwrap();
        assert_eq!(
            mach_msg_receive(&thread, &space, send, MachMsgOption::RCV_MSG, 256, None).err(),
            Some(IpcError::InvalidName)
        );
    }

    #[test]
    fn test_send_only_returns_none() {
        let (thread, space, name, _) = setup();
        let result = mach_msg(
            &thread,
            &space,
            Some(IpcKmsg::simple(name, 1, vec![])),
            MachMsgOption::SEND_MSG,
            0,
            0,
            None,
        )
        .unwrap();
        assert!(result.is_none());
        assert_eq!(
            mach_msg(&thread, &space, None, MachMsgOption::SEND_MSG, 0, 0, None)
                .unwrap_err()
                .return_code(),
            MACH_SEND_INVALID_DATA
        );
    }

    #[test]
    fn test_earlier_kernel_reply_does_not_answer_receive() {
        let (thread, space, name, port) = setup();
        let kport = kernel_port(&space);
        let send = space.insert_send_right(&port).unwrap();

        // Send-only request: the reply is left on the thread
        mach_msg(
            &thread,
            &space,
            Some(IpcKmsg::request(kport, name, 1, vec![])),
            MachMsgOption::SEND_MSG,
            0,
            0,
            None,
        )
        .unwrap();
        let kmsg = IpcKmsg::simple(send, 7, vec![]);
        mach_msg_send(&thread, &space, kmsg, MachMsgOption::SEND_MSG, None).unwrap();

        let (kmsg, seqno) = mach_msg(
            &thread,
            &space,
            None,
            MachMsgOption::RCV_MSG | MachMsgOption::RCV_TIMEOUT,
            name,
            256,
            Some(Duration::ZERO),
        )
        .unwrap()
        .unwrap();
        assert_eq!((kmsg.id(), seqno), (7, 0));
        assert_eq!(thread.take_kernel_reply().map(|r| r.id()), Some(101));
    }

    #[test]
    fn test_combined_call_discards_unclaimed_reply() {
        let (thread, space, name, _) = setup();
        let kport = kernel_port(&space);
        let option = MachMsgOption::SEND_MSG;
        let request = IpcKmsg::request(kport, name, 1, vec![]);
        mach_msg(&thread, &space, Some(request), option, 0, 0, None).unwrap();

        let (reply, _) = mach_msg(
            &thread,
            &space,
            Some(IpcKmsg::request(kport, name, 2, vec![])),
            MachMsgOption::SEND_MSG | MachMsgOption::RCV_MSG,
            name,
            256,
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(reply.id(), 102);
        assert!(thread.take_kernel_reply().is_none());
    }

    #[test]
    fn test_kernel_reply_too_large() {
        let (thread, space, name, _) = setup();
        let kport = kernel_port(&space);
        let required = MACH_MSG_HEADER_SIZE + 64 + MAX_TRAILER_SIZE;
        let call = |option: MachMsgOption| {
            mach_msg(
                &thread,
                &space,
                Some(IpcKmsg::request(kport, name, 1, vec![])),
                MachMsgOption::SEND_MSG | MachMsgOption::RCV_MSG | option,
                name,
                16,
                None,
            )
            .unwrap_err()
        };

        let err = call(MachMsgOption::RCV_LARGE);
        assert_eq!(err.ipc_error(), Some(IpcError::TooLarge { required }));
        assert_eq!(thread.take_kernel_reply().map(|r| r.id()), Some(101));

        let err = call(MachMsgOption::empty());
        assert_eq!(err.ipc_error(), Some(IpcError::TooLarge { required }));
        assert!(thread.take_kernel_reply().is_none());
    }
}
