//! IPC Message Queue - send, receive and deliver
//!
//! Based on Mach4 ipc/ipc_mqueue.c
//! Each port has a message queue for pending messages, a list of threads
//! parked waiting to receive from it, and a list of senders parked waiting
//! for room.
//!
//! ## Delivery
//!
//! `deliver` runs with the port lock held. A parked receiver on the port is
//! served first, then a receiver parked on the port's set, and only then is
//! the message queued. Waiters are removed from their wait queue under the
//! lock that performs the handoff, so a message reaches at most one
//! receiver.
//!
//! ## Lock order
//!
//! A thread holding a port lock may block on the lock of the port's set.
//! A thread holding a set lock only ever try-locks member ports (see
//! [`super::pset`]). Space locks are never held here.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::time::Duration;
use thiserror::Error;

use super::kmsg::{kmsg_destroy, IpcKmsg, MachPortSeqno, MACH_MSG_TYPE_PORT_SEND_ONCE};
use super::mach_msg::MachMsgOption;
use super::port::{Port, PortKind};
use super::pset::{ipc_pset_receive, PortSet};
use super::{IpcError, IpcResult};
use crate::counter;
use crate::kern::counters::{
    C_IPC_CIRCULAR_DISCARD, C_IPC_DEAD_DISCARD, C_IPC_ENQUEUE, C_IPC_HANDOFF, C_IPC_RECEIVE,
    C_IPC_RECEIVE_BLOCK, C_IPC_SEND, C_IPC_SEND_BLOCK, C_IPC_TOO_LARGE,
};
use crate::kern::ipc_kobject::ipc_kobject_server;
use crate::kern::sched_prim::{thread_block, IpcThread, WaitOutcome, WaitQueue, WaitSlot, WakeEvent};

// ============================================================================
// Message Queue
// ============================================================================

/// Message queue for a port, protected by the port lock
#[derive(Debug)]
pub(crate) struct IpcMqueue {
    /// Cleared once when the port is destroyed
    pub(crate) active: bool,
    messages: VecDeque<Box<IpcKmsg>>,
    qlimit: usize,
    /// Sequence number given to the next received message
    seqno: MachPortSeqno,
    /// Threads parked in receive on this port
    pub(crate) receivers: WaitQueue,
    /// Threads parked waiting for room
    pub(crate) senders: WaitQueue,
    /// Set this port belongs to; the set owns the membership
    pub(crate) port_set: Option<Weak<PortSet>>,
}

impl IpcMqueue {
    pub(crate) fn new(qlimit: usize) -> Self {
        Self {
            active: true,
            messages: VecDeque::new(),
            qlimit,
            seqno: 0,
            receivers: WaitQueue::new(),
            senders: WaitQueue::new(),
            port_set: None,
        }
    }

    #[inline]
    pub(crate) fn msgcount(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub(crate) fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    #[inline]
    pub(crate) fn qlimit(&self) -> usize {
        self.qlimit
    }

    #[inline]
    pub(crate) fn seqno(&self) -> MachPortSeqno {
        self.seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: MachPortSeqno) {
        self.seqno = seqno;
    }

    /// Change the limit; senders that now fit are woken
    pub(crate) fn set_qlimit(&mut self, qlimit: usize) {
        self.qlimit = qlimit;
        let room = qlimit.saturating_sub(self.messages.len());
        for _ in 0..room {
            if !self.senders.wake_one(WakeEvent::Retry) {
                break;
            }
        }
    }

    /// The set this port belongs to, if it is still alive
    pub(crate) fn port_set(&self) -> Option<Arc<PortSet>> {
        self.port_set.as_ref().and_then(Weak::upgrade)
    }

    /// True if the port's set back-reference points at `pset`
    pub(crate) fn in_set(&self, pset: &PortSet) -> bool {
        self.port_set
            .as_ref()
            .is_some_and(|w| core::ptr::eq(w.as_ptr(), pset))
    }

    /// Take everything queued, leaving the queue empty
    pub(crate) fn drain(&mut self) -> VecDeque<Box<IpcKmsg>> {
        core::mem::take(&mut self.messages)
    }

    /// Remove the head message for a receiver with a `max_size` buffer.
    ///
    /// Returns `None` if the queue is empty. A message that does not fit is
    /// left in place when `large` is set and consumed otherwise; both cases
    /// report `TooLarge`.
    pub(crate) fn dequeue(
        &mut self,
        max_size: usize,
        large: bool,
    ) -> Option<IpcResult<(Box<IpcKmsg>, MachPortSeqno)>> {
        let required = self.messages.front()?.receive_size();
        if required > max_size && large {
            counter!(C_IPC_TOO_LARGE);
            return Some(Err(IpcError::TooLarge { required }));
        }

        let mut kmsg = self.messages.pop_front()?;
        let seqno = self.next_seqno();
        if self.messages.len() < self.qlimit {
            self.senders.wake_one(WakeEvent::Retry);
        }

        if required > max_size {
            counter!(C_IPC_TOO_LARGE);
            log::debug!(
                "mqueue: seqno {} needs {} bytes, buffer {}, discarded",
                seqno,
                required,
                max_size
            );
            kmsg_destroy(kmsg);
            return Some(Err(IpcError::TooLarge { required }));
        }

        kmsg.set_seqno(seqno);
        Some(Ok((kmsg, seqno)))
    }

    fn next_seqno(&mut self) -> MachPortSeqno {
        let seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        seqno
    }

    /// Offer `kmsg` to the threads parked on `waiters`, stamping it with
    /// this queue's next sequence number.
    ///
    /// Returns the message if nobody took it. The caller holds the port lock
    /// and, for a set's waiters, the set lock as well.
    pub(crate) fn handoff(
        &mut self,
        waiters: &mut WaitQueue,
        mut kmsg: Box<IpcKmsg>,
    ) -> Option<Box<IpcKmsg>> {
        while let Some(slot) = waiters.pop_front() {
            let required = kmsg.receive_size();
            if required <= slot.max_size() {
                let seqno = self.next_seqno();
                kmsg.set_seqno(seqno);
                counter!(C_IPC_HANDOFF);
                slot.complete(WaitOutcome::Message(kmsg, seqno));
                return None;
            }

            counter!(C_IPC_TOO_LARGE);
            slot.complete(WaitOutcome::TooLarge(required));
            if !slot.large() {
                let seqno = self.next_seqno();
                log::debug!(
                    "mqueue: seqno {} needs {} bytes, receiver discarded it",
                    seqno,
                    required
                );
                kmsg_destroy(kmsg);
                return None;
            }
        }
        Some(kmsg)
    }
}

// ============================================================================
// Deliver
// ============================================================================

/// Hand `kmsg` to a parked receiver or queue it. The caller holds the port
/// lock and has already checked the port is active.
pub(crate) fn ipc_mqueue_deliver(mq: &mut IpcMqueue, kmsg: Box<IpcKmsg>) {
    let mut receivers = core::mem::take(&mut mq.receivers);
    let kmsg = mq.handoff(&mut receivers, kmsg);
    mq.receivers = receivers;
    let Some(kmsg) = kmsg else {
        return;
    };

    if let Some(pset) = mq.port_set() {
        let mut set = pset.lock();
        if set.active {
            let Some(kmsg) = mq.handoff(&mut set.waiters, kmsg) else {
                return;
            };
            mq.messages.push_back(kmsg);
            set.epoch = set.epoch.wrapping_add(1);
            counter!(C_IPC_ENQUEUE);
            return;
        }
    }

    mq.messages.push_back(kmsg);
    counter!(C_IPC_ENQUEUE);
}

// ============================================================================
// Send
// ============================================================================

/// A send that did not go through; the caller gets the message back
#[derive(Debug, Error)]
#[error("send failed: {error}")]
pub struct SendError {
    pub error: IpcError,
    pub message: Box<IpcKmsg>,
}

fn discard_dead(port: &Port, kmsg: Box<IpcKmsg>) {
    counter!(C_IPC_DEAD_DISCARD);
    log::warn!("mqueue: port {} is dead, message {} discarded", port.id().value(), kmsg.id());
    kmsg_destroy(kmsg);
}

/// Send a message to a port.
///
/// Kernel ports service the message on the spot. Messages to a dead port,
/// and messages carrying the circular bit, are destroyed and the send
/// reports success. Otherwise the sender waits while the queue is full,
/// unless `SEND_ALWAYS` is given or the message travels on a send-once
/// right. A sender that times out or is aborted gets its message back and
/// leaves the queue untouched.
pub fn ipc_mqueue_send(
    thread: &IpcThread,
    port: &Arc<Port>,
    kmsg: Box<IpcKmsg>,
    option: MachMsgOption,
    timeout: Option<Duration>,
) -> Result<(), SendError> {
    if let PortKind::Kernel(handler) = port.kind() {
        if !port.is_active() {
            discard_dead(port, kmsg);
            return Ok(());
        }
        if let Some(reply) = ipc_kobject_server(handler.as_ref(), kmsg) {
            thread.set_kernel_reply(reply);
        }
        counter!(C_IPC_SEND);
        return Ok(());
    }

    if kmsg.header.is_circular() {
        counter!(C_IPC_CIRCULAR_DISCARD);
        log::warn!(
            "mqueue: circular message {} to port {} discarded",
            kmsg.id(),
            port.id().value()
        );
        kmsg_destroy(kmsg);
        return Ok(());
    }

    let always = option.contains(MachMsgOption::SEND_ALWAYS);
    let send_once = kmsg.header.remote_type() == MACH_MSG_TYPE_PORT_SEND_ONCE;
    let deadline = thread.deadline(timeout);

    let mut mq = port.lock();
    loop {
        if !mq.active {
            drop(mq);
            discard_dead(port, kmsg);
            return Ok(());
        }
        if mq.msgcount() < mq.qlimit() || always || send_once {
            break;
        }

        let slot = WaitSlot::sender(thread);
        mq.senders.push_back(Arc::clone(&slot));
        drop(mq);
        counter!(C_IPC_SEND_BLOCK);
        log::trace!(
            "mqueue: thread {} blocks sending to port {}",
            thread.id().value(),
            port.id().value()
        );

        // Any wakeup means re-check: room, death, or another sender won
        let woken = thread_block(thread, &slot, deadline, |s| port.lock().senders.remove(s));
        if let Err(error) = woken {
            return Err(SendError { error, message: kmsg });
        }
        mq = port.lock();
    }

    ipc_mqueue_deliver(&mut mq, kmsg);
    drop(mq);
    counter!(C_IPC_SEND);
    Ok(())
}

// ============================================================================
// Receive
// ============================================================================

/// What a receive waits on
#[derive(Debug, Clone)]
pub enum ReceiveTarget {
    Port(Arc<Port>),
    PortSet(Arc<PortSet>),
}

/// Map a wakeup to the receive result, `None` meaning scan again
pub(crate) fn receive_outcome(
    outcome: WaitOutcome,
) -> Option<IpcResult<(Box<IpcKmsg>, MachPortSeqno)>> {
    match outcome {
        WaitOutcome::Message(kmsg, seqno) => Some(Ok((kmsg, seqno))),
        WaitOutcome::TooLarge(required) => Some(Err(IpcError::TooLarge { required })),
        WaitOutcome::Event(WakeEvent::PortDied) => Some(Err(IpcError::PortDied)),
        WaitOutcome::Event(WakeEvent::PortChanged) => Some(Err(IpcError::PortChanged)),
        WaitOutcome::Event(WakeEvent::Retry) => None,
    }
}

fn ipc_mqueue_receive_port(
    thread: &IpcThread,
    port: &Arc<Port>,
    max_size: usize,
    large: bool,
    deadline: Option<Duration>,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    let mut mq = port.lock();
    loop {
        if !mq.active {
            return Err(IpcError::PortDied);
        }
        if let Some(result) = mq.dequeue(max_size, large) {
            return result;
        }

        let slot = WaitSlot::receiver(thread, max_size, large);
        mq.receivers.push_back(Arc::clone(&slot));
        drop(mq);
        counter!(C_IPC_RECEIVE_BLOCK);

        let outcome = thread_block(thread, &slot, deadline, |s| port.lock().receivers.remove(s))?;
        if let Some(result) = receive_outcome(outcome) {
            return result;
        }
        mq = port.lock();
    }
}

/// Receive the next message from a port or port set.
///
/// `max_size` is the caller's buffer size and must leave room for the
/// trailer. With `RCV_LARGE` a message that does not fit stays queued and
/// `TooLarge` reports the size needed; without it the message is consumed.
pub fn ipc_mqueue_receive(
    thread: &IpcThread,
    target: &ReceiveTarget,
    option: MachMsgOption,
    max_size: usize,
    timeout: Option<Duration>,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    let large = option.contains(MachMsgOption::RCV_LARGE);
    let deadline = thread.deadline(timeout);

    let result = match target {
        ReceiveTarget::Port(port) => {
            ipc_mqueue_receive_port(thread, port, max_size, large, deadline)
        }
        ReceiveTarget::PortSet(pset) => ipc_pset_receive(thread, pset, max_size, large, deadline),
    };

    if let Ok((kmsg, seqno)) = &result {
        counter!(C_IPC_RECEIVE);
        log::trace!(
            "mqueue: thread {} received message {} seqno {}",
            thread.id().value(),
            kmsg.id(),
            seqno
        );
    }
    result
}
