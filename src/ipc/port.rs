//! IPC Port - the message endpoint
//!
//! Based on Mach4 ipc/ipc_port.h/c
//!
//! A port is a bounded FIFO with one receiver and any number of senders.
//! User ports queue messages; kernel ports hand every message to their
//! kernel object on the spot. A port lives until its receive right is
//! released, at which point it turns dead: queued messages are destroyed,
//! blocked threads are woken and later sends are discarded.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::MutexGuard;

use super::ipc_object::IpcObjectId;
use super::kmsg::{kmsg_destroy, MachPortSeqno};
use super::mqueue::IpcMqueue;
use super::pset::PortSet;
use crate::config;
use crate::kern::ipc_kobject::{KobjectHandler, KobjectType};
use crate::kern::sched_prim::WakeEvent;

/// What services messages sent to a port
#[derive(Clone)]
pub enum PortKind {
    /// Messages are queued for the holder of the receive right
    User,
    /// Messages are handled synchronously by a kernel object
    Kernel(Arc<dyn KobjectHandler>),
}

impl fmt::Debug for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::User => f.write_str("User"),
            PortKind::Kernel(handler) => write!(f, "Kernel({})", handler.kobject_type().name()),
        }
    }
}

/// Snapshot of a port's state (mach_port_status)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub active: bool,
    pub msgcount: usize,
    pub qlimit: usize,
    pub seqno: MachPortSeqno,
    /// Send rights held across all spaces
    pub send_rights: u32,
    /// Outstanding send-once rights
    pub sorights: u32,
    /// Id of the owning set, if any
    pub pset: Option<IpcObjectId>,
    pub kobject: KobjectType,
    /// Threads parked receiving directly from the port
    pub blocked_receivers: usize,
    /// Threads parked waiting for room
    pub blocked_senders: usize,
}

/// IPC port
pub struct Port {
    id: IpcObjectId,
    kind: PortKind,
    /// Mirrors the queue's state for lock-free checks; written under the lock
    active: AtomicBool,
    mqueue: spin::Mutex<IpcMqueue>,
    send_rights: AtomicU32,
    sorights: AtomicU32,
}

impl Port {
    /// New user port with the configured default queue limit
    pub fn new() -> Arc<Self> {
        Self::with_qlimit(config::get().default_qlimit)
    }

    /// New user port with an explicit queue limit
    pub fn with_qlimit(qlimit: usize) -> Arc<Self> {
        Self::create(PortKind::User, qlimit)
    }

    /// New port serviced by a kernel object
    pub fn new_kernel(handler: Arc<dyn KobjectHandler>) -> Arc<Self> {
        Self::create(PortKind::Kernel(handler), config::get().default_qlimit)
    }

    fn create(kind: PortKind, qlimit: usize) -> Arc<Self> {
        let port = Arc::new(Self {
            id: IpcObjectId::generate(),
            kind,
            active: AtomicBool::new(true),
            mqueue: spin::Mutex::new(IpcMqueue::new(qlimit)),
            send_rights: AtomicU32::new(0),
            sorights: AtomicU32::new(0),
        });
        log::debug!("port {}: created ({:?}, qlimit {})", port.id.value(), port.kind, qlimit);
        port
    }

    #[inline]
    pub fn id(&self) -> IpcObjectId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self.kind, PortKind::Kernel(_))
    }

    /// False once the port has been destroyed
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IpcMqueue> {
        self.mqueue.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, IpcMqueue>> {
        self.mqueue.try_lock()
    }

    // ========================================================================
    // Queue state
    // ========================================================================

    /// Number of queued messages
    pub fn msgcount(&self) -> usize {
        self.lock().msgcount()
    }

    pub fn qlimit(&self) -> usize {
        self.lock().qlimit()
    }

    /// Change the queue limit. Raising it wakes senders that now fit.
    pub fn set_qlimit(&self, qlimit: usize) {
        self.lock().set_qlimit(qlimit);
    }

    /// Sequence number the next received message will carry
    pub fn seqno(&self) -> MachPortSeqno {
        self.lock().seqno()
    }

    pub fn set_seqno(&self, seqno: MachPortSeqno) {
        self.lock().set_seqno(seqno);
    }

    /// The set this port belongs to
    pub fn port_set(&self) -> Option<Arc<PortSet>> {
        self.lock().port_set()
    }

    pub fn status(&self) -> PortStatus {
        let mq = self.lock();
        PortStatus {
            active: mq.active,
            msgcount: mq.msgcount(),
            qlimit: mq.qlimit(),
            seqno: mq.seqno(),
            send_rights: self.send_rights.load(Ordering::Relaxed),
            sorights: self.sorights.load(Ordering::Relaxed),
            pset: mq.port_set().map(|pset| pset.id()),
            kobject: match &self.kind {
                PortKind::User => KobjectType::None,
                PortKind::Kernel(handler) => handler.kobject_type(),
            },
            blocked_receivers: mq.receivers.len(),
            blocked_senders: mq.senders.len(),
        }
    }

    // ========================================================================
    // Send right accounting
    // ========================================================================

    pub(crate) fn add_send_right(&self) {
        self.send_rights.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_send_right(&self) {
        if self.send_rights.fetch_sub(1, Ordering::AcqRel) == 1 {
            log::trace!("port {}: no more senders", self.id.value());
        }
    }

    pub(crate) fn add_send_once_right(&self) {
        self.sorights.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_send_once_right(&self) {
        self.sorights.fetch_sub(1, Ordering::AcqRel);
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Destroy the port.
    ///
    /// Leaves its set first, then marks it dead, destroys the queued
    /// messages and wakes every blocked thread with `PortDied`. Blocked
    /// senders re-check, see the port dead and discard their message.
    pub fn destroy(&self) {
        let mut mq = loop {
            let mq = self.lock();
            if !mq.active {
                return;
            }
            let Some(weak) = mq.port_set.clone() else {
                break mq;
            };
            drop(mq);
            match weak.upgrade() {
                Some(pset) => pset.unlink_member(self),
                None => {
                    // The set is gone without having unlinked us
                    let mut mq = self.lock();
                    mq.port_set = None;
                }
            }
        };

        mq.active = false;
        self.active.store(false, Ordering::Release);
        let messages = mq.drain();
        let receivers = mq.receivers.wake_all(WakeEvent::PortDied);
        let senders = mq.senders.wake_all(WakeEvent::PortDied);
        drop(mq);

        log::debug!(
            "port {}: destroyed, {} messages discarded, {} receivers and {} senders woken",
            self.id.value(),
            messages.len(),
            receivers,
            senders
        );
        for kmsg in messages {
            kmsg_destroy(kmsg);
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}
