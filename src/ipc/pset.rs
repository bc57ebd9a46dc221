//! IPC Port Sets - Collections of ports for multiplexed receive
//!
//! Based on Mach4 ipc/ipc_pset.c
//! Port sets allow receiving from multiple ports with a single receive.
//!
//! ## Architecture
//!
//! The set owns its members; each member port only keeps a weak reference
//! back to the set. A port can be in at most one port set at a time, and
//! receiving from a set removes the message from the member port it was
//! queued on.
//!
//! ## Locking
//!
//! Delivery to a member port holds the port lock and then takes the set
//! lock, so a thread holding the set lock must never block on a member's
//! lock. It try-locks instead; when that fails it drops the set lock, takes
//! the port lock, takes the set lock again and re-validates. Any state
//! observed before the set lock was dropped is stale at that point: the
//! receive scan checks the set's epoch (bumped on every membership change
//! and every message queued on a member) and starts over if it moved.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use spin::{Mutex, MutexGuard};

use super::ipc_object::IpcObjectId;
use super::kmsg::{IpcKmsg, MachPortSeqno};
use super::mqueue::{receive_outcome, IpcMqueue};
use super::port::Port;
use super::{IpcError, IpcResult};
use crate::config;
use crate::counter;
use crate::kern::counters::{C_IPC_RECEIVE_BLOCK, C_PSET_LOCK_RETRY};
use crate::kern::sched_prim::{thread_block, IpcThread, WaitQueue, WaitSlot, WakeEvent};

// ============================================================================
// Port Set
// ============================================================================

/// Port set state, protected by the set lock
#[derive(Debug)]
pub(crate) struct IpcPortSet {
    pub(crate) active: bool,
    members: Vec<Arc<Port>>,
    /// Threads parked receiving from the set
    pub(crate) waiters: WaitQueue,
    /// Bumped whenever membership changes or a member queues a message
    pub(crate) epoch: u64,
    max_members: usize,
}

impl IpcPortSet {
    fn position(&self, port: &Port) -> Option<usize> {
        self.members
            .iter()
            .position(|member| core::ptr::eq(Arc::as_ptr(member), port))
    }

    fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// Port set
pub struct PortSet {
    id: IpcObjectId,
    active: AtomicBool,
    inner: Mutex<IpcPortSet>,
}

impl PortSet {
    /// New set with the configured member limit
    pub fn new() -> Arc<Self> {
        Self::with_max_members(config::get().pset_max_members)
    }

    pub fn with_max_members(max_members: usize) -> Arc<Self> {
        let pset = Arc::new(Self {
            id: IpcObjectId::generate(),
            active: AtomicBool::new(true),
            inner: Mutex::new(IpcPortSet {
                active: true,
                members: Vec::new(),
                waiters: WaitQueue::new(),
                epoch: 0,
                max_members,
            }),
        });
        log::debug!("pset {}: created", pset.id.value());
        pset
    }

    #[inline]
    pub fn id(&self) -> IpcObjectId {
        self.id
    }

    /// False once the set has been destroyed
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IpcPortSet> {
        self.inner.lock()
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_member(&self, port: &Port) -> bool {
        self.lock().position(port).is_some()
    }

    /// Snapshot of the member ports
    pub fn members(&self) -> Vec<Arc<Port>> {
        self.lock().members.clone()
    }

    /// Threads parked receiving from the set
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Add `port` to the set.
    ///
    /// Adding a port that is already a member is a no-op. A port in another
    /// set must be moved out first. Threads parked directly on the port are
    /// woken with `PortChanged`; messages already queued on it become
    /// visible to the set's receivers.
    pub fn add_member(self: &Arc<Self>, port: &Arc<Port>) -> IpcResult<()> {
        let (mut set, mut mq) = lock_set_and_port(self, port);
        if !set.active {
            return Err(IpcError::InvalidName);
        }
        if !mq.active {
            return Err(IpcError::InvalidRight);
        }
        if mq.in_set(self) {
            return Ok(());
        }
        if mq.port_set().is_some() {
            return Err(IpcError::InvalidRight);
        }
        if set.members.len() >= set.max_members {
            return Err(IpcError::ResourceShortage);
        }
        set.members
            .try_reserve(1)
            .map_err(|_| IpcError::ResourceShortage)?;

        set.members.push(Arc::clone(port));
        set.bump_epoch();
        mq.port_set = Some(Arc::downgrade(self));
        mq.receivers.wake_all(WakeEvent::PortChanged);
        for _ in 0..mq.msgcount() {
            if !set.waiters.wake_one(WakeEvent::Retry) {
                break;
            }
        }
        log::trace!("pset {}: port {} added", self.id.value(), port.id().value());
        Ok(())
    }

    /// Remove `port` from the set, waking threads parked directly on it with
    /// `PortChanged`
    pub fn remove_member(&self, port: &Port) -> IpcResult<()> {
        self.unlink(port, true)
    }

    /// Remove `port` quietly, used while the port is being destroyed
    pub(crate) fn unlink_member(&self, port: &Port) {
        if self.unlink(port, false).is_err() {
            log::trace!("pset {}: port {} already unlinked", self.id.value(), port.id().value());
        }
    }

    fn unlink(&self, port: &Port, notify: bool) -> IpcResult<()> {
        let (mut set, mut mq) = lock_set_and_port(self, port);
        if mq.in_set(self) {
            mq.port_set = None;
            if notify {
                mq.receivers.wake_all(WakeEvent::PortChanged);
            }
        }
        let index = set.position(port).ok_or(IpcError::InvalidRight)?;
        let member = set.members.remove(index);
        set.bump_epoch();
        drop(set);
        drop(mq);
        log::trace!("pset {}: port {} removed", self.id.value(), member.id().value());
        Ok(())
    }

    /// Destroy the set.
    ///
    /// Threads parked on the set are woken with `PortDied`. Every member is
    /// unlinked before the set lets go of it.
    pub fn destroy(&self) {
        let members = {
            let mut set = self.lock();
            if !set.active {
                return;
            }
            set.active = false;
            self.active.store(false, Ordering::Release);
            set.bump_epoch();
            set.waiters.wake_all(WakeEvent::PortDied);
            core::mem::take(&mut set.members)
        };

        for port in &members {
            let mut mq = port.lock();
            if mq.in_set(self) {
                mq.port_set = None;
                mq.receivers.wake_all(WakeEvent::PortChanged);
            }
        }
        log::debug!("pset {}: destroyed, {} members unlinked", self.id.value(), members.len());
    }
}

impl fmt::Debug for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSet")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Locking
// ============================================================================

/// Lock a set and one of its (possible) members.
///
/// The returned state is fresh; anything the caller read from the set before
/// calling this must be checked again.
fn lock_set_and_port<'a>(
    pset: &'a PortSet,
    port: &'a Port,
) -> (MutexGuard<'a, IpcPortSet>, MutexGuard<'a, IpcMqueue>) {
    let set = pset.lock();
    if let Some(mq) = port.try_lock() {
        return (set, mq);
    }
    drop(set);
    counter!(C_PSET_LOCK_RETRY);
    let mq = port.lock();
    let set = pset.lock();
    (set, mq)
}

// ============================================================================
// Receive
// ============================================================================

/// Receive from the first member with a queued message, or park on the set
pub(crate) fn ipc_pset_receive(
    thread: &IpcThread,
    pset: &Arc<PortSet>,
    max_size: usize,
    large: bool,
    deadline: Option<Duration>,
) -> IpcResult<(Box<IpcKmsg>, MachPortSeqno)> {
    let mut set = pset.lock();
    'scan: loop {
        if !set.active {
            return Err(IpcError::PortDied);
        }

        let epoch = set.epoch;
        let mut index = 0;
        while index < set.members.len() {
            let port = Arc::clone(&set.members[index]);
            index += 1;

            let mut mq = match port.try_lock() {
                Some(mq) => mq,
                None => {
                    counter!(C_PSET_LOCK_RETRY);
                    drop(set);
                    let mq = port.lock();
                    set = pset.lock();
                    if !set.active || set.epoch != epoch || !mq.in_set(pset) {
                        drop(mq);
                        continue 'scan;
                    }
                    mq
                }
            };
            if let Some(result) = mq.dequeue(max_size, large) {
                return result;
            }
        }

        let slot = WaitSlot::receiver(thread, max_size, large);
        set.waiters.push_back(Arc::clone(&slot));
        drop(set);
        counter!(C_IPC_RECEIVE_BLOCK);

        let outcome = thread_block(thread, &slot, deadline, |s| pset.lock().waiters.remove(s))?;
        if let Some(result) = receive_outcome(outcome) {
            return result;
        }
        set = pset.lock();
    }
}
