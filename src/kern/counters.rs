//! IPC Event Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counters track the paths messages take through the queue engine:
//! direct handoffs versus queueing, blocked senders and receivers, and the
//! various ways a message can be discarded.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// IPC Counters
// ============================================================================

/// Messages accepted by `send` (queued, handed off, or dispatched)
pub static C_IPC_SEND: MachCounter = MachCounter::new("ipc_send");
/// Messages returned by `receive`
pub static C_IPC_RECEIVE: MachCounter = MachCounter::new("ipc_receive");
/// Messages handed straight to a parked receiver
pub static C_IPC_HANDOFF: MachCounter = MachCounter::new("ipc_handoff");
/// Messages appended to a port queue
pub static C_IPC_ENQUEUE: MachCounter = MachCounter::new("ipc_enqueue");
/// Senders that parked on a full queue
pub static C_IPC_SEND_BLOCK: MachCounter = MachCounter::new("ipc_mqueue_send_block");
/// Receivers that parked on an empty port or set
pub static C_IPC_RECEIVE_BLOCK: MachCounter = MachCounter::new("ipc_mqueue_receive_block");
/// Messages discarded because the destination was dead
pub static C_IPC_DEAD_DISCARD: MachCounter = MachCounter::new("ipc_dead_discard");
/// Messages discarded because they carried the circular bit
pub static C_IPC_CIRCULAR_DISCARD: MachCounter = MachCounter::new("ipc_circular_discard");
/// Receives that reported a too-small buffer
pub static C_IPC_TOO_LARGE: MachCounter = MachCounter::new("ipc_too_large");
/// Messages serviced by a kernel object
pub static C_IPC_KOBJECT: MachCounter = MachCounter::new("ipc_kobject_server");
/// Space teardowns run by the lifecycle hooks
pub static C_IPC_TEARDOWN: MachCounter = MachCounter::new("ipc_space_teardown");
/// Times the port-set scan fell back from try-lock to lock-and-revalidate
pub static C_PSET_LOCK_RETRY: MachCounter = MachCounter::new("ipc_pset_lock_retry");

/// Whether counters are enabled
pub const MACH_COUNTERS_ENABLED: bool = true;

/// Increment counter (only if counters enabled)
#[macro_export]
macro_rules! counter {
    ($counter:expr) => {
        if $crate::kern::counters::MACH_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
}

/// All IPC counters, for iteration
pub fn all() -> [&'static MachCounter; 12] {
    [
        &C_IPC_SEND,
        &C_IPC_RECEIVE,
        &C_IPC_HANDOFF,
        &C_IPC_ENQUEUE,
        &C_IPC_SEND_BLOCK,
        &C_IPC_RECEIVE_BLOCK,
        &C_IPC_DEAD_DISCARD,
        &C_IPC_CIRCULAR_DISCARD,
        &C_IPC_TOO_LARGE,
        &C_IPC_KOBJECT,
        &C_IPC_TEARDOWN,
        &C_PSET_LOCK_RETRY,
    ]
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of the IPC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub sends: u64,
    pub receives: u64,
    pub handoffs: u64,
    pub enqueues: u64,
    pub send_blocks: u64,
    pub receive_blocks: u64,
    pub dead_discards: u64,
    pub circular_discards: u64,
    pub too_large: u64,
    pub kobject_calls: u64,
    pub teardowns: u64,
    pub pset_lock_retries: u64,
}

/// Take a snapshot of the IPC counters
pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        sends: C_IPC_SEND.get(),
        receives: C_IPC_RECEIVE.get(),
        handoffs: C_IPC_HANDOFF.get(),
        enqueues: C_IPC_ENQUEUE.get(),
        send_blocks: C_IPC_SEND_BLOCK.get(),
        receive_blocks: C_IPC_RECEIVE_BLOCK.get(),
        dead_discards: C_IPC_DEAD_DISCARD.get(),
        circular_discards: C_IPC_CIRCULAR_DISCARD.get(),
        too_large: C_IPC_TOO_LARGE.get(),
        kobject_calls: C_IPC_KOBJECT.get(),
        teardowns: C_IPC_TEARDOWN.get(),
        pset_lock_retries: C_PSET_LOCK_RETRY.get(),
    }
}

/// Reset every IPC counter to zero
pub fn reset_all() {
    for counter in all() {
        counter.reset();
    }
}
