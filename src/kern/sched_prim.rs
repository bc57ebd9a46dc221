//! Scheduling Primitives - Park/Wake for IPC waits
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! The queue engine never blocks on a lock it does not own for long; when a
//! thread has to wait for a message (or for room in a queue) it queues a
//! [`WaitSlot`] on the port or port set and parks. Wakers complete the slot
//! while holding the lock of the object the slot is queued on, and the
//! waiting thread resolves a timeout or abort under that same lock, so a
//! handoff and a cancellation can never both take effect.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use spin::Mutex;

use crate::ipc::kmsg::{IpcKmsg, MachPortSeqno};
use crate::ipc::IpcError;

// ============================================================================
// Thread Identity
// ============================================================================

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn generate() -> Self {
        static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn value(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Parker - host scheduler interface
// ============================================================================

/// Park/wake primitives supplied by the host scheduler.
///
/// One parker belongs to one thread. `park` is only ever called from that
/// thread; `unpark` may be called from any thread, including before the
/// matching `park`, in which case the next `park` returns immediately.
pub trait Parker: Send + Sync {
    /// Block the calling thread until unparked or until `timeout` elapses.
    /// Spurious returns are allowed.
    fn park(&self, timeout: Option<Duration>);

    /// Wake the owning thread
    fn unpark(&self);

    /// Monotonic time since an arbitrary, per-parker epoch
    fn now(&self) -> Duration;
}

/// Parker for host OS threads
#[cfg(any(feature = "std", test))]
#[derive(Debug)]
pub struct StdParker {
    thread: std::thread::Thread,
    epoch: std::time::Instant,
}

#[cfg(any(feature = "std", test))]
impl StdParker {
    /// Parker for the calling thread
    pub fn current() -> Self {
        Self {
            thread: std::thread::current(),
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(any(feature = "std", test))]
impl Parker for StdParker {
    fn park(&self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => std::thread::park_timeout(timeout),
            None => std::thread::park(),
        }
    }

    fn unpark(&self) {
        self.thread.unpark();
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

// ============================================================================
// IPC Thread
// ============================================================================

/// Per-thread IPC state: the thread's parker, its abort flag, and the reply
/// left behind by a kernel object.
pub struct IpcThread {
    id: ThreadId,
    parker: Arc<dyn Parker>,
    aborted: AtomicBool,
    kernel_reply: Mutex<Option<Box<IpcKmsg>>>,
}

impl IpcThread {
    /// Wrap a host parker
    pub fn new(parker: Arc<dyn Parker>) -> Arc<Self> {
        Arc::new(Self {
            id: ThreadId::generate(),
            parker,
            aborted: AtomicBool::new(false),
            kernel_reply: Mutex::new(None),
        })
    }

    /// IPC state for the calling OS thread
    #[cfg(any(feature = "std", test))]
    pub fn current() -> Arc<Self> {
        Self::new(Arc::new(StdParker::current()))
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Monotonic time as seen by this thread's parker
    #[inline]
    pub fn now(&self) -> Duration {
        self.parker.now()
    }

    /// Abort the thread's current (or next) IPC wait with `Interrupted`
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.parker.unpark();
    }

    fn take_abort(&self) -> bool {
        self.aborted.swap(false, Ordering::AcqRel)
    }

    /// Record the reply produced by a kernel object for this thread
    pub(crate) fn set_kernel_reply(&self, reply: Box<IpcKmsg>) {
        let mut slot = self.kernel_reply.lock();
        if slot.replace(reply).is_some() {
            log::warn!("thread {}: unclaimed kernel reply replaced", self.id.value());
        }
    }

    /// Take the pending kernel reply, if any
    pub fn take_kernel_reply(&self) -> Option<Box<IpcKmsg>> {
        self.kernel_reply.lock().take()
    }

    /// Convert a relative timeout into a deadline on this thread's clock
    pub(crate) fn deadline(&self, timeout: Option<Duration>) -> Option<Duration> {
        timeout.map(|t| self.now().saturating_add(t))
    }
}

impl fmt::Debug for IpcThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcThread")
            .field("id", &self.id)
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Wait Slots
// ============================================================================

/// Wakeups that carry no message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeEvent {
    /// Conditions changed, re-check and retry
    Retry,
    /// The object the thread waited on was destroyed
    PortDied,
    /// The port moved into or out of a port set
    PortChanged,
}

/// What a waker handed to a parked thread
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// Direct handoff of a message and the sequence number it was given
    Message(Box<IpcKmsg>, MachPortSeqno),
    /// The next message needs a buffer of this many bytes
    TooLarge(usize),
    Event(WakeEvent),
}

#[derive(Debug)]
enum SlotState {
    Waiting,
    Done(WaitOutcome),
    Taken,
}

/// One parked thread, queued on a port or port set
pub(crate) struct WaitSlot {
    thread_id: ThreadId,
    parker: Arc<dyn Parker>,
    max_size: usize,
    large: bool,
    state: Mutex<SlotState>,
}

impl WaitSlot {
    /// Slot for a receiver with a buffer of `max_size` bytes
    pub(crate) fn receiver(thread: &IpcThread, max_size: usize, large: bool) -> Arc<Self> {
        Arc::new(Self {
            thread_id: thread.id,
            parker: Arc::clone(&thread.parker),
            max_size,
            large,
            state: Mutex::new(SlotState::Waiting),
        })
    }

    /// Slot for a sender waiting for queue room
    pub(crate) fn sender(thread: &IpcThread) -> Arc<Self> {
        Self::receiver(thread, 0, false)
    }

    #[inline]
    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Receiver asked for MACH_RCV_LARGE semantics
    #[inline]
    pub(crate) fn large(&self) -> bool {
        self.large
    }

    /// Hand an outcome to the parked thread.
    ///
    /// The caller must hold the lock of the object the slot was queued on and
    /// must already have removed the slot from that object's wait queue.
    pub(crate) fn complete(&self, outcome: WaitOutcome) {
        {
            let mut state = self.state.lock();
            debug_assert!(matches!(*state, SlotState::Waiting));
            *state = SlotState::Done(outcome);
        }
        self.parker.unpark();
    }

    fn take(&self) -> Option<WaitOutcome> {
        let mut state = self.state.lock();
        match core::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Done(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }
}

impl fmt::Debug for WaitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSlot")
            .field("thread_id", &self.thread_id)
            .field("max_size", &self.max_size)
            .field("large", &self.large)
            .finish()
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// FIFO of parked threads
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Arc<WaitSlot>>,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn push_back(&mut self, slot: Arc<WaitSlot>) {
        self.waiters.push_back(slot);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<WaitSlot>> {
        self.waiters.pop_front()
    }

    /// Remove a specific slot; false if a waker already took it
    pub(crate) fn remove(&mut self, slot: &Arc<WaitSlot>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, slot)) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Wake the longest waiter, returns false if nobody was waiting
    pub(crate) fn wake_one(&mut self, event: WakeEvent) -> bool {
        match self.waiters.pop_front() {
            Some(slot) => {
                slot.complete(WaitOutcome::Event(event));
                true
            }
            None => false,
        }
    }

    /// Wake every waiter, returns how many were woken
    pub(crate) fn wake_all(&mut self, event: WakeEvent) -> usize {
        let count = self.waiters.len();
        for slot in self.waiters.drain(..) {
            slot.complete(WaitOutcome::Event(event));
        }
        count
    }
}

// ============================================================================
// Blocking
// ============================================================================

/// Park `thread` until `slot` is completed, the deadline passes, or the
/// thread is aborted.
///
/// `cancel` must lock the object the slot is queued on and remove the slot
/// from its wait queue, returning false if a waker got there first. In that
/// case the waker's outcome wins over the timeout or abort.
pub(crate) fn thread_block<F>(
    thread: &IpcThread,
    slot: &Arc<WaitSlot>,
    deadline: Option<Duration>,
    mut cancel: F,
) -> Result<WaitOutcome, IpcError>
where
    F: FnMut(&Arc<WaitSlot>) -> bool,
{
    loop {
        if let Some(outcome) = slot.take() {
            return Ok(outcome);
        }

        let error = if thread.take_abort() {
            Some(IpcError::Interrupted)
        } else if deadline.is_some_and(|d| thread.now() >= d) {
            Some(IpcError::TimedOut)
        } else {
            None
        };

        if let Some(error) = error {
            if cancel(slot) {
                return Err(error);
            }
            // Completed under the object lock before cancel could take it
            continue;
        }

        let timeout = deadline.map(|d| d.saturating_sub(thread.now()));
        thread.parker.park(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_queue_remove() {
        let thread = IpcThread::current();
        let mut queue = WaitQueue::new();
        let a = WaitSlot::sender(&thread);
        let b = WaitSlot::sender(&thread);
        queue.push_back(Arc::clone(&a));
        queue.push_back(Arc::clone(&b));

        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert_eq!(queue.len(), 1);
        assert!(queue.wake_one(WakeEvent::Retry));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_block_times_out_when_not_woken() {
        let thread = IpcThread::current();
        let queue = Mutex::new(WaitQueue::new());
        let slot = WaitSlot::sender(&thread);
        queue.lock().push_back(Arc::clone(&slot));

        let deadline = thread.deadline(Some(Duration::from_millis(10)));
        let result = thread_block(&thread, &slot, deadline, |s| queue.lock().remove(s));
        assert!(matches!(result, Err(IpcError::TimedOut)));
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn test_completed_slot_beats_abort() {
        let thread = IpcThread::current();
        let queue = Mutex::new(WaitQueue::new());
        let slot = WaitSlot::sender(&thread);
        queue.lock().push_back(Arc::clone(&slot));

        queue.lock().wake_one(WakeEvent::PortDied);
        thread.abort();
        let result = thread_block(&thread, &slot, None, |s| queue.lock().remove(s));
        assert!(matches!(
            result,
            Ok(WaitOutcome::Event(WakeEvent::PortDied))
        ));
    }

    #[test]
    fn test_abort_interrupts_wait() {
        let thread = IpcThread::current();
        let queue = Mutex::new(WaitQueue::new());
        let slot = WaitSlot::sender(&thread);
        queue.lock().push_back(Arc::clone(&slot));

        thread.abort();
        let result = thread_block(&thread, &slot, None, |s| queue.lock().remove(s));
        assert!(matches!(result, Err(IpcError::Interrupted)));
    }
}
