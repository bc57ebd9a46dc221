//! Task Lifecycle
//!
//! Based on Mach4 kern/task.h/c by Avadis Tevanian, Jr.
//!
//! A task here is the owner of an IPC space. Subsystems register lifecycle
//! hooks that run when the task exits or execs; the IPC hook drains the
//! space so no right outlives the task that held it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::ipc::{IpcError, IpcResult, IpcSpace};

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn generate() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process lifecycle notification
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// The task is exiting; runs once
    fn on_exit(&self, task: &Task);

    /// The task is replacing its image
    fn on_exec(&self, task: &Task);
}

/// Releases every IPC entry of the task's space.
///
/// Port sets are closed before ports so no member keeps a link to a dead
/// set. On exit the space is left inactive; on exec it stays usable.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpcTeardownHook;

impl LifecycleHook for IpcTeardownHook {
    fn name(&self) -> &'static str {
        "ipc_space_teardown"
    }

    fn on_exit(&self, task: &Task) {
        task.space().destroy();
    }

    fn on_exec(&self, task: &Task) {
        task.space().teardown();
    }
}

/// Task
pub struct Task {
    id: TaskId,
    space: Arc<IpcSpace>,
    hooks: Mutex<Vec<Arc<dyn LifecycleHook>>>,
    exited: AtomicBool,
}

impl Task {
    /// New task with a fresh space and the IPC teardown hook registered
    pub fn new() -> Arc<Self> {
        Self::with_space(IpcSpace::new())
    }

    pub fn with_space(space: Arc<IpcSpace>) -> Arc<Self> {
        let hooks: Vec<Arc<dyn LifecycleHook>> = alloc::vec![Arc::new(IpcTeardownHook)];
        let task = Arc::new(Self {
            id: TaskId::generate(),
            space,
            hooks: Mutex::new(hooks),
            exited: AtomicBool::new(false),
        });
        log::debug!("task {}: created with space {}", task.id.0, task.space.id().0);
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn space(&self) -> &Arc<IpcSpace> {
        &self.space
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Register a hook; hooks run in registration order
    pub fn register_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.lock().push(hook);
    }

    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>> {
        self.hooks.lock().clone()
    }

    /// Terminate the task.
    ///
    /// Runs the exit hooks once, then deactivates the space so later
    /// allocations fail with `InvalidTask`.
    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        for hook in self.hooks() {
            log::trace!("task {}: exit hook {}", self.id.0, hook.name());
            hook.on_exit(self);
        }
        self.space.deactivate();
        log::debug!("task {}: exited", self.id.0);
    }

    /// Replace the task's image. The space stays active but empty.
    pub fn exec(&self) -> IpcResult<()> {
        if self.has_exited() {
            return Err(IpcError::InvalidTask);
        }
        for hook in self.hooks() {
            log::trace!("task {}: exec hook {}", self.id.0, hook.name());
            hook.on_exec(self);
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("space", &self.space.id())
            .field("exited", &self.has_exited())
            .finish()
    }
}
