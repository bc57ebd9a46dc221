//! Entry handles
//!
//! Every entry in a space is backed by one [`Handle`]: a right to an IPC
//! object with an explicit reference count. Cloning a handle holds a
//! reference, dropping it releases one. When the last reference goes, the
//! right is given up: a receive right destroys its port, a port-set right
//! destroys the set, and send or send-once rights drop the port's
//! send-right count.
//!
//! `lookup` hands out held references, so an object named by an entry that
//! is closed while another thread is still using it stays alive until that
//! thread lets go.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use super::entry::MachPortRight;
use super::ipc_object::IpcObject;
use super::port::Port;
use super::pset::PortSet;

struct HandleInner {
    refs: AtomicU32,
    right: MachPortRight,
    object: IpcObject,
}

/// Reference-counted right to an IPC object
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Create a handle holding one reference.
    ///
    /// Send and send-once rights are counted on the port from here until the
    /// last reference is released.
    pub(crate) fn new(object: IpcObject, right: MachPortRight) -> Self {
        if let IpcObject::Port(port) = &object {
            match right {
                MachPortRight::Send => port.add_send_right(),
                MachPortRight::SendOnce => port.add_send_once_right(),
                _ => {}
            }
        }
        Self {
            inner: Arc::new(HandleInner {
                refs: AtomicU32::new(1),
                right,
                object,
            }),
        }
    }

    #[inline]
    pub fn right(&self) -> MachPortRight {
        self.inner.right
    }

    #[inline]
    pub fn object(&self) -> &IpcObject {
        &self.inner.object
    }

    pub fn port(&self) -> Option<&Arc<Port>> {
        self.inner.object.as_port()
    }

    pub fn port_set(&self) -> Option<&Arc<PortSet>> {
        self.inner.object.as_port_set()
    }

    /// Current number of references
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Both handles refer to the same backing slot
    pub fn ptr_eq(a: &Handle, b: &Handle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn last_release(&self) {
        let inner = &self.inner;
        match (&inner.object, inner.right) {
            (IpcObject::Port(port), MachPortRight::Receive) => port.destroy(),
            (IpcObject::Port(port), MachPortRight::Send) => port.release_send_right(),
            (IpcObject::Port(port), MachPortRight::SendOnce) => port.release_send_once_right(),
            (IpcObject::PortSet(pset), MachPortRight::PortSet) => pset.destroy(),
            (object, right) => {
                log::warn!("handle: {:?} right on {} released", right, object.type_name());
            }
        }
    }
}

impl Clone for Handle {
    /// Hold another reference
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.last_release();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("right", &self.inner.right)
            .field("object", &self.inner.object.id())
            .field("refs", &self.ref_count())
            .finish()
    }
}
