//! IPC Space - Per-task IPC capability namespace
//!
//! Based on Mach4 ipc/ipc_space.h
//! Every task has an IPC space containing its port capabilities.
//! The space manages a table of IpcEntry records and the reverse hash for
//! send rights.
//!
//! ## Locking
//!
//! The space lock covers the table and the hash only. It is never held while
//! a port or port-set lock is taken: entries removed from the table are
//! released after the space lock is dropped, since releasing the last
//! reference to a receive right destroys the port.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::entry::{
    mach_port_valid, IpcEntry, IpcEntryTable, MachPortName, MachPortRight, MachPortType,
    MACH_PORT_UREFS_MAX,
};
use super::handle::Handle;
use super::ipc_hash::IpcLocalHash;
use super::ipc_object::{IpcObject, IpcObjectId};
use super::port::Port;
use super::pset::PortSet;
use super::{IpcError, IpcResult};
use crate::config::{self, IpcConfig};
use crate::counter;
use crate::kern::counters::C_IPC_TEARDOWN;

/// Space ID type - newtype for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u64);

impl SpaceId {
    fn generate() -> Self {
        static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Entry references
// ============================================================================

/// A held reference to an entry's right, returned by `lookup` and `alloc`.
///
/// Dropping it releases the reference. Callers that are about to block must
/// extract what they need (usually the port) and drop the reference first.
#[derive(Debug)]
pub struct EntryRef {
    name: MachPortName,
    handle: Handle,
}

impl EntryRef {
    #[inline]
    pub fn name(&self) -> MachPortName {
        self.name
    }

    #[inline]
    pub fn right(&self) -> MachPortRight {
        self.handle.right()
    }

    #[inline]
    pub fn object(&self) -> &IpcObject {
        self.handle.object()
    }

    pub fn port(&self) -> Option<&Arc<Port>> {
        self.handle.port()
    }

    pub fn port_set(&self) -> Option<&Arc<PortSet>> {
        self.handle.port_set()
    }

    /// Release the reference
    pub fn release(self) {}
}

// ============================================================================
// IPC Space - Per-task capability namespace
// ============================================================================

#[derive(Debug)]
struct SpaceInner {
    active: bool,
    table: IpcEntryTable,
    hash: IpcLocalHash,
}

/// IPC Space - contains all port capabilities for a task
#[derive(Debug)]
pub struct IpcSpace {
    id: SpaceId,
    config: IpcConfig,
    inner: Mutex<SpaceInner>,
}

impl IpcSpace {
    /// Create a new IPC space using the global configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(config::get())
    }

    /// Create a new IPC space with explicit table limits
    pub fn with_config(config: IpcConfig) -> Arc<Self> {
        let space = Arc::new(Self {
            id: SpaceId::generate(),
            config,
            inner: Mutex::new(SpaceInner {
                active: true,
                table: IpcEntryTable::new(config.table_initial_size, config.table_max_size),
                hash: IpcLocalHash::new(),
            }),
        });
        log::debug!("space {}: created", space.id.0);
        space
    }

    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Configuration the space was created with
    #[inline]
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Number of live entries
    pub fn entry_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Bind a new right to `object` under the lowest free name.
    ///
    /// On failure the new right is released again before returning.
    pub fn alloc(
        &self,
        object: IpcObject,
        right: MachPortRight,
    ) -> IpcResult<(MachPortName, EntryRef)> {
        let handle = Handle::new(object, right);
        let result = {
            let mut inner = self.inner.lock();
            if inner.active {
                let result = inner.table.alloc(IpcEntry::new(handle.clone()));
                if let (Ok(name), MachPortRight::Send) = (result, right) {
                    inner.hash.insert(handle.object().id(), name);
                }
                result
            } else {
                Err(IpcError::InvalidTask)
            }
        };
        // On error the only reference left is `handle`, released here
        let name = result?;
        log::trace!("space {}: {:?} right bound to {:#x}", self.id.0, right, name);
        Ok((name, EntryRef { name, handle }))
    }

    /// Bind a right to `object` under exactly `name`.
    ///
    /// If `name` already names this object with the same right, the existing
    /// entry is returned unchanged.
    pub fn alloc_name(
        &self,
        name: MachPortName,
        object: IpcObject,
        right: MachPortRight,
    ) -> IpcResult<EntryRef> {
        if !mach_port_valid(name) {
            return Err(IpcError::InvalidValue);
        }
        {
            let inner = self.inner.lock();
            if !inner.active {
                return Err(IpcError::InvalidTask);
            }
            if let Some(entry) = inner.table.lookup(name) {
                if entry.right() == right && entry.object().same_object(&object) {
                    return Ok(EntryRef {
                        name,
                        handle: entry.handle().clone(),
                    });
                }
                return Err(IpcError::NameExists);
            }
        }

        let handle = Handle::new(object, right);
        let result = {
            let mut inner = self.inner.lock();
            if inner.active {
                let result = inner.table.alloc_with_name(name, IpcEntry::new(handle.clone()));
                if result.is_ok() && right == MachPortRight::Send {
                    inner.hash.insert(handle.object().id(), name);
                }
                result
            } else {
                Err(IpcError::InvalidTask)
            }
        };
        result?;
        log::trace!("space {}: {:?} right bound to {:#x}", self.id.0, right, name);
        Ok(EntryRef { name, handle })
    }

    /// Look up an entry, holding a reference to its right
    pub fn lookup(&self, name: MachPortName) -> IpcResult<EntryRef> {
        let inner = self.inner.lock();
        if !inner.active {
            return Err(IpcError::InvalidName);
        }
        inner
            .table
            .lookup(name)
            .map(|entry| EntryRef {
                name,
                handle: entry.handle().clone(),
            })
            .ok_or(IpcError::InvalidName)
    }

    /// Unbind `name` and drop the table's reference to its right
    pub fn close(&self, name: MachPortName) -> IpcResult<()> {
        let entry = {
            let mut inner = self.inner.lock();
            Self::remove_locked(&mut inner, name)?
        };
        log::trace!("space {}: closed {:#x}", self.id.0, name);
        drop(entry);
        Ok(())
    }

    fn remove_locked(inner: &mut SpaceInner, name: MachPortName) -> IpcResult<IpcEntry> {
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        let entry = inner.table.lookup(name).ok_or(IpcError::InvalidName)?;
        // Unhook the reverse pointer before the slot goes away
        if entry.right() == MachPortRight::Send {
            let id = entry.object().id();
            inner.hash.remove(id, name);
        }
        inner.table.dealloc(name).ok_or(IpcError::InvalidName)
    }

    // ========================================================================
    // Send rights
    // ========================================================================

    /// Give the space a send right to `port`.
    ///
    /// A space holds at most one send-right name per port; inserting another
    /// send right adds a user reference to the existing name.
    pub fn insert_send_right(&self, port: &Arc<Port>) -> IpcResult<MachPortName> {
        let handle = Handle::new(IpcObject::Port(Arc::clone(port)), MachPortRight::Send);
        let result = {
            let mut inner = self.inner.lock();
            Self::insert_send_locked(&mut inner, port.id(), &handle)
        };
        let name = result?;
        log::trace!("space {}: send right to port {} at {:#x}", self.id.0, port.id().value(), name);
        Ok(name)
    }

    fn insert_send_locked(
        inner: &mut SpaceInner,
        id: IpcObjectId,
        handle: &Handle,
    ) -> IpcResult<MachPortName> {
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        if let Some(name) = inner.hash.lookup(id) {
            if let Some(entry) = inner.table.lookup_mut(name) {
                let urefs = entry.urefs() + 1;
                entry.set_urefs(urefs)?;
                return Ok(name);
            }
            inner.hash.remove(id, name);
        }
        let name = inner.table.alloc(IpcEntry::new(handle.clone()))?;
        inner.hash.insert(id, name);
        Ok(name)
    }

    /// Give the space a new send-once right to `port`
    pub fn insert_send_once_right(&self, port: &Arc<Port>) -> IpcResult<MachPortName> {
        let (name, _entry) =
            self.alloc(IpcObject::Port(Arc::clone(port)), MachPortRight::SendOnce)?;
        Ok(name)
    }

    /// Name under which this space holds a send right to `object`
    pub fn find_send_name(&self, object: IpcObjectId) -> Option<MachPortName> {
        self.inner.lock().hash.lookup(object)
    }

    /// Name under which this space holds the receive right to `port`
    pub fn find_receive_name(&self, port: &Arc<Port>) -> Option<MachPortName> {
        let inner = self.inner.lock();
        let name = inner
            .table
            .iter_active()
            .find(|(_, entry)| {
                entry.right() == MachPortRight::Receive
                    && entry.object().as_port().is_some_and(|p| Arc::ptr_eq(p, port))
            })
            .map(|(name, _)| name);
        name
    }

    // ========================================================================
    // User references
    // ========================================================================

    /// User references on `name`
    pub fn get_refs(&self, name: MachPortName) -> IpcResult<u32> {
        let inner = self.inner.lock();
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        inner
            .table
            .lookup(name)
            .map(IpcEntry::urefs)
            .ok_or(IpcError::InvalidName)
    }

    /// Type bits reported for `name`
    pub fn port_type(&self, name: MachPortName) -> IpcResult<MachPortType> {
        let inner = self.inner.lock();
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        inner
            .table
            .lookup(name)
            .map(IpcEntry::port_type)
            .ok_or(IpcError::InvalidName)
    }

    /// Add `delta` user references to `name`; reaching zero closes it.
    ///
    /// Receive, port-set and send-once rights carry exactly one reference,
    /// so only `-1` (close) or `0` is accepted for them.
    pub fn mod_refs(&self, name: MachPortName, delta: i32) -> IpcResult<()> {
        let removed = {
            let mut inner = self.inner.lock();
            if !inner.active {
                return Err(IpcError::InvalidTask);
            }
            let entry = inner.table.lookup_mut(name).ok_or(IpcError::InvalidName)?;
            let urefs = i64::from(entry.urefs()) + i64::from(delta);
            if urefs < 0 || (!entry.right().has_urefs() && urefs > 1) {
                return Err(IpcError::InvalidValue);
            }
            if urefs > i64::from(MACH_PORT_UREFS_MAX) {
                return Err(IpcError::InvalidValue);
            }
            if urefs == 0 {
                Some(Self::remove_locked(&mut inner, name)?)
            } else {
                entry.set_urefs(urefs as u32)?;
                None
            }
        };
        drop(removed);
        Ok(())
    }

    // ========================================================================
    // Moving entries out and back
    // ========================================================================

    /// Remove the entry `name` if it holds `right`, keeping it alive for the
    /// caller
    pub(crate) fn take_entry(
        &self,
        name: MachPortName,
        right: MachPortRight,
    ) -> IpcResult<IpcEntry> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(IpcError::InvalidName);
        }
        match inner.table.lookup(name) {
            Some(entry) if entry.right() == right => {}
            _ => return Err(IpcError::InvalidName),
        }
        Self::remove_locked(&mut inner, name)
    }

    /// Put back an entry removed by `take_entry`, under `name` if it is still
    /// free, else under a fresh name.
    pub(crate) fn restore_entry(
        &self,
        name: MachPortName,
        entry: IpcEntry,
    ) -> IpcResult<MachPortName> {
        let mut inner = self.inner.lock();
        if !inner.active {
            drop(inner);
            drop(entry);
            return Err(IpcError::InvalidTask);
        }
        let right = entry.right();
        let id = entry.object().id();
        let name = if inner.table.lookup(name).is_none() {
            inner.table.alloc_with_name(name, entry).map(|()| name)
        } else {
            inner.table.alloc(entry)
        };
        // A failed insert drops the entry under the lock. Only send and
        // send-once rights come back here and their release is lock-free.
        let name = name?;
        if right == MachPortRight::Send {
            inner.hash.insert(id, name);
        }
        Ok(name)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release every entry, port sets first.
    ///
    /// The space stays active and usable afterwards. Safe to call on an
    /// empty space and more than once.
    pub fn teardown(&self) {
        self.drain(false);
    }

    /// Deactivate the space and release every entry
    pub fn destroy(&self) {
        self.drain(true);
    }

    /// Mark the space inactive without touching its entries
    pub fn deactivate(&self) {
        self.inner.lock().active = false;
    }

    fn drain(&self, deactivate: bool) {
        let entries = {
            let mut inner = self.inner.lock();
            if deactivate {
                inner.active = false;
            }
            inner.hash.clear();
            inner.table.drain()
        };
        if entries.is_empty() {
            return;
        }
        counter!(C_IPC_TEARDOWN);
        log::debug!("space {}: tearing down {} entries", self.id.0, entries.len());

        // Sets go first so no port is left pointing at a set being freed
        let (sets, rest): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|(_, entry)| entry.right() == MachPortRight::PortSet);
        for (name, entry) in sets.into_iter().chain(rest) {
            log::trace!("space {}: teardown {:#x} ({:?})", self.id.0, name, entry.right());
            drop(entry);
        }
    }
}

impl Drop for IpcSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_receive(space: &IpcSpace) -> (MachPortName, Arc<Port>) {
        let port = Port::new();
        let (name, _entry) = space
            .alloc(IpcObject::Port(Arc::clone(&port)), MachPortRight::Receive)
            .unwrap();
        (name, port)
    }

    #[test]
    fn test_alloc_lookup_close() {
        let space = IpcSpace::new();
        let (name, port) = new_receive(&space);

        let entry = space.lookup(name).unwrap();
        assert_eq!(entry.right(), MachPortRight::Receive);
        assert!(Arc::ptr_eq(entry.port().unwrap(), &port));
        entry.release();

        space.close(name).unwrap();
        assert!(!port.is_active());
        assert_eq!(space.lookup(name).err(), Some(IpcError::InvalidName));
    }

    #[test]
    fn test_lookup_reference_keeps_port_alive() {
        let space = IpcSpace::new();
        let (name, port) = new_receive(&space);

        let held = space.lookup(name).unwrap();
        space.close(name).unwrap();
        assert!(port.is_active());
        held.release();
        assert!(!port.is_active());
    }

    #[test]
    fn test_alloc_name_idempotent_and_conflict() {
        let space = IpcSpace::new();
        let port = Port::new();
        let object = IpcObject::Port(Arc::clone(&port));

        let a = space.alloc_name(42, object.clone(), MachPortRight::Receive).unwrap();
        let b = space.alloc_name(42, object, MachPortRight::Receive).unwrap();
        assert_eq!(a.name(), 42);
        assert!(Arc::ptr_eq(a.port().unwrap(), b.port().unwrap()));
        assert_eq!(space.entry_count(), 1);

        let other = IpcObject::Port(Port::new());
        assert_eq!(
            space.alloc_name(42, other, MachPortRight::Receive).err(),
            Some(IpcError::NameExists)
        );
    }

    #[test]
    fn test_send_rights_share_a_name() {
        let space = IpcSpace::new();
        let port = Port::new();

        let a = space.insert_send_right(&port).unwrap();
        let b = space.insert_send_right(&port).unwrap();
        assert_eq!(a, b);
        assert_eq!(space.get_refs(a), Ok(2));
        assert_eq!(port.status().send_rights, 1);

        space.mod_refs(a, -1).unwrap();
        assert_eq!(space.get_refs(a), Ok(1));
        space.mod_refs(a, -1).unwrap();
        assert_eq!(space.lookup(a).err(), Some(IpcError::InvalidName));
        assert_eq!(port.status().send_rights, 0);
        assert!(space.find_send_name(port.id()).is_none());
    }

    #[test]
    fn test_mod_refs_on_receive() {
        let space = IpcSpace::new();
        let (name, port) = new_receive(&space);
        assert_eq!(space.mod_refs(name, 1), Err(IpcError::InvalidValue));
        assert_eq!(space.mod_refs(name, -2), Err(IpcError::InvalidValue));
        space.mod_refs(name, -1).unwrap();
        assert!(!port.is_active());
    }

    #[test]
    fn test_dead_name_type() {
        let space = IpcSpace::new();
        let (recv, port) = new_receive(&space);
        let send = space.insert_send_right(&port).unwrap();
        assert_eq!(space.port_type(send), Ok(MachPortType::SEND));

        space.close(recv).unwrap();
        assert_eq!(space.port_type(send), Ok(MachPortType::DEAD_NAME));
    }

    #[test]
    fn test_teardown_and_destroy() {
        let space = IpcSpace::new();
        let (_, port) = new_receive(&space);
        let pset = PortSet::new();
        space
            .alloc(IpcObject::PortSet(Arc::clone(&pset)), MachPortRight::PortSet)
            .unwrap();
        pset.add_member(&port).unwrap();

        space.teardown();
        assert_eq!(space.entry_count(), 0);
        assert!(!port.is_active());
        assert!(!pset.is_active());
        assert!(space.is_active());
        space.teardown();

        space.destroy();
        assert!(!space.is_active());
        assert_eq!(
            space.alloc(IpcObject::Port(Port::new()), MachPortRight::Receive).err(),
            Some(IpcError::InvalidTask)
        );
        assert_eq!(space.lookup(1).err(), Some(IpcError::InvalidName));
    }

    #[test]
    fn test_take_and_restore() {
        let space = IpcSpace::new();
        let port = Port::new();
        let name = space.insert_send_once_right(&port).unwrap();

        assert_eq!(
            space.take_entry(name, MachPortRight::Send).err(),
            Some(IpcError::InvalidName)
        );
        let entry = space.take_entry(name, MachPortRight::SendOnce).unwrap();
        assert!(space.lookup(name).is_err());
        assert_eq!(space.restore_entry(name, entry), Ok(name));
        assert_eq!(space.lookup(name).unwrap().right(), MachPortRight::SendOnce);
    }
}
