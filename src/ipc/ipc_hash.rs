//! IPC Hash Table - object -> name lookup
//!
//! Based on Mach4 ipc/ipc_hash.h/c by Rich Draves (1989)
//!
//! Reverse lookup from a port to the name of the send right a space already
//! holds for it, so a space never holds two send-right names for one port.
//! Each space owns one table, protected by the space lock.

use alloc::collections::BTreeMap;

use super::entry::MachPortName;
use super::ipc_object::IpcObjectId;

/// Per-space reverse hash for send rights
#[derive(Debug, Default)]
pub struct IpcLocalHash {
    map: BTreeMap<IpcObjectId, MachPortName>,
}

impl IpcLocalHash {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Name of the send right for `object`, if any
    pub fn lookup(&self, object: IpcObjectId) -> Option<MachPortName> {
        self.map.get(&object).copied()
    }

    pub fn insert(&mut self, object: IpcObjectId, name: MachPortName) {
        if let Some(old) = self.map.insert(object, name) {
            log::warn!(
                "ipc_hash: object {} rebound from {:#x} to {:#x}",
                object.value(),
                old,
                name
            );
        }
    }

    /// Remove the linkage if it still points at `name`
    pub fn remove(&mut self, object: IpcObjectId, name: MachPortName) -> bool {
        match self.map.get(&object) {
            Some(&bound) if bound == name => {
                self.map.remove(&object);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_only_matching_name() {
        let mut hash = IpcLocalHash::new();
        let id = IpcObjectId::generate();
        hash.insert(id, 7);

        assert!(!hash.remove(id, 8));
        assert_eq!(hash.lookup(id), Some(7));
        assert!(hash.remove(id, 7));
        assert!(hash.lookup(id).is_none());
        assert!(hash.is_empty());
    }
}
