//! IPC Entry - Port name to capability translation
//!
//! Based on Mach4 ipc/ipc_entry.h
//! Each ipc_entry records a capability (port right) in a task's IPC space.
//! Entries are stored in a table indexed by port name. Names are handed out
//! like file descriptors: the lowest free slot wins, slot 0 is never used.

use alloc::vec::Vec;

use super::handle::Handle;
use super::ipc_object::IpcObject;
use super::IpcError;

/// Port name type - the user-visible handle to a port capability
pub type MachPortName = u32;

/// Entry bits field type
pub type IpcEntryBits = u32;

/// The null name, never bound
pub const MACH_PORT_NULL: MachPortName = 0;

/// The dead name, never bound
pub const MACH_PORT_DEAD: MachPortName = !0;

/// A name that can be bound to an entry
#[inline]
pub const fn mach_port_valid(name: MachPortName) -> bool {
    name != MACH_PORT_NULL && name != MACH_PORT_DEAD
}

// ============================================================================
// Entry Bits Constants (from Mach4 ipc_entry.h)
// ============================================================================

/// Mask for user references (16 bits)
pub const IE_BITS_UREFS_MASK: u32 = 0x0000_FFFF;

/// Maximum user references on one entry
pub const MACH_PORT_UREFS_MAX: u32 = IE_BITS_UREFS_MASK;

/// Extract user references from bits
#[inline]
pub const fn ie_bits_urefs(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_UREFS_MASK
}

/// Mask for capability type (5 bits)
pub const IE_BITS_TYPE_MASK: u32 = 0x001F_0000;

/// Extract type from bits
#[inline]
pub const fn ie_bits_type(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_TYPE_MASK
}

bitflags::bitflags! {
    /// Port right types (shifted into IE_BITS_TYPE position)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MachPortType: u32 {
        const SEND = 0x0001_0000;
        const RECEIVE = 0x0002_0000;
        const SEND_ONCE = 0x0004_0000;
        const PORT_SET = 0x0008_0000;
        /// Port was destroyed
        const DEAD_NAME = 0x0010_0000;
    }
}

// ============================================================================
// Port Rights
// ============================================================================

/// Port right kinds (mach_port_right_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MachPortRight {
    Send = 0,
    Receive = 1,
    SendOnce = 2,
    PortSet = 3,
    DeadName = 4,
}

impl MachPortRight {
    /// Entry type bits for this right
    pub const fn port_type(self) -> MachPortType {
        match self {
            MachPortRight::Send => MachPortType::SEND,
            MachPortRight::Receive => MachPortType::RECEIVE,
            MachPortRight::SendOnce => MachPortType::SEND_ONCE,
            MachPortRight::PortSet => MachPortType::PORT_SET,
            MachPortRight::DeadName => MachPortType::DEAD_NAME,
        }
    }

    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::Send),
            1 => Some(Self::Receive),
            2 => Some(Self::SendOnce),
            3 => Some(Self::PortSet),
            4 => Some(Self::DeadName),
            _ => None,
        }
    }

    /// Rights whose entries count user references beyond one
    pub fn has_urefs(self) -> bool {
        matches!(self, MachPortRight::Send | MachPortRight::DeadName)
    }
}

// ============================================================================
// IPC Entry - A single capability record
// ============================================================================

/// One capability in a space
#[derive(Debug)]
pub struct IpcEntry {
    bits: IpcEntryBits,
    handle: Handle,
}

impl IpcEntry {
    /// New entry with one user reference
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            bits: handle.right().port_type().bits() | 1,
            handle,
        }
    }

    #[inline]
    pub fn bits(&self) -> IpcEntryBits {
        self.bits
    }

    #[inline]
    pub fn right(&self) -> MachPortRight {
        self.handle.right()
    }

    /// Type bits as reported to the user; a right to a destroyed port reads
    /// as a dead name
    pub fn port_type(&self) -> MachPortType {
        match self.handle.object() {
            IpcObject::Port(port) if !port.is_active() => MachPortType::DEAD_NAME,
            _ => MachPortType::from_bits_truncate(ie_bits_type(self.bits)),
        }
    }

    #[inline]
    pub fn urefs(&self) -> u32 {
        ie_bits_urefs(self.bits)
    }

    pub(crate) fn set_urefs(&mut self, urefs: u32) -> Result<(), IpcError> {
        if urefs > MACH_PORT_UREFS_MAX {
            return Err(IpcError::InvalidValue);
        }
        self.bits = (self.bits & !IE_BITS_UREFS_MASK) | urefs;
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[inline]
    pub fn object(&self) -> &IpcObject {
        self.handle.object()
    }
}

// ============================================================================
// IPC Entry Table
// ============================================================================

/// Name-indexed entry table of one space
#[derive(Debug)]
pub struct IpcEntryTable {
    slots: Vec<Option<IpcEntry>>,
    /// No slot below this index is free
    first_free: usize,
    count: usize,
    max_size: usize,
}

impl IpcEntryTable {
    /// Table with `initial_size` slots that never grows past `max_size`
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        let initial_size = initial_size.clamp(2, max_size.max(2));
        let mut slots = Vec::with_capacity(initial_size);
        slots.resize_with(initial_size, || None);
        Self {
            slots,
            first_free: 1,
            count: 0,
            max_size,
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn lookup(&self, name: MachPortName) -> Option<&IpcEntry> {
        if !mach_port_valid(name) {
            return None;
        }
        self.slots.get(name as usize).and_then(Option::as_ref)
    }

    pub fn lookup_mut(&mut self, name: MachPortName) -> Option<&mut IpcEntry> {
        if !mach_port_valid(name) {
            return None;
        }
        self.slots.get_mut(name as usize).and_then(Option::as_mut)
    }

    /// Bind `entry` to the lowest free name
    pub fn alloc(&mut self, entry: IpcEntry) -> Result<MachPortName, IpcError> {
        let index = match self.slots[self.first_free..].iter().position(Option::is_none) {
            Some(offset) => self.first_free + offset,
            None => {
                let index = self.slots.len();
                self.grow(index + 1)?;
                index
            }
        };
        self.slots[index] = Some(entry);
        self.count += 1;
        self.first_free = index + 1;
        Ok(index as MachPortName)
    }

    /// Bind `entry` to exactly `name`, which must be free
    pub fn alloc_with_name(&mut self, name: MachPortName, entry: IpcEntry) -> Result<(), IpcError> {
        if !mach_port_valid(name) {
            return Err(IpcError::InvalidValue);
        }
        let index = name as usize;
        if index >= self.slots.len() {
            self.grow(index + 1)?;
        }
        if self.slots[index].is_some() {
            return Err(IpcError::NameExists);
        }
        self.slots[index] = Some(entry);
        self.count += 1;
        if index == self.first_free {
            self.first_free += 1;
        }
        Ok(())
    }

    /// Unbind `name`, returning its entry
    pub fn dealloc(&mut self, name: MachPortName) -> Option<IpcEntry> {
        if !mach_port_valid(name) {
            return None;
        }
        let index = name as usize;
        let entry = self.slots.get_mut(index)?.take()?;
        self.count -= 1;
        if index < self.first_free {
            self.first_free = index;
        }
        Some(entry)
    }

    /// Unbind every entry
    pub fn drain(&mut self) -> Vec<(MachPortName, IpcEntry)> {
        let entries: Vec<_> = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.take().map(|e| (index as MachPortName, e)))
            .collect();
        self.count = 0;
        self.first_free = 1;
        entries
    }

    /// Iterate live entries in name order
    pub fn iter_active(&self) -> impl Iterator<Item = (MachPortName, &IpcEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|e| (index as MachPortName, e)))
    }

    /// Make room for at least `needed` slots, doubling up to the maximum
    fn grow(&mut self, needed: usize) -> Result<(), IpcError> {
        if needed > self.max_size {
            log::debug!("entry table full: {} slots, max {}", needed, self.max_size);
            return Err(IpcError::ResourceShortage);
        }
        let new_size = needed
            .max(self.slots.len().saturating_mul(2))
            .min(self.max_size);
        self.slots
            .try_reserve(new_size - self.slots.len())
            .map_err(|_| IpcError::ResourceShortage)?;
        self.slots.resize_with(new_size, || None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::Port;

    fn receive_entry() -> IpcEntry {
        IpcEntry::new(Handle::new(IpcObject::Port(Port::new()), MachPortRight::Receive))
    }

    #[test]
    fn test_entry_bits() {
        let entry = receive_entry();
        assert_eq!(entry.urefs(), 1);
        assert_eq!(entry.port_type(), MachPortType::RECEIVE);
        assert_eq!(ie_bits_type(entry.bits()), MachPortType::RECEIVE.bits());
    }

    #[test]
    fn test_lowest_free_name() {
        let mut table = IpcEntryTable::new(4, 64);
        assert_eq!(table.alloc(receive_entry()), Ok(1));
        assert_eq!(table.alloc(receive_entry()), Ok(2));
        assert_eq!(table.alloc(receive_entry()), Ok(3));
        assert!(table.dealloc(2).is_some());
        assert_eq!(table.alloc(receive_entry()), Ok(2));
        assert_eq!(table.alloc(receive_entry()), Ok(4));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_alloc_with_name_grows() {
        let mut table = IpcEntryTable::new(4, 64);
        table.alloc_with_name(42, receive_entry()).unwrap();
        assert!(table.size() > 42);
        assert!(table.lookup(42).is_some());
        assert_eq!(
            table.alloc_with_name(42, receive_entry()).err(),
            Some(IpcError::NameExists)
        );
        assert_eq!(
            table.alloc_with_name(MACH_PORT_NULL, receive_entry()).err(),
            Some(IpcError::InvalidValue)
        );
    }

    #[test]
    fn test_table_full() {
        let mut table = IpcEntryTable::new(2, 3);
        assert_eq!(table.alloc(receive_entry()), Ok(1));
        assert_eq!(table.alloc(receive_entry()), Ok(2));
        assert_eq!(table.alloc(receive_entry()), Err(IpcError::ResourceShortage));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_drain() {
        let mut table = IpcEntryTable::new(4, 64);
        table.alloc(receive_entry()).unwrap();
        table.alloc_with_name(9, receive_entry()).unwrap();
        let drained = table.drain();
        assert_eq!(drained.iter().map(|(n, _)| *n).collect::<Vec<_>>(), [1, 9]);
        assert!(table.is_empty());
        assert!(table.lookup(9).is_none());
    }
}
