//! Port Operations - User-callable port manipulation
//!
//! Based on Mach4 ipc/mach_port.c
//!
//! This module provides the user-level operations for port manipulation:
//! - mach_port_allocate / mach_port_allocate_name: create ports and sets
//! - mach_port_deallocate / mach_port_destroy: give up rights
//! - mach_port_mod_refs / mach_port_get_refs: user references
//! - mach_port_insert_member / extract_member / move_member: set membership
//! - mach_port_set_qlimit / set_seqno / get_status: port attributes

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::entry::{MachPortName, MachPortRight, MachPortType, MACH_PORT_NULL};
use super::ipc_object::IpcObject;
use super::kmsg::MachPortSeqno;
use super::port::{Port, PortStatus};
use super::pset::PortSet;
use super::space::IpcSpace;
use super::{IpcError, IpcResult};
use crate::kern::ipc_kobject::KobjectHandler;

fn new_object(space: &IpcSpace, right: MachPortRight) -> IpcResult<IpcObject> {
    match right {
        MachPortRight::Receive => Ok(IpcObject::Port(Port::with_qlimit(
            space.config().default_qlimit,
        ))),
        MachPortRight::PortSet => Ok(IpcObject::PortSet(PortSet::with_max_members(
            space.config().pset_max_members,
        ))),
        _ => Err(IpcError::InvalidValue),
    }
}

/// The port behind a receive right
fn receive_port(space: &IpcSpace, name: MachPortName) -> IpcResult<Arc<Port>> {
    let entry = space.lookup(name)?;
    match (entry.right(), entry.port()) {
        (MachPortRight::Receive, Some(port)) => Ok(Arc::clone(port)),
        _ => Err(IpcError::InvalidRight),
    }
}

/// The set behind a port-set right
fn port_set(space: &IpcSpace, name: MachPortName) -> IpcResult<Arc<PortSet>> {
    let entry = space.lookup(name)?;
    match (entry.right(), entry.port_set()) {
        (MachPortRight::PortSet, Some(pset)) => Ok(Arc::clone(pset)),
        _ => Err(IpcError::InvalidRight),
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Create a port (receive right) or a port set, returning its name
pub fn mach_port_allocate(space: &IpcSpace, right: MachPortRight) -> IpcResult<MachPortName> {
    let object = new_object(space, right)?;
    let (name, _entry) = space.alloc(object, right)?;
    Ok(name)
}

/// Create a port or port set under `name`.
///
/// If `name` already holds a right of the requested kind it is left alone.
pub fn mach_port_allocate_name(
    space: &IpcSpace,
    right: MachPortRight,
    name: MachPortName,
) -> IpcResult<()> {
    if let Ok(entry) = space.lookup(name) {
        return if entry.right() == right {
            Ok(())
        } else {
            Err(IpcError::NameExists)
        };
    }
    let object = new_object(space, right)?;
    space.alloc_name(name, object, right)?;
    Ok(())
}

/// Create a kernel port serviced by `handler` and give `space` a send right
/// to it. The caller keeps the port to destroy it later.
pub fn mach_port_allocate_kernel(
    space: &IpcSpace,
    handler: Arc<dyn KobjectHandler>,
) -> IpcResult<(MachPortName, Arc<Port>)> {
    let port = Port::new_kernel(handler);
    let name = space.insert_send_right(&port)?;
    Ok((name, port))
}

/// Give `space` a send right to `port`
pub fn mach_port_insert_send(space: &IpcSpace, port: &Arc<Port>) -> IpcResult<MachPortName> {
    space.insert_send_right(port)
}

/// Give `space` a send-once right to `port`
pub fn mach_port_insert_send_once(space: &IpcSpace, port: &Arc<Port>) -> IpcResult<MachPortName> {
    space.insert_send_once_right(port)
}

// ============================================================================
// Deallocation and references
// ============================================================================

/// Remove `name` and every user reference it carries
pub fn mach_port_destroy(space: &IpcSpace, name: MachPortName) -> IpcResult<()> {
    space.close(name)
}

/// Drop one user reference to a send, send-once or dead-name right
pub fn mach_port_deallocate(space: &IpcSpace, name: MachPortName) -> IpcResult<()> {
    let right = space.lookup(name)?.right();
    match right {
        MachPortRight::Send | MachPortRight::DeadName => space.mod_refs(name, -1),
        MachPortRight::SendOnce => space.close(name),
        MachPortRight::Receive | MachPortRight::PortSet => Err(IpcError::InvalidRight),
    }
}

pub fn mach_port_mod_refs(space: &IpcSpace, name: MachPortName, delta: i32) -> IpcResult<()> {
    space.mod_refs(name, delta)
}

pub fn mach_port_get_refs(space: &IpcSpace, name: MachPortName) -> IpcResult<u32> {
    space.get_refs(name)
}

/// Right type held under `name`; rights to destroyed ports read as dead names
pub fn mach_port_type(space: &IpcSpace, name: MachPortName) -> IpcResult<MachPortType> {
    space.port_type(name)
}

// ============================================================================
// Port set membership
// ============================================================================

/// Add the port `member` to the set `pset`
pub fn mach_port_insert_member(
    space: &IpcSpace,
    member: MachPortName,
    pset: MachPortName,
) -> IpcResult<()> {
    let port = receive_port(space, member)?;
    let pset = port_set(space, pset)?;
    pset.add_member(&port)
}

/// Remove the port `member` from the set `pset`
pub fn mach_port_extract_member(
    space: &IpcSpace,
    member: MachPortName,
    pset: MachPortName,
) -> IpcResult<()> {
    let port = receive_port(space, member)?;
    let pset = port_set(space, pset)?;
    pset.remove_member(&port)
}

/// Move `member` into the set `after`, or out of any set if `after` is
/// MACH_PORT_NULL
pub fn mach_port_move_member(
    space: &IpcSpace,
    member: MachPortName,
    after: MachPortName,
) -> IpcResult<()> {
    let port = receive_port(space, member)?;
    let target = if after == MACH_PORT_NULL {
        None
    } else {
        Some(port_set(space, after)?)
    };

    if let Some(current) = port.port_set() {
        if target.as_ref().is_some_and(|t| Arc::ptr_eq(t, &current)) {
            return Ok(());
        }
        // Lost a race with another move: the port is already out
        if let Err(error) = current.remove_member(&port) {
            log::debug!("move_member {:#x}: {}", member, error);
        }
    }
    match target {
        Some(pset) => pset.add_member(&port),
        None => Ok(()),
    }
}

/// Names of the member ports of `pset` that this space holds receive
/// rights for
pub fn mach_port_get_set_status(
    space: &IpcSpace,
    pset: MachPortName,
) -> IpcResult<Vec<MachPortName>> {
    let pset = port_set(space, pset)?;
    Ok(pset
        .members()
        .iter()
        .filter_map(|port| space.find_receive_name(port))
        .collect())
}

// ============================================================================
// Port attributes
// ============================================================================

/// Change the queue limit of a port, bounded by the space's `max_qlimit`
pub fn mach_port_set_qlimit(space: &IpcSpace, name: MachPortName, qlimit: usize) -> IpcResult<()> {
    if qlimit > space.config().max_qlimit {
        return Err(IpcError::InvalidValue);
    }
    receive_port(space, name)?.set_qlimit(qlimit);
    Ok(())
}

pub fn mach_port_set_seqno(
    space: &IpcSpace,
    name: MachPortName,
    seqno: MachPortSeqno,
) -> IpcResult<()> {
    receive_port(space, name)?.set_seqno(seqno);
    Ok(())
}

pub fn mach_port_get_status(space: &IpcSpace, name: MachPortName) -> IpcResult<PortStatus> {
    Ok(receive_port(space, name)?.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;

    #[test]
    fn test_allocate_and_destroy() {
        let space = IpcSpace::new();
        let name = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        assert_eq!(mach_port_type(&space, name), Ok(MachPortType::RECEIVE));
        assert_eq!(
            mach_port_allocate(&space, MachPortRight::Send),
            Err(IpcError::InvalidValue)
        );
        assert_eq!(mach_port_deallocate(&space, name), Err(IpcError::InvalidRight));
        mach_port_destroy(&space, name).unwrap();
        assert_eq!(mach_port_type(&space, name), Err(IpcError::InvalidName));
    }

    #[test]
    fn test_allocate_name() {
        let space = IpcSpace::new();
        mach_port_allocate_name(&space, MachPortRight::Receive, 42).unwrap();
        let port = receive_port(&space, 42).unwrap();
        mach_port_allocate_name(&space, MachPortRight::Receive, 42).unwrap();
        assert!(Arc::ptr_eq(&port, &receive_port(&space, 42).unwrap()));
        assert_eq!(
            mach_port_allocate_name(&space, MachPortRight::PortSet, 42),
            Err(IpcError::NameExists)
        );
    }

    #[test]
    fn test_qlimit_bounds() {
        let space = IpcSpace::with_config(IpcConfig::new().with_max_qlimit(8));
        let name = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        assert_eq!(mach_port_set_qlimit(&space, name, 9), Err(IpcError::InvalidValue));
        mach_port_set_qlimit(&space, name, 8).unwrap();
        assert_eq!(mach_port_get_status(&space, name).unwrap().qlimit, 8);
    }

    #[test]
    fn test_set_membership_by_name() {
        let space = IpcSpace::new();
        let a = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        let b = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        let s1 = mach_port_allocate(&space, MachPortRight::PortSet).unwrap();
        let s2 = mach_port_allocate(&space, MachPortRight::PortSet).unwrap();

        mach_port_insert_member(&space, a, s1).unwrap();
        mach_port_insert_member(&space, b, s1).unwrap();
        assert_eq!(mach_port_get_set_status(&space, s1), Ok(alloc::vec![a, b]));
        assert_eq!(mach_port_insert_member(&space, a, s2), Err(IpcError::InvalidRight));
        assert_eq!(mach_port_insert_member(&space, s1, s2), Err(IpcError::InvalidRight));

        mach_port_move_member(&space, a, s2).unwrap();
        assert_eq!(mach_port_get_set_status(&space, s1), Ok(alloc::vec![b]));
        assert_eq!(mach_port_get_set_status(&space, s2), Ok(alloc::vec![a]));

        mach_port_move_member(&space, a, MACH_PORT_NULL).unwrap();
        assert!(mach_port_get_set_status(&space, s2).unwrap().is_empty());
        mach_port_extract_member(&space, b, s1).unwrap();
        assert_eq!(mach_port_extract_member(&space, b, s1), Err(IpcError::InvalidRight));
    }

    #[test]
    fn test_deallocate_send() {
        let space = IpcSpace::new();
        let recv = mach_port_allocate(&space, MachPortRight::Receive).unwrap();
        let port = receive_port(&space, recv).unwrap();
        let send = mach_port_insert_send(&space, &port).unwrap();
        mach_port_insert_send(&space, &port).unwrap();
        assert_eq!(mach_port_get_refs(&space, send), Ok(2));

        mach_port_deallocate(&space, send).unwrap();
        mach_port_deallocate(&space, send).unwrap();
        assert_eq!(mach_port_get_refs(&space, send), Err(IpcError::InvalidName));
        assert!(port.is_active());
    }
}
