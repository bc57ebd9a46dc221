//! IPC Kernel Message - Internal message representation
//!
//! Based on Mach4 ipc/ipc_kmsg.h
//! Kernel messages are the internal representation of Mach messages
//! as they pass through the kernel. Body encoding and out-of-line data are
//! handled by the caller; the queue engine only looks at the header.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::size_of;

use super::entry::MachPortName;

// ============================================================================
// Message Header (matches Mach message format)
// ============================================================================

/// Message header bits
pub type MsgBits = u32;

/// Message size type
pub type MsgSize = u32;

/// Message ID type
pub type MsgId = i32;

/// Per-port sequence number assigned at receive
pub type MachPortSeqno = u32;

// Message bits constants
pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_00FF;
pub const MACH_MSGH_BITS_LOCAL_MASK: u32 = 0x0000_FF00;
pub const MACH_MSGH_BITS_PORTS_MASK: u32 =
    MACH_MSGH_BITS_REMOTE_MASK | MACH_MSGH_BITS_LOCAL_MASK;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
/// Set by copyin when the message would carry a receive right into itself
pub const MACH_MSGH_BITS_CIRCULAR: u32 = 0x1000_0000;

// Message type names for port rights
pub const MACH_MSG_TYPE_MOVE_RECEIVE: u32 = 16;
pub const MACH_MSG_TYPE_MOVE_SEND: u32 = 17;
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u32 = 18;
pub const MACH_MSG_TYPE_COPY_SEND: u32 = 19;
pub const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;
pub const MACH_MSG_TYPE_MAKE_SEND_ONCE: u32 = 21;

/// Type names after copyin
pub const MACH_MSG_TYPE_PORT_RECEIVE: u32 = MACH_MSG_TYPE_MOVE_RECEIVE;
pub const MACH_MSG_TYPE_PORT_SEND: u32 = MACH_MSG_TYPE_MOVE_SEND;
pub const MACH_MSG_TYPE_PORT_SEND_ONCE: u32 = MACH_MSG_TYPE_MOVE_SEND_ONCE;

/// Compose header bits from remote and local type names
#[inline]
pub const fn mach_msgh_bits(remote: u32, local: u32) -> MsgBits {
    (remote & 0xFF) | ((local & 0xFF) << 8)
}

/// Mach message header
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct MachMsgHeader {
    /// Message bits (remote/local port types, complex and circular flags)
    pub msgh_bits: MsgBits,
    /// Size of message including header
    pub msgh_size: MsgSize,
    /// Destination port
    pub msgh_remote_port: MachPortName,
    /// Reply port
    pub msgh_local_port: MachPortName,
    /// Reserved (voucher port in newer Mach)
    pub msgh_reserved: u32,
    /// Message ID
    pub msgh_id: MsgId,
}

/// Size of the message header in bytes
pub const MACH_MSG_HEADER_SIZE: usize = size_of::<MachMsgHeader>();

impl MachMsgHeader {
    /// Create a new empty header
    pub const fn new() -> Self {
        Self {
            msgh_bits: 0,
            msgh_size: MACH_MSG_HEADER_SIZE as MsgSize,
            msgh_remote_port: 0,
            msgh_local_port: 0,
            msgh_reserved: 0,
            msgh_id: 0,
        }
    }

    /// Get remote port type from bits
    #[inline]
    pub fn remote_type(&self) -> u32 {
        self.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK
    }

    /// Get local port type from bits
    #[inline]
    pub fn local_type(&self) -> u32 {
        (self.msgh_bits & MACH_MSGH_BITS_LOCAL_MASK) >> 8
    }

    /// Check if message is complex (has OOL data or port rights in body)
    #[inline]
    pub fn is_complex(&self) -> bool {
        (self.msgh_bits & MACH_MSGH_BITS_COMPLEX) != 0
    }

    #[inline]
    pub fn is_circular(&self) -> bool {
        (self.msgh_bits & MACH_MSGH_BITS_CIRCULAR) != 0
    }

    /// Replace the remote type, keeping the local type and flags
    pub fn set_remote_type(&mut self, remote: u32) {
        self.msgh_bits = (self.msgh_bits & !MACH_MSGH_BITS_REMOTE_MASK) | (remote & 0xFF);
    }
}

impl Default for MachMsgHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Trailer
// ============================================================================

/// MACH_MSG_TRAILER_FORMAT_0
pub const MACH_MSG_TRAILER_FORMAT_0: u32 = 0;

/// Trailer appended to every received message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MachMsgTrailer {
    pub msgh_trailer_type: u32,
    pub msgh_trailer_size: u32,
    pub msgh_seqno: MachPortSeqno,
    pub msgh_sender: [u32; 2],
}

/// Room a receiver must leave for the trailer
pub const MAX_TRAILER_SIZE: usize = size_of::<MachMsgTrailer>();

// ============================================================================
// Kernel Message
// ============================================================================

/// A message in flight: header, opaque body, and the trailer filled in at
/// receive time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcKmsg {
    pub header: MachMsgHeader,
    body: Vec<u8>,
    trailer: MachMsgTrailer,
}

impl IpcKmsg {
    /// Build a message with explicit header bits
    pub fn new(
        bits: MsgBits,
        remote: MachPortName,
        local: MachPortName,
        id: MsgId,
        body: Vec<u8>,
    ) -> Box<Self> {
        let size = (MACH_MSG_HEADER_SIZE + body.len()) as MsgSize;
        Box::new(Self {
            header: MachMsgHeader {
                msgh_bits: bits,
                msgh_size: size,
                msgh_remote_port: remote,
                msgh_local_port: local,
                msgh_reserved: 0,
                msgh_id: id,
            },
            body,
            trailer: MachMsgTrailer {
                msgh_trailer_type: MACH_MSG_TRAILER_FORMAT_0,
                msgh_trailer_size: MAX_TRAILER_SIZE as u32,
                ..MachMsgTrailer::default()
            },
        })
    }

    /// Simple message to `remote` over a copied send right, no reply port
    pub fn simple(remote: MachPortName, id: MsgId, body: Vec<u8>) -> Box<Self> {
        Self::new(
            mach_msgh_bits(MACH_MSG_TYPE_COPY_SEND, 0),
            remote,
            0,
            id,
            body,
        )
    }

    /// Request carrying a send-once reply right in `local`
    pub fn request(
        remote: MachPortName,
        local: MachPortName,
        id: MsgId,
        body: Vec<u8>,
    ) -> Box<Self> {
        Self::new(
            mach_msgh_bits(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE),
            remote,
            local,
            id,
            body,
        )
    }

    /// Message size including header
    #[inline]
    pub fn size(&self) -> usize {
        self.header.msgh_size as usize
    }

    /// Buffer size a receiver needs for this message
    #[inline]
    pub fn receive_size(&self) -> usize {
        self.size() + MAX_TRAILER_SIZE
    }

    #[inline]
    pub fn id(&self) -> MsgId {
        self.header.msgh_id
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self: Box<Self>) -> Vec<u8> {
        self.body
    }

    #[inline]
    pub fn trailer(&self) -> &MachMsgTrailer {
        &self.trailer
    }

    /// Sequence number stamped at receive
    #[inline]
    pub fn seqno(&self) -> MachPortSeqno {
        self.trailer.msgh_seqno
    }

    pub(crate) fn set_seqno(&mut self, seqno: MachPortSeqno) {
        self.trailer.msgh_seqno = seqno;
    }
}

/// Destroy a message the kernel will not deliver
pub(crate) fn kmsg_destroy(kmsg: Box<IpcKmsg>) {
    log::trace!(
        "kmsg destroy: id {} to {:#x}, {} bytes",
        kmsg.id(),
        kmsg.header.msgh_remote_port,
        kmsg.size()
    );
    drop(kmsg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_header_bits() {
        let kmsg = IpcKmsg::request(5, 7, 100, vec![0; 8]);
        assert_eq!(kmsg.header.remote_type(), MACH_MSG_TYPE_COPY_SEND);
        assert_eq!(kmsg.header.local_type(), MACH_MSG_TYPE_MAKE_SEND_ONCE);
        assert!(!kmsg.header.is_circular());
        assert!(!kmsg.header.is_complex());
    }

    #[test]
    fn test_sizes() {
        let kmsg = IpcKmsg::simple(3, 1, vec![0; 40]);
        assert_eq!(kmsg.size(), MACH_MSG_HEADER_SIZE + 40);
        assert_eq!(kmsg.receive_size(), MACH_MSG_HEADER_SIZE + 40 + MAX_TRAILER_SIZE);
    }

    #[test]
    fn test_set_remote_type_keeps_flags() {
        let mut kmsg = IpcKmsg::new(
            mach_msgh_bits(MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND)
                | MACH_MSGH_BITS_CIRCULAR,
            1,
            2,
            0,
            vec![],
        );
        kmsg.header.set_remote_type(MACH_MSG_TYPE_PORT_SEND_ONCE);
        assert_eq!(kmsg.header.remote_type(), MACH_MSG_TYPE_PORT_SEND_ONCE);
        assert_eq!(kmsg.header.local_type(), MACH_MSG_TYPE_MAKE_SEND);
        assert!(kmsg.header.is_circular());
    }
}
