//! §6.2 kernel↔daemon upcall/downcall framing. The kernel VFS module itself
//! is out of scope (an external collaborator per spec.md §1); this module
//! only defines the frame the daemon reads off `/dev/capfs` (or the upcall
//! socket used in tests) and the frame it writes back.
//!
//! Header shape follows `fuser`'s `ll/fuse_abi.rs` convention of one
//! small fixed `#[repr(C)]` struct per direction; the `capfsd_upcall`/
//! `capfsd_downcall` round trip in `examples/original_source/client/capfsd.c`
//! grounds the unique-id correlation and opcode dispatch.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{tagged, ErrorKind};

pub const UPCALL_MAGIC: u32 = 0x4341_5046; // "CAPF"

/// Operations the daemon's dispatcher (C8) routes to C6/C7. Deliberately
/// smaller than the full VFS surface: anything not listed here (ioctl,
/// xattr, locking) is a Non-goal per spec.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpcallOp {
    Lookup = 0,
    Getattr = 1,
    Setattr = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Release = 6,
    Create = 7,
    Unlink = 8,
    Rename = 9,
    Link = 10,
    Symlink = 11,
    Readlink = 12,
    Mkdir = 13,
    Rmdir = 14,
    Readdir = 15,
    Statfs = 16,
    Fsync = 17,
    /// Daemon-internal: the callback service (C9) pushing an invalidation
    /// into the same downcall channel the kernel module listens on.
    InvalEntry = 18,
    InvalInode = 19,
    /// Daemon-internal: the callback service (C9) pushing freshly-committed
    /// hashes from another client's WCOMMIT (§4.9).
    UpdateHashes = 20,
}

impl UpcallOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        use UpcallOp::*;
        Some(match v {
            0 => Lookup,
            1 => Getattr,
            2 => Setattr,
            3 => Read,
            4 => Write,
            5 => Open,
            6 => Release,
            7 => Create,
            8 => Unlink,
            9 => Rename,
            10 => Link,
            11 => Symlink,
            12 => Readlink,
            13 => Mkdir,
            14 => Rmdir,
            15 => Readdir,
            16 => Statfs,
            17 => Fsync,
            18 => InvalEntry,
            19 => InvalInode,
            20 => UpdateHashes,
            _ => return None,
        })
    }
}

/// Fixed-layout payloads for the upcalls C8 actually dispatches (§6.2). One
/// struct per op whose arguments don't already fit in the header; a
/// variable-length trailer (a path, a write body) follows immediately
/// after in the upcall frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OpenUpcallFixed {
    pub flags: u32,
    pub mode: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReadUpcallFixed {
    pub file_id: u64,
    pub offset: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WriteUpcallFixed {
    pub file_id: u64,
    pub offset: u64,
}

/// Shared by every op that only needs to name an already-open file
/// (Release, Getattr, Fsync).
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FileIdFixed {
    pub file_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct UpcallHeader {
    pub magic: u32,
    pub opcode: u32,
    pub unique: u64,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub len: u32,
}

impl UpcallHeader {
    pub fn new(opcode: UpcallOp, unique: u64, pid: u32, uid: u32, gid: u32, len: u32) -> Self {
        UpcallHeader {
            magic: UPCALL_MAGIC,
            opcode: opcode as u32,
            unique,
            pid,
            uid,
            gid,
            len,
        }
    }

    pub fn validate(&self) -> std::io::Result<UpcallOp> {
        if self.magic != UPCALL_MAGIC {
            return Err(tagged(ErrorKind::Protocol, "bad upcall magic"));
        }
        UpcallOp::from_u32(self.opcode).ok_or_else(|| tagged(ErrorKind::Protocol, "unknown upcall opcode"))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DowncallHeader {
    pub magic: u32,
    pub unique: u64,
    pub status: i32,
    pub len: u32,
}

impl DowncallHeader {
    pub fn ok(unique: u64, len: u32) -> Self {
        DowncallHeader {
            magic: UPCALL_MAGIC,
            unique,
            status: 0,
            len,
        }
    }

    pub fn error(unique: u64, errno: i32) -> Self {
        DowncallHeader {
            magic: UPCALL_MAGIC,
            unique,
            status: -errno,
            len: 0,
        }
    }

    pub fn validate(&self) -> std::io::Result<()> {
        if self.magic != UPCALL_MAGIC {
            return Err(tagged(ErrorKind::Protocol, "bad downcall magic"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upcall_opcode_round_trips() {
        let h = UpcallHeader::new(UpcallOp::Write, 42, 1, 0, 0, 64);
        assert_eq!(h.validate().unwrap(), UpcallOp::Write);
        assert_eq!(h.unique, 42);
    }

    #[test]
    fn downcall_error_encodes_negative_errno() {
        let d = DowncallHeader::error(7, libc::ENOENT);
        assert_eq!(d.status, -libc::ENOENT);
    }

    #[test]
    fn update_hashes_opcode_round_trips() {
        let h = UpcallHeader::new(UpcallOp::UpdateHashes, 1, 0, 0, 0, 0);
        assert_eq!(h.validate().unwrap(), UpcallOp::UpdateHashes);
    }
}
