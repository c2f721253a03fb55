//! §6.1 manager wire format: fixed-layout request/ack headers plus the
//! type-tagged unions consumed by C6/C7. Layouts are grounded in
//! `examples/original_source/lib/req.h` (`struct mreq`/`struct mack`),
//! translated from the original's manually-aligned C unions into one
//! `zerocopy` struct per operation.

use std::io;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::argument::ArgumentIterator;

/// `MGR_MAJIK_NR` from `req.h`.
pub const MGR_MAGIC: u32 = 0x4a87_c9fe;
pub const MGR_RELEASE: u32 = 1;

/// Manager operation codes. Numbering kept close to `req.h` for fidelity,
/// though the wire wouldn't care if it were renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MgrOpcode {
    Chmod = 0,
    Chown = 1,
    Close = 2,
    Lstat = 3,
    Open = 5,
    Unlink = 6,
    Fstat = 9,
    Rename = 10,
    Mkdir = 12,
    Rmdir = 15,
    Truncate = 17,
    Utime = 18,
    Getdents = 19,
    Statfs = 20,
    Lookup = 22,
    Link = 24,
    Symlink = 29,
    Readlink = 25,
    Stat = 26,
    Gethashes = 27,
    Wcommit = 28,
    RegisterCallback = 30,
}

impl MgrOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MgrOpcode::*;
        Some(match v {
            0 => Chmod,
            1 => Chown,
            2 => Close,
            3 => Lstat,
            5 => Open,
            6 => Unlink,
            9 => Fstat,
            10 => Rename,
            12 => Mkdir,
            15 => Rmdir,
            17 => Truncate,
            18 => Utime,
            19 => Getdents,
            20 => Statfs,
            22 => Lookup,
            24 => Link,
            29 => Symlink,
            25 => Readlink,
            26 => Stat,
            27 => Gethashes,
            28 => Wcommit,
            30 => RegisterCallback,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    pub magic: u32,
    pub release: u32,
    pub type_: u8,
    pub pad0: [u8; 3],
    pub uid: u32,
    pub gid: u32,
    pub pad1: u32,
    pub dsize: u64,
}

impl RequestHeader {
    pub fn new(opcode: MgrOpcode, uid: u32, gid: u32, dsize: u64) -> Self {
        RequestHeader {
            magic: MGR_MAGIC,
            release: MGR_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            uid,
            gid,
            pad1: 0,
            dsize,
        }
    }

    pub fn validate(&self) -> io::Result<MgrOpcode> {
        if self.magic != MGR_MAGIC {
            return Err(crate::error::tagged(
                crate::error::ErrorKind::Protocol,
                "bad manager request magic",
            ));
        }
        MgrOpcode::from_u8(self.type_)
            .ok_or_else(|| crate::error::tagged(crate::error::ErrorKind::Protocol, "unknown manager opcode"))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct AckHeader {
    pub magic: u32,
    pub release: u32,
    pub type_: u8,
    pub pad0: [u8; 3],
    pub status: i32,
    pub errno: u32,
    pub pad1: u32,
    pub dsize: u64,
}

impl AckHeader {
    pub fn ok(opcode: MgrOpcode, dsize: u64) -> Self {
        AckHeader {
            magic: MGR_MAGIC,
            release: MGR_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            status: 0,
            errno: 0,
            pad1: 0,
            dsize,
        }
    }

    pub fn error(opcode: MgrOpcode, errno: u32, dsize: u64) -> Self {
        AckHeader {
            magic: MGR_MAGIC,
            release: MGR_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            status: -1,
            errno,
            pad1: 0,
            dsize,
        }
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.magic != MGR_MAGIC {
            return Err(crate::error::tagged(
                crate::error::ErrorKind::Protocol,
                "bad manager ack magic",
            ));
        }
        Ok(())
    }
}

/// Per-file metadata as returned by OPEN/STAT/FSTAT/LOOKUP, including the
/// striping parameters C2 needs (`stripe_size`, `server_count`, `base`).
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FileMeta {
    pub inode: u64,
    pub size: u64,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub stripe_size: u32,
    pub server_count: u32,
    pub base: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct IodInfo {
    pub host: [u8; 56],
    pub port: u16,
    pub pad: [u8; 6],
}

impl IodInfo {
    pub fn new(host: &str, port: u16) -> Self {
        let mut buf = [0u8; 56];
        let bytes = host.as_bytes();
        let n = bytes.len().min(55);
        buf[..n].copy_from_slice(&bytes[..n]);
        IodInfo {
            host: buf,
            port,
            pad: [0; 6],
        }
    }

    pub fn host_str(&self) -> String {
        let end = self.host.iter().position(|&b| b == 0).unwrap_or(self.host.len());
        String::from_utf8_lossy(&self.host[..end]).into_owned()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OpenReqFixed {
    pub flags: u32,
    pub mode: u32,
    pub prefetch_count: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OpenAckFixed {
    pub meta: FileMeta,
    pub capability: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct GethashesReqFixed {
    pub begin_chunk: u64,
    pub nchunks: u64,
}

/// Shared by GETHASHES and WCOMMIT acks: both refresh the client's view of
/// file size, per SPEC_FULL's supplement grounded in `req.h`'s `fmeta`
/// field on both ack unions.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FileStat {
    pub size: u64,
    pub mtime: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct HashesAckFixed {
    pub nhashes: u64,
    pub stat: FileStat,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WcommitReqFixed {
    pub begin_chunk: u64,
    pub write_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct GetdentsReqFixed {
    pub offset: u64,
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DirentRecord {
    pub inode: u64,
    pub offset: u64,
    pub name: [u8; 1024],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct StatfsAckFixed {
    pub tot_bytes: u64,
    pub free_bytes: u64,
    pub tot_files: u32,
    pub free_files: u32,
    pub namelen: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ChownReqFixed {
    pub force_group_change: u32,
    pub owner: u32,
    pub group: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct TruncateReqFixed {
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct UtimeReqFixed {
    pub actime: i64,
    pub modtime: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ChmodReqFixed {
    pub mode: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct MkdirReqFixed {
    pub mode: u32,
    pub pad: u32,
}

/// Register this daemon's callback endpoint with the manager (§4.9). Not
/// present in the original wire table; added because C9's registration RPC
/// needs *some* request shape and the manager protocol is the only channel
/// the client has to it.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RegisterCallbackReqFixed {
    pub client_id: u64,
    pub port: u16,
    pub pad: [u8; 6],
}

/// Append a NUL-terminated name (and optional second name for rename-style
/// ops) ahead of any binary payload, matching the original's "filename(s)
/// appended immediately after the fixed record" rule.
pub fn encode_names(names: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, n) in names.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(n.as_bytes());
    }
    buf.push(0);
    buf
}

pub fn decode_name(trailer: &[u8]) -> io::Result<(String, &[u8])> {
    let mut it = ArgumentIterator::new(trailer);
    let rest_len_before = it.len();
    let name = it
        .fetch_name()
        .ok_or_else(|| crate::error::tagged(crate::error::ErrorKind::Protocol, "missing name in trailer"))?;
    let consumed = rest_len_before - it.len();
    let name = name.to_string_lossy().into_owned();
    Ok((name, &trailer[consumed..]))
}
