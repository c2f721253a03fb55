//! Data-server wire format (§4.5, §6.1). Grounded in
//! `examples/original_source/lib/req.h`'s `struct ireq`/`struct iack`, but
//! collapsed from the original's fd+offset+stride `IOD_RW` subtype down to
//! plain hash-keyed GET/PUT, per spec.md's redesign: content is addressed by
//! its SHA-1 digest, so there is no file descriptor or byte range to carry.
//!
//! Endianness: native, same caveat as [`super::manager`].

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{tagged, ErrorKind};

/// `IOD_MAJIK_NR` from `req.h`.
pub const DS_MAGIC: u32 = 0x49e3_ac9f;
pub const DS_RELEASE: u32 = 1;

pub const DIGEST_LEN: usize = 20;
pub type Digest = [u8; DIGEST_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DsOpcode {
    /// `IOD_RW` / `IOD_RW_READ` collapsed to hash-keyed fetch.
    Get = 0,
    /// `IOD_RW` / `IOD_RW_WRITE` collapsed to hash-keyed store.
    Put = 1,
    /// `IOD_NOOP`.
    Ping = 2,
    /// `IOD_STATFS`.
    Statfs = 3,
    /// Admin operation (§4.5): wipe every object a server holds. No digest,
    /// no body, no reply payload beyond the ack header.
    RemoveAll = 4,
}

impl DsOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use DsOpcode::*;
        Some(match v {
            0 => Get,
            1 => Put,
            2 => Ping,
            3 => Statfs,
            4 => RemoveAll,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DsRequestHeader {
    pub magic: u32,
    pub release: u32,
    pub type_: u8,
    pub pad0: [u8; 3],
    pub dsize: u64,
}

impl DsRequestHeader {
    pub fn new(opcode: DsOpcode, dsize: u64) -> Self {
        DsRequestHeader {
            magic: DS_MAGIC,
            release: DS_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            dsize,
        }
    }

    pub fn validate(&self) -> std::io::Result<DsOpcode> {
        if self.magic != DS_MAGIC {
            return Err(tagged(ErrorKind::Protocol, "bad data server request magic"));
        }
        DsOpcode::from_u8(self.type_).ok_or_else(|| tagged(ErrorKind::Protocol, "unknown data server opcode"))
    }
}

/// Ack status values. `NotFound` is not a wire error: GET on absent content
/// is a normal outcome the client maps to a zero-filled chunk (§4.6, never
/// surfaced to the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DsStatus {
    Ok = 0,
    NotFound = 1,
    Error = -1,
}

impl DsStatus {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => DsStatus::Ok,
            1 => DsStatus::NotFound,
            _ => DsStatus::Error,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DsAckHeader {
    pub magic: u32,
    pub release: u32,
    pub type_: u8,
    pub pad0: [u8; 3],
    pub status: i32,
    pub errno: u32,
    pub pad1: u32,
    pub dsize: u64,
}

impl DsAckHeader {
    pub fn ok(opcode: DsOpcode, dsize: u64) -> Self {
        DsAckHeader {
            magic: DS_MAGIC,
            release: DS_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            status: DsStatus::Ok as i32,
            errno: 0,
            pad1: 0,
            dsize,
        }
    }

    pub fn not_found(opcode: DsOpcode) -> Self {
        DsAckHeader {
            magic: DS_MAGIC,
            release: DS_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            status: DsStatus::NotFound as i32,
            errno: 0,
            pad1: 0,
            dsize: 0,
        }
    }

    pub fn error(opcode: DsOpcode, errno: u32) -> Self {
        DsAckHeader {
            magic: DS_MAGIC,
            release: DS_RELEASE,
            type_: opcode as u8,
            pad0: [0; 3],
            status: DsStatus::Error as i32,
            errno,
            pad1: 0,
            dsize: 0,
        }
    }

    pub fn validate(&self) -> std::io::Result<()> {
        if self.magic != DS_MAGIC {
            return Err(tagged(ErrorKind::Protocol, "bad data server ack magic"));
        }
        Ok(())
    }

    pub fn status(&self) -> DsStatus {
        DsStatus::from_i32(self.status)
    }
}

/// GET/PUT requests carry exactly one digest ahead of any body bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DigestHeader {
    pub digest: Digest,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct DsStatfsAckFixed {
    pub tot_bytes: u64,
    pub free_bytes: u64,
}
