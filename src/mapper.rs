//! C2: chunk-to-server mapping (§4.2). Pure arithmetic, no `fuser` analog
//! needed — this is CAPFS's own striping formula, carried from
//! `FileMeta::{stripe_size, server_count, base}` as returned by OPEN/STAT.

use std::io;

use crate::error::{tagged, ErrorKind};

/// Fixed content-addressing unit (§3, §4.2): every chunk hashed and stored
/// at a data server is exactly this many bytes, except a file's final chunk
/// which may be shorter. Distinct from a file's `stripe_size`, which is a
/// per-file multiple of `CHUNK` describing how many chunks land on the same
/// server before rotating to the next one.
pub const CHUNK: u64 = 16384;

/// Which server index (0-based, already rotated by `base`) owns a given
/// chunk, and the chunk's absolute offset bounds within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub chunk_index: u64,
    pub server_index: u32,
    pub start: u64,
    pub end: u64,
}

/// Striping parameters for one open file, mirroring `FileMeta`'s striping
/// fields so callers don't have to thread the whole struct through.
#[derive(Debug, Clone, Copy)]
pub struct StripeParams {
    pub stripe_size: u32,
    pub server_count: u32,
    pub base: u32,
}

impl StripeParams {
    /// Every chunk is exactly [`CHUNK`] bytes (the file's final chunk may be
    /// shorter on the wire, but its offset span still ends at a `CHUNK`
    /// boundary).
    pub fn chunk_size(&self) -> u64 {
        CHUNK
    }

    /// `stripe_size` must be a positive multiple of `CHUNK` and
    /// `server_count` must be positive (§4.2). Callers that build
    /// `StripeParams` from a manager OPEN/STAT reply must call this before
    /// trusting the mapping; tests that only need arithmetic fixtures may
    /// construct `StripeParams` directly and skip it.
    pub fn validate(&self) -> io::Result<()> {
        if self.server_count == 0 {
            return Err(tagged(ErrorKind::Protocol, "server_count must be positive"));
        }
        if self.stripe_size == 0 || (self.stripe_size as u64) % CHUNK != 0 {
            return Err(tagged(
                ErrorKind::Protocol,
                format!("stripe_size {} must be a positive multiple of CHUNK ({CHUNK})", self.stripe_size),
            ));
        }
        Ok(())
    }

    /// Which chunk index covers byte offset `pos`.
    pub fn chunk_index_for(&self, pos: u64) -> u64 {
        pos / self.chunk_size()
    }

    /// Server index (round-robin, starting at `base`) that owns
    /// `chunk_index`: `(base + chunk_index*CHUNK/stripe_size) mod
    /// server_count` (§4.2) — chunks within the same `stripe_size` span
    /// share a server before the mapping rotates to the next one.
    pub fn server_for_chunk(&self, chunk_index: u64) -> u32 {
        debug_assert!(self.server_count > 0, "server_count must be positive");
        debug_assert!(self.stripe_size > 0, "stripe_size must be positive");
        let stripe_index = (chunk_index * CHUNK) / self.stripe_size as u64;
        ((self.base as u64 + stripe_index) % self.server_count as u64) as u32
    }

    pub fn location(&self, chunk_index: u64) -> ChunkLocation {
        let size = self.chunk_size();
        ChunkLocation {
            chunk_index,
            server_index: self.server_for_chunk(chunk_index),
            start: chunk_index * size,
            end: chunk_index * size + size,
        }
    }

    /// Every chunk index touched by a `[offset, offset+len)` byte range,
    /// in ascending order. Used by C7's read/write pipeline to decide which
    /// chunks need fetching (edges) versus whole-chunk overwrite.
    pub fn chunks_in_range(&self, offset: u64, len: u64) -> impl Iterator<Item = ChunkLocation> + '_ {
        let size = self.chunk_size();
        let first = offset / size;
        let last = if len == 0 { first } else { (offset + len - 1) / size };
        (first..=last).map(move |i| self.location(i))
    }

    /// True if `[offset, offset+len)` exactly covers chunk `chunk_index`
    /// without partial overlap at either edge — i.e. no read-modify-write
    /// is needed for that chunk (§4.6).
    pub fn is_full_chunk_write(&self, chunk_index: u64, offset: u64, len: u64) -> bool {
        let loc = self.location(chunk_index);
        offset <= loc.start && offset + len >= loc.end
    }
}
