//! Open-file record table backing C7/C8: one entry per capability held from
//! the manager, with the striping parameters and server list OPEN returned,
//! plus an idle sweep that closes files nobody has touched in two
//! consecutive sweep passes.
//!
//! Lifecycle bookkeeping (insert on open, remove on close, periodic sweep)
//! is modeled on `fuser`'s `session.rs` `ActiveSession`/
//! `BackgroundSession` split: a long-lived table of handles plus a
//! background pass that reclaims ones nobody is using.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mapper::StripeParams;
use crate::wire::dataserver::Digest;

/// A write staged client-side but not yet committed to the manager
/// (`delay_commit`, §4.4). `base_digest` is the pre-image hash the eventual
/// WCOMMIT must present as its old value; `None` means the chunk had never
/// been written (or cached) when it was staged.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub base_digest: Option<Digest>,
    pub body: Vec<u8>,
}

pub struct OpenFile {
    pub file_id: u64,
    pub capability: u32,
    pub stripe: StripeParams,
    pub servers: Vec<SocketAddr>,
    size: AtomicU64,
    mtime: AtomicI64,
    dirty: AtomicBool,
    touched: AtomicBool,
    idle_strikes: AtomicU32,
    pending: Mutex<BTreeMap<u64, PendingChunk>>,
}

impl OpenFile {
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn mtime(&self) -> i64 {
        self.mtime.load(Ordering::Acquire)
    }

    pub fn set_mtime(&self, mtime: i64) {
        self.mtime.store(mtime, Ordering::Release);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.touched.store(true, Ordering::Release);
        self.idle_strikes.store(0, Ordering::Release);
    }

    /// Buffer a write for `chunk_index` instead of committing it right
    /// away. Overwrites whatever was previously staged for that chunk
    /// (`base_digest` stays pinned to the oldest pre-image seen so a later
    /// flush's WCOMMIT still compares against what the manager actually
    /// has).
    pub fn stage_write(&self, chunk_index: u64, base_digest: Option<Digest>, body: Vec<u8>) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&chunk_index) {
            Some(existing) => existing.body = body,
            None => {
                pending.insert(chunk_index, PendingChunk { base_digest, body });
            }
        }
    }

    pub fn pending_get(&self, chunk_index: u64) -> Option<PendingChunk> {
        self.pending.lock().get(&chunk_index).cloned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Drain every staged write, handing ownership to the caller (a flush).
    pub fn take_pending(&self) -> BTreeMap<u64, PendingChunk> {
        std::mem::take(&mut *self.pending.lock())
    }
}

pub struct OpenFileTable {
    files: Mutex<HashMap<u64, Arc<OpenFile>>>,
    next_id: AtomicU64,
    max_idle_strikes: u32,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::with_strikes(2)
    }

    pub fn with_strikes(max_idle_strikes: u32) -> Self {
        OpenFileTable {
            files: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_idle_strikes,
        }
    }

    pub fn insert(&self, capability: u32, stripe: StripeParams, servers: Vec<SocketAddr>, size: u64, mtime: i64) -> Arc<OpenFile> {
        let file_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(OpenFile {
            file_id,
            capability,
            stripe,
            servers,
            size: AtomicU64::new(size),
            mtime: AtomicI64::new(mtime),
            dirty: AtomicBool::new(false),
            touched: AtomicBool::new(true),
            idle_strikes: AtomicU32::new(0),
            pending: Mutex::new(BTreeMap::new()),
        });
        self.files.lock().insert(file_id, entry.clone());
        entry
    }

    pub fn get(&self, file_id: u64) -> Option<Arc<OpenFile>> {
        let entry = self.files.lock().get(&file_id).cloned();
        if let Some(ref e) = entry {
            e.touch();
        }
        entry
    }

    pub fn remove(&self, file_id: u64) -> Option<Arc<OpenFile>> {
        self.files.lock().remove(&file_id)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one idle-sweep pass: any entry not touched since the previous
    /// sweep earns a strike; at two strikes it is evicted and returned to
    /// the caller, which is responsible for actually closing it with the
    /// manager (CLOSE is a fallible RPC, this table only manages memory).
    pub fn sweep_idle(&self) -> Vec<Arc<OpenFile>> {
        let mut evicted = Vec::new();
        let mut files = self.files.lock();
        files.retain(|_, entry| {
            if entry.touched.swap(false, Ordering::AcqRel) {
                true
            } else {
                let strikes = entry.idle_strikes.fetch_add(1, Ordering::AcqRel) + 1;
                if strikes >= self.max_idle_strikes {
                    evicted.push(entry.clone());
                    false
                } else {
                    true
                }
            }
        });
        evicted
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
