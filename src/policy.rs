//! C4: consistency policy plug-ins (§4.4). The three semantics booleans and
//! six lifecycle hooks are exposed as one trait with default
//! implementations, the same shape as `fuser`'s `Filesystem` trait in
//! `lib.rs` — a handful of required-in-spirit methods with sensible no-op
//! defaults, so a policy only overrides what makes it different from POSIX.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy)]
pub struct OpenContext {
    pub file_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CloseContext {
    pub file_id: u64,
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadContext {
    pub file_id: u64,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteContext {
    pub file_id: u64,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitRaceContext {
    pub file_id: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub file_id: u64,
}

/// What the pipeline should do after a WCOMMIT race (§4.6, §9 Open Question
/// (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceAction {
    /// Refresh hashes for the racing chunks and resubmit.
    Retry,
    /// Give up and surface [`ErrorKind::AgainRace`] to the caller.
    GiveUp,
}

/// A named consistency policy. Default method bodies give POSIX-ish
/// behavior (commit eagerly, trust the hash cache, no hooks do real work);
/// concrete policies override only what distinguishes them.
pub trait ConsistencyPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// If true, every WRITE commits to the manager before returning,
    /// rather than batching (§4.4).
    fn force_commit(&self) -> bool {
        true
    }

    /// If true, the hash cache is authoritative without a manager round
    /// trip as long as no invalidation has arrived; if false, every read
    /// must confirm freshness with GETHASHES.
    fn hcache_coherence(&self) -> bool {
        true
    }

    /// If true, WCOMMIT is deferred until close/sync instead of per-write.
    fn delay_commit(&self) -> bool {
        false
    }

    /// Retry ceiling for a racing WCOMMIT. `None` means unbounded, matching
    /// the original's behavior (DESIGN.md Open Question (a)).
    fn max_commit_retries(&self) -> Option<u32> {
        None
    }

    /// Veto a write before it ever reaches a data-server PUT. Called once
    /// per `pipeline::write()` invocation, regardless of whether that write
    /// would race on commit. The default allows everything; policies that
    /// need to reject writes unconditionally (rather than only when they
    /// collide with another committer) override this instead of — or in
    /// addition to — `on_commit_race`.
    fn before_write(&self, _ctx: &WriteContext) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn on_open(&self, ctx: &OpenContext) {
        log::trace!("policy {}: open file {}", self.name(), ctx.file_id);
    }

    fn on_close(&self, ctx: &CloseContext) {
        log::trace!("policy {}: close file {} dirty={}", self.name(), ctx.file_id, ctx.dirty);
    }

    fn on_read(&self, ctx: &ReadContext) {
        log::trace!("policy {}: read file {} off={} len={}", self.name(), ctx.file_id, ctx.offset, ctx.len);
    }

    fn on_write(&self, ctx: &WriteContext) {
        log::trace!("policy {}: write file {} off={} len={}", self.name(), ctx.file_id, ctx.offset, ctx.len);
    }

    fn on_commit_race(&self, ctx: &CommitRaceContext) -> RaceAction {
        if let Some(max) = self.max_commit_retries() {
            if ctx.attempt >= max {
                return RaceAction::GiveUp;
            }
        }
        if ctx.attempt > 0 && ctx.attempt % 8 == 0 {
            log::warn!(
                "policy {}: file {} still racing after {} WCOMMIT attempts",
                self.name(),
                ctx.file_id,
                ctx.attempt
            );
        }
        RaceAction::Retry
    }

    fn on_sync(&self, ctx: &SyncContext) {
        log::trace!("policy {}: sync file {}", self.name(), ctx.file_id);
    }
}

/// Strict close-to-open consistency: every write commits, every read
/// confirms against the manager. The conservative default.
pub struct PosixPolicy;

impl ConsistencyPolicy for PosixPolicy {
    fn name(&self) -> &'static str {
        "posix"
    }
}

/// Consistency is only guaranteed across open/close boundaries of the same
/// client session; reads within an open file trust the hash cache even
/// without a fresh GETHASHES round trip.
pub struct SessionPolicy;

impl ConsistencyPolicy for SessionPolicy {
    fn name(&self) -> &'static str {
        "session"
    }

    fn hcache_coherence(&self) -> bool {
        true
    }

    fn delay_commit(&self) -> bool {
        true
    }
}

/// Files are write-once: the first write a given `ImmutablePolicy` instance
/// sees succeeds, every write after that is rejected in `before_write`
/// before it ever reaches a data-server PUT, whether or not it would have
/// raced with another committer.
pub struct ImmutablePolicy {
    committed: AtomicBool,
}

impl ImmutablePolicy {
    pub fn new() -> Self {
        ImmutablePolicy {
            committed: AtomicBool::new(false),
        }
    }
}

impl Default for ImmutablePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyPolicy for ImmutablePolicy {
    fn name(&self) -> &'static str {
        "immutable"
    }

    fn force_commit(&self) -> bool {
        true
    }

    fn max_commit_retries(&self) -> Option<u32> {
        Some(0)
    }

    fn before_write(&self, ctx: &WriteContext) -> Result<(), ErrorKind> {
        if self.committed.swap(true, Ordering::AcqRel) {
            log::debug!("policy immutable: file {} already written once, rejecting", ctx.file_id);
            return Err(ErrorKind::Permission);
        }
        Ok(())
    }

    fn on_commit_race(&self, ctx: &CommitRaceContext) -> RaceAction {
        log::debug!("policy immutable: file {} already committed, refusing race", ctx.file_id);
        RaceAction::GiveUp
    }
}

/// All writes within an open/close span are buffered client-side and
/// committed atomically at close or sync, matching spec §9 Open Question
/// (b)'s stronger client-side flush contract.
pub struct TransactionalPolicy {
    max_retries: u32,
}

impl TransactionalPolicy {
    pub fn new() -> Self {
        TransactionalPolicy { max_retries: 32 }
    }
}

impl Default for TransactionalPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyPolicy for TransactionalPolicy {
    fn name(&self) -> &'static str {
        "transactional"
    }

    fn force_commit(&self) -> bool {
        false
    }

    fn delay_commit(&self) -> bool {
        true
    }

    fn max_commit_retries(&self) -> Option<u32> {
        Some(self.max_retries)
    }

    fn on_sync(&self, ctx: &SyncContext) {
        log::debug!("policy transactional: flushing buffered writes for file {}", ctx.file_id);
    }
}

/// Parallel-filesystem-style: commits happen eagerly like POSIX, but the
/// hash cache is never trusted without coherence traffic, trading latency
/// for strict multi-writer visibility (closest to the original PVFS
/// client's own default).
pub struct PvfsPolicy;

impl ConsistencyPolicy for PvfsPolicy {
    fn name(&self) -> &'static str {
        "pvfs"
    }

    fn hcache_coherence(&self) -> bool {
        false
    }

    /// §4.4: "writes do not retry on race (caller sees the conflicting
    /// commit via errno)" — a single racing WCOMMIT gives up immediately
    /// rather than refreshing hashes and resubmitting.
    fn max_commit_retries(&self) -> Option<u32> {
        Some(0)
    }
}

/// Look up a named policy, the way `mnt/mount_options.rs` resolves a
/// `cons=<name>` mount option into a concrete implementation.
pub fn by_name(name: &str) -> Result<Box<dyn ConsistencyPolicy>, std::io::Error> {
    Ok(match name {
        "posix" => Box::new(PosixPolicy),
        "session" => Box::new(SessionPolicy),
        "immutable" => Box::new(ImmutablePolicy::new()),
        "transactional" => Box::new(TransactionalPolicy::new()),
        "pvfs" => Box::new(PvfsPolicy),
        other => {
            return Err(crate::error::tagged(
                ErrorKind::Protocol,
                format!("unknown consistency policy '{other}'"),
            ))
        }
    })
}
