//! Error taxonomy for the client data path.
//!
//! Every fallible operation in this crate returns [`std::io::Result`]. Rather
//! than introduce a crate-specific `Result`/`Error` type, fallible layers
//! classify failures into [`ErrorKind`] and attach that classification to a
//! plain [`std::io::Error`] (same idiom `fuser` uses with raw errno
//! inspection via `err.raw_os_error()`), so callers that need to branch on
//! "was this transient" can do so with [`classify`] without every layer
//! having to match a bespoke enum.

use std::fmt;
use std::io;

/// Coarse classification of a failure, per spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection reset, broken pipe, refused, or too-many-open-files.
    /// Retried up to 5 times with a 5 second sleep at the daemon level.
    TransientNet,
    /// A WCOMMIT was rejected because the submitted pre-image no longer
    /// matches the manager's current hash list.
    AgainRace,
    /// A data-server GET reported the content as absent; treated as a
    /// zero-filled chunk, never surfaced to the caller as an error.
    NotFound,
    /// Bad magic or unsupported release number on a wire frame. Fatal to
    /// the in-flight operation; the socket is dropped and reopened.
    Protocol,
    /// Surfaced to the caller unchanged.
    Permission,
    /// Surfaced to the caller unchanged.
    NoSpace,
    /// Surfaced to the caller unchanged.
    NoEntry,
    /// The upcall was abandoned by its caller (process killed, INTR).
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNet => "transient network error",
            ErrorKind::AgainRace => "commit race, current hashes returned",
            ErrorKind::NotFound => "content not found",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Permission => "permission denied",
            ErrorKind::NoSpace => "no space left",
            ErrorKind::NoEntry => "no such file or directory",
            ErrorKind::Cancelled => "operation cancelled",
        };
        f.write_str(s)
    }
}

/// Marker type attached to an [`io::Error`] via [`io::Error::new`] so that
/// [`classify`] can recover the [`ErrorKind`] later without re-deriving it
/// from a raw errno.
#[derive(Debug)]
struct Tagged(ErrorKind);

impl fmt::Display for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Tagged {}

/// Build an [`io::Error`] carrying the given [`ErrorKind`].
pub fn tagged(kind: ErrorKind, msg: impl Into<String>) -> io::Error {
    let tagged = Tagged(kind);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", tagged, msg.into()))
}

/// Classify a raw OS error the way `fuser`'s `session.rs`/`channel.rs`
/// classify `raw_os_error()` results, extended with the CAPFS-specific
/// kinds that don't come from a syscall (race, not-found-as-zero-fill).
pub fn classify_os_error(err: &io::Error) -> ErrorKind {
    match err.raw_os_error() {
        Some(libc::ECONNRESET)
        | Some(libc::EPIPE)
        | Some(libc::ECONNREFUSED)
        | Some(libc::ENFILE)
        | Some(libc::EMFILE) => ErrorKind::TransientNet,
        Some(libc::EAGAIN) => ErrorKind::AgainRace,
        Some(libc::ENOENT) => ErrorKind::NoEntry,
        Some(libc::EACCES) | Some(libc::EPERM) => ErrorKind::Permission,
        Some(libc::ENOSPC) => ErrorKind::NoSpace,
        _ => ErrorKind::Protocol,
    }
}

/// True if the daemon-level retry loop (§4.8) should retry this error.
pub fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TransientNet)
}

pub(crate) fn io_err(kind: io::ErrorKind, msg: impl Into<String>) -> io::Error {
    io::Error::new(kind, msg.into())
}
