//! C9: the invalidation callback service (§4.9). `fuser`'s
//! `notify.rs` gives FUSE a `Notifier` that *sends* `inval_entry`/
//! `inval_inode`/`store` messages to the kernel. CAPFS's daemon sits on
//! the other end of an equivalent RPC: the manager calls *us* to push an
//! invalidation before granting a conflicting WCOMMIT elsewhere, and we
//! must apply it to the hash cache and ack before the manager proceeds —
//! the callback-before-grant invariant from spec.md §4.9.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crate::error::tagged;
use crate::error::ErrorKind;
use crate::hashcache::HashCache;
use crate::wire::dataserver::Digest;
use crate::wire::upcall::{DowncallHeader, UpcallHeader, UpcallOp};
use crate::wire::{read_header, read_trailer, write_frame};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct InvalEntryPayload {
    file_id: u64,
    chunk_index: u64,
    /// Client ID of the committer that triggered this invalidation (§4.9).
    /// If it matches this daemon's own ID, the entry is skipped: the write
    /// that invalidated it is this client's own, and its hash cache already
    /// holds the fresher value from the WCOMMIT it just performed.
    owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct InvalInodePayload {
    file_id: u64,
    begin_chunk: u64,
    nchunks: u64,
    owner: u64,
}

/// Fixed header for `UpdateHashes`; the digests themselves (`count` of
/// them) follow as a trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct UpdateHashesFixed {
    file_id: u64,
    begin_chunk: u64,
    count: u64,
    owner: u64,
}

/// Listens for manager-initiated invalidation callbacks and applies them to
/// the shared [`HashCache`] before acking. One instance per daemon process,
/// bound once at startup and registered with every manager via
/// [`crate::mgrclient::ManagerClient::register_callback`].
pub struct CallbackService {
    listener: TcpListener,
    hashcache: Arc<HashCache>,
    client_id: u64,
}

impl CallbackService {
    /// `client_id` is the same ID passed to `register_callback` at mount
    /// time, so a callback carrying `owner == client_id` can be recognized
    /// as this daemon's own commit and skipped.
    pub fn bind(addr: &str, hashcache: Arc<HashCache>, client_id: u64) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(CallbackService { listener, hashcache, client_id })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Block accepting callback connections, handling each on its own
    /// thread so a slow manager connection never blocks another one's
    /// invalidation. Returns only on a listener error (socket closed).
    pub fn serve_forever(self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = stream?;
            let hashcache = self.hashcache.clone();
            let client_id = self.client_id;
            std::thread::spawn(move || {
                if let Err(e) = handle_connection(stream, &hashcache, client_id) {
                    log::warn!("callback connection error: {e}");
                }
            });
        }
        Ok(())
    }
}

fn handle_connection(mut stream: TcpStream, hashcache: &HashCache, client_id: u64) -> io::Result<()> {
    loop {
        let header: UpcallHeader = match read_header(&mut stream) {
            Ok(h) => h,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let op = header.validate()?;
        let body = read_trailer(&mut stream, header.len as usize)?;
        match op {
            UpcallOp::InvalEntry => {
                let payload = InvalEntryPayload::read_from_bytes(&body)
                    .map_err(|_| tagged(ErrorKind::Protocol, "truncated inval_entry callback"))?;
                if payload.owner != client_id {
                    hashcache.invalidate(payload.file_id, payload.chunk_index);
                    log::debug!("invalidated file {} chunk {}", payload.file_id, payload.chunk_index);
                } else {
                    log::trace!("skipping self-originated inval_entry for file {}", payload.file_id);
                }
            }
            UpcallOp::InvalInode => {
                let payload = InvalInodePayload::read_from_bytes(&body)
                    .map_err(|_| tagged(ErrorKind::Protocol, "truncated inval_inode callback"))?;
                if payload.owner != client_id {
                    hashcache.invalidate_bitmap(payload.file_id, payload.begin_chunk, payload.nchunks);
                    log::debug!(
                        "invalidated file {} chunks [{}, {})",
                        payload.file_id,
                        payload.begin_chunk,
                        payload.begin_chunk + payload.nchunks
                    );
                } else {
                    log::trace!("skipping self-originated inval_inode for file {}", payload.file_id);
                }
            }
            UpcallOp::UpdateHashes => {
                let mut it = crate::wire::argument::ArgumentIterator::new(&body);
                let fixed: &UpdateHashesFixed = it
                    .fetch()
                    .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated update_hashes callback"))?;
                let fixed = *fixed;
                let digests: &[Digest] = it
                    .fetch_slice(fixed.count as usize)
                    .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated update_hashes digests"))?;
                if fixed.owner != client_id {
                    hashcache.put_hashes(fixed.file_id, fixed.begin_chunk, digests);
                    log::debug!(
                        "updated file {} hashes [{}, {})",
                        fixed.file_id,
                        fixed.begin_chunk,
                        fixed.begin_chunk + fixed.count
                    );
                } else {
                    log::trace!("skipping self-originated update_hashes for file {}", fixed.file_id);
                }
            }
            other => {
                return Err(tagged(ErrorKind::Protocol, format!("unexpected callback opcode {other:?}")));
            }
        }
        // Ack only after the cache mutation above has completed, so the
        // manager never proceeds to grant a conflicting commit while this
        // client might still answer reads from the stale entry.
        write_frame(&mut stream, &DowncallHeader::ok(header.unique, 0), &[])?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn inval_entry_callback_clears_cache_and_acks() {
        let hashcache = Arc::new(HashCache::new());
        hashcache.insert(1, 0, [9u8; 20]);
        let service = CallbackService::bind("127.0.0.1:0", hashcache.clone(), 99).unwrap();
        let addr = service.listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = service.serve_forever();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let payload = InvalEntryPayload {
            file_id: 1,
            chunk_index: 0,
            owner: 1,
        };
        let header = UpcallHeader::new(UpcallOp::InvalEntry, 42, 0, 0, 0, payload.as_bytes().len() as u32);
        write_frame(&mut stream, &header, payload.as_bytes()).unwrap();
        let ack: DowncallHeader = read_header(&mut stream).unwrap();
        ack.validate().unwrap();
        assert_eq!(ack.unique, 42);
        assert_eq!(ack.status, 0);
        assert!(hashcache.get(1, 0).is_none());
    }

    #[test]
    fn inval_entry_from_self_is_skipped() {
        let hashcache = Arc::new(HashCache::new());
        hashcache.insert(1, 0, [9u8; 20]);
        let service = CallbackService::bind("127.0.0.1:0", hashcache.clone(), 7).unwrap();
        let addr = service.listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = service.serve_forever();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let payload = InvalEntryPayload {
            file_id: 1,
            chunk_index: 0,
            owner: 7,
        };
        let header = UpcallHeader::new(UpcallOp::InvalEntry, 1, 0, 0, 0, payload.as_bytes().len() as u32);
        write_frame(&mut stream, &header, payload.as_bytes()).unwrap();
        let ack: DowncallHeader = read_header(&mut stream).unwrap();
        ack.validate().unwrap();
        assert!(hashcache.get(1, 0).is_some());
    }

    #[test]
    fn update_hashes_populates_cache() {
        let hashcache = Arc::new(HashCache::new());
        let service = CallbackService::bind("127.0.0.1:0", hashcache.clone(), 7).unwrap();
        let addr = service.listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = service.serve_forever();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let fixed = UpdateHashesFixed {
            file_id: 5,
            begin_chunk: 2,
            count: 2,
            owner: 1,
        };
        let mut trailer = fixed.as_bytes().to_vec();
        trailer.extend_from_slice(&[3u8; 20]);
        trailer.extend_from_slice(&[4u8; 20]);
        let header = UpcallHeader::new(UpcallOp::UpdateHashes, 2, 0, 0, 0, trailer.len() as u32);
        write_frame(&mut stream, &header, &trailer).unwrap();
        let ack: DowncallHeader = read_header(&mut stream).unwrap();
        ack.validate().unwrap();
        assert_eq!(hashcache.get(5, 2).unwrap().digest, [3u8; 20]);
        assert_eq!(hashcache.get(5, 3).unwrap().digest, [4u8; 20]);
    }
}
