//! C5: the content-addressable data-server client (§4.5). Structured after
//! `examples/wofferl-proxmox-backup/src/backup/read_chunk.rs`'s
//! `ReadChunk`/`AsyncReadChunk` split between "read bytes for a digest" and
//! "read bytes and verify the digest", adapted to CAPFS's synchronous
//! GET/PUT instead of a local chunk store.
//!
//! Two backends share one call surface (§4.1): a pooled TCP connection, or
//! a connectionless [`DatagramTransport`] exchange. Both resolve to the
//! same `(DsAckHeader, Vec<u8>)` shape via [`DataServerClient::roundtrip`],
//! so `get`/`put`/`ping`/`statfs`/`remove_all` don't know or care which
//! transport backs a given client.

use std::io::{self, Cursor, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use sha1::{Digest as _, Sha1};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{tagged, ErrorKind};
use crate::transport::{ConnectionPool, DatagramTransport};
use crate::wire::dataserver::{Digest, DigestHeader, DsAckHeader, DsOpcode, DsRequestHeader, DsStatfsAckFixed, DsStatus, DIGEST_LEN};
use crate::wire::{read_header, read_trailer};

enum Backend {
    Tcp(Arc<ConnectionPool>),
    Udp(Arc<DatagramTransport>),
}

pub struct DataServerClient {
    backend: Backend,
}

impl DataServerClient {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        DataServerClient { backend: Backend::Tcp(pool) }
    }

    pub fn new_udp(transport: Arc<DatagramTransport>) -> Self {
        DataServerClient { backend: Backend::Udp(transport) }
    }

    /// Build a request frame (fixed header followed by trailing bytes) as
    /// one contiguous buffer, the shape both the TCP path (two `write_all`
    /// calls) and the UDP path (one datagram) need.
    fn build_frame<T: IntoBytes + Immutable>(header: &T, trailer: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(size_of::<T>() + trailer.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(trailer);
        buf
    }

    /// Send one request frame and parse the ack header plus whatever
    /// trailing bytes the caller says to expect, regardless of backend.
    fn roundtrip(&self, addr: SocketAddr, frame: &[u8], expect_trailer: impl Fn(&DsAckHeader) -> usize) -> io::Result<(DsAckHeader, Vec<u8>)> {
        match &self.backend {
            Backend::Tcp(pool) => {
                let mut conn = pool.get(addr)?;
                let result = (|| -> io::Result<(DsAckHeader, Vec<u8>)> {
                    conn.stream().write_all(frame)?;
                    conn.stream().flush()?;
                    let ack: DsAckHeader = read_header(conn.stream())?;
                    ack.validate()?;
                    let trailer = read_trailer(conn.stream(), expect_trailer(&ack))?;
                    Ok((ack, trailer))
                })();
                if result.is_err() {
                    conn.mark_broken();
                }
                result
            }
            Backend::Udp(transport) => {
                let reply = transport.exchange(addr, frame)?;
                let mut cur = Cursor::new(reply);
                let ack: DsAckHeader = read_header(&mut cur)?;
                ack.validate()?;
                let trailer = read_trailer(&mut cur, expect_trailer(&ack))?;
                Ok((ack, trailer))
            }
        }
    }

    /// Fetch the chunk named by `digest`. `Ok(None)` means the server has no
    /// content under that digest — per §4.6 the caller treats that as a
    /// zero-filled chunk, never as an error.
    pub fn get(&self, addr: SocketAddr, digest: &Digest) -> io::Result<Option<Vec<u8>>> {
        let req = DsRequestHeader::new(DsOpcode::Get, DIGEST_LEN as u64);
        let digest_hdr = DigestHeader { digest: *digest };
        let frame = Self::build_frame(&req, digest_hdr.as_bytes());
        let (ack, body) = self.roundtrip(addr, &frame, |ack| ack.dsize as usize)?;
        match ack.status() {
            DsStatus::NotFound => Ok(None),
            DsStatus::Error => Err(tagged(ErrorKind::Protocol, format!("GET failed, errno {}", ack.errno))),
            DsStatus::Ok => {
                verify_digest(digest, &body)?;
                Ok(Some(body))
            }
        }
    }

    /// Store `data`, which the caller has already hashed to `digest`
    /// (the pipeline computes the digest once and reuses it for both the
    /// WCOMMIT pre-image and this PUT).
    pub fn put(&self, addr: SocketAddr, digest: &Digest, data: &[u8]) -> io::Result<()> {
        verify_digest(digest, data)?;
        let mut trailer = Vec::with_capacity(DIGEST_LEN + data.len());
        trailer.extend_from_slice(digest);
        trailer.extend_from_slice(data);
        let req = DsRequestHeader::new(DsOpcode::Put, trailer.len() as u64);
        let frame = Self::build_frame(&req, &trailer);
        let (ack, _) = self.roundtrip(addr, &frame, |_| 0)?;
        match ack.status() {
            DsStatus::Ok => Ok(()),
            _ => Err(tagged(ErrorKind::Protocol, format!("PUT failed, errno {}", ack.errno))),
        }
    }

    /// `IOD_NOOP`-equivalent liveness probe, used by the transport layer's
    /// health checks and by `mount.capfs` at mount time.
    pub fn ping(&self, addr: SocketAddr) -> io::Result<()> {
        let req = DsRequestHeader::new(DsOpcode::Ping, 0);
        let frame = Self::build_frame(&req, &[]);
        self.roundtrip(addr, &frame, |_| 0)?;
        Ok(())
    }

    pub fn statfs(&self, addr: SocketAddr) -> io::Result<(u64, u64)> {
        let req = DsRequestHeader::new(DsOpcode::Statfs, 0);
        let frame = Self::build_frame(&req, &[]);
        let (_, trailer) = self.roundtrip(addr, &frame, |_| size_of::<DsStatfsAckFixed>())?;
        let stat = DsStatfsAckFixed::read_from_bytes(&trailer)
            .map_err(|_| tagged(ErrorKind::Protocol, "truncated statfs ack"))?;
        Ok((stat.tot_bytes, stat.free_bytes))
    }

    /// Admin op (§4.5): wipe everything a data server holds.
    pub fn remove_all(&self, addr: SocketAddr) -> io::Result<()> {
        let req = DsRequestHeader::new(DsOpcode::RemoveAll, 0);
        let frame = Self::build_frame(&req, &[]);
        let (ack, _) = self.roundtrip(addr, &frame, |_| 0)?;
        match ack.status() {
            DsStatus::Ok => Ok(()),
            _ => Err(tagged(ErrorKind::Protocol, format!("REMOVE_ALL failed, errno {}", ack.errno))),
        }
    }
}

fn verify_digest(expected: &Digest, data: &[u8]) -> io::Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let got: Digest = hasher.finalize().into();
    if &got != expected {
        return Err(tagged(ErrorKind::Protocol, "chunk content does not match its digest"));
    }
    Ok(())
}

/// Compute the content-address for a chunk's bytes (§3).
pub fn hash_chunk(data: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
