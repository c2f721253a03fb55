//! C6: manager RPC client. One method per opcode in
//! `examples/original_source/lib/req.h`'s `mreq`/`mack` table, following the
//! send-then-check-status-then-read-trailer shape that
//! `examples/original_source/lib/capfs_gethashes.c`'s `send_mreq_saddr` /
//! ack-status-check uses for every op, not just GETHASHES.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use zerocopy::IntoBytes;

use crate::error::{tagged, ErrorKind};
use crate::transport::ConnectionPool;
use crate::wire::manager::*;
use crate::wire::{read_header, read_trailer, write_frame};
use crate::wire::dataserver::Digest;

pub struct OpenReply {
    pub meta: FileMeta,
    pub capability: u32,
    pub servers: Vec<IodInfo>,
    pub hashes: Vec<Digest>,
}

pub struct StatfsReply {
    pub tot_bytes: u64,
    pub free_bytes: u64,
    pub tot_files: u32,
    pub free_files: u32,
    pub namelen: u32,
}

pub struct DirentEntry {
    pub inode: u64,
    pub offset: u64,
    pub name: String,
}

/// Outcome of a WCOMMIT attempt (§4.6/§4.4). A race is not an error: the
/// manager hands back the chunks' current hashes so the pipeline can
/// recompute a pre-image and retry per the active policy.
pub enum WcommitOutcome {
    Committed { stat: FileStat },
    Race { current_hashes: Vec<Digest>, stat: FileStat },
}

pub struct ManagerClient {
    pool: Arc<ConnectionPool>,
    addr: SocketAddr,
    uid: u32,
    gid: u32,
}

impl ManagerClient {
    pub fn new(pool: Arc<ConnectionPool>, addr: SocketAddr, uid: u32, gid: u32) -> Self {
        ManagerClient { pool, addr, uid, gid }
    }

    fn roundtrip(&self, opcode: MgrOpcode, fixed: &[u8], trailer: &[u8]) -> io::Result<(AckHeader, Vec<u8>)> {
        let mut conn = self.pool.get(self.addr)?;
        let result = (|| -> io::Result<(AckHeader, Vec<u8>)> {
            let dsize = (fixed.len() + trailer.len()) as u64;
            let header = RequestHeader::new(opcode, self.uid, self.gid, dsize);
            write_frame(conn.stream(), &header, &[fixed, trailer].concat())?;
            let ack: AckHeader = read_header(conn.stream())?;
            ack.validate()?;
            let body = read_trailer(conn.stream(), ack.dsize as usize)?;
            Ok((ack, body))
        })();
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }

    /// Any non-race, non-zero status is a hard failure; map it straight to
    /// an `io::Error` tagged from the wire errno.
    fn check_ok(ack: &AckHeader) -> io::Result<()> {
        if ack.status != 0 {
            return Err(errno_to_error(ack.errno));
        }
        Ok(())
    }

    pub fn open(&self, name: &str, flags: u32, mode: u32, prefetch_count: u32) -> io::Result<OpenReply> {
        let fixed = OpenReqFixed {
            flags,
            mode,
            prefetch_count,
            pad: 0,
        };
        let trailer = encode_names(&[name]);
        let (ack, body) = self.roundtrip(MgrOpcode::Open, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)?;
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let open_fixed: &OpenAckFixed = it
            .fetch()
            .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated OPEN ack"))?;
        let servers: &[IodInfo] = it
            .fetch_slice(open_fixed.meta.server_count as usize)
            .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated OPEN server list"))?;
        let hashes: &[Digest] = it
            .fetch_slice(prefetch_count as usize)
            .unwrap_or(&[]);
        crate::mapper::StripeParams {
            stripe_size: open_fixed.meta.stripe_size,
            server_count: open_fixed.meta.server_count,
            base: open_fixed.meta.base,
        }
        .validate()?;
        Ok(OpenReply {
            meta: open_fixed.meta,
            capability: open_fixed.capability,
            servers: servers.to_vec(),
            hashes: hashes.to_vec(),
        })
    }

    pub fn close(&self, capability: u32) -> io::Result<()> {
        let fixed = capability.to_ne_bytes();
        let (ack, _) = self.roundtrip(MgrOpcode::Close, &fixed, &[])?;
        Self::check_ok(&ack)
    }

    fn stat_like(&self, opcode: MgrOpcode, name: &str) -> io::Result<FileMeta> {
        let trailer = encode_names(&[name]);
        let (ack, body) = self.roundtrip(opcode, &[], &trailer)?;
        Self::check_ok(&ack)?;
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let meta: &FileMeta = it.fetch().ok_or_else(|| tagged(ErrorKind::Protocol, "truncated stat ack"))?;
        Ok(*meta)
    }

    pub fn lstat(&self, name: &str) -> io::Result<FileMeta> {
        self.stat_like(MgrOpcode::Lstat, name)
    }

    pub fn stat(&self, name: &str) -> io::Result<FileMeta> {
        self.stat_like(MgrOpcode::Stat, name)
    }

    pub fn lookup(&self, name: &str) -> io::Result<FileMeta> {
        self.stat_like(MgrOpcode::Lookup, name)
    }

    pub fn fstat(&self, capability: u32) -> io::Result<FileMeta> {
        let fixed = capability.to_ne_bytes();
        let (ack, body) = self.roundtrip(MgrOpcode::Fstat, &fixed, &[])?;
        Self::check_ok(&ack)?;
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let meta: &FileMeta = it.fetch().ok_or_else(|| tagged(ErrorKind::Protocol, "truncated fstat ack"))?;
        Ok(*meta)
    }

    pub fn unlink(&self, name: &str) -> io::Result<()> {
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Unlink, &[], &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let trailer = encode_names(&[from, to]);
        let (ack, _) = self.roundtrip(MgrOpcode::Rename, &[], &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn link(&self, existing: &str, new: &str) -> io::Result<()> {
        let trailer = encode_names(&[existing, new]);
        let (ack, _) = self.roundtrip(MgrOpcode::Link, &[], &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn symlink(&self, target: &str, link_path: &str) -> io::Result<()> {
        let trailer = encode_names(&[target, link_path]);
        let (ack, _) = self.roundtrip(MgrOpcode::Symlink, &[], &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn readlink(&self, name: &str) -> io::Result<String> {
        let trailer = encode_names(&[name]);
        let (ack, body) = self.roundtrip(MgrOpcode::Readlink, &[], &trailer)?;
        Self::check_ok(&ack)?;
        let (target, _) = decode_name(&body)?;
        Ok(target)
    }

    pub fn mkdir(&self, name: &str, mode: u32) -> io::Result<()> {
        let fixed = MkdirReqFixed { mode, pad: 0 };
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Mkdir, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn rmdir(&self, name: &str) -> io::Result<()> {
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Rmdir, &[], &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn truncate(&self, name: &str, length: u64) -> io::Result<()> {
        let fixed = TruncateReqFixed { length };
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Truncate, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn utime(&self, name: &str, actime: i64, modtime: i64) -> io::Result<()> {
        let fixed = UtimeReqFixed { actime, modtime };
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Utime, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn chmod(&self, name: &str, mode: u32) -> io::Result<()> {
        let fixed = ChmodReqFixed { mode, pad: 0 };
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Chmod, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn chown(&self, name: &str, owner: u32, group: u32, force_group_change: bool) -> io::Result<()> {
        let fixed = ChownReqFixed {
            force_group_change: force_group_change as u32,
            owner,
            group,
            pad: 0,
        };
        let trailer = encode_names(&[name]);
        let (ack, _) = self.roundtrip(MgrOpcode::Chown, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)
    }

    pub fn getdents(&self, name: &str, offset: u64, length: u64) -> io::Result<Vec<DirentEntry>> {
        let fixed = GetdentsReqFixed { offset, length };
        let trailer = encode_names(&[name]);
        let (ack, body) = self.roundtrip(MgrOpcode::Getdents, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)?;
        let count = body.len() / std::mem::size_of::<DirentRecord>();
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let records: &[DirentRecord] = it
            .fetch_slice(count)
            .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated GETDENTS ack"))?;
        Ok(records
            .iter()
            .map(|r| {
                let end = r.name.iter().position(|&b| b == 0).unwrap_or(r.name.len());
                DirentEntry {
                    inode: r.inode,
                    offset: r.offset,
                    name: String::from_utf8_lossy(&r.name[..end]).into_owned(),
                }
            })
            .collect())
    }

    pub fn statfs(&self) -> io::Result<StatfsReply> {
        let (ack, body) = self.roundtrip(MgrOpcode::Statfs, &[], &[])?;
        Self::check_ok(&ack)?;
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let fixed: &StatfsAckFixed = it.fetch().ok_or_else(|| tagged(ErrorKind::Protocol, "truncated STATFS ack"))?;
        Ok(StatfsReply {
            tot_bytes: fixed.tot_bytes,
            free_bytes: fixed.free_bytes,
            tot_files: fixed.tot_files,
            free_files: fixed.free_files,
            namelen: fixed.namelen,
        })
    }

    pub fn gethashes(&self, capability: u32, begin_chunk: u64, nchunks: u64) -> io::Result<(Vec<Digest>, FileStat)> {
        let fixed = GethashesReqFixed { begin_chunk, nchunks };
        let cap_bytes = capability.to_ne_bytes();
        let trailer = cap_bytes.to_vec();
        let (ack, body) = self.roundtrip(MgrOpcode::Gethashes, fixed.as_bytes(), &trailer)?;
        Self::check_ok(&ack)?;
        let mut it = crate::wire::argument::ArgumentIterator::new(&body);
        let head: &HashesAckFixed = it
            .fetch()
            .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated GETHASHES ack"))?;
        let hashes: &[Digest] = it
            .fetch_slice(head.nhashes as usize)
            .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated GETHASHES digests"))?;
        Ok((hashes.to_vec(), head.stat))
    }

    /// Compare-and-swap the hash list for `[begin_chunk, begin_chunk +
    /// old_hashes.len())`. `EAGAIN` is decoded as [`WcommitOutcome::Race`]
    /// with the manager's current hashes, not surfaced as an `io::Error` —
    /// callers retry via the active [`crate::policy::ConsistencyPolicy`].
    pub fn wcommit(
        &self,
        capability: u32,
        begin_chunk: u64,
        old_hashes: &[Digest],
        new_hashes: &[Digest],
    ) -> io::Result<WcommitOutcome> {
        let write_size = new_hashes.len() as u64;
        let fixed = WcommitReqFixed { begin_chunk, write_size };
        let mut trailer = capability.to_ne_bytes().to_vec();
        for h in old_hashes {
            trailer.extend_from_slice(h);
        }
        for h in new_hashes {
            trailer.extend_from_slice(h);
        }
        let (ack, body) = self.roundtrip(MgrOpcode::Wcommit, fixed.as_bytes(), &trailer)?;
        if ack.status == 0 {
            let mut it = crate::wire::argument::ArgumentIterator::new(&body);
            let head: &HashesAckFixed = it
                .fetch()
                .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated WCOMMIT ack"))?;
            return Ok(WcommitOutcome::Committed { stat: head.stat });
        }
        if ack.errno == libc::EAGAIN as u32 {
            let mut it = crate::wire::argument::ArgumentIterator::new(&body);
            let head: &HashesAckFixed = it
                .fetch()
                .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated WCOMMIT race ack"))?;
            let current: &[Digest] = it
                .fetch_slice(head.nhashes as usize)
                .ok_or_else(|| tagged(ErrorKind::Protocol, "truncated WCOMMIT race digests"))?;
            return Ok(WcommitOutcome::Race {
                current_hashes: current.to_vec(),
                stat: head.stat,
            });
        }
        Err(errno_to_error(ack.errno))
    }

    /// Register this daemon's callback listener with the manager (§4.9),
    /// done once "at the time of mount" per `capfsd.c`'s
    /// `check_for_registration`.
    pub fn register_callback(&self, client_id: u64, port: u16) -> io::Result<()> {
        let fixed = RegisterCallbackReqFixed {
            client_id,
            port,
            pad: [0; 6],
        };
        let (ack, _) = self.roundtrip(MgrOpcode::RegisterCallback, fixed.as_bytes(), &[])?;
        Self::check_ok(&ack)
    }
}

fn errno_to_error(errno: u32) -> io::Error {
    let err = io::Error::from_raw_os_error(errno as i32);
    tagged(crate::error::classify_os_error(&err), format!("manager returned errno {errno}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn client_for(listener: &TcpListener) -> ManagerClient {
        let addr = listener.local_addr().unwrap();
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1), Duration::from_secs(1)));
        ManagerClient::new(pool, addr, 0, 0)
    }

    #[test]
    fn unlink_happy_path() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let req: RequestHeader = read_header(&mut stream).unwrap();
            assert_eq!(req.validate().unwrap(), MgrOpcode::Unlink);
            let mut trailer = vec![0u8; req.dsize as usize];
            stream.read_exact(&mut trailer).unwrap();
            let ack = AckHeader::ok(MgrOpcode::Unlink, 0);
            stream.write_all(ack.as_bytes()).unwrap();
        });
        client.unlink("/capfs/doomed").unwrap();
    }

    #[test]
    fn wcommit_race_decodes_current_hashes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let req: RequestHeader = read_header(&mut stream).unwrap();
            assert_eq!(req.validate().unwrap(), MgrOpcode::Wcommit);
            let mut trailer = vec![0u8; req.dsize as usize];
            stream.read_exact(&mut trailer).unwrap();
            let mut body = HashesAckFixed {
                nhashes: 1,
                stat: FileStat { size: 4096, mtime: 0 },
            }
            .as_bytes()
            .to_vec();
            body.extend_from_slice(&[9u8; 20]);
            let ack = AckHeader::error(MgrOpcode::Wcommit, libc::EAGAIN as u32, body.len() as u64);
            stream.write_all(ack.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
        });
        let outcome = client
            .wcommit(1, 0, &[[0u8; 20]], &[[1u8; 20]])
            .unwrap();
        match outcome {
            WcommitOutcome::Race { current_hashes, stat } => {
                assert_eq!(current_hashes, vec![[9u8; 20]]);
                assert_eq!(stat.size, 4096);
            }
            WcommitOutcome::Committed { .. } => panic!("expected race"),
        }
    }
}
