//! End-to-end exercises of C7's read/write pipeline against in-process mock
//! manager and data servers speaking the real wire protocols over TCP
//! loopback, the way `examples/original_source/lib/capfs_write_list.c`'s
//! job-retry loop is tested against a real `iod` in the original test
//! suite rather than a mocked transport layer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capfs::dsclient::{hash_chunk, DataServerClient};
use capfs::hashcache::HashCache;
use capfs::mapper::{StripeParams, CHUNK};
use capfs::mgrclient::ManagerClient;
use capfs::openfile::OpenFileTable;
use capfs::pipeline::Pipeline;
use capfs::policy::{ConsistencyPolicy, PosixPolicy, TransactionalPolicy};
use capfs::transport::ConnectionPool;
use capfs::wire::dataserver::{Digest, DsAckHeader, DsOpcode, DsRequestHeader, DIGEST_LEN};
use capfs::wire::manager::{
    AckHeader, FileStat, GethashesReqFixed, HashesAckFixed, MgrOpcode, RequestHeader, WcommitReqFixed,
};
use capfs::wire::{read_header, read_trailer, write_frame};
use zerocopy::IntoBytes;

/// A single-process stand-in for a data server: an in-memory content-
/// addressed blob store behind the real `DsOpcode::{Get,Put}` wire frames.
fn spawn_mock_data_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let store: Arc<Mutex<HashMap<Digest, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            let store = store.clone();
            std::thread::spawn(move || loop {
                let req: DsRequestHeader = match read_header(&mut stream) {
                    Ok(r) => r,
                    Err(_) => return,
                };
                match req.validate().unwrap() {
                    DsOpcode::Get => {
                        let mut digest = [0u8; DIGEST_LEN];
                        stream.read_exact(&mut digest).unwrap();
                        let body = store.lock().unwrap().get(&digest).cloned();
                        match body {
                            Some(data) => {
                                let ack = DsAckHeader::ok(DsOpcode::Get, data.len() as u64);
                                stream.write_all(ack.as_bytes()).unwrap();
                                stream.write_all(&data).unwrap();
                            }
                            None => {
                                let ack = DsAckHeader::not_found(DsOpcode::Get);
                                stream.write_all(ack.as_bytes()).unwrap();
                            }
                        }
                    }
                    DsOpcode::Put => {
                        let mut digest = [0u8; DIGEST_LEN];
                        stream.read_exact(&mut digest).unwrap();
                        let body = read_trailer(&mut stream, (req.dsize as usize) - DIGEST_LEN).unwrap();
                        store.lock().unwrap().insert(digest, body);
                        let ack = DsAckHeader::ok(DsOpcode::Put, 0);
                        stream.write_all(ack.as_bytes()).unwrap();
                    }
                    _ => return,
                }
            });
            break;
        }
    });
    addr
}

/// A single-process stand-in for the manager: tracks one file's hash list
/// per chunk and answers GETHASHES/WCOMMIT with real compare-and-swap
/// semantics, including the §4.6 race path.
struct MockManagerState {
    hashes: Mutex<HashMap<u64, Digest>>,
    size: AtomicU32,
    force_race_once: Mutex<bool>,
}

fn spawn_mock_manager(state: Arc<MockManagerState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            let state = state.clone();
            std::thread::spawn(move || loop {
                let req: RequestHeader = match read_header(&mut stream) {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let opcode = req.validate().unwrap();
                let mut trailer = vec![0u8; req.dsize as usize];
                stream.read_exact(&mut trailer).unwrap();
                match opcode {
                    MgrOpcode::Gethashes => {
                        let fixed: &GethashesReqFixed =
                            zerocopy::Ref::<_, GethashesReqFixed>::from_prefix(&trailer[..]).unwrap().0.into_ref();
                        let digest = state.hashes.lock().unwrap().get(&fixed.begin_chunk).copied().unwrap_or([0u8; 20]);
                        let mut body = HashesAckFixed {
                            nhashes: 1,
                            stat: FileStat {
                                size: state.size.load(Ordering::SeqCst) as u64,
                                mtime: 0,
                            },
                        }
                        .as_bytes()
                        .to_vec();
                        body.extend_from_slice(&digest);
                        let ack = AckHeader::ok(MgrOpcode::Gethashes, body.len() as u64);
                        stream.write_all(ack.as_bytes()).unwrap();
                        stream.write_all(&body).unwrap();
                    }
                    MgrOpcode::Wcommit => {
                        let fixed: &WcommitReqFixed =
                            zerocopy::Ref::<_, WcommitReqFixed>::from_prefix(&trailer[..]).unwrap().0.into_ref();
                        let rest = &trailer[std::mem::size_of::<WcommitReqFixed>()..];
                        let rest = &rest[4..]; // skip capability
                        let nchunks = fixed.write_size as usize;
                        let old_hashes = &rest[..nchunks * DIGEST_LEN];
                        let new_hashes = &rest[nchunks * DIGEST_LEN..];

                        let mut force_race = state.force_race_once.lock().unwrap();
                        let mut hashes = state.hashes.lock().unwrap();
                        let mut race = false;
                        for i in 0..nchunks {
                            let chunk = fixed.begin_chunk + i as u64;
                            let current = hashes.get(&chunk).copied().unwrap_or([0u8; 20]);
                            let claimed: Digest = old_hashes[i * DIGEST_LEN..(i + 1) * DIGEST_LEN].try_into().unwrap();
                            if current != claimed || *force_race {
                                race = true;
                            }
                        }
                        if race {
                            *force_race = false;
                            let mut body = HashesAckFixed {
                                nhashes: nchunks as u64,
                                stat: FileStat { size: state.size.load(Ordering::SeqCst) as u64, mtime: 0 },
                            }
                            .as_bytes()
                            .to_vec();
                            for i in 0..nchunks {
                                let chunk = fixed.begin_chunk + i as u64;
                                body.extend_from_slice(&hashes.get(&chunk).copied().unwrap_or([0u8; 20]));
                            }
                            let ack = AckHeader::error(MgrOpcode::Wcommit, libc::EAGAIN as u32, body.len() as u64);
                            stream.write_all(ack.as_bytes()).unwrap();
                            stream.write_all(&body).unwrap();
                        } else {
                            for i in 0..nchunks {
                                let chunk = fixed.begin_chunk + i as u64;
                                let digest: Digest = new_hashes[i * DIGEST_LEN..(i + 1) * DIGEST_LEN].try_into().unwrap();
                                hashes.insert(chunk, digest);
                            }
                            let body = HashesAckFixed {
                                nhashes: 0,
                                stat: FileStat { size: state.size.load(Ordering::SeqCst) as u64, mtime: 1 },
                            };
                            let ack = AckHeader::ok(MgrOpcode::Wcommit, std::mem::size_of::<HashesAckFixed>() as u64);
                            stream.write_all(ack.as_bytes()).unwrap();
                            stream.write_all(body.as_bytes()).unwrap();
                        }
                    }
                    _ => return,
                }
            });
            break;
        }
    });
    addr
}

fn test_pipeline_with_policy(mgr_addr: SocketAddr, policy: Arc<dyn ConsistencyPolicy>) -> (Pipeline, Arc<HashCache>, OpenFileTable) {
    let ds_pool = Arc::new(ConnectionPool::new(Duration::from_secs(2), Duration::from_secs(2)));
    let mgr_pool = Arc::new(ConnectionPool::new(Duration::from_secs(2), Duration::from_secs(2)));
    let dsclient = Arc::new(DataServerClient::new(ds_pool));
    let mgrclient = Arc::new(ManagerClient::new(mgr_pool, mgr_addr, 0, 0));
    let hashcache = Arc::new(HashCache::new());
    let pipeline = Pipeline::new(dsclient, mgrclient, hashcache.clone(), policy);
    let table = OpenFileTable::new();
    (pipeline, hashcache, table)
}

fn test_pipeline(mgr_addr: SocketAddr) -> (Pipeline, Arc<HashCache>, OpenFileTable) {
    test_pipeline_with_policy(mgr_addr, Arc::new(PosixPolicy))
}

#[test]
fn write_then_read_back_round_trips_unaligned_span() {
    let ds_addr = spawn_mock_data_server();
    let state = Arc::new(MockManagerState {
        hashes: Mutex::new(HashMap::new()),
        size: AtomicU32::new(0),
        force_race_once: Mutex::new(false),
    });
    let mgr_addr = spawn_mock_manager(state);
    let stripe = StripeParams {
        stripe_size: CHUNK as u32,
        server_count: 1,
        base: 0,
    };
    let (pipeline, _cache, table) = test_pipeline(mgr_addr);
    let file = table.insert(1, stripe, vec![ds_addr], 0, 0);

    // Unaligned write spanning two chunks: bytes [CHUNK-5, CHUNK+5) touch
    // chunk 0 (partial, needs RMW) and chunk 1 (partial).
    let offset = CHUNK - 5;
    let payload: Vec<u8> = (0..10).collect();
    pipeline.write(&file, offset, &payload).unwrap();
    assert_eq!(file.size(), offset + 10);

    let got = pipeline.read(&file, offset, 10).unwrap();
    assert_eq!(got, payload);

    // Bytes before the write within chunk 0 should read back as zero.
    let leading = pipeline.read(&file, 0, 10).unwrap();
    assert_eq!(leading, vec![0u8; 10]);
}

#[test]
fn empty_file_reads_back_nothing() {
    let ds_addr = spawn_mock_data_server();
    let state = Arc::new(MockManagerState {
        hashes: Mutex::new(HashMap::new()),
        size: AtomicU32::new(0),
        force_race_once: Mutex::new(false),
    });
    let mgr_addr = spawn_mock_manager(state);
    let stripe = StripeParams {
        stripe_size: CHUNK as u32,
        server_count: 1,
        base: 0,
    };
    let (pipeline, _cache, table) = test_pipeline(mgr_addr);
    let file = table.insert(1, stripe, vec![ds_addr], 0, 0);

    let got = pipeline.read(&file, 0, 100).unwrap();
    assert!(got.is_empty());
}

#[test]
fn commit_race_is_retried_and_succeeds() {
    let ds_addr = spawn_mock_data_server();
    let chunk = CHUNK as usize;
    let state = Arc::new(MockManagerState {
        hashes: Mutex::new(HashMap::new()),
        size: AtomicU32::new(chunk as u32),
        force_race_once: Mutex::new(true),
    });
    let mgr_addr = spawn_mock_manager(state);
    let stripe = StripeParams {
        stripe_size: CHUNK as u32,
        server_count: 1,
        base: 0,
    };
    let (pipeline, hashcache, table) = test_pipeline(mgr_addr);
    let file = table.insert(1, stripe, vec![ds_addr], chunk as u64, 0);

    // The mock manager forces exactly one race on the first WCOMMIT; the
    // pipeline must refresh its pre-image from the race reply and resubmit
    // rather than surfacing an error to the caller.
    pipeline.write(&file, 0, &vec![7u8; chunk]).unwrap();
    let got = pipeline.read(&file, 0, chunk as u64).unwrap();
    assert_eq!(got, vec![7u8; chunk]);
    assert!(hashcache.get(1, 0).is_some());
}

#[test]
fn full_chunk_write_skips_read_modify_write() {
    let ds_addr = spawn_mock_data_server();
    let state = Arc::new(MockManagerState {
        hashes: Mutex::new(HashMap::new()),
        size: AtomicU32::new(0),
        force_race_once: Mutex::new(false),
    });
    let mgr_addr = spawn_mock_manager(state);
    let stripe = StripeParams {
        stripe_size: CHUNK as u32,
        server_count: 1,
        base: 0,
    };
    let (pipeline, _cache, table) = test_pipeline(mgr_addr);
    let file = table.insert(1, stripe, vec![ds_addr], 0, 0);

    let chunk = CHUNK as usize;
    let body = vec![3u8; chunk];
    pipeline.write(&file, 0, &body).unwrap();
    let expect_digest = hash_chunk(&body);
    let got = pipeline.read(&file, 0, chunk as u64).unwrap();
    assert_eq!(hash_chunk(&got), expect_digest);
}

#[test]
fn delay_commit_batches_writes_until_sync() {
    let ds_addr = spawn_mock_data_server();
    let chunk = CHUNK as usize;
    let state = Arc::new(MockManagerState {
        hashes: Mutex::new(HashMap::new()),
        size: AtomicU32::new(0),
        force_race_once: Mutex::new(false),
    });
    let mgr_addr = spawn_mock_manager(state);
    let stripe = StripeParams {
        stripe_size: CHUNK as u32,
        server_count: 1,
        base: 0,
    };
    let (pipeline, hashcache, table) = test_pipeline_with_policy(mgr_addr, Arc::new(TransactionalPolicy::new()));
    let file = table.insert(1, stripe, vec![ds_addr], 0, 0);

    // Two whole-chunk writes land in the staging buffer without ever
    // reaching the mock manager until `sync`.
    pipeline.write(&file, 0, &vec![1u8; chunk]).unwrap();
    pipeline.write(&file, chunk as u64, &vec![2u8; chunk]).unwrap();
    assert!(file.has_pending());
    assert!(hashcache.get(1, 0).is_none());

    pipeline.sync(&file).unwrap();
    assert!(!file.has_pending());
    assert!(hashcache.get(1, 0).is_some());
    assert!(hashcache.get(1, 1).is_some());

    let got = pipeline.read(&file, 0, 2 * chunk as u64).unwrap();
    assert_eq!(&got[..chunk], &vec![1u8; chunk][..]);
    assert_eq!(&got[chunk..], &vec![2u8; chunk][..]);
}
