//! The CAPFS client daemon. CLI surface follows
//! `examples/original_source/client/capfsd.c`'s getopt string `"dhsn:p:"`:
//! `-d` run in foreground (don't daemonize), `-s` standalone/single-shot,
//! `-n THREADS` worker count, `-p MASK` debug mask, `-h` help.

use std::net::ToSocketAddrs;
use std::sync::Arc;

use clap::Parser;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use capfs::callback::CallbackService;
use capfs::config::{self, MountConfig};
use capfs::daemon::{DowncallResult, UpcallJob, WorkerPool, DEFAULT_NUM_THREADS};
use capfs::dsclient::DataServerClient;
use capfs::error::{tagged, ErrorKind};
use capfs::hashcache::HashCache;
use capfs::mapper::StripeParams;
use capfs::mgrclient::ManagerClient;
use capfs::openfile::{OpenFile, OpenFileTable};
use capfs::pipeline::Pipeline;
use capfs::policy::{CloseContext, ConsistencyPolicy};
use capfs::transport::{ConnectionPool, DatagramTransport};
use capfs::wire::manager::StatfsAckFixed;
use capfs::wire::upcall::{FileIdFixed, OpenUpcallFixed, ReadUpcallFixed, UpcallOp, WriteUpcallFixed};

/// §4.8's 30-second idle timeout on the device read also drives the
/// periodic idle sweep of open files; run it on its own cadence here since
/// there is no real device read loop without the kernel module.
const IDLE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "capfsd", about = "CAPFS client daemon")]
struct Args {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'd')]
    foreground: bool,

    /// Standalone mode: serve one mount without the registration handshake.
    #[arg(short = 's')]
    standalone: bool,

    /// Number of worker threads.
    #[arg(short = 'n', default_value_t = DEFAULT_NUM_THREADS)]
    num_threads: usize,

    /// Debug mask (0 = errors only, higher values add verbosity).
    #[arg(short = 'p', default_value_t = 0)]
    debug_mask: u32,

    /// Manager address, `host:port`.
    #[arg(long)]
    manager: String,

    /// Address the callback service listens on for manager-initiated
    /// invalidations.
    #[arg(long, default_value = "0.0.0.0:0")]
    callback_bind: String,

    /// Mount options, same syntax as `-o` on the `mount.capfs` helper.
    #[arg(short = 'o', long, default_value = "")]
    options: String,
}

/// Read a fixed-layout struct off the front of an upcall payload, the way
/// `wire::argument::ArgumentIterator::fetch` does inside the library crate
/// (not usable here directly: it's `pub(crate)` and this is a separate
/// binary crate).
fn read_fixed<T: FromBytes + KnownLayout + Immutable + Copy>(payload: &[u8]) -> std::io::Result<(T, &[u8])> {
    let size = std::mem::size_of::<T>();
    if payload.len() < size {
        return Err(tagged(ErrorKind::Protocol, "truncated upcall payload"));
    }
    let val = T::read_from_bytes(&payload[..size]).map_err(|_| tagged(ErrorKind::Protocol, "misaligned upcall payload"))?;
    Ok((val, &payload[size..]))
}

/// Read a NUL-terminated path out of an upcall trailer.
fn read_cstr(payload: &[u8]) -> std::io::Result<String> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| tagged(ErrorKind::Protocol, "missing NUL-terminated name in upcall"))?;
    Ok(String::from_utf8_lossy(&payload[..end]).into_owned())
}

fn lookup_file(open_files: &OpenFileTable, file_id: u64) -> std::io::Result<Arc<OpenFile>> {
    open_files.get(file_id).ok_or_else(|| tagged(ErrorKind::NotFound, "no open file for that handle"))
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    job: &UpcallJob,
    pipeline: &Pipeline,
    mgrclient: &ManagerClient,
    open_files: &OpenFileTable,
    policy: &dyn ConsistencyPolicy,
) -> std::io::Result<Vec<u8>> {
    match job.op {
        UpcallOp::Open => {
            let (fixed, rest): (OpenUpcallFixed, _) = read_fixed(&job.payload)?;
            let name = read_cstr(rest)?;
            let reply = mgrclient.open(&name, fixed.flags, fixed.mode, 0)?;
            let stripe = StripeParams {
                stripe_size: reply.meta.stripe_size,
                server_count: reply.meta.server_count,
                base: reply.meta.base,
            };
            let mut servers = Vec::with_capacity(reply.servers.len());
            for iod in &reply.servers {
                let addr = (iod.host_str(), iod.port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| tagged(ErrorKind::Protocol, "could not resolve data server address"))?;
                servers.push(addr);
            }
            let file = open_files.insert(reply.capability, stripe, servers, reply.meta.size, reply.meta.mtime);
            Ok(file.file_id.to_ne_bytes().to_vec())
        }
        UpcallOp::Read => {
            let (fixed, _): (ReadUpcallFixed, _) = read_fixed(&job.payload)?;
            let file = lookup_file(open_files, fixed.file_id)?;
            pipeline.read(&file, fixed.offset, fixed.len)
        }
        UpcallOp::Write => {
            let (fixed, data): (WriteUpcallFixed, _) = read_fixed(&job.payload)?;
            let file = lookup_file(open_files, fixed.file_id)?;
            pipeline.write(&file, fixed.offset, data)?;
            Ok(Vec::new())
        }
        UpcallOp::Release => {
            let (fixed, _): (FileIdFixed, _) = read_fixed(&job.payload)?;
            let file = lookup_file(open_files, fixed.file_id)?;
            pipeline.sync(&file)?;
            policy.on_close(&CloseContext { file_id: file.file_id, dirty: file.is_dirty() });
            mgrclient.close(file.capability)?;
            open_files.remove(fixed.file_id);
            Ok(Vec::new())
        }
        UpcallOp::Getattr => {
            let (fixed, _): (FileIdFixed, _) = read_fixed(&job.payload)?;
            let file = lookup_file(open_files, fixed.file_id)?;
            let meta = mgrclient.fstat(file.capability)?;
            Ok(meta.as_bytes().to_vec())
        }
        UpcallOp::Statfs => {
            let reply = mgrclient.statfs()?;
            let fixed = StatfsAckFixed {
                tot_bytes: reply.tot_bytes,
                free_bytes: reply.free_bytes,
                tot_files: reply.tot_files,
                free_files: reply.free_files,
                namelen: reply.namelen,
                pad: 0,
            };
            Ok(fixed.as_bytes().to_vec())
        }
        UpcallOp::Fsync => {
            let (fixed, _): (FileIdFixed, _) = read_fixed(&job.payload)?;
            let file = lookup_file(open_files, fixed.file_id)?;
            pipeline.sync(&file)?;
            Ok(Vec::new())
        }
        other => Err(tagged(ErrorKind::Protocol, format!("upcall {other:?} not yet wired into the dispatcher"))),
    }
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(config::debug_mask_to_level(args.debug_mask))
        .init();

    if !args.foreground {
        log::info!("daemonizing is a deployment concern handled by the service manager; running in foreground");
    }

    let mount_config = MountConfig::from_options(&args.options);
    let policy = mount_config.build_policy()?;
    let policy: Arc<dyn ConsistencyPolicy> = Arc::from(policy);

    let manager_addr = args
        .manager
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| tagged(ErrorKind::Protocol, "could not resolve manager address"))?;

    let mgr_pool = Arc::new(ConnectionPool::new(config::connect_timeout(), config::io_timeout()));
    let hashcache = Arc::new(HashCache::with_capacity(config::hashcache_bucket_count(), 1024));

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mgrclient = Arc::new(ManagerClient::new(mgr_pool, manager_addr, uid, gid));

    let dsclient = Arc::new(if mount_config.use_udp {
        DataServerClient::new_udp(Arc::new(DatagramTransport::new(config::io_timeout())))
    } else {
        let ds_pool = Arc::new(ConnectionPool::new(config::connect_timeout(), config::io_timeout()));
        DataServerClient::new(ds_pool)
    });

    let pipeline = Arc::new(Pipeline::new(dsclient, mgrclient.clone(), hashcache.clone(), policy.clone()));
    let open_files = Arc::new(OpenFileTable::new());

    {
        let open_files = open_files.clone();
        let mgrclient = mgrclient.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(IDLE_SWEEP_INTERVAL);
            for file in open_files.sweep_idle() {
                if let Err(e) = mgrclient.close(file.capability) {
                    log::warn!("idle sweep: failed to close capability {}: {e}", file.capability);
                }
            }
        });
    }

    let client_id = std::process::id() as u64;
    let callback_service = CallbackService::bind(&args.callback_bind, hashcache.clone(), client_id)?;
    let callback_port = callback_service.local_port()?;
    if !args.standalone {
        mgrclient.register_callback(client_id, callback_port)?;
        log::info!("registered callback listener on port {callback_port} with manager {manager_addr}");
    }
    std::thread::spawn(move || {
        if let Err(e) = callback_service.serve_forever() {
            log::error!("callback service exited: {e}");
        }
    });

    let pool = WorkerPool::start(args.num_threads, move |job: UpcallJob| -> std::io::Result<DowncallResult> {
        log::trace!("dispatching upcall {:?} unique={}", job.op, job.header.unique);
        let result = dispatch(&job, &pipeline, &mgrclient, &open_files, policy.as_ref());
        Ok(match result {
            Ok(payload) => DowncallResult { unique: job.header.unique, status: 0, payload },
            Err(e) => {
                log::warn!("upcall {:?} unique={} failed: {e}", job.op, job.header.unique);
                DowncallResult {
                    unique: job.header.unique,
                    status: -(e.raw_os_error().unwrap_or(libc::EIO)),
                    payload: Vec::new(),
                }
            }
        })
    });

    log::info!("capfsd ready with {} worker threads", pool.num_workers());
    loop {
        std::thread::park();
    }
}
