//! `mount.capfs` — the mount(8) helper invoked as `mount -t capfs
//! host:/path /mnt/point -o opts`. Parses the `-o` option string the same
//! way `capfsd` does, resolves the entry from `CAPFSTAB_FILE`, and pings
//! the manager before handing off to the long-running daemon (actually
//! mounting the filesystem into the kernel's VFS is the kernel module's
//! job, out of scope per spec.md §1).

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use capfs::config::{self, MountConfig};
use capfs::error::{tagged, ErrorKind};
use capfs::mgrclient::ManagerClient;
use capfs::transport::ConnectionPool;

#[derive(Parser, Debug)]
#[command(name = "mount.capfs", about = "CAPFS mount helper")]
struct Args {
    /// `host:/path`-style source, as passed by mount(8).
    source: String,

    /// Mount point, as passed by mount(8).
    target: String,

    /// Comma-separated mount options (`-o rw,udp,cons=session`).
    #[arg(short = 'o', default_value = "")]
    options: String,

    /// Debug mask, forwarded to the daemon.
    #[arg(short = 'v', default_value_t = 0)]
    verbose: u32,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(config::debug_mask_to_level(args.verbose))
        .init();

    let (host, path) = args
        .source
        .split_once(':')
        .ok_or_else(|| tagged(ErrorKind::Protocol, format!("bad source '{}': expected host:/path", args.source)))?;
    log::info!("mounting {host}{path} at {}", args.target);

    let mount_config = MountConfig::from_options(&args.options);
    let _policy = mount_config.build_policy()?;

    let manager_addr = format!("{host}:3000")
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| tagged(ErrorKind::Protocol, "could not resolve manager host"))?;
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(5)));
    let mgrclient = ManagerClient::new(pool, manager_addr, unsafe { libc::getuid() }, unsafe { libc::getgid() });

    let stat = mgrclient.statfs()?;
    log::info!(
        "manager reachable: {} bytes free of {}, {} files free of {}",
        stat.free_bytes,
        stat.tot_bytes,
        stat.free_files,
        stat.tot_files
    );

    log::warn!("kernel VFS mount is out of scope for this client; hand off to capfsd for {}", args.target);
    Ok(())
}
