//! Ambient config: environment variables, `-o` mount options, and the
//! debug-mask-to-log-level mapping. The comma-separated option parser is
//! lifted from `fuser`'s `mnt/mount_options.rs` `MountOption::from_str`;
//! the env vars and debug mask are grounded in
//! `examples/original_source/client/capfsd.c`'s option handling.

use std::env;
use std::time::Duration;

use crate::error::{tagged, ErrorKind};
use crate::policy::{by_name, ConsistencyPolicy};

/// `CAPFSTAB_FILE`: path to the mount table, defaulting to `/etc/capfstab`.
pub fn capfstab_path() -> String {
    env::var("CAPFSTAB_FILE").unwrap_or_else(|_| "/etc/capfstab".to_string())
}

/// `CMGR_BCOUNT`: hash cache bucket count override.
pub fn hashcache_bucket_count() -> usize {
    env_usize("CMGR_BCOUNT", 64)
}

/// `CMGR_CHUNK_SIZE`: default stripe size hint for new files, in bytes.
/// Servers ultimately decide the real stripe size (carried in `FileMeta`);
/// this is only the hint a client passes on CREATE-shaped OPENs.
pub fn default_chunk_size() -> u32 {
    env_usize("CMGR_CHUNK_SIZE", 64 * 1024) as u32
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// A single `-o` option, the way `MountOption::from_str` decomposes the
/// comma-separated mount option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOption {
    ReadWrite,
    ReadOnly,
    Interruptible,
    Udp,
    Tcp,
    HashCache(bool),
    DentryCache(bool),
    Consistency(String),
    Other(String),
}

impl MountOption {
    pub fn parse_str(s: &str) -> MountOption {
        match s {
            "rw" => MountOption::ReadWrite,
            "ro" => MountOption::ReadOnly,
            "intr" => MountOption::Interruptible,
            "udp" => MountOption::Udp,
            "tcp" => MountOption::Tcp,
            "hcache" => MountOption::HashCache(true),
            "nohcache" => MountOption::HashCache(false),
            "dcache" => MountOption::DentryCache(true),
            "nodcache" => MountOption::DentryCache(false),
            _ => match s.split_once('=') {
                Some(("cons", name)) => MountOption::Consistency(name.to_string()),
                _ => MountOption::Other(s.to_string()),
            },
        }
    }

    pub fn parse_comma_list(options: &str) -> Vec<MountOption> {
        options.split(',').filter(|s| !s.is_empty()).map(MountOption::parse_str).collect()
    }
}

/// Resolved mount configuration after folding every `-o` option together.
pub struct MountConfig {
    pub read_only: bool,
    pub interruptible: bool,
    pub use_udp: bool,
    pub use_hashcache: bool,
    pub use_dentry_cache: bool,
    pub policy_name: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            read_only: false,
            interruptible: true,
            use_udp: false,
            use_hashcache: true,
            use_dentry_cache: true,
            policy_name: "posix".to_string(),
        }
    }
}

impl MountConfig {
    pub fn from_options(options: &str) -> Self {
        let mut cfg = MountConfig::default();
        for opt in MountOption::parse_comma_list(options) {
            match opt {
                MountOption::ReadWrite => cfg.read_only = false,
                MountOption::ReadOnly => cfg.read_only = true,
                MountOption::Interruptible => cfg.interruptible = true,
                MountOption::Udp => cfg.use_udp = true,
                MountOption::Tcp => cfg.use_udp = false,
                MountOption::HashCache(v) => cfg.use_hashcache = v,
                MountOption::DentryCache(v) => cfg.use_dentry_cache = v,
                MountOption::Consistency(name) => cfg.policy_name = name,
                MountOption::Other(o) => log::debug!("ignoring unrecognized mount option '{o}'"),
            }
        }
        cfg
    }

    pub fn build_policy(&self) -> std::io::Result<Box<dyn ConsistencyPolicy>> {
        by_name(&self.policy_name)
    }
}

/// Map capfsd's `-p MASK` debug mask to a `log` level, the way
/// `capfsd.c` maps its own bitmask to verbosity. Bit 0 = errors only
/// (default), bit 1 adds warnings, bit 2 adds info, bit 3 adds debug,
/// anything higher is trace.
pub fn debug_mask_to_level(mask: u32) -> log::LevelFilter {
    match mask {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

pub fn connect_timeout() -> Duration {
    Duration::from_secs(env_usize("CAPFS_CONNECT_TIMEOUT_SECS", 10) as u64)
}

pub fn io_timeout() -> Duration {
    Duration::from_secs(env_usize("CAPFS_IO_TIMEOUT_SECS", 30) as u64)
}

/// Parse a `host:port` pair the way the manager/data server addresses are
/// written in a capfstab entry.
pub fn parse_host_port(s: &str) -> std::io::Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| tagged(ErrorKind::Protocol, format!("bad host:port '{s}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| tagged(ErrorKind::Protocol, format!("bad port in '{s}'")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_options() {
        let cfg = MountConfig::from_options("ro,udp,nohcache,cons=session");
        assert!(cfg.read_only);
        assert!(cfg.use_udp);
        assert!(!cfg.use_hashcache);
        assert_eq!(cfg.policy_name, "session");
    }

    #[test]
    fn unknown_option_does_not_panic() {
        let cfg = MountConfig::from_options("rw,bogus=1,tcp");
        assert!(!cfg.read_only);
        assert!(!cfg.use_udp);
    }

    #[test]
    fn default_config_is_posix_rw() {
        let cfg = MountConfig::default();
        assert!(!cfg.read_only);
        assert_eq!(cfg.policy_name, "posix");
        assert!(cfg.build_policy().is_ok());
    }

    #[test]
    fn debug_mask_escalates_verbosity() {
        assert_eq!(debug_mask_to_level(0), log::LevelFilter::Error);
        assert_eq!(debug_mask_to_level(3), log::LevelFilter::Debug);
        assert_eq!(debug_mask_to_level(99), log::LevelFilter::Trace);
    }

    #[test]
    fn host_port_parses() {
        let (host, port) = parse_host_port("data1.example:4000").unwrap();
        assert_eq!(host, "data1.example");
        assert_eq!(port, 4000);
    }

    #[test]
    fn host_port_rejects_missing_port() {
        assert!(parse_host_port("data1.example").is_err());
    }
}
