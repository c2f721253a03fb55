//! CAPFS client-side data path and consistency engine: the library behind
//! the `capfsd` daemon and `mount.capfs` helper binaries.
//!
//! Chunks are content-addressed by SHA-1 digest (§3); writes compare-and-
//! swap their chunk hash list at the manager (§4.4/§4.6) under a pluggable
//! [`policy::ConsistencyPolicy`]; reads and writes are driven by
//! [`pipeline::Pipeline`] over a [`mapper::StripeParams`]-derived chunk
//! layout and a shared [`hashcache::HashCache`].

pub mod callback;
pub mod config;
pub mod daemon;
pub mod dsclient;
pub mod error;
pub mod hashcache;
pub mod mapper;
pub mod mgrclient;
pub mod openfile;
pub mod pipeline;
pub mod policy;
pub mod transport;
pub mod wire;

/// SHA-1 digest length in bytes, used throughout the wire formats (§3).
pub const DIGEST_LEN: usize = wire::dataserver::DIGEST_LEN;
