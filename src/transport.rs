//! C1: pooled, ref-counted TCP connections to managers and data servers
//! (§4.1). Grounded in `fuser`'s `channel.rs`, which keeps a primary
//! connection plus a vector of cloneable sub-channels, each wrapped in an
//! `Arc` so callers can hold a connection across a request without blocking
//! unrelated callers out of the pool.
//!
//! CAPFS has no kernel-side fd to clone, so "sub-channel" here is just a
//! pooled `TcpStream`; the pool-by-address-ref-count shape is what carries
//! over, not the fd-duplication mechanics.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{classify_os_error, is_transient, tagged, ErrorKind};

/// A pooled connection. Returned to the pool's free list on drop rather
/// than closed, unless it was marked broken.
pub struct PooledConn {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledConn {
    pub fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("stream taken")
    }

    /// Mark this connection as unusable; it will be closed instead of
    /// returned to the pool when dropped. Call this after any I/O error
    /// classified as [`ErrorKind::Protocol`] or [`ErrorKind::TransientNet`].
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        if let Some(stream) = self.stream.take() {
            self.pool.release(self.addr, stream);
        }
    }
}

struct PoolInner {
    idle: Mutex<HashMap<SocketAddr, Vec<TcpStream>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl PoolInner {
    fn release(&self, addr: SocketAddr, stream: TcpStream) {
        self.idle.lock().entry(addr).or_default().push(stream);
    }
}

/// Pool of outbound connections, one instance shared by the whole client
/// (manager connections and data-server connections use separate pools so
/// a storm of chunk I/O never starves a manager RPC of a spare socket).
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    retries: u32,
    retry_sleep: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(HashMap::new()),
                connect_timeout,
                io_timeout,
            }),
            retries: 5,
            retry_sleep: Duration::from_secs(5),
        }
    }

    /// §4.8's "retry up to 5 times, sleeping 5s" backstop, applied here to
    /// connection establishment specifically (the daemon applies the same
    /// shape at the upcall-dispatch level for the request as a whole).
    pub fn with_retry(mut self, retries: u32, sleep: Duration) -> Self {
        self.retries = retries;
        self.retry_sleep = sleep;
        self
    }

    /// Borrow a connection to `addr`, reusing an idle one from the pool if
    /// available, otherwise dialing a fresh one with bounded retry on
    /// transient failures.
    pub fn get(&self, addr: SocketAddr) -> io::Result<PooledConn> {
        if let Some(stream) = self.inner.idle.lock().get_mut(&addr).and_then(Vec::pop) {
            return Ok(PooledConn {
                addr,
                stream: Some(stream),
                pool: self.inner.clone(),
                broken: false,
            });
        }
        let mut last_err = None;
        for attempt in 0..=self.retries {
            match self.dial(addr) {
                Ok(stream) => {
                    return Ok(PooledConn {
                        addr,
                        stream: Some(stream),
                        pool: self.inner.clone(),
                        broken: false,
                    })
                }
                Err(e) => {
                    let kind = classify_os_error(&e);
                    if !is_transient(kind) || attempt == self.retries {
                        last_err = Some(e);
                        break;
                    }
                    log::warn!("connect to {addr} failed ({e}), retrying ({attempt}/{})", self.retries);
                    std::thread::sleep(self.retry_sleep);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| tagged(ErrorKind::TransientNet, "connection pool exhausted retries")))
    }

    fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, self.inner.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.inner.io_timeout))?;
        stream.set_write_timeout(Some(self.inner.io_timeout))?;
        Ok(stream)
    }

    /// Number of idle connections currently pooled for `addr`, for tests
    /// and `STATFS`-adjacent diagnostics.
    pub fn idle_count(&self, addr: SocketAddr) -> usize {
        self.inner.idle.lock().get(&addr).map_or(0, Vec::len)
    }
}

/// Largest reply a single UDP datagram can carry on IPv4 without
/// fragmentation bookkeeping; a `CHUNK`-sized GET/PUT reply plus headers
/// fits comfortably under this, so the datagram path never needs to split a
/// frame across multiple packets.
const MAX_DATAGRAM: usize = 65507;

/// §4.1's datagram transport: one request datagram, one reply datagram, no
/// connection state to pool. Retried the same way [`ConnectionPool::get`]
/// retries a dial — a fresh ephemeral socket per attempt, since UDP has no
/// notion of a broken connection to recover.
pub struct DatagramTransport {
    io_timeout: Duration,
    retries: u32,
    retry_sleep: Duration,
}

impl DatagramTransport {
    pub fn new(io_timeout: Duration) -> Self {
        DatagramTransport {
            io_timeout,
            retries: 5,
            retry_sleep: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retries: u32, sleep: Duration) -> Self {
        self.retries = retries;
        self.retry_sleep = sleep;
        self
    }

    /// Send `request` to `addr` as a single datagram and return the single
    /// reply datagram's bytes.
    pub fn exchange(&self, addr: SocketAddr, request: &[u8]) -> io::Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            match self.try_once(addr, request) {
                Ok(buf) => return Ok(buf),
                Err(e) => {
                    let retryable = is_transient(classify_os_error(&e))
                        || matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut);
                    if !retryable || attempt == self.retries {
                        last_err = Some(e);
                        break;
                    }
                    log::warn!("datagram exchange with {addr} timed out ({e}), retrying ({attempt}/{})", self.retries);
                    std::thread::sleep(self.retry_sleep);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| tagged(ErrorKind::TransientNet, "datagram transport exhausted retries")))
    }

    fn try_once(&self, addr: SocketAddr, request: &[u8]) -> io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.io_timeout))?;
        socket.send_to(request, addr)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = socket.recv_from(&mut buf)?;
        if from != addr {
            return Err(tagged(ErrorKind::Protocol, "datagram reply from unexpected sender"));
        }
        buf.truncate(n);
        Ok(buf)
    }
}
