//! Wire codecs for the two dialects spoken at the client boundary (§4.1,
//! §6.1, §6.2): the manager protocol, the data-server protocol, and the
//! kernel↔daemon upcall/downcall framing.
//!
//! All multi-byte integers are native-endian `zerocopy` structs, matching
//! spec.md §6.1's "not portable across endianness" note — see DESIGN.md
//! Open Question (c).

pub(crate) mod argument;
pub mod dataserver;
pub mod manager;
pub mod upcall;

use std::io::{self, Read, Write};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Read a fixed-layout header struct from a stream.
pub(crate) fn read_header<T>(stream: &mut impl Read) -> io::Result<T>
where
    T: FromBytes + KnownLayout + Immutable,
{
    let mut buf = vec![0u8; size_of::<T>()];
    stream.read_exact(&mut buf)?;
    T::read_from_bytes(&buf).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "short or misaligned wire header")
    })
}

/// Read exactly `len` bytes of trailing data (the hash list, dirent array,
/// name(s), or chunk body that follows a fixed header).
pub(crate) fn read_trailer(stream: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a fixed-layout header followed by trailing bytes as one logical
/// frame. Not a single syscall (TCP give no atomicity guarantee anyway);
/// just two `write_all` calls, which is all `fuser`'s `writev`-based
/// `SubChannel::send` buys over a kernel pipe either.
pub(crate) fn write_frame<T>(stream: &mut impl Write, header: &T, trailer: &[u8]) -> io::Result<()>
where
    T: IntoBytes + Immutable,
{
    stream.write_all(header.as_bytes())?;
    if !trailer.is_empty() {
        stream.write_all(trailer)?;
    }
    stream.flush()
}
