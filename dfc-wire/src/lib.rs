//! Outbound packet buffers and the header parsing needed to classify them.
//!
//! Nothing in here allocates or copies payload: [`Packet`] wraps [`Bytes`] chunks and the
//! parsers read fixed header offsets straight out of the first chunk.

use thiserror::Error;

mod packet;
pub use packet::Packet;

pub mod dissect;
pub use dissect::{dissect, Dissected};

pub mod synth;

/// IP protocol numbers used by the classifier.
pub mod proto {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const IPV6_FRAGMENT: u8 = 44;
    pub const ICMPV6: u8 = 58;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unsupported packet: {0}")]
    UnsupportedPacket(&'static str),
    #[error("Truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// The IP version found in the first nibble of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Checks that `buf` holds at least `need` bytes.
#[inline]
pub(crate) fn ensure(buf: &[u8], need: usize) -> Result<(), Error> {
    if buf.len() < need {
        return Err(Error::Truncated { need, have: buf.len() });
    }
    Ok(())
}

#[inline]
pub(crate) fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}
