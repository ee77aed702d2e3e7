use bytes::Bytes;
use dfc_common::AddressFamily;

use crate::{be16, proto, IpVersion};

/// Fixed IPv6 header length.
pub(crate) const IPV6_HDR_LEN: usize = 40;

/// Router solicitation through redirect.
const NDP_TYPES: std::ops::RangeInclusive<u8> = 133..=137;

/// TCP flags byte with only ACK set.
const TCP_FLAG_ACK: u8 = 0x10;

/// An outbound IP packet together with its classification mark.
///
/// A packet is either linear (all bytes in one chunk) or carries additional fragment chunks.
/// Only the linear case can be dissected.
#[derive(Debug, Clone)]
pub struct Packet {
    head: Bytes,
    frags: Vec<Bytes>,
    mark: u32,
}

impl Packet {
    /// Creates a linear packet.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { head: data.into(), frags: Vec::new(), mark: 0 }
    }

    /// Creates a packet from a head chunk followed by fragment chunks.
    pub fn with_fragments(head: impl Into<Bytes>, frags: Vec<Bytes>) -> Self {
        Self { head: head.into(), frags, mark: 0 }
    }

    #[inline]
    pub fn is_linear(&self) -> bool {
        self.frags.is_empty()
    }

    /// The first chunk, which holds at least the headers for packets produced by the stack.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.head
    }

    /// Total length over all chunks.
    pub fn len(&self) -> usize {
        self.head.len() + self.frags.iter().map(Bytes::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn mark(&self) -> u32 {
        self.mark
    }

    #[inline]
    pub fn set_mark(&mut self, mark: u32) {
        self.mark = mark;
    }

    pub fn version(&self) -> Option<IpVersion> {
        match self.head.first().map(|b| b >> 4) {
            Some(4) => Some(IpVersion::V4),
            Some(6) => Some(IpVersion::V6),
            _ => None,
        }
    }

    /// Address family used for flow lookups. Everything that is not IPv6 is looked up as IPv4.
    pub fn family(&self) -> AddressFamily {
        match self.version() {
            Some(IpVersion::V6) => AddressFamily::Inet6,
            _ => AddressFamily::Inet,
        }
    }

    /// Returns `true` for a TCP segment that carries no payload and has only the ACK flag set.
    pub fn is_tcp_pure_ack(&self) -> bool {
        let data = &self.head[..];
        let (hdr_len, payload_len) = match self.version() {
            Some(IpVersion::V4) => {
                if data.len() < 20 || data[9] != proto::TCP {
                    return false;
                }
                let ihl = usize::from(data[0] & 0x0F) << 2;
                let total = usize::from(be16(data, 2));
                match total.checked_sub(ihl) {
                    Some(payload_len) => (ihl, payload_len),
                    None => return false,
                }
            }
            Some(IpVersion::V6) => {
                if data.len() < IPV6_HDR_LEN || data[6] != proto::TCP {
                    return false;
                }
                (IPV6_HDR_LEN, usize::from(be16(data, 4)))
            }
            None => return false,
        };

        if data.len() < hdr_len + 14 {
            return false;
        }

        let doff = usize::from(data[hdr_len + 12] >> 4) << 2;
        let flags = data[hdr_len + 13];

        payload_len == doff && flags == TCP_FLAG_ACK
    }

    /// Returns `true` for ICMPv6 neighbor discovery messages.
    pub fn is_ipv6_ndp(&self) -> bool {
        let data = &self.head[..];
        self.version() == Some(IpVersion::V6) &&
            data.len() > IPV6_HDR_LEN &&
            data[6] == proto::ICMPV6 &&
            NDP_TYPES.contains(&data[IPV6_HDR_LEN])
    }
}
