//! Header dissection for filter matching.

use bytes::Buf;
use dfc_common::AddressFamily;

use crate::{be16, ensure, packet::IPV6_HDR_LEN, proto, Error, IpVersion, Packet};

/// IPv4 "more fragments" flag plus the 13-bit fragment offset.
const IPV4_FRAG_MASK: u16 = 0x3FFF;

/// IPv6 fragment extension header length.
const FRAG_HDR_LEN: usize = 8;

/// The header fields filter rules match against.
///
/// Addresses are stored as 32-bit words in network order (`10.0.0.1` is `0x0A00_0001`). IPv4
/// only fills the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dissected {
    pub version: IpVersion,
    /// Transport protocol, after skipping an IPv6 fragment header.
    pub proto: u8,
    /// DSCP (TOS byte shifted right by two). Always zero for IPv6.
    pub tos: u8,
    pub is_frag: bool,
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    /// Zero unless the packet is an unfragmented TCP or UDP packet.
    pub sport: u16,
    pub dport: u16,
}

impl Dissected {
    pub fn family(&self) -> AddressFamily {
        match self.version {
            IpVersion::V4 => AddressFamily::Inet,
            IpVersion::V6 => AddressFamily::Inet6,
        }
    }

    #[inline]
    pub fn has_ports(&self) -> bool {
        self.proto == proto::TCP || self.proto == proto::UDP
    }
}

/// Dissects a linear IPv4 or IPv6 packet.
pub fn dissect(packet: &Packet) -> Result<Dissected, Error> {
    if !packet.is_linear() {
        tracing::trace!(len = packet.len(), "dissect failed: non-linear buffer");
        return Err(Error::UnsupportedPacket("non-linear buffer"));
    }

    let data = &packet.data()[..];
    let result = match packet.version() {
        Some(IpVersion::V4) => dissect_v4(data),
        Some(IpVersion::V6) => dissect_v6(data),
        None => Err(Error::UnsupportedPacket("not IPv4 or IPv6")),
    };

    if let Err(ref e) = result {
        tracing::trace!(len = data.len(), "dissect failed: {e}");
    }
    result
}

fn dissect_v4(data: &[u8]) -> Result<Dissected, Error> {
    ensure(data, 20)?;

    let ihl = usize::from(data[0] & 0x0F) << 2;
    if ihl < 20 {
        return Err(Error::UnsupportedPacket("IPv4 header length below minimum"));
    }
    ensure(data, ihl)?;

    let mut addrs = &data[12..20];
    let mut di = Dissected {
        version: IpVersion::V4,
        proto: data[9],
        tos: data[1] >> 2,
        is_frag: be16(data, 6) & IPV4_FRAG_MASK != 0,
        saddr: [addrs.get_u32(), 0, 0, 0],
        daddr: [addrs.get_u32(), 0, 0, 0],
        sport: 0,
        dport: 0,
    };

    if !di.is_frag && di.has_ports() {
        read_ports(data, ihl, &mut di)?;
    }

    Ok(di)
}

fn dissect_v6(data: &[u8]) -> Result<Dissected, Error> {
    ensure(data, IPV6_HDR_LEN)?;

    let mut addrs = &data[8..IPV6_HDR_LEN];
    let mut saddr = [0u32; 4];
    let mut daddr = [0u32; 4];
    for word in saddr.iter_mut() {
        *word = addrs.get_u32();
    }
    for word in daddr.iter_mut() {
        *word = addrs.get_u32();
    }

    let mut di = Dissected {
        version: IpVersion::V6,
        proto: data[6],
        tos: 0,
        is_frag: false,
        saddr,
        daddr,
        sport: 0,
        dport: 0,
    };

    if di.proto == proto::IPV6_FRAGMENT {
        ensure(data, IPV6_HDR_LEN + FRAG_HDR_LEN)?;
        di.proto = data[IPV6_HDR_LEN];
        di.is_frag = true;
        return Ok(di);
    }

    if di.has_ports() {
        read_ports(data, IPV6_HDR_LEN, &mut di)?;
    }

    Ok(di)
}

fn read_ports(data: &[u8], offset: usize, di: &mut Dissected) -> Result<(), Error> {
    ensure(data, offset + 4)?;
    di.sport = be16(data, offset);
    di.dport = be16(data, offset + 2);
    Ok(())
}
