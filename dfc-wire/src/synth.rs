//! Synthesizes minimal, well-formed IP packets.
//!
//! Checksums are left at zero: nothing in the classifier looks at them.

use std::{net::IpAddr, ops::BitOr};

use bytes::{BufMut, BytesMut};

use crate::{proto, Packet};

/// TCP control bits as they appear in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Builds an IPv4 or IPv6 packet around a transport header.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    src: IpAddr,
    dst: IpAddr,
    dscp: u8,
    fragment: bool,
}

impl PacketBuilder {
    /// Both addresses must be of the same family.
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        debug_assert_eq!(src.is_ipv4(), dst.is_ipv4(), "mixed address families");
        Self { src, dst, dscp: 0, fragment: false }
    }

    /// Sets the DSCP value (upper six bits of the IPv4 TOS byte).
    pub fn dscp(mut self, dscp: u8) -> Self {
        self.dscp = dscp;
        self
    }

    /// Marks the packet as the first fragment of a larger datagram.
    pub fn fragmented(mut self) -> Self {
        self.fragment = true;
        self
    }

    pub fn tcp(self, sport: u16, dport: u16, flags: TcpFlags, payload_len: usize) -> Packet {
        let mut l4 = BytesMut::with_capacity(20);
        l4.put_u16(sport);
        l4.put_u16(dport);
        l4.put_u32(1); // seq
        l4.put_u32(1); // ack
        l4.put_u8(5 << 4); // data offset, no options
        l4.put_u8(flags.0);
        l4.put_u16(u16::MAX); // window
        l4.put_u16(0); // checksum
        l4.put_u16(0); // urgent pointer
        self.build(proto::TCP, &l4, payload_len)
    }

    pub fn udp(self, sport: u16, dport: u16, payload_len: usize) -> Packet {
        let mut l4 = BytesMut::with_capacity(8);
        l4.put_u16(sport);
        l4.put_u16(dport);
        l4.put_u16((8 + payload_len) as u16);
        l4.put_u16(0);
        self.build(proto::UDP, &l4, payload_len)
    }

    pub fn icmpv6(self, ty: u8) -> Packet {
        let l4 = [ty, 0, 0, 0, 0, 0, 0, 0];
        self.build(proto::ICMPV6, &l4, 0)
    }

    fn build(self, protocol: u8, l4: &[u8], payload_len: usize) -> Packet {
        let mut buf = BytesMut::with_capacity(48 + l4.len() + payload_len);

        match (self.src, self.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.put_u8(0x45);
                buf.put_u8(self.dscp << 2);
                buf.put_u16((20 + l4.len() + payload_len) as u16);
                buf.put_u16(0); // id
                buf.put_u16(if self.fragment { 0x2000 } else { 0 });
                buf.put_u8(64);
                buf.put_u8(protocol);
                buf.put_u16(0);
                buf.put_slice(&src.octets());
                buf.put_slice(&dst.octets());
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let frag_len = if self.fragment { 8 } else { 0 };
                buf.put_u32(6 << 28);
                buf.put_u16((frag_len + l4.len() + payload_len) as u16);
                buf.put_u8(if self.fragment { proto::IPV6_FRAGMENT } else { protocol });
                buf.put_u8(64);
                buf.put_slice(&src.octets());
                buf.put_slice(&dst.octets());
                if self.fragment {
                    buf.put_u8(protocol);
                    buf.put_u8(0);
                    buf.put_u16(1); // offset 0, more fragments
                    buf.put_u32(0x1234); // identification
                }
            }
            _ => unreachable!("mixed address families"),
        }

        buf.put_slice(l4);
        buf.put_bytes(0, payload_len);

        Packet::new(buf.freeze())
    }
}

/// An IPv4 TCP segment.
pub fn tcp_v4(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    sport: u16,
    dport: u16,
    flags: TcpFlags,
    payload_len: usize,
) -> Packet {
    PacketBuilder::new(src.into(), dst.into()).tcp(sport, dport, flags, payload_len)
}

/// An IPv6 TCP segment.
pub fn tcp_v6(
    src: std::net::Ipv6Addr,
    dst: std::net::Ipv6Addr,
    sport: u16,
    dport: u16,
    flags: TcpFlags,
    payload_len: usize,
) -> Packet {
    PacketBuilder::new(src.into(), dst.into()).tcp(sport, dport, flags, payload_len)
}

/// An IPv4 UDP datagram.
pub fn udp_v4(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    sport: u16,
    dport: u16,
    payload_len: usize,
) -> Packet {
    PacketBuilder::new(src.into(), dst.into()).udp(sport, dport, payload_len)
}

/// An IPv6 UDP datagram.
pub fn udp_v6(
    src: std::net::Ipv6Addr,
    dst: std::net::Ipv6Addr,
    sport: u16,
    dport: u16,
    payload_len: usize,
) -> Packet {
    PacketBuilder::new(src.into(), dst.into()).udp(sport, dport, payload_len)
}

/// An ICMPv6 message of the given type.
pub fn icmpv6(src: std::net::Ipv6Addr, dst: std::net::Ipv6Addr, ty: u8) -> Packet {
    PacketBuilder::new(src.into(), dst.into()).icmpv6(ty)
}
