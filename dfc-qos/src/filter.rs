//! Packet classification rules.
//!
//! A rule is installed for a flow, normalized once (addresses pre-masked, port ranges made
//! absolute) and kept in a single list ordered by precedence. Marking walks that list and
//! stamps the first matching rule's flow id on the packet.

use std::{
    fmt,
    net::IpAddr,
    ops::{BitOr, RangeInclusive},
};

use dfc_common::AddressFamily;
use dfc_wire::{Dissected, IpVersion};

use crate::{context::FlowKey, QosError};

/// Selects which fields of a [`FilterSpec`] take part in matching.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FieldMask(u32);

impl FieldMask {
    pub const NONE: Self = Self(0);
    pub const TOS: Self = Self(0x01);
    pub const PROTO: Self = Self(0x02);
    pub const SADDR: Self = Self(0x04);
    pub const DADDR: Self = Self(0x08);
    pub const SPORT: Self = Self(0x10);
    pub const DPORT: Self = Self(0x20);

    const ALL: u32 = 0x3F;

    /// Creates a mask from raw bits, rejecting unknown ones.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            return None;
        }
        Some(Self(bits))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    const fn has_ports(self) -> bool {
        self.0 & (Self::SPORT.0 | Self::DPORT.0) != 0
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({:#04x})", self.0)
    }
}

/// A classification rule as delivered by the control plane.
///
/// Addresses are 32-bit words in network order. Port ranges are a base port plus a width, the
/// rule matching `base..=base + width`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSpec {
    /// Lower values are checked first.
    pub precedence: u32,
    pub mask: FieldMask,
    pub tos: u8,
    pub tos_mask: u8,
    pub proto: u8,
    pub saddr: [u32; 4],
    pub saddr_mask: [u32; 4],
    pub daddr: [u32; 4],
    pub daddr_mask: [u32; 4],
    pub sport: u16,
    pub sport_range: u16,
    pub dport: u16,
    pub dport_range: u16,
}

impl FilterSpec {
    /// Creates a rule that matches every packet of its flow's family.
    pub fn new(precedence: u32) -> Self {
        Self { precedence, ..Default::default() }
    }

    /// Matches the DSCP value under `mask`. Only applies to IPv4.
    pub fn tos(mut self, tos: u8, mask: u8) -> Self {
        self.mask = self.mask | FieldMask::TOS;
        self.tos = tos;
        self.tos_mask = mask;
        self
    }

    /// Matches the transport protocol.
    pub fn protocol(mut self, proto: u8) -> Self {
        self.mask = self.mask | FieldMask::PROTO;
        self.proto = proto;
        self
    }

    /// Matches source addresses within `addr/prefix`.
    pub fn source(mut self, addr: IpAddr, prefix: u8) -> Self {
        self.mask = self.mask | FieldMask::SADDR;
        (self.saddr, self.saddr_mask) = prefix_words(addr, prefix);
        self
    }

    /// Matches destination addresses within `addr/prefix`.
    pub fn destination(mut self, addr: IpAddr, prefix: u8) -> Self {
        self.mask = self.mask | FieldMask::DADDR;
        (self.daddr, self.daddr_mask) = prefix_words(addr, prefix);
        self
    }

    /// Matches source ports `base..=base + width`.
    pub fn source_ports(mut self, base: u16, width: u16) -> Self {
        self.mask = self.mask | FieldMask::SPORT;
        self.sport = base;
        self.sport_range = width;
        self
    }

    /// Matches destination ports `base..=base + width`.
    pub fn destination_ports(mut self, base: u16, width: u16) -> Self {
        self.mask = self.mask | FieldMask::DPORT;
        self.dport = base;
        self.dport_range = width;
        self
    }
}

/// Splits an address and prefix length into network-order words and the matching mask.
fn prefix_words(addr: IpAddr, prefix: u8) -> ([u32; 4], [u32; 4]) {
    let mut words = [0u32; 4];
    let bits = match addr {
        IpAddr::V4(v4) => {
            words[0] = u32::from(v4);
            32
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            for (word, chunk) in words.iter_mut().zip(octets.chunks_exact(4)) {
                *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            128
        }
    };

    let mut mask = [0u32; 4];
    let mut remaining = u32::from(prefix).min(bits);
    for word in mask.iter_mut() {
        let take = remaining.min(32);
        *word = if take == 0 { 0 } else { u32::MAX << (32 - take) };
        remaining -= take;
    }

    (words, mask)
}

/// Identifies an installed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub(crate) u64);

/// An installed, normalized rule.
#[derive(Debug, Clone)]
pub(crate) struct FilterRule {
    pub(crate) id: FilterId,
    pub(crate) owner: FlowKey,
    pub(crate) precedence: u32,
    mask: FieldMask,
    tos: u8,
    tos_mask: u8,
    proto: u8,
    saddr: [u32; 4],
    saddr_mask: [u32; 4],
    daddr: [u32; 4],
    daddr_mask: [u32; 4],
    sport: RangeInclusive<u16>,
    dport: RangeInclusive<u16>,
}

impl FilterRule {
    /// Validates and normalizes `spec`.
    pub(crate) fn new(id: FilterId, owner: FlowKey, spec: &FilterSpec) -> Result<Self, QosError> {
        let sport = port_range(spec.sport, spec.sport_range)?;
        let dport = port_range(spec.dport, spec.dport_range)?;

        let mut saddr = spec.saddr;
        let mut daddr = spec.daddr;
        for i in 0..4 {
            saddr[i] &= spec.saddr_mask[i];
            daddr[i] &= spec.daddr_mask[i];
        }

        Ok(Self {
            id,
            owner,
            precedence: spec.precedence,
            mask: spec.mask,
            tos: spec.tos & spec.tos_mask,
            tos_mask: spec.tos_mask,
            proto: spec.proto,
            saddr,
            saddr_mask: spec.saddr_mask,
            daddr,
            daddr_mask: spec.daddr_mask,
            sport,
            dport,
        })
    }

    #[inline]
    pub(crate) fn family(&self) -> AddressFamily {
        self.owner.family
    }

    /// Checks the dissected headers against this rule.
    pub(crate) fn matches(&self, di: &Dissected) -> bool {
        let family = self.family();
        if di.family() != family {
            return false;
        }

        let mask = self.mask;
        if mask.contains(FieldMask::TOS) &&
            di.version == IpVersion::V4 &&
            di.tos & self.tos_mask != self.tos
        {
            return false;
        }

        if mask.contains(FieldMask::PROTO) && di.proto != self.proto {
            return false;
        }

        let words = family.addr_words();
        if mask.contains(FieldMask::SADDR) &&
            !masked_eq(&di.saddr, &self.saddr, &self.saddr_mask, words)
        {
            return false;
        }

        if mask.contains(FieldMask::DADDR) &&
            !masked_eq(&di.daddr, &self.daddr, &self.daddr_mask, words)
        {
            return false;
        }

        if !mask.has_ports() {
            return true;
        }

        // Port rules never match packets without a readable transport header.
        if di.is_frag || !di.has_ports() {
            return false;
        }

        if mask.contains(FieldMask::SPORT) && !self.sport.contains(&di.sport) {
            return false;
        }

        !(mask.contains(FieldMask::DPORT) && !self.dport.contains(&di.dport))
    }
}

fn port_range(base: u16, width: u16) -> Result<RangeInclusive<u16>, QosError> {
    match base.checked_add(width) {
        Some(end) => Ok(base..=end),
        None => Err(QosError::InvalidArgument(format!(
            "port range {base}+{width} exceeds {}",
            u16::MAX
        ))),
    }
}

#[inline]
fn masked_eq(addr: &[u32; 4], rule: &[u32; 4], mask: &[u32; 4], words: usize) -> bool {
    (0..words).all(|i| addr[i] & mask[i] == rule[i])
}
