use std::fmt;

/// Linux `AF_INET`.
const AF_INET: u32 = 2;
/// Linux `AF_INET6`.
const AF_INET6: u32 = 10;

/// The address family a flow (and its filters) is bound to.
///
/// Anything that is neither IPv4 nor IPv6 is an ancillary flow. Ancillary flows only ever feed
/// a bearer's ack queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u32),
}

impl AddressFamily {
    /// Maps a raw `AF_*` value as carried by control commands.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            AF_INET => Self::Inet,
            AF_INET6 => Self::Inet6,
            other => Self::Other(other),
        }
    }

    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Inet => AF_INET,
            Self::Inet6 => AF_INET6,
            Self::Other(raw) => raw,
        }
    }

    /// Returns `true` for flows that are neither IPv4 nor IPv6.
    pub const fn is_ancillary(self) -> bool {
        matches!(self, Self::Other(_))
    }

    /// Number of 32-bit words in an address of this family. Zero for ancillary families.
    pub const fn addr_words(self) -> usize {
        match self {
            Self::Inet => 1,
            Self::Inet6 => 4,
            Self::Other(_) => 0,
        }
    }
}

impl From<u32> for AddressFamily {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
            Self::Other(raw) => write!(f, "af{raw}"),
        }
    }
}
