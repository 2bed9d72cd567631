use rand::RngCore;
use std::fmt;
use std::net::Ipv4Addr;

/// Global Session Identifier: six bytes naming a PGM source independent of
/// its data-destination port. Never changes for the lifetime of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gsi([u8; 6]);

impl Gsi {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Gsi(bytes)
    }

    /// Derives a GSI from an IPv4 host address plus two bytes of entropy,
    /// mirroring the address-based construction of the original protocol.
    pub fn from_addr(addr: Ipv4Addr, rng: &mut dyn RngCore) -> Self {
        let octets = addr.octets();
        let mut id = [0u8; 6];
        id[..4].copy_from_slice(&octets);
        let mut salt = [0u8; 2];
        rng.fill_bytes(&mut salt);
        id[4..].copy_from_slice(&salt);
        Gsi(id)
    }

    /// A fully random GSI, for hosts without a stable address.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        let mut id = [0u8; 6];
        rng.fill_bytes(&mut id);
        Gsi(id)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

/// Transport Session Identifier: (GSI, source port). All receiver state is
/// keyed on the TSI of the publishing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub fn new(gsi: Gsi, sport: u16) -> Self {
        Tsi { gsi, sport }
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}
