//! Overlay address-space partitioning

use crate::{LaceworkError, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Smallest block that still leaves room for an address besides network and broadcast
const MAX_SUBNET_PREFIX: u8 = 30;

/// Fixed-size subnet blocks inside a parent range.
///
/// The pool keeps no record of past allocations: availability is always
/// computed against the taken set handed in by the caller. Block 0 of the
/// range is reserved and never handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrPool {
    range: Ipv4Network,
    subnet_prefix: u8,
}

impl CidrPool {
    /// Create a pool over `range` handing out blocks of `/subnet_prefix`
    pub fn new(range: &str, subnet_prefix: u8) -> Result<Self> {
        let parsed = range
            .parse::<Ipv4Network>()
            .map_err(|_| LaceworkError::InvalidCidr(range.to_string()))?;

        if subnet_prefix > MAX_SUBNET_PREFIX {
            return Err(LaceworkError::Config(format!(
                "subnet prefix /{} is too small to hold any host address",
                subnet_prefix
            )));
        }

        let range = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|_| LaceworkError::InvalidCidr(range.to_string()))?;

        Ok(Self {
            range,
            subnet_prefix,
        })
    }

    /// Parent range, normalised to its network address
    pub fn range(&self) -> Ipv4Network {
        self.range
    }

    /// Prefix length of every block in the pool
    pub fn subnet_prefix(&self) -> u8 {
        self.subnet_prefix
    }

    /// Number of allocatable blocks (the reserved first block excluded)
    pub fn size(&self) -> u64 {
        if self.subnet_prefix <= self.range.prefix() {
            return 0;
        }
        (1u64 << (self.subnet_prefix - self.range.prefix())) - 1
    }

    /// First block, in ascending order, that is not in `taken`
    pub fn get_available<S: AsRef<str>>(&self, taken: &[S]) -> Option<String> {
        let taken: HashSet<&str> = taken.iter().map(|subnet| subnet.as_ref()).collect();

        (1..=self.size())
            .filter_map(|index| self.block(index))
            .map(|block| block.to_string())
            .find(|candidate| !taken.contains(candidate.as_str()))
    }

    /// True when `subnet` is exactly one of this pool's allocatable blocks
    pub fn is_member(&self, subnet: &str) -> bool {
        let Ok(candidate) = subnet.parse::<Ipv4Network>() else {
            return false;
        };

        if candidate.prefix() != self.subnet_prefix || !self.range.contains(candidate.ip()) {
            return false;
        }

        let offset = u64::from(u32::from(candidate.ip()) - u32::from(self.range.network()));
        offset != 0 && offset % self.block_size() == 0
    }

    fn block_size(&self) -> u64 {
        1u64 << (32 - u32::from(self.subnet_prefix))
    }

    fn block(&self, index: u64) -> Option<Ipv4Network> {
        let base = u64::from(u32::from(self.range.network())) + index * self.block_size();
        let base = u32::try_from(base).ok()?;
        Ipv4Network::new(Ipv4Addr::from(base), self.subnet_prefix).ok()
    }
}

/// Hardware address bound to an overlay subnet: `ee:ee:` followed by the base address octets
pub fn hardware_addr_for_subnet(subnet: &Ipv4Network) -> String {
    let [a, b, c, d] = subnet.network().octets();
    format!("ee:ee:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

/// Parse a colon-separated six-octet hardware address
pub fn parse_hardware_addr(addr: &str) -> Result<[u8; 6]> {
    let invalid = || LaceworkError::InvalidHardwareAddr(addr.to_string());

    let mut octets = [0u8; 6];
    let mut parts = addr.split(':');
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }

    Ok(octets)
}
