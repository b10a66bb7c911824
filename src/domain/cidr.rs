//! IPv4 CIDR blocks with integer-mask containment.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, DomainError> {
        if prefix > 32 {
            return Err(DomainError::validation(format!(
                "prefix length {prefix} exceeds 32"
            )));
        }
        let mask = mask_for(prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_for(self.prefix) == self.network
    }

    /// IPv6 addresses are contained only when they are IPv4-mapped.
    pub fn contains_ip(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.contains(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| self.contains(v4)),
        }
    }
}

fn mask_for(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (addr, prefix) = match trimmed.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix.parse::<u8>().map_err(|err| {
                    DomainError::validation(format!("invalid prefix in `{trimmed}`: {err}"))
                })?;
                (addr, prefix)
            }
            None => (trimmed, 32),
        };
        let addr = addr.parse::<Ipv4Addr>().map_err(|err| {
            DomainError::validation(format!("invalid IPv4 address in `{trimmed}`: {err}"))
        })?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(value: &str) -> Ipv4Cidr {
        value.parse().expect("valid cidr")
    }

    #[test]
    fn containment_respects_mask_boundaries() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        assert!(cidr("10.0.0.0/24").contains(addr));
        assert!(!cidr("10.0.1.0/24").contains(addr));
    }

    #[test]
    fn string_prefix_lookalikes_are_not_contained() {
        // "10.0.0.1" is a textual prefix of "10.0.0.100" but lies outside /32.
        assert!(!cidr("10.0.0.1/32").contains(Ipv4Addr::new(10, 0, 0, 100)));
        assert!(cidr("10.0.0.0/25").contains(Ipv4Addr::new(10, 0, 0, 127)));
        assert!(!cidr("10.0.0.0/25").contains(Ipv4Addr::new(10, 0, 0, 128)));
    }

    #[test]
    fn host_bits_are_normalized_away() {
        let block = cidr("192.168.1.77/16");
        assert_eq!(block.to_string(), "192.168.0.0/16");
    }

    #[test]
    fn zero_prefix_contains_everything() {
        assert!(cidr("0.0.0.0/0").contains(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn bare_address_is_a_single_host() {
        let block = cidr("198.51.100.7");
        assert_eq!(block.prefix(), 32);
        assert!(block.contains(Ipv4Addr::new(198, 51, 100, 7)));
        assert!(!block.contains(Ipv4Addr::new(198, 51, 100, 8)));
    }

    #[test]
    fn mapped_ipv6_is_checked_against_ipv4_blocks() {
        let block = cidr("10.0.0.0/8");
        let mapped: IpAddr = "::ffff:10.1.2.3".parse().expect("ipv6");
        let native: IpAddr = "2001:db8::1".parse().expect("ipv6");
        assert!(block.contains_ip(mapped));
        assert!(!block.contains_ip(native));
    }

    #[test]
    fn rejects_invalid_input() {
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Cidr>().is_err());
    }
}
