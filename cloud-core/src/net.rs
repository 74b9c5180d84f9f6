//! IPv4 subnet and interface types.
//!
//! Both serialise as their CIDR text form (`10.50.0.0/24`, `10.50.0.5/24`) so
//! they read naturally inside the YAML metadata annotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid IPv4 network `{0}`")]
pub struct NetParseError(pub String);

fn split_cidr(s: &str) -> Result<(Ipv4Addr, u8), NetParseError> {
    let (addr, prefix) = s
        .trim()
        .split_once('/')
        .ok_or_else(|| NetParseError(s.to_string()))?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| NetParseError(s.to_string()))?;
    let prefix: u8 = prefix.parse().map_err(|_| NetParseError(s.to_string()))?;
    if prefix > 32 {
        return Err(NetParseError(s.to_string()));
    }
    Ok((addr, prefix))
}

fn mask_for(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// An IPv4 network, always stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, NetParseError> {
        if prefix > 32 {
            return Err(NetParseError(format!("{addr}/{prefix}")));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask_for(prefix));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_for(self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_for(self.prefix) == u32::from(self.network)
    }

    /// Usable host addresses, i.e. everything except the network and
    /// broadcast address (point-to-point /31 and /32 networks keep all).
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network);
        let last = u32::from(self.broadcast());
        let (start, end) = if self.prefix >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        };
        (start..=end).map(Ipv4Addr::from)
    }

    /// The conventional gateway: first host address.
    pub fn first_host(&self) -> Option<Ipv4Addr> {
        self.hosts().next()
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = NetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(s)?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = NetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(value: Ipv4Subnet) -> Self {
        value.to_string()
    }
}

/// An address together with the prefix length of the network it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Interface {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Interface {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, NetParseError> {
        if prefix > 32 {
            return Err(NetParseError(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn subnet(&self) -> Ipv4Subnet {
        Ipv4Subnet {
            network: Ipv4Addr::from(u32::from(self.addr) & mask_for(self.prefix)),
            prefix: self.prefix,
        }
    }
}

impl fmt::Display for Ipv4Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Interface {
    type Err = NetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = split_cidr(s)?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Interface {
    type Error = NetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Interface> for String {
    fn from(value: Ipv4Interface) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_clears_host_bits() {
        let subnet: Ipv4Subnet = "10.50.0.77/24".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 50, 0, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 50, 0, 255));
        assert_eq!(subnet.to_string(), "10.50.0.0/24");
    }

    #[test]
    fn test_hosts_exclude_network_and_broadcast() {
        let subnet: Ipv4Subnet = "10.50.0.0/24".parse().unwrap();
        let hosts: Vec<_> = subnet.hosts().collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 50, 0, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(10, 50, 0, 254));
        assert_eq!(subnet.first_host(), Some(Ipv4Addr::new(10, 50, 0, 1)));
    }

    #[test]
    fn test_contains() {
        let subnet: Ipv4Subnet = "192.168.4.0/22".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 7, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 8, 1)));
    }

    #[test]
    fn test_invalid_networks_rejected() {
        assert!("10.0.0.0".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0/24".parse::<Ipv4Subnet>().is_err());
        assert!("banana/8".parse::<Ipv4Interface>().is_err());
    }

    #[test]
    fn test_interface_serde_uses_cidr_text() {
        let iface: Ipv4Interface = "10.50.0.5/24".parse().unwrap();
        let json = serde_json::to_string(&iface).unwrap();
        assert_eq!(json, "\"10.50.0.5/24\"");
        let back: Ipv4Interface = serde_json::from_str(&json).unwrap();
        assert_eq!(back, iface);
        assert_eq!(back.subnet().to_string(), "10.50.0.0/24");
    }
}
