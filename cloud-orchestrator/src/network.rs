//! NIC allocation from the configured address pool.

use cloud_config::NetworkConfig;
use cloud_core::{CloudError, Ipv4Interface, Ipv4Subnet, Result};
use cloud_provider::NicAllocation;
use rand::Rng;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Usable instance addresses: the subnet's hosts, optionally narrowed to a
/// range, minus the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    subnet: Ipv4Subnet,
    gateway: Ipv4Addr,
    range: Option<(Ipv4Addr, Ipv4Addr)>,
    vlan: Option<u16>,
}

impl AddressPool {
    pub fn new(subnet: Ipv4Subnet, gateway: Ipv4Addr) -> Self {
        Self {
            subnet,
            gateway,
            range: None,
            vlan: None,
        }
    }

    pub fn with_range(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_vlan(mut self, vlan: Option<u16>) -> Self {
        self.vlan = vlan;
        self
    }

    pub fn from_config(network: &NetworkConfig) -> anyhow::Result<Self> {
        let mut pool = Self::new(network.subnet()?, network.gateway()?).with_vlan(network.vlan);
        if let Some(range) = network.range {
            pool = pool.with_range(range.start, range.end);
        }
        Ok(pool)
    }

    pub fn subnet(&self) -> Ipv4Subnet {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.subnet
            .hosts()
            .filter(move |ip| *ip != self.gateway)
            .filter(move |ip| match self.range {
                Some((start, end)) => start <= *ip && *ip <= end,
                None => true,
            })
    }

    /// Allocate the lowest pool address not in `held`.
    pub fn allocate(&self, held: &BTreeSet<Ipv4Addr>) -> Result<NicAllocation> {
        let ip = self
            .candidates()
            .find(|ip| !held.contains(ip))
            .ok_or_else(|| {
                CloudError::Unavailable(
                    "could not allocate an IP for the instance, no addresses available"
                        .to_string(),
                )
            })?;

        let address = Ipv4Interface::new(ip, self.subnet.prefix())
            .map_err(|e| CloudError::Unavailable(e.to_string()))?;

        Ok(NicAllocation {
            addresses: vec![address],
            gateway4: self.gateway,
            macaddress: random_mac(),
            vlan: self.vlan,
        })
    }
}

/// A random locally administered unicast MAC under `02:00:00`.
pub fn random_mac() -> String {
    let mut rng = rand::rng();
    let tail: [u8; 3] = rng.random();
    format!("02:00:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn pool() -> AddressPool {
        AddressPool::new("10.50.0.0/24".parse().unwrap(), Ipv4Addr::new(10, 50, 0, 1))
    }

    #[test]
    fn test_skips_gateway_and_held_addresses() {
        let held = BTreeSet::from([Ipv4Addr::new(10, 50, 0, 2), Ipv4Addr::new(10, 50, 0, 5)]);
        let nic = pool().allocate(&held).unwrap();
        assert_eq!(nic.addresses[0].ip(), Ipv4Addr::new(10, 50, 0, 3));
        assert_eq!(nic.addresses[0].prefix(), 24);
        assert_eq!(nic.gateway4, Ipv4Addr::new(10, 50, 0, 1));
    }

    #[test]
    fn test_never_network_or_broadcast() {
        let candidates: Vec<_> = pool().candidates().collect();
        assert_eq!(candidates.len(), 253);
        assert!(!candidates.contains(&Ipv4Addr::new(10, 50, 0, 0)));
        assert!(!candidates.contains(&Ipv4Addr::new(10, 50, 0, 1)));
        assert!(!candidates.contains(&Ipv4Addr::new(10, 50, 0, 255)));
    }

    #[test]
    fn test_range_narrows_pool() {
        let pool = pool()
            .with_range(Ipv4Addr::new(10, 50, 0, 100), Ipv4Addr::new(10, 50, 0, 101))
            .with_vlan(Some(40));
        let held = BTreeSet::from([Ipv4Addr::new(10, 50, 0, 100)]);
        let nic = pool.allocate(&held).unwrap();
        assert_eq!(nic.addresses[0].ip(), Ipv4Addr::new(10, 50, 0, 101));
        assert_eq!(nic.vlan, Some(40));

        let held = BTreeSet::from([Ipv4Addr::new(10, 50, 0, 100), Ipv4Addr::new(10, 50, 0, 101)]);
        assert!(matches!(pool.allocate(&held), Err(CloudError::Unavailable(_))));
    }

    #[test]
    fn test_mac_format() {
        let re = Regex::new(r"^02:00:00:[0-9a-f]{2}:[0-9a-f]{2}:[0-9a-f]{2}$").unwrap();
        for _ in 0..32 {
            assert!(re.is_match(&random_mac()));
        }
    }
}
