//! Cluster-wide map of external ports to instance ports.
//!
//! The map is rebuilt from the port claims recorded in every instance's
//! metadata. A claim outside the configured range, or one that collides with
//! a port already claimed earlier in the scan, is dropped and logged; the
//! first instance seen keeps the port.

use crate::range::PortRange;
use cloud_core::{CloudError, Result};
use rand::seq::IteratorRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::warn;

/// One `external -> internal` entry recorded on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClaim {
    pub fqdn: String,
    pub address: Option<Ipv4Addr>,
    pub external: u16,
    pub internal: u16,
}

/// Where an external port is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardTarget {
    pub fqdn: String,
    pub address: Option<Ipv4Addr>,
    pub internal: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortForwardMap {
    entries: BTreeMap<u16, ForwardTarget>,
}

impl PortForwardMap {
    pub fn build<I>(range: &PortRange, claims: I) -> Self
    where
        I: IntoIterator<Item = PortClaim>,
    {
        let mut entries: BTreeMap<u16, ForwardTarget> = BTreeMap::new();

        for claim in claims {
            if !range.contains(claim.external) {
                warn!(
                    fqdn = %claim.fqdn,
                    port = claim.external,
                    %range,
                    "ignoring port mapping outside the forward range"
                );
                continue;
            }

            if let Some(existing) = entries.get(&claim.external) {
                warn!(
                    port = claim.external,
                    holder = %existing.fqdn,
                    claimant = %claim.fqdn,
                    "ignoring conflicting port mapping"
                );
                continue;
            }

            entries.insert(
                claim.external,
                ForwardTarget {
                    fqdn: claim.fqdn,
                    address: claim.address,
                    internal: claim.internal,
                },
            );
        }

        Self { entries }
    }

    pub fn get(&self, external: u16) -> Option<&ForwardTarget> {
        self.entries.get(&external)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u16, &ForwardTarget)> {
        self.entries.iter()
    }

    /// Pick a random external port in `range` nobody holds yet.
    pub fn random_available(&self, range: &PortRange) -> Result<u16> {
        range
            .ports()
            .filter(|port| !self.entries.contains_key(port))
            .choose(&mut rand::rng())
            .ok_or_else(|| {
                CloudError::Unavailable(format!("no external ports left in range {range}"))
            })
    }
}
