// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Access control for incoming requests: which addresses may talk to the server, and which
//! filenames may be signed.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// An IP network in CIDR notation, such as `10.0.0.0/8` or `2001:db8::/32`.
///
/// A bare address is a network containing only that address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpNetwork {
    address: IpAddr,
    prefix: u8,
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a valid IP network")]
pub struct InvalidNetwork(String);

impl IpNetwork {
    /// Returns true if `address` falls inside this network.
    ///
    /// IPv4-mapped IPv6 addresses are treated as the IPv4 address they map.
    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.address, address.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(address)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(network) & mask == u32::from(address) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(address)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(network) & mask == u128::from(address) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = InvalidNetwork;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidNetwork(value.to_string());
        let (address, prefix) = match value.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (value.trim(), None),
        };
        let address = IpAddr::from_str(address).map_err(|_| invalid())?;
        let max_prefix = match address {
            IpAddr::V4(_) => Ipv4Addr::BITS,
            IpAddr::V6(_) => Ipv6Addr::BITS,
        };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max_prefix as u8,
        };
        if u32::from(prefix) > max_prefix {
            return Err(invalid());
        }

        Ok(Self { address, prefix })
    }
}

impl TryFrom<String> for IpNetwork {
    type Error = InvalidNetwork;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpNetwork> for String {
    fn from(value: IpNetwork) -> Self {
        value.to_string()
    }
}

impl Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// A set of networks; an address is allowed if any network contains it.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    networks: Vec<IpNetwork>,
}

impl IpAllowList {
    pub fn new(networks: &[IpNetwork]) -> Self {
        Self {
            networks: networks.to_vec(),
        }
    }

    pub fn allows(&self, address: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(address))
    }
}

/// The filenames the server is willing to sign.
///
/// The signing programs decide how to sign based on the original filename, so the set of names
/// build machines can submit is restricted.
#[derive(Debug, Clone)]
pub struct FilenamePolicy {
    patterns: Vec<Regex>,
}

impl FilenamePolicy {
    /// Compile the allowed patterns.
    ///
    /// Each pattern must match starting at the beginning of the filename.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&format!("^(?:{pattern})"))
                    .with_context(|| format!("'{pattern}' is not a valid filename pattern"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn allows(&self, filename: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(filename))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parse_networks() {
        let network = IpNetwork::from_str("127.0.0.0/24").unwrap();
        assert_eq!(network.to_string(), "127.0.0.0/24");
        assert_eq!(
            IpNetwork::from_str("10.1.2.3").unwrap().to_string(),
            "10.1.2.3/32"
        );
        assert_eq!(
            IpNetwork::from_str("2001:db8::/32").unwrap().to_string(),
            "2001:db8::/32"
        );
        assert!(IpNetwork::from_str("127.0.0.0/33").is_err());
        assert!(IpNetwork::from_str("not-an-address/8").is_err());
        assert!(IpNetwork::from_str("10.0.0.0/eight").is_err());
    }

    #[test]
    fn network_containment() {
        let network = IpNetwork::from_str("127.1.0.0/24").unwrap();
        assert!(network.contains("127.1.0.1".parse().unwrap()));
        assert!(network.contains("127.1.0.255".parse().unwrap()));
        assert!(!network.contains("127.1.1.0".parse().unwrap()));
        assert!(!network.contains("::1".parse().unwrap()));

        let everything = IpNetwork::from_str("0.0.0.0/0").unwrap();
        assert!(everything.contains("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn mapped_addresses_match_ipv4_networks() {
        let list = IpAllowList::new(&[IpNetwork::from_str("127.0.0.0/8").unwrap()]);
        assert!(list.allows("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!list.allows("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn filename_patterns_anchor_at_start() -> anyhow::Result<()> {
        let policy = FilenamePolicy::new(&[r"firefox.*\.exe", r".*\.mar"])?;
        assert!(policy.allows("firefox-setup.exe"));
        assert!(policy.allows("update.complete.mar"));
        assert!(!policy.allows("evil-firefox.exe"));
        assert!(!policy.allows("README"));

        assert!(FilenamePolicy::new(&["("]).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn addresses_are_in_their_own_networks(raw: u32, prefix in 0_u8..=32) {
            let address = IpAddr::V4(Ipv4Addr::from(raw));
            let network = IpNetwork::from_str(&format!("{address}/{prefix}")).unwrap();
            prop_assert!(network.contains(address));
        }

        #[test]
        fn host_networks_contain_only_the_host(a: u32, b: u32) {
            let network = IpNetwork::from_str(&Ipv4Addr::from(a).to_string()).unwrap();
            prop_assert_eq!(network.contains(IpAddr::V4(Ipv4Addr::from(b))), a == b);
        }
    }
}
