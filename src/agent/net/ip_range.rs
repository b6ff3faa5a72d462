use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};

/// An IPv4 subnet from which per-instance addresses are derived. The host
/// part of every address is the instance's numeric identity, so address
/// uniqueness follows from identity uniqueness.
#[derive(Debug, Clone)]
pub struct IpRange {
    pub cidr: String,
    pub net: u32,
    pub mask: u32,
}

fn u32_to_ip(ip: u32) -> Ipv4Addr {
    Ipv4Addr::new(
        ((ip >> 24) & 0xff) as u8,
        ((ip >> 16) & 0xff) as u8,
        ((ip >> 8) & 0xff) as u8,
        (ip & 0xff) as u8,
    )
}

impl IpRange {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let cidr = cidr.to_string();

        let parts = cidr.split('/').collect::<Vec<&str>>();
        if parts.len() != 2 {
            bail!("Invalid CIDR: {}", cidr);
        }

        let net_parts = parts[0].split('.').collect::<Vec<&str>>();
        if net_parts.len() != 4 {
            bail!("Invalid CIDR: {}", cidr);
        }

        let mut net = 0u32;
        for part in net_parts {
            if part.len() > 3 {
                bail!("Invalid CIDR: {}", cidr);
            }

            let part = part
                .parse::<u8>()
                .context(format!("Invalid CIDR: {}", cidr))?;
            net = (net << 8) | part as u32;
        }

        let mask = parts[1]
            .parse::<u32>()
            .context(format!("Invalid CIDR: {}", cidr))?;
        if mask == 0 || mask > 30 {
            bail!("Invalid CIDR (prefix length out of range): {}", cidr);
        }

        let mask = 0xffffffff << (32 - mask);

        Ok(IpRange { cidr, net, mask })
    }

    /// Address with the identity as the host part.
    pub fn host(&self, identity: u8) -> Result<Ipv4Addr> {
        let host = identity as u32;
        if host & self.mask != 0 || host >= !self.mask {
            bail!("identity {} is outside of {}", identity, self.cidr);
        }
        Ok(u32_to_ip((self.net & self.mask) | host))
    }

    /// Largest identity that maps to a usable host address (the broadcast
    /// address is excluded; identities are a single byte).
    pub fn max_host(&self) -> u8 {
        let hosts = !self.mask;
        if hosts >= 0xff { 254 } else { (hosts - 1) as u8 }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        u32_to_ip((self.net & self.mask) | 1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        u32_to_ip(self.mask)
    }
}
