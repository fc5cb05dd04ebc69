use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("proxy cidr is invalid")]
pub struct ProxyCidrError;

/// CIDR block of reverse proxies allowed to supply `X-Forwarded-For`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyCidr {
    network: IpAddr,
    prefix: u8,
}

impl ProxyCidr {
    #[must_use]
    pub fn contains(self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask_ip(ip, self.prefix).is_ok_and(|masked| masked == self.network)
    }
}

impl FromStr for ProxyCidr {
    type Err = ProxyCidrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (address, prefix) = match value.split_once('/') {
            Some((ip_part, prefix_part)) => {
                let ip = IpAddr::from_str(ip_part).map_err(|_| ProxyCidrError)?;
                let prefix = prefix_part.parse::<u8>().map_err(|_| ProxyCidrError)?;
                (ip, prefix)
            }
            None => {
                let ip = IpAddr::from_str(value).map_err(|_| ProxyCidrError)?;
                (ip, if ip.is_ipv4() { 32 } else { 128 })
            }
        };
        Ok(Self {
            network: mask_ip(address, prefix)?,
            prefix,
        })
    }
}

impl std::fmt::Display for ProxyCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask_ip(ip: IpAddr, prefix: u8) -> Result<IpAddr, ProxyCidrError> {
    match ip {
        IpAddr::V4(value) => {
            if prefix > 32 {
                return Err(ProxyCidrError);
            }
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            Ok(IpAddr::V4(Ipv4Addr::from(u32::from(value) & mask)))
        }
        IpAddr::V6(value) => {
            if prefix > 128 {
                return Err(ProxyCidrError);
            }
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            Ok(IpAddr::V6(Ipv6Addr::from(u128::from(value) & mask)))
        }
    }
}
