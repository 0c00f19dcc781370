use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{MasterError, Result};

/// IP whitelist for mutating management endpoints.
///
/// Entries are single addresses or CIDR ranges. An empty list admits every
/// client; a non-empty one admits only clients inside some entry.
#[derive(Debug, Clone, Default)]
pub struct Guard {
    white_list: Vec<IpNet>,
}

impl Guard {
    /// Blank entries are skipped. Anything else that is neither an address
    /// nor a range is rejected.
    pub fn new(white_list: &[String]) -> Result<Self> {
        let white_list = white_list
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(parse_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { white_list })
    }

    pub fn is_open(&self) -> bool {
        self.white_list.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.is_open() {
            return true;
        }
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.white_list.iter().any(|net| net.contains(&ip))
    }
}

fn parse_entry(entry: &str) -> Result<IpNet> {
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(IpNet::from(ip));
    }
    entry
        .parse::<IpNet>()
        .map_err(|_| MasterError::InvalidWhiteList {
            entry: entry.to_string(),
        })
}
