use crate::output::HostScanResult;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;

/// Open ports on one address that are not on the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub target: String,
    pub ip: IpAddr,
    pub ports: Vec<u16>,
}

/// Ports that are expected to be reachable and are never reported.
#[derive(Debug, Clone)]
pub struct AllowList {
    ports: HashSet<u16>,
}

impl AllowList {
    pub fn new(ports: &[u16]) -> Self {
        Self {
            ports: ports.iter().copied().collect(),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Keeps only unexpected ports. Hosts left with nothing produce no finding.
    pub fn unexpected(&self, results: &[HostScanResult]) -> Vec<Finding> {
        results
            .iter()
            .filter_map(|res| {
                let mut ports: Vec<u16> = res
                    .open_ports
                    .iter()
                    .copied()
                    .filter(|p| !self.contains(*p))
                    .collect();
                if ports.is_empty() {
                    return None;
                }
                ports.sort_unstable();
                ports.dedup();
                Some(Finding {
                    target: res.target.clone(),
                    ip: res.ip,
                    ports,
                })
            })
            .collect()
    }
}
