use anyhow::{Context, Result};
use ipnet::IpNet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tokio::net::lookup_host;
use std::collections::HashSet;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// Upper bound on hosts expanded from a single CIDR block or range.
const MAX_EXPANSION: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub ip: IpAddr,
}

impl Target {
    fn from_ip(ip: IpAddr) -> Self {
        Self { host: ip.to_string(), ip }
    }
}

/// Collects the addresses to audit from the command line and the inventory file.
///
/// Order of first appearance is kept and every IP appears at most once.
pub async fn resolve_targets(
    target_inputs: &[String],
    file_input: Option<&Path>,
    exclude_inputs: &[String],
    public_only: bool,
) -> Result<Vec<Target>> {
    let mut exclude_ips = HashSet::new();
    let mut exclude_nets = Vec::new();
    for input in exclude_inputs {
        if let Ok(net) = input.trim().parse::<IpNet>() {
            exclude_nets.push(net);
            continue;
        }
        match process_input(input).await {
            Ok(targets) => exclude_ips.extend(targets.into_iter().map(|t| t.ip)),
            Err(e) => warn!("ignoring exclusion {}: {:#}", input, e),
        }
    }

    let mut all_inputs: Vec<String> = target_inputs.to_vec();
    if let Some(path) = file_input {
        let file = File::open(path).with_context(|| format!("cannot open address inventory {:?}", path))?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                all_inputs.push(line.to_string());
            }
        }
    }

    let results = stream::iter(all_inputs)
        .map(|input| async move {
            let res = process_input(&input).await;
            (input, res)
        })
        .buffered(64)
        .collect::<Vec<_>>()
        .await;

    let mut seen = HashSet::new();
    let mut deduped_targets = Vec::new();
    for (input, res) in results {
        let targets = match res {
            Ok(t) => t,
            Err(e) => {
                warn!("skipping target {}: {:#}", input, e);
                continue;
            }
        };
        for target in targets {
            if exclude_ips.contains(&target.ip) || exclude_nets.iter().any(|n| n.contains(&target.ip)) {
                debug!("{} excluded", target.ip);
                continue;
            }
            if public_only && !is_publicly_routable(&target.ip) {
                warn!("{} is not publicly routable, skipped", target.ip);
                continue;
            }
            if seen.insert(target.ip) {
                deduped_targets.push(target);
            }
        }
    }
    Ok(deduped_targets)
}

async fn process_input(input: &str) -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    let mut cleaned = input.trim();
    let lower = cleaned.to_ascii_lowercase();
    if lower.starts_with("http://") {
        cleaned = &cleaned[7..];
    } else if lower.starts_with("https://") {
        cleaned = &cleaned[8..];
    }
    if let Some(idx) = cleaned.find('/') {
        // keep CIDR suffixes, drop URL paths
        if cleaned.parse::<IpNet>().is_err() {
            cleaned = &cleaned[..idx];
        }
    }
    if cleaned.is_empty() {
        anyhow::bail!("empty entry");
    }

    if let Ok(ip) = cleaned.parse::<IpAddr>() {
        targets.push(Target::from_ip(ip));
        return Ok(targets);
    }

    if let Ok(net) = cleaned.parse::<IpNet>() {
        if (net.addr().is_ipv4() && net.prefix_len() == 32) || (net.addr().is_ipv6() && net.prefix_len() == 128) {
            targets.push(Target::from_ip(net.addr()));
            return Ok(targets);
        }
        // hosts().count() never finishes on large v6 blocks
        let prefix = net.prefix_len();
        let is_too_large = match net {
            IpNet::V4(_) => prefix < 16,
            IpNet::V6(_) => prefix < 112,
        };
        if is_too_large {
            warn!("block {} is too large, only the first {} hosts are used", input, MAX_EXPANSION);
        }
        targets.extend(net.hosts().take(MAX_EXPANSION).map(Target::from_ip));
        return Ok(targets);
    }

    if let Some((start_str, end_str)) = cleaned.split_once('-') {
        if let (Ok(s), Ok(e)) = (start_str.parse::<Ipv4Addr>(), end_str.parse::<Ipv4Addr>()) {
            let s_u32: u32 = s.into();
            let e_u32: u32 = e.into();
            if s_u32 > e_u32 {
                anyhow::bail!("range start is after range end");
            }
            let count = e_u32 as u64 - s_u32 as u64 + 1;
            if count > MAX_EXPANSION as u64 {
                warn!("range {} holds {} addresses, only the first {} are used", input, count, MAX_EXPANSION);
            }
            targets.extend(
                (s_u32..=e_u32)
                    .take(MAX_EXPANSION)
                    .map(|i| Target::from_ip(IpAddr::V4(Ipv4Addr::from(i)))),
            );
            return Ok(targets);
        }

        // 192.0.2.10-20
        if let Some(last_dot_idx) = start_str.rfind('.') {
            let prefix = &start_str[..last_dot_idx];
            if let (Ok(start), Ok(end)) = (start_str[last_dot_idx + 1..].parse::<u8>(), end_str.parse::<u8>()) {
                if start > end {
                    anyhow::bail!("range start is after range end");
                }
                for i in start..=end {
                    if let Ok(ip) = format!("{}.{}", prefix, i).parse::<Ipv4Addr>() {
                        targets.push(Target::from_ip(IpAddr::V4(ip)));
                    }
                }
                if !targets.is_empty() {
                    return Ok(targets);
                }
            }
        }
    }

    // hostname, optionally with a port that lookup_host needs anyway
    let (host_str, addr_to_resolve) = match cleaned.rsplit_once(':') {
        Some((h, p)) if p.parse::<u16>().is_ok() => (h, cleaned.to_string()),
        _ => (cleaned, format!("{}:0", cleaned)),
    };
    let addrs = lookup_host(&addr_to_resolve)
        .await
        .with_context(|| format!("cannot resolve {}", host_str))?;
    let mut seen = HashSet::new();
    for socket_addr in addrs {
        if seen.insert(socket_addr.ip()) {
            targets.push(Target {
                host: host_str.to_string(),
                ip: socket_addr.ip(),
            });
        }
    }
    if targets.is_empty() {
        anyhow::bail!("{} resolved to no addresses", host_str);
    }
    Ok(targets)
}

/// True for addresses reachable from the public internet.
pub fn is_publicly_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            let cgnat = o[0] == 100 && (o[1] & 0xc0) == 64;
            let benchmarking = o[0] == 198 && (o[1] & 0xfe) == 18;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || o[0] == 0
                || o[0] >= 240
                || cgnat
                || benchmarking)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_publicly_routable(&IpAddr::V4(v4));
            }
            let seg = v6.segments();
            let unique_local = (seg[0] & 0xfe00) == 0xfc00;
            let link_local = (seg[0] & 0xffc0) == 0xfe80;
            let documentation = seg[0] == 0x2001 && seg[1] == 0x0db8;
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || unique_local
                || link_local
                || documentation)
        }
    }
}
