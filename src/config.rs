use clap::Parser;
use std::path::PathBuf;
use anyhow::{Context, Result};
use std::collections::HashSet;
use crate::error::AuditError;

pub const DEFAULT_PORTS: &str = "20-30000";
pub const DEFAULT_ALLOWED: &str = "22,80,443,1194";
pub const DEFAULT_REPORT: &str = "open_ports.txt";

#[derive(Parser, Debug, Clone)]
#[command(name = "port-audit")]
#[command(version)]
#[command(about = "port-audit - finds unexpected open TCP ports on your public addresses", long_about = None)]
#[command(after_help = "Only scan addresses you own or are authorized to test.")]
pub struct Cli {
    #[arg(value_name = "TARGET")]
    pub target: Vec<String>,
    /// Address inventory exported from the account, one entry per line
    #[arg(short = 'L', long, value_name = "FILE", env = "PORT_AUDIT_TARGETS")]
    pub target_list: Option<PathBuf>,
    #[arg(long, value_name = "TARGETS")]
    pub exclude_hosts: Option<String>,
    /// Drop addresses that are not publicly routable
    #[arg(long)]
    pub public_only: bool,
    #[arg(short, long, default_value = DEFAULT_PORTS)]
    pub ports: String,
    #[arg(long, value_name = "PORTS")]
    pub exclude_ports: Option<String>,
    /// Ports that are expected to be open and never reported
    #[arg(short, long, default_value = DEFAULT_ALLOWED)]
    pub allow: String,
    /// Simultaneous connection attempts per host (default: one per port)
    #[arg(short = 'C', long)]
    pub concurrency: Option<usize>,
    /// Per-attempt connect timeout in milliseconds
    #[arg(short, long, default_value = "2000")]
    pub timeout: u64,
    /// Global connection rate limit per second, 0 disables it
    #[arg(long, default_value = "0")]
    pub rate: u32,
    #[arg(short = 'o', long, value_name = "FILE", default_value = DEFAULT_REPORT)]
    pub output: PathBuf,
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,
    /// Shell command run with the report once it has findings
    #[arg(long, value_name = "CMD", env = "PORT_AUDIT_DELIVER_CMD")]
    pub deliver_cmd: Option<String>,
    #[arg(long, env = "SUBJECT", default_value = "Unexpected open ports")]
    pub subject: String,
    #[arg(long, env = "EMAIL_FROM")]
    pub from: Option<String>,
    #[arg(long, env = "EMAIL_TO")]
    pub to: Option<String>,
    #[arg(short, long)]
    pub quiet: bool,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub targets: Vec<String>,
    pub target_list: Option<PathBuf>,
    pub exclude_hosts: Vec<String>,
    pub public_only: bool,
    pub ports: Vec<u16>,
    pub allowed_ports: Vec<u16>,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub rate: u32,
    pub report_path: PathBuf,
    pub json_path: Option<PathBuf>,
    pub delivery: DeliveryConfig,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub command: Option<String>,
    pub subject: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl ScanConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut ports = parse_ports(&cli.ports)?;
        if let Some(exclude_str) = cli.exclude_ports {
            let exclude_set: HashSet<u16> = parse_ports(&exclude_str)?.into_iter().collect();
            ports.retain(|p| !exclude_set.contains(p));
        }
        if ports.is_empty() {
            return Err(AuditError::InvalidPortRange("no ports left to scan".to_string()).into());
        }
        let allowed_ports = parse_ports(&cli.allow).context("failed to parse --allow")?;
        if cli.timeout == 0 {
            return Err(AuditError::ConfigError("--timeout must be greater than 0".to_string()).into());
        }
        let concurrency = match cli.concurrency {
            Some(0) => {
                return Err(AuditError::ConfigError("--concurrency must be greater than 0".to_string()).into())
            }
            Some(c) => c,
            None => ports.len(),
        };
        let exclude_hosts = cli
            .exclude_hosts
            .map(|ex| {
                ex.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ScanConfig {
            targets: cli.target,
            target_list: cli.target_list,
            exclude_hosts,
            public_only: cli.public_only,
            ports,
            allowed_ports,
            concurrency,
            timeout_ms: cli.timeout,
            rate: cli.rate,
            report_path: cli.output,
            json_path: cli.json,
            delivery: DeliveryConfig {
                command: cli.deliver_cmd.filter(|c| !c.trim().is_empty()),
                subject: cli.subject,
                from: cli.from,
                to: cli.to,
            },
            quiet: cli.quiet,
        })
    }
}

/// Parses `22,80,8000-8100` into a sorted, deduplicated port list.
pub fn parse_ports(port_str: &str) -> Result<Vec<u16>> {
    let mut ports = HashSet::new();
    for part in port_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.contains('-') {
            let range: Vec<&str> = part.split('-').collect();
            if range.len() != 2 {
                return Err(AuditError::InvalidPortRange(part.to_string()).into());
            }
            let start: u16 = range[0].trim().parse().with_context(|| format!("bad range start in {}", part))?;
            let end: u16 = range[1].trim().parse().with_context(|| format!("bad range end in {}", part))?;
            if start > end {
                return Err(AuditError::InvalidPortRange(format!("{}-{} (start is after end)", start, end)).into());
            }
            ports.extend(start..=end);
        } else {
            let p: u16 = part.parse().with_context(|| format!("bad port {}", part))?;
            ports.insert(p);
        }
    }
    if ports.remove(&0) {
        return Err(AuditError::InvalidPortRange("port 0 cannot be scanned".to_string()).into());
    }
    let mut sorted_ports: Vec<u16> = ports.into_iter().collect();
    sorted_ports.sort_unstable();
    Ok(sorted_ports)
}
