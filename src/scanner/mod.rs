mod tcp_connect;
mod rate_limit;
mod socket_budget;
pub mod service_map;

use crate::config::ScanConfig;
use crate::target::Target;
use crate::output::HostScanResult;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use rate_limit::RateLimiter;
use socket_budget::{socket_budget, SocketGate};
use tracing::{debug, info};

pub use tcp_connect::{probe_port, PortState};

/// Limits shared by every host of one run.
#[derive(Clone)]
pub struct ScanLimits {
    rate: Option<Arc<RateLimiter>>,
    sockets: SocketGate,
}

impl ScanLimits {
    pub fn new(rate: u32, sockets: usize) -> Self {
        Self {
            rate: (rate > 0).then(|| Arc::new(RateLimiter::new(rate))),
            sockets: SocketGate::new(sockets),
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.rate, socket_budget(config.concurrency))
    }
}

fn progress_bar(total: u64, ip: &IpAddr, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(ip.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Probes every configured port on one address.
///
/// One future per port is queued (up to `config.concurrency`), but a probe only
/// opens its socket, and starts its timeout, once the socket gate lets it in.
pub async fn scan_host(target: &Target, config: &ScanConfig, limits: &ScanLimits) -> HostScanResult {
    let started = Instant::now();
    let connect_timeout = Duration::from_millis(config.timeout_ms);
    let ip = target.ip;
    let pb = progress_bar(config.ports.len() as u64, &ip, config.quiet);

    let mut stream = stream::iter(config.ports.iter().copied())
        .map(|port| async move {
            let _permit = limits.sockets.acquire().await;
            if let Some(rate) = &limits.rate {
                rate.acquire().await;
            }
            let state = probe_port(SocketAddr::new(ip, port), connect_timeout).await;
            (port, state)
        })
        .buffer_unordered(config.concurrency);

    let mut result = HostScanResult {
        target: target.host.clone(),
        ip,
        open_ports: Vec::new(),
        closed: 0,
        filtered: 0,
        elapsed_ms: 0,
    };
    while let Some((port, state)) = stream.next().await {
        pb.inc(1);
        match state {
            PortState::Open => {
                debug!("{}:{} open", ip, port);
                result.open_ports.push(port);
            }
            PortState::Closed => result.closed += 1,
            PortState::Filtered => result.filtered += 1,
        }
    }
    pb.finish_and_clear();

    result.open_ports.sort_unstable();
    result.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "{} scanned: {} open, {} closed, {} filtered in {}ms",
        ip,
        result.open_ports.len(),
        result.closed,
        result.filtered,
        result.elapsed_ms
    );
    result
}

/// Scans hosts one after another; the ports of a single host are the parallel unit.
pub async fn run_scan(config: &ScanConfig, targets: &[Target]) -> Vec<HostScanResult> {
    let limits = ScanLimits::from_config(config);
    info!(
        "scanning {} address(es), {} port(s) each, {} concurrent attempts, {}ms timeout",
        targets.len(),
        config.ports.len(),
        config.concurrency,
        config.timeout_ms
    );

    let mut results = Vec::with_capacity(targets.len());
    for (idx, target) in targets.iter().enumerate() {
        if !config.quiet {
            println!("[{}/{}] scanning {} ({})", idx + 1, targets.len(), target.host, target.ip);
        }
        results.push(scan_host(target, config, &limits).await);
    }
    results
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    pub(crate) fn test_config(ports: Vec<u16>) -> ScanConfig {
        ScanConfig {
            targets: Vec::new(),
            target_list: None,
            exclude_hosts: Vec::new(),
            public_only: false,
            concurrency: ports.len().max(1),
            ports,
            allowed_ports: vec![22, 80, 443, 1194],
            timeout_ms: 1000,
            rate: 0,
            report_path: PathBuf::from("open_ports.txt"),
            json_path: None,
            delivery: DeliveryConfig {
                command: None,
                subject: "Unexpected open ports".to_string(),
                from: None,
                to: None,
            },
            quiet: true,
        }
    }

    fn localhost() -> Target {
        Target {
            host: "127.0.0.1".to_string(),
            ip: "127.0.0.1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_scan_host_finds_listeners() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pa = a.local_addr().unwrap().port();
        let pb = b.local_addr().unwrap().port();
        let pc = closed.local_addr().unwrap().port();
        drop(closed);

        let config = test_config(vec![pa, pb, pc]);
        let result = scan_host(&localhost(), &config, &ScanLimits::new(0, 16)).await;

        let mut expected = vec![pa, pb];
        expected.sort_unstable();
        assert_eq!(result.open_ports, expected);
        assert_eq!(result.closed, 1);
        assert_eq!(result.filtered, 0);
    }

    #[tokio::test]
    async fn test_low_concurrency_and_rate_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let mut config = test_config(vec![open]);
        config.concurrency = 1;
        config.rate = 1000;

        let results = run_scan(&config, &[localhost()]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].open_ports, vec![open]);
        assert_eq!(results[0].target, "127.0.0.1");
    }

    /// Many silent ports queued behind a tiny socket budget must not push the
    /// open ports queued after them into `Filtered`: the wait for a socket is
    /// far longer than the connect timeout here.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_small_socket_budget_keeps_open_ports() {
        let (_silent, _fillers, silent_addr) = tcp_connect::tests::saturated_listener().await;
        let open_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_ports = vec![
            open_a.local_addr().unwrap().port(),
            open_b.local_addr().unwrap().port(),
        ];

        // 12 silent attempts, 2 at a time, 250ms each: ~1.5s of queueing
        let mut attempts = vec![silent_addr; 12];
        attempts.extend(open_ports.iter().map(|p| SocketAddr::new(silent_addr.ip(), *p)));
        let limits = ScanLimits::new(0, 2);
        let connect_timeout = Duration::from_millis(250);

        let states: Vec<(SocketAddr, PortState)> = stream::iter(attempts)
            .map(|addr| {
                let limits = &limits;
                async move {
                    let _permit = limits.sockets.acquire().await;
                    (addr, probe_port(addr, connect_timeout).await)
                }
            })
            .buffer_unordered(64)
            .collect()
            .await;

        let silent = states.iter().filter(|(a, _)| *a == silent_addr);
        assert!(silent.clone().all(|(_, s)| *s == PortState::Filtered));
        assert_eq!(silent.count(), 12);
        for port in open_ports {
            let (_, state) = states.iter().find(|(a, _)| a.port() == port).unwrap();
            assert_eq!(*state, PortState::Open, "port {}", port);
        }
    }

    #[test]
    fn test_limits_from_config() {
        let mut config = test_config(vec![1, 2, 3]);
        config.rate = 0;
        assert!(ScanLimits::from_config(&config).rate.is_none());
        config.rate = 50;
        assert!(ScanLimits::from_config(&config).rate.is_some());
    }
}
